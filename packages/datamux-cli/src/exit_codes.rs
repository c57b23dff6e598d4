/// Finished cleanly
pub const SUCCESS: i32 = 0;
/// Bad configuration, arguments or unreachable server
pub const ERROR: i32 = 1;
/// Stopped by SIGINT/SIGTERM
pub const INTERRUPTED: i32 = 130;
