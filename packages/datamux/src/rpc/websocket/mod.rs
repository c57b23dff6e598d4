// WebSocket transport
//
// Server: axum router with the `/ws` upgrade endpoint, `/` answering 200
// and 404 everywhere else. Each connection gets a send task and a receive
// task with their own codec instance; both stop when either side ends.
//
// Client: tokio-tungstenite connection that announces its codec in the
// `X-CODEC` handshake header.

mod client;
mod server;

pub use client::WebSocketClient;
pub use server::WebSocketServer;

pub const WS_PATH: &str = "/ws";
