use clap::Parser;
use tracing_subscriber::EnvFilter;

mod cli;
mod commands;
mod exit_codes;

use cli::Cli;

fn main() {
    let cli = Cli::parse();

    let default_level = match (cli.quiet, cli.verbose) {
        (true, _) => "warn",
        (false, 0) => "info",
        (false, 1) => "debug",
        (false, _) => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let exit_code = match cli.command {
        cli::Command::Serve(args) => commands::serve::execute(args),
        cli::Command::Init(args) => commands::init::execute(args),
        cli::Command::Replay(args) => commands::replay::execute(args),
    };

    std::process::exit(exit_code);
}
