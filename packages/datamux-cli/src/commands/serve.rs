use anyhow::Context;
use datamux::queue::Flag;
use datamux::{signals, Api, DataMuxServer};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::cli::ServeArgs;
use crate::commands::load_config;
use crate::exit_codes;

pub fn execute(args: ServeArgs) -> i32 {
    match run(args) {
        Ok(()) if signals::interrupted() => exit_codes::INTERRUPTED,
        Ok(()) => exit_codes::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            exit_codes::ERROR
        }
    }
}

fn run(args: ServeArgs) -> anyhow::Result<()> {
    let config = load_config(&args.dirs)?;
    tracing::info!(
        "Serving collections from {} (metadata in {})",
        config.data_dir.display(),
        config.meta_dir.display()
    );
    let api = Arc::new(Api::new(config));
    let server = DataMuxServer::new(api, &args.rpc)?;

    let runtime = tokio::runtime::Runtime::new().context("Failed to start the async runtime")?;
    let shutdown = CancellationToken::new();

    // SIGINT/SIGTERM set the flag; the watcher turns it into a shutdown
    let stop = Flag::new();
    signals::register(&stop);
    {
        let stop = stop.clone();
        let shutdown = shutdown.clone();
        std::thread::Builder::new()
            .name("serve-signals".to_string())
            .spawn(move || {
                stop.wait(None);
                shutdown.cancel();
            })
            .context("Failed to start the signal watcher")?;
    }

    let result = runtime.block_on(async {
        let listener = DataMuxServer::bind(&args.host, args.port).await?;
        server.serve(listener, shutdown).await
    });
    stop.set();
    runtime.shutdown_background();
    result?;
    Ok(())
}
