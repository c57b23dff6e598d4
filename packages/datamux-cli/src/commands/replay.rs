use anyhow::{bail, Context};
use datamux::queue::Flag;
use datamux::task::{LogSink, SinkTask};
use datamux::{signals, Api, ApiStreamer, DataMuxApi, Pipeline, RemoteApi, StreamOptions, Task, Transform};
use dfds::Attrs;
use std::sync::Arc;
use std::time::Duration;

use crate::cli::ReplayArgs;
use crate::commands::load_config;
use crate::exit_codes;

const POLL: Duration = Duration::from_millis(100);

pub fn execute(args: ReplayArgs) -> i32 {
    match run(args) {
        Ok(true) => exit_codes::SUCCESS,
        Ok(false) => exit_codes::INTERRUPTED,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            exit_codes::ERROR
        }
    }
}

/// Parse `k=v,k=v` into attributes.
pub fn parse_attributes(raw: &str) -> anyhow::Result<Attrs> {
    let mut attrs = Attrs::new();
    for pair in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (key, value) = match pair.split_once('=') {
            Some((k, v)) if !k.trim().is_empty() => (k.trim(), v.trim()),
            _ => bail!("Invalid attribute '{}', expected key=value", pair),
        };
        attrs.insert(key.to_string(), value.to_string());
    }
    Ok(attrs)
}

/// Returns false when interrupted before every stream ended.
fn run(args: ReplayArgs) -> anyhow::Result<bool> {
    let filter = match &args.attributes {
        Some(raw) => parse_attributes(raw)?,
        None => Attrs::new(),
    };

    let api: Arc<dyn DataMuxApi> = match &args.host {
        Some(host) => {
            let remote = RemoteApi::connect(&args.rpc, &args.codec, host, args.port)
                .with_context(|| format!("Cannot reach the server at {}:{}", host, args.port))?;
            Arc::new(remote)
        }
        None => Arc::new(Api::new(load_config(&args.dirs)?)),
    };

    let streams: Vec<_> = api
        .list_collection_streams(&args.collection_name)?
        .into_iter()
        .filter(|s| s.matches_attrs(&filter))
        .collect();
    if streams.is_empty() {
        bail!("No stream of '{}' matches {:?}", args.collection_name, filter);
    }

    let options = StreamOptions {
        rate_limit: !args.no_rate_limit,
        ..StreamOptions::default()
    };

    let mut pipelines = Vec::with_capacity(streams.len());
    for stream in &streams {
        let label = format!("{} {:?}", stream.name, stream.attrs);
        let source = ApiStreamer::new(api.clone(), stream, Transform::Identity, options)?;
        let sink = SinkTask::new("log", LogSink::new(&label));
        let mut pipeline = Pipeline::new(&stream.name, vec![Box::new(source), Box::new(sink)])?;
        pipeline.start()?;
        pipelines.push(pipeline);
    }
    tracing::info!("Replaying {} stream(s) of '{}'", pipelines.len(), args.collection_name);

    let stop = Flag::new();
    signals::register(&stop);
    let finished = loop {
        let done = pipelines
            .iter()
            .all(|p| p.completed().map(Flag::is_set).unwrap_or(true));
        if done {
            break true;
        }
        if stop.wait(Some(POLL)) {
            break false;
        }
    };

    for pipeline in &mut pipelines {
        if let Err(e) = pipeline.stop() {
            tracing::warn!("Stopping '{}' failed: {}", pipeline.name(), e);
        }
    }
    Ok(finished)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_attributes() {
        let attrs = parse_attributes("subject=12, noise=0,question=10").unwrap();
        assert_eq!(attrs.len(), 3);
        assert_eq!(attrs["noise"], "0");
        assert!(parse_attributes("").unwrap().is_empty());
        assert!(parse_attributes("subject").is_err());
        assert!(parse_attributes("=12").is_err());
    }
}
