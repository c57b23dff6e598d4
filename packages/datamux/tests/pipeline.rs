// Source -> pipe -> sink pipelines fed by the API.

mod common;

use common::{adhd_sin, values_of};
use datamux::task::{filter_pipe, map_pipe, CollectSink, SinkTask};
use datamux::{Api, DataMuxApi, Message, Pipeline, StreamOptions, Transform};
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[test]
fn test_pipeline_runs_a_replayed_stream_to_completion() {
    let dir = tempfile::tempdir().unwrap();
    let rows = 20;
    let api = Arc::new(Api::new(adhd_sin(dir.path(), rows)));
    let stream = api.list_collection_streams("adhd_sin").unwrap().remove(0);

    let source = api
        .clone()
        .attach(&stream, Transform::Identity, StreamOptions::unpaced())
        .unwrap();
    let double = map_pipe("double", |msg: Message| match msg {
        Message::Data(mut record) => {
            let x = record.value["x"].as_f64().unwrap_or_default();
            record.value.insert("x".to_string(), json!(x * 2.0));
            Message::Data(record)
        }
        other => other,
    });
    let sink = CollectSink::new();
    let mut pipeline = Pipeline::new(
        "gaze",
        vec![
            Box::new(source),
            Box::new(double),
            Box::new(SinkTask::new("collect", sink.clone())),
        ],
    )
    .unwrap();

    assert!(pipeline.run(Duration::from_secs(10)).unwrap());
    let items = sink.items();
    assert_eq!(items.len(), rows + 1);
    assert!(items[rows].is_eof());
    assert_eq!(
        values_of(&items, "x"),
        (0..rows).map(|i| i as f64 * 2.0).collect::<Vec<_>>()
    );
    assert!(api.active_handles().is_empty());
}

#[test]
fn test_stopping_a_pipeline_early_stops_the_attach() {
    let dir = tempfile::tempdir().unwrap();
    let api = Arc::new(Api::new(adhd_sin(dir.path(), 1000)));
    let stream = api.list_collection_streams("adhd_sin").unwrap().remove(0);

    let source = api
        .clone()
        .attach(&stream, Transform::Identity, StreamOptions::default())
        .unwrap();
    let even = filter_pipe("even", |msg: &Message| {
        msg.record()
            .and_then(|r| r.value["x"].as_f64())
            .map(|x| x % 2.0 == 0.0)
            .unwrap_or(true)
    });
    let sink = CollectSink::new();
    let mut pipeline = Pipeline::new(
        "gaze",
        vec![
            Box::new(source),
            Box::new(even),
            Box::new(SinkTask::new("collect", sink.clone())),
        ],
    )
    .unwrap();

    let started = Instant::now();
    assert!(!pipeline.run(Duration::from_millis(300)).unwrap());
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(api.active_handles().is_empty());

    let xs = values_of(&sink.items(), "x");
    assert!(!xs.is_empty());
    assert!(xs.len() < 1000);
    assert!(xs.iter().all(|x| x % 2.0 == 0.0));
}
