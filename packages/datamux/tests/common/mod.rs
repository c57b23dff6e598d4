// Shared fixtures for the integration tests.

#![allow(dead_code)]

use datamux::{Message, Queue};
use dfds::{Attrs, Config};
use serde_json::json;
use std::path::Path;
use std::time::Duration;

pub const FREQUENCY: f64 = 100.0;

/// Write an `adhd_sin` collection with one recorded `Gaze` stream of `rows` samples.
pub fn adhd_sin(root: &Path, rows: usize) -> Config {
    let meta = root.join("meta");
    let data = root.join("data").join("adhd_sin");
    std::fs::create_dir_all(&meta).unwrap();
    std::fs::create_dir_all(&data).unwrap();

    std::fs::write(
        meta.join("adhd_sin.collection.json"),
        json!({
            "name": "adhd_sin",
            "description": "synthetic sinusoidal gaze",
            "streams": {
                "gaze": {
                    "name": "Gaze",
                    "unit": "px",
                    "frequency": FREQUENCY,
                    "fields": {
                        "x": {"name": "x", "dtype": "f64"},
                        "y": {"name": "y", "dtype": "f64"}
                    },
                    "index": {
                        "t": {"name": "t", "dtype": "f64"}
                    }
                }
            },
            "groups": {
                "subject": {"values": ["12"]},
                "noise": {"values": ["0"]},
                "question": {"values": ["10"]}
            },
            "pattern": "csv://{subject}_{noise}_{question}"
        })
        .to_string(),
    )
    .unwrap();

    let mut csv = String::from("t,x,y\n");
    for i in 0..rows {
        // starts away from zero so relative timestamps are observable
        let t = 100.0 + i as f64 / FREQUENCY;
        csv.push_str(&format!("{:.2},{},{:.4}\n", t, i, (i as f64 / 10.0).sin()));
    }
    std::fs::write(data.join("12_0_10.csv"), csv).unwrap();

    Config::new(
        root.join("data").to_string_lossy(),
        meta.to_string_lossy(),
    )
    .unwrap()
}

pub fn attrs() -> Attrs {
    [("subject", "12"), ("noise", "0"), ("question", "10")]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// Drain `queue` up to and including the end of stream.
pub fn drain(queue: &Queue, timeout: Duration) -> Vec<Message> {
    let mut out = Vec::new();
    while let Some(msg) = queue.get_timeout(timeout) {
        let eof = msg.is_eof();
        out.push(msg);
        if eof {
            break;
        }
    }
    out
}

pub fn values_of(messages: &[Message], key: &str) -> Vec<f64> {
    messages
        .iter()
        .filter_map(|m| m.record())
        .filter_map(|r| r.value.get(key).and_then(|v| v.as_f64()))
        .collect()
}
