// Loading a collection descriptor from disk and reading its records.

use dfds::{Config, DType, Parser};
use serde_json::json;
use std::path::Path;

fn write_fixture(root: &Path) -> Config {
    let meta = root.join("meta");
    let data = root.join("data");
    std::fs::create_dir_all(&meta).unwrap();
    std::fs::create_dir_all(data.join("demo")).unwrap();

    std::fs::write(
        meta.join("tracker.node.json"),
        json!({
            "id": "tracker",
            "device": {"model": "T1", "manufacturer": "Acme", "category": "eye tracker"}
        })
        .to_string(),
    )
    .unwrap();

    std::fs::write(
        meta.join("demo.collection.json"),
        json!({
            "name": "demo",
            "description": "synthetic gaze",
            "keywords": ["gaze"],
            "authors": [{"name": "A", "affiliation": "B", "email": "a@b"}],
            "streams": {
                "gaze": {
                    "name": "Gaze",
                    "description": "gaze position",
                    "unit": "px",
                    "frequency": 10,
                    "fields": {
                        "x": {"name": "x", "description": "", "dtype": "f64"}
                    },
                    "index": {
                        "t": {"name": "t", "description": "", "dtype": "f64"}
                    },
                    "@node": {"@ref": "tracker.node.json"}
                }
            },
            "groups": {
                "subject": {"description": "", "values": ["1", "2"]}
            },
            "pattern": "csv://sub{subject}"
        })
        .to_string(),
    )
    .unwrap();

    std::fs::write(data.join("demo").join("sub1.csv"), "t,x\n0.0,1.0\n0.1,2.0\n").unwrap();

    Config::new(data.to_str().unwrap(), meta.to_str().unwrap()).unwrap()
}

#[test]
fn test_collection_metadata_resolves_node() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_fixture(dir.path());
    let parser = Parser::new();

    let ptr = config.meta_dir.join("demo.collection.json");
    let collection = parser
        .get_collection_metadata(ptr.to_str().unwrap())
        .unwrap();

    assert_eq!(collection.name, "demo");
    let gaze = &collection.streams["gaze"];
    assert_eq!(gaze.fields["x"].dtype, DType::F64);
    let node = gaze.node.as_ref().unwrap();
    assert_eq!(node.device.as_ref().unwrap().model, "T1");
}

#[test]
fn test_dataloader_lists_and_reads_existing_records() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_fixture(dir.path());
    let parser = Parser::new();
    let collection = parser
        .get_collection_metadata(config.meta_dir.join("demo.collection.json").to_str().unwrap())
        .unwrap();

    let loader = collection.dataloader(&config).unwrap();
    let records = loader.ls().unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0]["subject"], "1");
    assert_eq!(records[0]["collection"], "demo");

    let (meta, table) = loader.read(&records[0]).unwrap();
    assert_eq!(meta["subject"], "1");
    assert_eq!(table.num_rows(), 2);
    assert_eq!(table.column("x").unwrap().f64_at(1), Some(2.0));

    let mut missing = records[0].clone();
    missing.insert("subject".into(), "2".into());
    assert!(loader.read(&missing).is_err());
}
