use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::config::Config;
use crate::dataloader::DataLoader;
use crate::dtype::DType;
use crate::error::Result;

/// Opaque key/value discriminators attached to streams and records
pub type Attrs = BTreeMap<String, String>;

/// A single named channel of a stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub dtype: DType,
}

/// Hardware that produces a node's streams
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub model: String,
    pub manufacturer: String,
    pub category: String,
}

/// Stream descriptor
///
/// `index` keeps its insertion order; its first entry is the primary index
/// used for pacing replays.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stream {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub unit: String,
    #[serde(default)]
    pub frequency: f64,
    pub fields: IndexMap<String, Field>,
    #[serde(default)]
    pub index: IndexMap<String, Field>,
    #[serde(rename = "@node", default, skip_serializing_if = "Option::is_none")]
    pub node: Option<Box<Node>>,
    #[serde(default)]
    pub attrs: Attrs,
}

impl Stream {
    /// Name of the primary index column, if the stream has an index
    pub fn primary_index(&self) -> Option<&str> {
        self.index.keys().next().map(String::as_str)
    }

    /// True when every `(key, value)` of `query` is present in the stream's attrs
    pub fn matches_attrs(&self, query: &Attrs) -> bool {
        query
            .iter()
            .all(|(k, v)| self.attrs.get(k).map(|x| x == v).unwrap_or(false))
    }
}

/// A source of streams (a device, or a synthetic node for a collection)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Node {
    #[serde(default)]
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<Device>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
    #[serde(default)]
    pub inputs: IndexMap<String, Stream>,
    #[serde(default)]
    pub outputs: IndexMap<String, Stream>,
}

impl Node {
    pub fn with_id(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Author {
    pub name: String,
    #[serde(default)]
    pub affiliation: String,
    #[serde(default)]
    pub email: String,
}

/// One grouping dimension of a collection (e.g. subject, task)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Group {
    #[serde(default)]
    pub description: String,
    pub values: Vec<String>,
}

/// Recorded dataset descriptor
///
/// `pattern` encodes the physical layout as `<proto>://<template>`, where the
/// template's placeholders are group names.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Collection {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub authors: Vec<Author>,
    pub streams: IndexMap<String, Stream>,
    pub groups: IndexMap<String, Group>,
    pub pattern: String,
}

impl Collection {
    /// Cartesian product of all group values, in group order.
    ///
    /// A collection without groups yields a single empty tuple.
    pub fn iterate_groups(&self) -> Vec<Attrs> {
        let mut combos: Vec<Attrs> = vec![Attrs::new()];
        for (key, group) in &self.groups {
            let mut next = Vec::with_capacity(combos.len() * group.values.len());
            for combo in &combos {
                for value in &group.values {
                    let mut c = combo.clone();
                    c.insert(key.clone(), value.clone());
                    next.push(c);
                }
            }
            combos = next;
        }
        combos
    }

    pub fn dataloader(&self, config: &Config) -> Result<DataLoader> {
        DataLoader::new(self, config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_stream() -> serde_json::Value {
        json!({
            "name": "Gaze",
            "description": "gaze position",
            "unit": "px",
            "frequency": 60,
            "fields": {
                "x": {"name": "X", "description": "horizontal", "dtype": "f32"},
                "y": {"name": "Y", "description": "vertical", "dtype": "f32"}
            },
            "index": {
                "t": {"name": "T", "description": "time", "dtype": "f64"},
                "s": {"name": "S", "description": "sample", "dtype": "u32"}
            }
        })
    }

    #[test]
    fn test_stream_keeps_index_order() {
        let stream: Stream = serde_json::from_value(sample_stream()).unwrap();
        assert_eq!(stream.primary_index(), Some("t"));
        assert_eq!(stream.fields.keys().collect::<Vec<_>>(), vec!["x", "y"]);
        assert!(stream.node.is_none());
        assert!(stream.attrs.is_empty());
    }

    #[test]
    fn test_stream_node_alias() {
        let mut value = sample_stream();
        value["@node"] = json!({"id": "tracker"});
        let stream: Stream = serde_json::from_value(value).unwrap();
        assert_eq!(stream.node.as_ref().unwrap().id, "tracker");

        let out = serde_json::to_value(&stream).unwrap();
        assert_eq!(out["@node"]["id"], "tracker");
    }

    #[test]
    fn test_iterate_groups_product() {
        let collection: Collection = serde_json::from_value(json!({
            "name": "demo",
            "streams": {},
            "groups": {
                "subject": {"description": "", "values": ["1", "2"]},
                "task": {"description": "", "values": ["a", "b", "c"]}
            },
            "pattern": "csv://{subject}_{task}"
        }))
        .unwrap();

        let groups = collection.iterate_groups();
        assert_eq!(groups.len(), 6);
        assert_eq!(groups[0].get("subject").unwrap(), "1");
        assert_eq!(groups[0].get("task").unwrap(), "a");
        assert_eq!(groups[5].get("subject").unwrap(), "2");
        assert_eq!(groups[5].get("task").unwrap(), "c");
    }

    #[test]
    fn test_iterate_groups_without_groups() {
        let collection: Collection = serde_json::from_value(json!({
            "name": "flat",
            "streams": {},
            "groups": {},
            "pattern": "csv://data"
        }))
        .unwrap();
        assert_eq!(collection.iterate_groups(), vec![Attrs::new()]);
    }

    #[test]
    fn test_matches_attrs() {
        let mut stream: Stream = serde_json::from_value(sample_stream()).unwrap();
        stream.attrs.insert("subject".into(), "12".into());
        stream.attrs.insert("id".into(), "gaze".into());

        let mut query = Attrs::new();
        query.insert("subject".into(), "12".into());
        assert!(stream.matches_attrs(&query));
        query.insert("noise".into(), "0".into());
        assert!(!stream.matches_attrs(&query));
    }
}
