// Stream messages
//
// A record carries its index columns (time, sample counters) apart from its
// value columns. The end of a stream is the empty map `{}` on the wire and
// `Message::Eof` in memory.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Ordered column name -> scalar map
pub type Scalars = Map<String, Value>;

/// One row of a stream
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub index: Scalars,
    pub value: Scalars,
}

impl Record {
    pub fn new(index: Scalars, value: Scalars) -> Self {
        Self { index, value }
    }

    pub fn index_f64(&self, key: &str) -> Option<f64> {
        self.index.get(key).and_then(Value::as_f64)
    }

    pub fn set_index(&mut self, key: &str, value: f64) {
        let v = serde_json::Number::from_f64(value)
            .map(Value::Number)
            .unwrap_or(Value::Null);
        self.index.insert(key.to_string(), v);
    }
}

/// Routing frame produced by an enveloper: `[prefix?, message, suffix?]`
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub prefix: Option<Vec<u8>>,
    pub message: Box<Message>,
    pub suffix: Option<Vec<u8>>,
}

/// Item carried by queues
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Data(Record),
    Eof,
    /// Arbitrary content produced by a transform
    Content(Value),
    Envelope(Envelope),
}

impl Message {
    /// True for the end-of-stream sentinel, also when enveloped or reshaped
    /// into an empty map by a transform.
    pub fn is_eof(&self) -> bool {
        match self {
            Message::Eof => true,
            Message::Content(Value::Object(map)) => map.is_empty(),
            Message::Envelope(env) => env.message.is_eof(),
            _ => false,
        }
    }

    pub fn record(&self) -> Option<&Record> {
        match self {
            Message::Data(r) => Some(r),
            Message::Envelope(env) => env.message.record(),
            _ => None,
        }
    }

    /// Strip any envelope, returning the payload.
    pub fn into_payload(self) -> Message {
        match self {
            Message::Envelope(env) => env.message.into_payload(),
            other => other,
        }
    }

    /// Wire content of this message (envelopes are transparent).
    pub fn to_content(&self) -> Value {
        match self {
            Message::Data(record) => {
                let mut map = Map::new();
                map.insert("index".to_string(), Value::Object(record.index.clone()));
                map.insert("value".to_string(), Value::Object(record.value.clone()));
                Value::Object(map)
            }
            Message::Eof => Value::Object(Map::new()),
            Message::Content(value) => value.clone(),
            Message::Envelope(env) => env.message.to_content(),
        }
    }

    /// Inverse of [`Message::to_content`] for records and the EOF sentinel.
    pub fn from_content(content: Value) -> Message {
        match content {
            Value::Object(map) if map.is_empty() => Message::Eof,
            Value::Object(mut map)
                if map.len() == 2
                    && map.get("index").map(Value::is_object).unwrap_or(false)
                    && map.get("value").map(Value::is_object).unwrap_or(false) =>
            {
                let index = match map.remove("index") {
                    Some(Value::Object(m)) => m,
                    _ => Map::new(),
                };
                let value = match map.remove("value") {
                    Some(Value::Object(m)) => m,
                    _ => Map::new(),
                };
                Message::Data(Record { index, value })
            }
            other => Message::Content(other),
        }
    }
}

impl From<Record> for Message {
    fn from(record: Record) -> Self {
        Message::Data(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_content_mapping() {
        let content = json!({"index": {"t": 0.5}, "value": {"x": 1.0}});
        let msg = Message::from_content(content.clone());
        assert_eq!(msg.record().unwrap().index_f64("t"), Some(0.5));
        assert_eq!(msg.to_content(), content);

        assert_eq!(Message::from_content(json!({})), Message::Eof);
        assert_eq!(Message::Eof.to_content(), json!({}));

        let other = Message::from_content(json!({"x": 2}));
        assert!(matches!(other, Message::Content(_)));
    }

    #[test]
    fn test_eof_detection_through_envelope() {
        let env = Message::Envelope(Envelope {
            prefix: Some(b"d_abcde".to_vec()),
            message: Box::new(Message::Eof),
            suffix: None,
        });
        assert!(env.is_eof());
        assert!(Message::Content(json!({})).is_eof());
        assert!(!Message::Content(json!({"a": 1})).is_eof());
        assert_eq!(env.into_payload(), Message::Eof);
    }
}
