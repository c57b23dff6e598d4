use serde_json::{Map, Value};

use crate::rpc::{join_frame, split_frame, CodecError, RpcCodec};

/// JSON bodies; the empty map is sent as an empty body
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl JsonCodec {
    pub(crate) fn encode_body(topic: &str, content: &Value) -> Result<Vec<u8>, CodecError> {
        if is_empty_map(content) {
            return Ok(Vec::new());
        }
        serde_json::to_vec(content).map_err(|e| CodecError::Encode {
            topic: topic.to_string(),
            reason: e.to_string(),
        })
    }

    pub(crate) fn decode_body(topic: &str, body: &[u8]) -> Result<Value, CodecError> {
        if body.is_empty() {
            return Ok(Value::Object(Map::new()));
        }
        serde_json::from_slice(body).map_err(|e| CodecError::Decode {
            topic: topic.to_string(),
            reason: e.to_string(),
        })
    }
}

pub(crate) fn is_empty_map(content: &Value) -> bool {
    matches!(content, Value::Object(map) if map.is_empty())
}

impl RpcCodec for JsonCodec {
    fn name(&self) -> &'static str {
        "json"
    }

    fn encode(&mut self, topic: &str, content: &Value) -> Result<Vec<Vec<u8>>, CodecError> {
        let body = Self::encode_body(topic, content)?;
        Ok(vec![join_frame(topic, &body)])
    }

    fn decode(&mut self, payload: &[u8]) -> Result<Option<(String, Value)>, CodecError> {
        let (topic, body) = split_frame(payload)?;
        let content = Self::decode_body(topic, body)?;
        Ok(Some((topic.to_string(), content)))
    }
}
