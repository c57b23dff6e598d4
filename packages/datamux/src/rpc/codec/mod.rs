// Frame codecs
//
// `json` encodes every body as JSON. `avro` encodes streaming topics
// (`d_XXXXX`) as Avro datums against a schema it announces in a preceding
// `schema_XXXXX` frame, and everything else as JSON.

mod avro;
mod json;

pub use avro::{AvroCodec, DEFAULT_CACHE_SIZE};
pub use json::JsonCodec;

use super::{CodecError, RpcCodec};

pub const CODECS: &[&str] = &["json", "avro"];
pub const DEFAULT_CODEC: &str = "json";

pub fn create_codec(name: &str) -> Result<Box<dyn RpcCodec>, CodecError> {
    match name {
        "json" => Ok(Box::new(JsonCodec)),
        "avro" => Ok(Box::new(AvroCodec::new())),
        other => Err(CodecError::UnknownCodec(other.to_string())),
    }
}
