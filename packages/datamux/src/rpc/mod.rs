// Remote procedure call plumbing
//
// Every message on the wire is one frame:
//
//   <topic> "||" <body>
//
// The topic is ASCII and never contains "||"; an empty body is an
// acknowledgement without payload (and, for streaming topics, the
// end-of-stream sentinel). Bodies are produced by a codec negotiated per
// connection through the `X-CODEC` handshake header.
//
// Request topics are the constants below; streaming responses use the
// handle returned in the acknowledgement (`d_XXXXX`) as their topic.

pub mod codec;
pub mod websocket;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{DataMuxError, Result};

pub use codec::{create_codec, AvroCodec, JsonCodec, CODECS, DEFAULT_CODEC};
pub use websocket::{WebSocketClient, WebSocketServer};

pub const TOPIC_LIST_COLLECTIONS: &str = "list_collections";
pub const TOPIC_LIST_COLLECTION_STREAMS: &str = "list_collection_streams";
pub const TOPIC_REPLAY_COLLECTION_STREAM: &str = "replay_collection_stream";
pub const TOPIC_PUBLISH_COLLECTION_STREAM: &str = "publish_collection_stream";
pub const TOPIC_LIST_LIVE_NODES: &str = "list_live_nodes";
pub const TOPIC_LIST_LIVE_STREAMS: &str = "list_live_streams";
pub const TOPIC_READ_LIVE_STREAM: &str = "read_live_stream";
pub const TOPIC_STOP_TASK: &str = "stop_task";

pub const SEPARATOR: &[u8] = b"||";

/// Handshake header carrying the codec name
pub const CODEC_HEADER: &str = "X-CODEC";

pub const TRANSPORTS: &[&str] = &["websocket"];

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Malformed frame: {0}")]
    Frame(String),

    #[error("Cannot encode '{topic}': {reason}")]
    Encode { topic: String, reason: String },

    #[error("Cannot decode '{topic}': {reason}")]
    Decode { topic: String, reason: String },

    #[error("No schema registered for '{0}'")]
    MissingSchema(String),

    #[error("Schema of '{0}' cannot change once registered")]
    SchemaConflict(String),

    #[error("Unknown codec: {0}")]
    UnknownCodec(String),
}

/// Frame body encoder/decoder
///
/// Codecs may keep per-connection state (e.g. learned schemas), hence the
/// `&mut self` receivers; each connection direction owns its own instance.
pub trait RpcCodec: Send {
    fn name(&self) -> &'static str;

    /// Frames to send for `(topic, content)`, in order.
    fn encode(&mut self, topic: &str, content: &Value) -> std::result::Result<Vec<Vec<u8>>, CodecError>;

    /// `None` when the frame only updated codec state.
    fn decode(&mut self, payload: &[u8]) -> std::result::Result<Option<(String, Value)>, CodecError>;
}

/// Join a topic and a body into one frame.
pub fn join_frame(topic: &str, body: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(topic.len() + SEPARATOR.len() + body.len());
    frame.extend_from_slice(topic.as_bytes());
    frame.extend_from_slice(SEPARATOR);
    frame.extend_from_slice(body);
    frame
}

/// Split a frame at its first separator.
pub fn split_frame(payload: &[u8]) -> std::result::Result<(&str, &[u8]), CodecError> {
    let at = payload
        .windows(SEPARATOR.len())
        .position(|w| w == SEPARATOR)
        .ok_or_else(|| CodecError::Frame(format!("no separator in {} bytes", payload.len())))?;
    let topic = std::str::from_utf8(&payload[..at])
        .map_err(|_| CodecError::Frame("topic is not ASCII".to_string()))?;
    Ok((topic, &payload[at + SEPARATOR.len()..]))
}

/// Connection identifier assigned by a server transport
pub type ConnectionId = u64;

/// What a server transport hands to the request handler
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    Request {
        topic: String,
        content: Value,
        conn: ConnectionId,
    },
    Closed(ConnectionId),
}

/// Frame addressed to one connection
#[derive(Debug, Clone, PartialEq)]
pub struct Outbound {
    pub topic: String,
    pub content: Value,
    pub conn: ConnectionId,
}

/// Server side of a transport
#[async_trait]
pub trait RpcServer: Send + Sync {
    fn name(&self) -> &'static str;

    /// Accept connections on `listener` until `shutdown` is cancelled.
    async fn serve(
        &self,
        listener: TcpListener,
        events: mpsc::UnboundedSender<ServerEvent>,
        outbound: mpsc::UnboundedReceiver<Outbound>,
        shutdown: CancellationToken,
    ) -> Result<()>;
}

/// Client side of a transport
#[async_trait]
pub trait RpcClient: Send {
    fn name(&self) -> &'static str;

    /// Connect and return the sender of outgoing `(topic, content)` pairs;
    /// decoded incoming pairs are forwarded to `incoming`.
    async fn connect(
        &mut self,
        host: &str,
        port: u16,
        incoming: mpsc::UnboundedSender<(String, Value)>,
    ) -> Result<mpsc::UnboundedSender<(String, Value)>>;

    async fn disconnect(&mut self);
}

pub fn create_server(name: &str) -> Result<Box<dyn RpcServer>> {
    match name {
        "websocket" => Ok(Box::new(WebSocketServer::new())),
        other => Err(DataMuxError::Config(format!(
            "unknown RPC transport '{}', expected one of {:?}",
            other, TRANSPORTS
        ))),
    }
}

pub fn create_client(name: &str, codec: &str) -> Result<Box<dyn RpcClient>> {
    // fail before connecting when the codec is unknown
    create_codec(codec)?;
    match name {
        "websocket" => Ok(Box::new(WebSocketClient::new(codec))),
        other => Err(DataMuxError::Config(format!(
            "unknown RPC transport '{}', expected one of {:?}",
            other, TRANSPORTS
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_frame_at_first_separator() {
        let (topic, body) = split_frame(b"d_ABCDE||a||b").unwrap();
        assert_eq!(topic, "d_ABCDE");
        assert_eq!(body, b"a||b");

        let (topic, body) = split_frame(b"list_collections||").unwrap();
        assert_eq!(topic, "list_collections");
        assert!(body.is_empty());

        assert!(matches!(split_frame(b"no separator"), Err(CodecError::Frame(_))));
    }

    #[test]
    fn test_registries_reject_unknown_names() {
        assert!(create_server("websocket").is_ok());
        assert!(create_server("carrier-pigeon").is_err());
        assert!(create_client("websocket", "json").is_ok());
        assert!(matches!(
            create_client("websocket", "xml"),
            Err(DataMuxError::Codec(CodecError::UnknownCodec(_)))
        ));
    }
}
