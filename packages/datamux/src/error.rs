use thiserror::Error;

use dfds::DfdsError;

use crate::rpc::CodecError;

#[derive(Error, Debug)]
pub enum DataMuxError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Metadata validation failed: {0}")]
    Validation(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Unknown source: {0}")]
    UnknownSource(String),

    #[error("Setup failed: {0}")]
    Setup(String),

    #[error("Source error: {0}")]
    Source(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Remote error: {0}")]
    Remote(String),

    #[error("Invalid pipeline: {0}")]
    Pipeline(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<DfdsError> for DataMuxError {
    fn from(err: DfdsError) -> Self {
        match err {
            DfdsError::Config(msg) => DataMuxError::Config(msg),
            DfdsError::NotFound(msg) => DataMuxError::NotFound(msg),
            DfdsError::Parse(msg) => DataMuxError::Parse(msg),
            e @ DfdsError::Validation { .. } => DataMuxError::Validation(e.to_string()),
            DfdsError::Io(e) => DataMuxError::Io(e),
            other => DataMuxError::Source(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for DataMuxError {
    fn from(err: serde_json::Error) -> Self {
        DataMuxError::Parse(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, DataMuxError>;
