use thiserror::Error;

use crate::readers::FileReaderError;

#[derive(Error, Debug)]
pub enum DfdsError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Failed to parse metadata: {0}")]
    Parse(String),

    #[error("Metadata does not validate against {schema}: {reason}")]
    Validation { schema: String, reason: String },

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("Reader error: {0}")]
    Reader(#[from] FileReaderError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for DfdsError {
    fn from(err: serde_json::Error) -> Self {
        DfdsError::Parse(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, DfdsError>;
