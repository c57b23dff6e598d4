//! File Readers Module
//!
//! Read-only access to the containers that hold recorded collections. Each
//! container exposes its records (`lsinfo`), the fields of each record
//! (`lsfields`) and the data of one record (`read`). New formats are added by
//! implementing the FileReader trait.

use indexmap::IndexMap;
use std::collections::BTreeMap;
use std::path::Path;

use crate::dtype::DType;
use crate::table::Table;
use crate::types::Attrs;

pub mod csv_reader;
#[cfg(feature = "hdf5-support")]
pub mod hdf5_reader;
#[cfg(feature = "parquet-support")]
pub mod parquet_reader;

pub use csv_reader::CSVFileReader;
#[cfg(feature = "hdf5-support")]
pub use hdf5_reader::HDF5FileReader;
#[cfg(feature = "parquet-support")]
pub use parquet_reader::ParquetFileReader;

/// Record id used by single-record containers (CSV, Parquet)
pub const ROOT_RECORD: &str = "root";

/// Result type alias for file reader operations
pub type FileResult<T> = Result<T, FileReaderError>;

/// Error types for file reading operations
#[derive(Debug)]
pub enum FileReaderError {
    IoError(std::io::Error),
    ParseError(String),
    UnsupportedFormat(String),
    InvalidData(String),
    MissingRecord(String),
}

impl std::fmt::Display for FileReaderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FileReaderError::IoError(e) => write!(f, "IO error: {}", e),
            FileReaderError::ParseError(msg) => write!(f, "Parse error: {}", msg),
            FileReaderError::UnsupportedFormat(msg) => write!(f, "Unsupported format: {}", msg),
            FileReaderError::InvalidData(msg) => write!(f, "Invalid data: {}", msg),
            FileReaderError::MissingRecord(msg) => write!(f, "Missing record: {}", msg),
        }
    }
}

impl std::error::Error for FileReaderError {}

impl From<std::io::Error> for FileReaderError {
    fn from(err: std::io::Error) -> Self {
        FileReaderError::IoError(err)
    }
}

/// Trait that all container readers implement
pub trait FileReader: Send + Sync {
    /// All records in the file and their attributes
    fn lsinfo(&self) -> FileResult<BTreeMap<String, Attrs>>;

    /// Fields of every record, with their dtype codes
    fn lsfields(&self) -> FileResult<BTreeMap<String, IndexMap<String, DType>>>;

    /// Metadata and data of a single record
    fn read(&self, record: &str) -> FileResult<(Attrs, Table)>;

    /// Format name (e.g. "CSV", "HDF5")
    fn format_name(&self) -> &str;
}

/// Extensions handled by this build
pub fn supported_extensions() -> Vec<&'static str> {
    let mut exts = vec!["csv"];
    if cfg!(feature = "parquet-support") {
        exts.push("parquet");
    }
    if cfg!(feature = "hdf5-support") {
        exts.extend(["h5", "hdf5"]);
    }
    exts
}

pub fn is_supported(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| supported_extensions().contains(&e.to_lowercase().as_str()))
        .unwrap_or(false)
}

/// Create a reader for `path`, selected by extension.
pub fn create_reader(path: &Path) -> FileResult<Box<dyn FileReader>> {
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_lowercase();

    match extension.as_str() {
        "csv" => Ok(Box::new(CSVFileReader::new(path)?)),
        #[cfg(feature = "parquet-support")]
        "parquet" => Ok(Box::new(ParquetFileReader::new(path)?)),
        #[cfg(feature = "hdf5-support")]
        "h5" | "hdf5" => Ok(Box::new(HDF5FileReader::new(path)?)),
        "parquet" | "h5" | "hdf5" => Err(FileReaderError::UnsupportedFormat(format!(
            "{} support is not enabled in this build: {}",
            extension,
            path.display()
        ))),
        _ => Err(FileReaderError::UnsupportedFormat(format!(
            "Unsupported file extension: {}",
            extension
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_supported() {
        assert!(is_supported(Path::new("rec.csv")));
        assert!(is_supported(Path::new("REC.CSV")));
        assert!(!is_supported(Path::new("rec.xyz")));
    }

    #[test]
    fn test_unknown_extension() {
        let err = create_reader(Path::new("/tmp/rec.xyz")).err().unwrap();
        assert!(matches!(err, FileReaderError::UnsupportedFormat(_)));
    }

    #[cfg(not(feature = "parquet-support"))]
    #[test]
    fn test_parquet_disabled() {
        let err = create_reader(Path::new("/tmp/rec.parquet")).err().unwrap();
        assert!(err.to_string().contains("not enabled"));
    }
}
