//! DFDS (Data-Flow Description Schema) support for StreamingHub.
//!
//! Loads collection, node and stream descriptors from paths or URLs,
//! validates them against their `$schema` and resolves `@ref` pointers.
//! Recorded collections are read through the [`readers`] abstraction and
//! addressed record by record with a [`DataLoader`].

pub mod config;
pub mod dataloader;
pub mod dtype;
pub mod error;
pub mod loader;
pub mod parser;
pub mod readers;
pub mod table;
pub mod types;
pub mod url;

pub use config::{Config, PartialConfig};
pub use dataloader::{DataLoader, Protocol, Template};
pub use dtype::DType;
pub use error::{DfdsError, Result};
pub use loader::Loader;
pub use parser::Parser;
pub use readers::{create_reader, FileReader, FileReaderError};
pub use table::{Column, ColumnData, Table};
pub use types::*;
pub use url::PathOrUrl;
