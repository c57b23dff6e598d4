use hdf5::File as H5File;
use indexmap::IndexMap;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use super::{FileReader, FileReaderError, FileResult};
use crate::dtype::DType;
use crate::table::{Column, Table};
use crate::types::Attrs;

/// HDF5 File Reader
///
/// Every top-level dataset is one record. Datasets are read as 2-D numeric
/// arrays (rows x columns); column names come from the comma separated
/// `fields` attribute, or default to `c0..cN`.
pub struct HDF5FileReader {
    path: PathBuf,
}

impl HDF5FileReader {
    pub fn new(path: &Path) -> FileResult<Self> {
        if !path.is_file() {
            return Err(FileReaderError::IoError(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("HDF5 file not found: {}", path.display()),
            )));
        }
        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    fn open(&self) -> FileResult<H5File> {
        H5File::open(&self.path)
            .map_err(|e| FileReaderError::ParseError(format!("Failed to open HDF5 file: {}", e)))
    }

    fn attrs(dataset: &hdf5::Dataset) -> Attrs {
        let mut attrs = Attrs::new();
        for name in dataset.attr_names().unwrap_or_default() {
            let Ok(attr) = dataset.attr(&name) else {
                continue;
            };
            if let Ok(text) = attr.read_scalar::<hdf5::types::VarLenUnicode>() {
                attrs.insert(name, text.as_str().to_string());
            } else if let Ok(number) = attr.read_scalar::<f64>() {
                attrs.insert(name, number.to_string());
            }
        }
        attrs
    }

    fn column_names(dataset: &hdf5::Dataset, ncols: usize) -> Vec<String> {
        let named: Option<Vec<String>> = dataset
            .attr("fields")
            .and_then(|a| a.read_scalar::<hdf5::types::VarLenUnicode>())
            .ok()
            .map(|s| s.as_str().split(',').map(|f| f.trim().to_string()).collect());
        match named {
            Some(names) if names.len() == ncols => names,
            _ => (0..ncols).map(|i| format!("c{}", i)).collect(),
        }
    }

    fn datasets(file: &H5File) -> FileResult<Vec<(String, hdf5::Dataset)>> {
        let names = file
            .member_names()
            .map_err(|e| FileReaderError::ParseError(e.to_string()))?;
        Ok(names
            .into_iter()
            .filter_map(|name| file.dataset(&name).ok().map(|ds| (name, ds)))
            .collect())
    }
}

impl FileReader for HDF5FileReader {
    fn lsinfo(&self) -> FileResult<BTreeMap<String, Attrs>> {
        let file = self.open()?;
        Ok(Self::datasets(&file)?
            .into_iter()
            .map(|(name, ds)| (name, Self::attrs(&ds)))
            .collect())
    }

    fn lsfields(&self) -> FileResult<BTreeMap<String, IndexMap<String, DType>>> {
        let file = self.open()?;
        let mut out = BTreeMap::new();
        for (name, ds) in Self::datasets(&file)? {
            let shape = ds.shape();
            let ncols = shape.get(1).copied().unwrap_or(1);
            let fields = Self::column_names(&ds, ncols)
                .into_iter()
                .map(|c| (c, DType::F64))
                .collect();
            out.insert(name, fields);
        }
        Ok(out)
    }

    fn read(&self, record: &str) -> FileResult<(Attrs, Table)> {
        let file = self.open()?;
        let dataset = file
            .dataset(record)
            .map_err(|_| FileReaderError::MissingRecord(record.to_string()))?;
        let meta = Self::attrs(&dataset);

        let array = dataset
            .read_2d::<f64>()
            .map_err(|e| FileReaderError::InvalidData(format!("{}: {}", record, e)))?;
        let names = Self::column_names(&dataset, array.ncols());
        let columns = names
            .into_iter()
            .enumerate()
            .map(|(i, name)| Column::float(name, DType::F64, array.column(i).to_vec()))
            .collect();
        Ok((meta, Table::from_columns(columns)?))
    }

    fn format_name(&self) -> &str {
        "HDF5"
    }
}
