use indexmap::IndexMap;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use super::{FileReader, FileReaderError, FileResult, ROOT_RECORD};
use crate::dtype::DType;
use crate::table::{Column, Table};
use crate::types::Attrs;

/// CSV File Reader
///
/// The whole file is one record (`"root"`). Column types are inferred from
/// the cells: integers that fit 32 bits keep an integer code, other numbers
/// become `f64` (empty cells read as NaN) and anything else is `bytes`.
pub struct CSVFileReader {
    path: PathBuf,
}

impl CSVFileReader {
    pub fn new(path: &Path) -> FileResult<Self> {
        if !path.is_file() {
            return Err(FileReaderError::IoError(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("CSV file not found: {}", path.display()),
            )));
        }
        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    fn load(&self) -> FileResult<Table> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .trim(csv::Trim::All)
            .from_path(&self.path)
            .map_err(|e| FileReaderError::ParseError(format!("Failed to open CSV: {}", e)))?;

        let headers: Vec<String> = reader
            .headers()
            .map_err(|e| FileReaderError::ParseError(format!("Failed to read CSV header: {}", e)))?
            .iter()
            .map(str::to_string)
            .collect();

        let mut cells: Vec<Vec<String>> = vec![Vec::new(); headers.len()];
        for (line, record) in reader.records().enumerate() {
            let record = record.map_err(|e| {
                FileReaderError::ParseError(format!("CSV row {}: {}", line + 2, e))
            })?;
            for (i, column) in cells.iter_mut().enumerate() {
                column.push(record.get(i).unwrap_or("").to_string());
            }
        }

        let columns = headers
            .into_iter()
            .zip(cells)
            .map(|(name, values)| infer_column(name, values))
            .collect();
        Table::from_columns(columns)
    }
}

fn infer_column(name: String, values: Vec<String>) -> Column {
    let ints: Option<Vec<i64>> = values.iter().map(|v| v.parse::<i64>().ok()).collect();
    if let Some(ints) = ints.filter(|v| !v.is_empty()) {
        let min = ints.iter().copied().min().unwrap_or(0);
        let max = ints.iter().copied().max().unwrap_or(0);
        let dtype = DType::for_int_range(min, max);
        if dtype.is_integer() {
            return Column::int(name, dtype, ints);
        }
        return Column::float(name, DType::F64, ints.into_iter().map(|x| x as f64).collect());
    }

    let floats: Option<Vec<f64>> = values
        .iter()
        .map(|v| {
            if v.is_empty() {
                Some(f64::NAN)
            } else {
                v.parse::<f64>().ok()
            }
        })
        .collect();
    match floats {
        Some(floats) if values.iter().any(|v| !v.is_empty()) => {
            Column::float(name, DType::F64, floats)
        }
        _ => Column::text(name, values),
    }
}

impl FileReader for CSVFileReader {
    fn lsinfo(&self) -> FileResult<BTreeMap<String, Attrs>> {
        let mut info = BTreeMap::new();
        info.insert(ROOT_RECORD.to_string(), Attrs::new());
        Ok(info)
    }

    fn lsfields(&self) -> FileResult<BTreeMap<String, IndexMap<String, DType>>> {
        let table = self.load()?;
        let fields = table
            .columns()
            .iter()
            .map(|c| (c.name.clone(), c.dtype))
            .collect();
        let mut out = BTreeMap::new();
        out.insert(ROOT_RECORD.to_string(), fields);
        Ok(out)
    }

    fn read(&self, _record: &str) -> FileResult<(Attrs, Table)> {
        // the record id is ignored: the file holds exactly one record
        Ok((Attrs::new(), self.load()?))
    }

    fn format_name(&self) -> &str {
        "CSV"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::ColumnData;

    #[test]
    fn test_infer_types() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rec.csv");
        std::fs::write(
            &path,
            "t,x,label,count\n0.0,1.5,a,1\n0.1,,b,2\n0.2,2.5,c,-3\n",
        )
        .unwrap();

        let reader = CSVFileReader::new(&path).unwrap();
        let fields = reader.lsfields().unwrap();
        let root = &fields["root"];
        assert_eq!(root["t"], DType::F64);
        assert_eq!(root["x"], DType::F64);
        assert_eq!(root["label"], DType::Bytes);
        assert_eq!(root["count"], DType::I8);

        let (meta, table) = reader.read("root").unwrap();
        assert!(meta.is_empty());
        assert_eq!(table.num_rows(), 3);
        assert!(table.column("x").unwrap().f64_at(1).unwrap().is_nan());
        assert_eq!(
            table.column("count").unwrap().data,
            ColumnData::Int(vec![1, 2, -3])
        );
    }

    #[test]
    fn test_single_root_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rec.csv");
        std::fs::write(&path, "a\n1\n").unwrap();
        let reader = CSVFileReader::new(&path).unwrap();
        let info = reader.lsinfo().unwrap();
        assert_eq!(info.keys().collect::<Vec<_>>(), vec!["root"]);
    }

    #[test]
    fn test_missing_file() {
        assert!(CSVFileReader::new(Path::new("/nonexistent/rec.csv")).is_err());
    }
}
