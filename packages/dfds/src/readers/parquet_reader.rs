use indexmap::IndexMap;
use parquet::basic::Type as PhysicalType;
use parquet::file::reader::{FileReader as _, SerializedFileReader};
use parquet::record::Field;
use std::collections::BTreeMap;
use std::fs::File;
use std::path::{Path, PathBuf};

use super::{FileReader, FileReaderError, FileResult, ROOT_RECORD};
use crate::dtype::DType;
use crate::table::{Column, ColumnData, Table};
use crate::types::Attrs;

/// Parquet File Reader
///
/// One record (`"root"`) per file. Physical types map onto dtype codes;
/// 64-bit integers are widened to `f64` since the code set stops at 32 bits.
pub struct ParquetFileReader {
    path: PathBuf,
}

fn map_physical(t: PhysicalType) -> DType {
    match t {
        PhysicalType::BOOLEAN => DType::U8,
        PhysicalType::INT32 => DType::I32,
        PhysicalType::FLOAT => DType::F32,
        PhysicalType::INT64 | PhysicalType::INT96 | PhysicalType::DOUBLE => DType::F64,
        PhysicalType::BYTE_ARRAY | PhysicalType::FIXED_LEN_BYTE_ARRAY => DType::Bytes,
    }
}

fn field_f64(field: &Field) -> Option<f64> {
    Some(match field {
        Field::Bool(b) => *b as u8 as f64,
        Field::Byte(x) => *x as f64,
        Field::Short(x) => *x as f64,
        Field::Int(x) => *x as f64,
        Field::Long(x) => *x as f64,
        Field::UByte(x) => *x as f64,
        Field::UShort(x) => *x as f64,
        Field::UInt(x) => *x as f64,
        Field::ULong(x) => *x as f64,
        Field::Float(x) => *x as f64,
        Field::Double(x) => *x,
        Field::TimestampMillis(x) => *x as f64,
        Field::TimestampMicros(x) => *x as f64,
        _ => return None,
    })
}

impl ParquetFileReader {
    pub fn new(path: &Path) -> FileResult<Self> {
        if !path.is_file() {
            return Err(FileReaderError::IoError(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("Parquet file not found: {}", path.display()),
            )));
        }
        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    fn open(&self) -> FileResult<SerializedFileReader<File>> {
        let file = File::open(&self.path)?;
        SerializedFileReader::new(file)
            .map_err(|e| FileReaderError::ParseError(format!("Failed to open parquet: {}", e)))
    }

    fn schema(&self, reader: &SerializedFileReader<File>) -> IndexMap<String, DType> {
        reader
            .metadata()
            .file_metadata()
            .schema_descr()
            .columns()
            .iter()
            .filter(|c| !c.name().starts_with("__index_level_"))
            .map(|c| (c.name().to_string(), map_physical(c.physical_type())))
            .collect()
    }
}

impl FileReader for ParquetFileReader {
    fn lsinfo(&self) -> FileResult<BTreeMap<String, Attrs>> {
        let mut info = BTreeMap::new();
        info.insert(ROOT_RECORD.to_string(), Attrs::new());
        Ok(info)
    }

    fn lsfields(&self) -> FileResult<BTreeMap<String, IndexMap<String, DType>>> {
        let reader = self.open()?;
        let mut out = BTreeMap::new();
        out.insert(ROOT_RECORD.to_string(), self.schema(&reader));
        Ok(out)
    }

    fn read(&self, _record: &str) -> FileResult<(Attrs, Table)> {
        let reader = self.open()?;
        let schema = self.schema(&reader);

        let mut data: IndexMap<String, ColumnData> = schema
            .iter()
            .map(|(name, dtype)| {
                let storage = match dtype {
                    DType::Bytes => ColumnData::Text(Vec::new()),
                    d if d.is_integer() => ColumnData::Int(Vec::new()),
                    _ => ColumnData::Float(Vec::new()),
                };
                (name.clone(), storage)
            })
            .collect();

        let rows = reader
            .get_row_iter(None)
            .map_err(|e| FileReaderError::ParseError(format!("Failed to iterate rows: {}", e)))?;
        for row in rows {
            let row = row.map_err(|e| FileReaderError::ParseError(e.to_string()))?;
            for (name, field) in row.get_column_iter() {
                let Some(column) = data.get_mut(name) else {
                    continue;
                };
                match column {
                    ColumnData::Text(v) => v.push(match field {
                        Field::Str(s) => s.clone(),
                        Field::Null => String::new(),
                        other => other.to_string(),
                    }),
                    ColumnData::Int(v) => v.push(field_f64(field).map(|x| x as i64).unwrap_or(0)),
                    ColumnData::Float(v) => v.push(field_f64(field).unwrap_or(f64::NAN)),
                }
            }
        }

        let columns = data
            .into_iter()
            .map(|(name, storage)| Column {
                dtype: schema[&name],
                name,
                data: storage,
            })
            .collect();
        Ok((Attrs::new(), Table::from_columns(columns)?))
    }

    fn format_name(&self) -> &str {
        "Parquet"
    }
}
