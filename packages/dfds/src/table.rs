use serde_json::Value;
use std::cmp::Ordering;

use crate::dtype::DType;
use crate::readers::{FileReaderError, FileResult};

/// Column storage
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnData {
    Float(Vec<f64>),
    Int(Vec<i64>),
    Text(Vec<String>),
}

impl ColumnData {
    pub fn len(&self) -> usize {
        match self {
            ColumnData::Float(v) => v.len(),
            ColumnData::Int(v) => v.len(),
            ColumnData::Text(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn take(&self, order: &[usize]) -> ColumnData {
        match self {
            ColumnData::Float(v) => ColumnData::Float(order.iter().map(|&i| v[i]).collect()),
            ColumnData::Int(v) => ColumnData::Int(order.iter().map(|&i| v[i]).collect()),
            ColumnData::Text(v) => {
                ColumnData::Text(order.iter().map(|&i| v[i].clone()).collect())
            }
        }
    }

    fn compare(&self, a: usize, b: usize) -> Ordering {
        match self {
            ColumnData::Float(v) => v[a].total_cmp(&v[b]),
            ColumnData::Int(v) => v[a].cmp(&v[b]),
            ColumnData::Text(v) => v[a].cmp(&v[b]),
        }
    }
}

/// A named, typed column
#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    pub name: String,
    pub dtype: DType,
    pub data: ColumnData,
}

impl Column {
    pub fn float(name: impl Into<String>, dtype: DType, values: Vec<f64>) -> Self {
        Self {
            name: name.into(),
            dtype,
            data: ColumnData::Float(values),
        }
    }

    pub fn int(name: impl Into<String>, dtype: DType, values: Vec<i64>) -> Self {
        Self {
            name: name.into(),
            dtype,
            data: ColumnData::Int(values),
        }
    }

    pub fn text(name: impl Into<String>, values: Vec<String>) -> Self {
        Self {
            name: name.into(),
            dtype: DType::Bytes,
            data: ColumnData::Text(values),
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Numeric view of one cell; text cells are parsed when possible.
    pub fn f64_at(&self, row: usize) -> Option<f64> {
        match &self.data {
            ColumnData::Float(v) => v.get(row).copied(),
            ColumnData::Int(v) => v.get(row).map(|x| *x as f64),
            ColumnData::Text(v) => v.get(row).and_then(|s| s.trim().parse().ok()),
        }
    }

    /// JSON view of one cell. Non-finite floats become `null`.
    pub fn json_at(&self, row: usize) -> Value {
        match &self.data {
            ColumnData::Float(v) => v
                .get(row)
                .and_then(|x| serde_json::Number::from_f64(*x))
                .map(Value::Number)
                .unwrap_or(Value::Null),
            ColumnData::Int(v) => v.get(row).map(|x| Value::from(*x)).unwrap_or(Value::Null),
            ColumnData::Text(v) => v
                .get(row)
                .map(|s| Value::String(s.clone()))
                .unwrap_or(Value::Null),
        }
    }

    /// Divide a numeric column by `scale`, turning it into floats.
    pub fn rescale(&mut self, scale: f64) {
        let values: Vec<f64> = (0..self.len())
            .map(|i| self.f64_at(i).unwrap_or(f64::NAN) / scale)
            .collect();
        self.data = ColumnData::Float(values);
        if !self.dtype.is_float() {
            self.dtype = DType::F64;
        }
    }
}

/// Column-oriented table with equal-length columns
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Table {
    columns: Vec<Column>,
    rows: usize,
}

impl Table {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_columns(columns: Vec<Column>) -> FileResult<Self> {
        let mut table = Table::new();
        for column in columns {
            table.push_column(column)?;
        }
        Ok(table)
    }

    /// Append or replace a column.
    pub fn push_column(&mut self, column: Column) -> FileResult<()> {
        if !self.columns.is_empty() && column.len() != self.rows {
            return Err(FileReaderError::InvalidData(format!(
                "column '{}' has {} rows, expected {}",
                column.name,
                column.len(),
                self.rows
            )));
        }
        self.rows = column.len();
        match self.columns.iter_mut().find(|c| c.name == column.name) {
            Some(existing) => *existing = column,
            None => self.columns.push(column),
        }
        Ok(())
    }

    pub fn num_rows(&self) -> usize {
        self.rows
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn column_mut(&mut self, name: &str) -> Option<&mut Column> {
        self.columns.iter_mut().find(|c| c.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.column(name).is_some()
    }

    /// Stable ascending sort by the given columns; absent names are skipped.
    pub fn sort_by(&mut self, keys: &[String]) {
        let key_idx: Vec<usize> = keys
            .iter()
            .filter_map(|k| self.columns.iter().position(|c| &c.name == k))
            .collect();
        if key_idx.is_empty() || self.rows < 2 {
            return;
        }
        let mut order: Vec<usize> = (0..self.rows).collect();
        order.sort_by(|&a, &b| {
            key_idx
                .iter()
                .map(|&k| self.columns[k].data.compare(a, b))
                .find(|o| *o != Ordering::Equal)
                .unwrap_or(Ordering::Equal)
        });
        for column in &mut self.columns {
            column.data = column.data.take(&order);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sort_multi_key() {
        let mut table = Table::from_columns(vec![
            Column::float("t", DType::F64, vec![2.0, 1.0, 1.0]),
            Column::int("s", DType::U8, vec![0, 5, 3]),
            Column::text("label", vec!["c".into(), "b".into(), "a".into()]),
        ])
        .unwrap();
        table.sort_by(&["t".to_string(), "s".to_string()]);
        assert_eq!(table.column("label").unwrap().data, ColumnData::Text(vec![
            "a".into(),
            "b".into(),
            "c".into()
        ]));
    }

    #[test]
    fn test_length_mismatch() {
        let mut table = Table::new();
        table
            .push_column(Column::float("a", DType::F64, vec![1.0, 2.0]))
            .unwrap();
        assert!(table
            .push_column(Column::float("b", DType::F64, vec![1.0]))
            .is_err());
    }

    #[test]
    fn test_json_view_and_rescale() {
        let mut col = Column::int("t", DType::U32, vec![1000, 2000]);
        assert_eq!(col.json_at(0), serde_json::json!(1000));
        col.rescale(1000.0);
        assert_eq!(col.dtype, DType::F64);
        assert_eq!(col.f64_at(1), Some(2.0));

        let nan = Column::float("x", DType::F32, vec![f64::NAN]);
        assert_eq!(nan.json_at(0), Value::Null);
    }
}
