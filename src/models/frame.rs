//! Column-ordered tables of JSON values
//!
//! `Frame` is the in-memory table shape shared by the paginated source client
//! (record sets) and the dynamic query client (long and wide results). Key
//! columns are tracked so that wide tables produced by a pivot can be joined
//! on the columns they were indexed by.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single record: column name to value
pub type Record = serde_json::Map<String, Value>;

/// Ordered table of JSON values
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    columns: Vec<String>,
    #[serde(default)]
    key_columns: Vec<String>,
    rows: Vec<Vec<Value>>,
}

impl Frame {
    /// Create an empty frame with the given columns
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            key_columns: Vec::new(),
            rows: Vec::new(),
        }
    }

    /// Build a frame from records
    ///
    /// Columns are the union of all record keys in first-seen order; a record
    /// missing a column contributes `null` for it.
    pub fn from_records(records: &[Record]) -> Self {
        let mut columns: Vec<String> = Vec::new();
        for record in records {
            for key in record.keys() {
                if !columns.iter().any(|c| c == key) {
                    columns.push(key.clone());
                }
            }
        }

        let rows = records
            .iter()
            .map(|record| {
                columns
                    .iter()
                    .map(|c| record.get(c).cloned().unwrap_or(Value::Null))
                    .collect()
            })
            .collect();

        Self {
            columns,
            key_columns: Vec::new(),
            rows,
        }
    }

    /// Mark the given columns as the frame's key
    pub fn with_key_columns(mut self, key_columns: Vec<String>) -> Self {
        self.key_columns = key_columns;
        self
    }

    /// Column names in order
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Key (index) columns, empty for long data
    pub fn key_columns(&self) -> &[String] {
        &self.key_columns
    }

    /// Rows of values, aligned with `columns()`
    pub fn rows(&self) -> &[Vec<Value>] {
        &self.rows
    }

    /// Append a row; missing trailing values are filled with `null`
    pub fn push_row(&mut self, mut row: Vec<Value>) {
        row.resize(self.columns.len(), Value::Null);
        self.rows.push(row);
    }

    /// Number of rows
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Check if the frame has no rows
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Position of a column
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    /// Check if a column exists
    pub fn has_column(&self, name: &str) -> bool {
        self.column_index(name).is_some()
    }

    /// Value at a row for a named column
    pub fn get(&self, row: usize, column: &str) -> Option<&Value> {
        let idx = self.column_index(column)?;
        self.rows.get(row).and_then(|r| r.get(idx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(value: Value) -> Record {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_from_records_unions_columns() {
        let frame = Frame::from_records(&[
            record(json!({"fips": 12, "cases": 5})),
            record(json!({"fips": 13, "deaths": 1})),
        ]);

        assert_eq!(frame.len(), 2);
        assert!(frame.has_column("cases"));
        assert!(frame.has_column("deaths"));
        assert_eq!(frame.get(1, "cases"), Some(&Value::Null));
        assert_eq!(frame.get(1, "deaths"), Some(&json!(1)));
    }

    #[test]
    fn test_push_row_pads() {
        let mut frame = Frame::new(vec!["a".to_string(), "b".to_string()]);
        frame.push_row(vec![json!(1)]);
        assert_eq!(frame.rows()[0], vec![json!(1), Value::Null]);
    }
}
