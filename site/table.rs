//! # Labelled Numeric Tables
//!
//! `Table` is the in-memory form of both the covariate table and the dependent table. Missing
//! cells are stored as `NaN`. Tables cross process boundaries in pandas-style "split"
//! orientation, `{"columns": [...], "index": [...], "data": [[...], ...]}`, with missing cells
//! written as `null`. A table without row labels omits `"index"` and is aligned by position.
//!
//! Floats are written in shortest round-trip form and read back with serde_json's
//! `float_roundtrip` parser, so a cached table restores bit-identical values.

use ndarray::{Array2, ArrayView1};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TableError {
    #[error("Table JSON could not be parsed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Row {row} has {found} cells, but the table declares {expected} columns.")]
    RaggedRow {
        row: usize,
        expected: usize,
        found: usize,
    },

    #[error("The table declares {labels} index labels for {rows} data rows.")]
    IndexLength { labels: usize, rows: usize },

    #[error("Column '{0}' appears more than once.")]
    DuplicateColumn(String),

    #[error("Column '{column}' holds the non-numeric value '{value}' at row {row}.")]
    NonNumericCell {
        column: String,
        row: usize,
        value: String,
    },
}

#[derive(Clone, Debug, PartialEq)]
pub struct Table {
    pub columns: Vec<String>,
    /// Row labels. `None` means rows are identified by position only.
    pub index: Option<Vec<String>>,
    /// Shape: [n_rows, n_columns].
    pub values: Array2<f64>,
}

impl Table {
    pub fn new(columns: Vec<String>, values: Array2<f64>) -> Result<Self, TableError> {
        Self::build(columns, None, values)
    }

    pub fn with_index(
        columns: Vec<String>,
        index: Vec<String>,
        values: Array2<f64>,
    ) -> Result<Self, TableError> {
        Self::build(columns, Some(index), values)
    }

    fn build(
        columns: Vec<String>,
        index: Option<Vec<String>>,
        values: Array2<f64>,
    ) -> Result<Self, TableError> {
        if columns.len() != values.ncols() {
            return Err(TableError::RaggedRow {
                row: 0,
                expected: columns.len(),
                found: values.ncols(),
            });
        }
        if let Some(labels) = &index {
            if labels.len() != values.nrows() {
                return Err(TableError::IndexLength {
                    labels: labels.len(),
                    rows: values.nrows(),
                });
            }
        }
        for (position, name) in columns.iter().enumerate() {
            if columns[..position].contains(name) {
                return Err(TableError::DuplicateColumn(name.clone()));
            }
        }
        Ok(Self {
            columns,
            index,
            values,
        })
    }

    pub fn nrows(&self) -> usize {
        self.values.nrows()
    }

    pub fn ncols(&self) -> usize {
        self.values.ncols()
    }

    pub fn column(&self, j: usize) -> ArrayView1<'_, f64> {
        self.values.column(j)
    }

    /// Serializes to a split-orientation JSON string.
    pub fn to_split_json(&self) -> Result<String, TableError> {
        let split = SplitTable::from(self);
        Ok(serde_json::to_string(&split)?)
    }

    /// Parses a split-orientation JSON string produced by [`Table::to_split_json`].
    pub fn from_split_json(text: &str) -> Result<Self, TableError> {
        let split: SplitTable = serde_json::from_str(text)?;
        split.into_table()
    }
}

/// A single cell as it may appear in inline JSON data.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Cell {
    Number(f64),
    Flag(bool),
    Text(String),
}

impl Cell {
    fn to_f64(&self) -> Option<f64> {
        match self {
            Cell::Number(value) => Some(*value),
            Cell::Flag(flag) => Some(if *flag { 1.0 } else { 0.0 }),
            Cell::Text(text) => {
                let trimmed = text.trim();
                if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("nan") {
                    Some(f64::NAN)
                } else {
                    trimmed.parse::<f64>().ok()
                }
            }
        }
    }
}

/// Index labels may be written as numbers or strings; both are kept as text.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IndexLabel {
    Integer(i64),
    Text(String),
}

impl IndexLabel {
    fn into_text(self) -> String {
        match self {
            IndexLabel::Integer(value) => value.to_string(),
            IndexLabel::Text(text) => text,
        }
    }
}

/// The split-orientation wire form of a [`Table`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SplitTable {
    pub columns: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<Vec<IndexLabel>>,
    pub data: Vec<Vec<Option<Cell>>>,
}

impl SplitTable {
    pub fn into_table(self) -> Result<Table, TableError> {
        let rows = self.data.len();
        let width = self.columns.len();
        let mut buffer = Vec::with_capacity(rows * width);
        for (row, cells) in self.data.iter().enumerate() {
            if cells.len() != width {
                return Err(TableError::RaggedRow {
                    row,
                    expected: width,
                    found: cells.len(),
                });
            }
            for (j, cell) in cells.iter().enumerate() {
                let value = match cell {
                    None => f64::NAN,
                    Some(cell) => cell.to_f64().ok_or_else(|| TableError::NonNumericCell {
                        column: self.columns[j].clone(),
                        row,
                        value: match cell {
                            Cell::Text(text) => text.clone(),
                            other => format!("{other:?}"),
                        },
                    })?,
                };
                buffer.push(value);
            }
        }

        let values = Array2::from_shape_vec((rows, width), buffer).map_err(|_| {
            TableError::RaggedRow {
                row: rows,
                expected: width,
                found: 0,
            }
        })?;
        let index = self
            .index
            .map(|labels| labels.into_iter().map(IndexLabel::into_text).collect());
        Table::build(self.columns, index, values)
    }
}

impl From<&Table> for SplitTable {
    fn from(table: &Table) -> Self {
        let data = table
            .values
            .rows()
            .into_iter()
            .map(|row| {
                row.iter()
                    .map(|&v| if v.is_nan() { None } else { Some(Cell::Number(v)) })
                    .collect()
            })
            .collect();
        SplitTable {
            columns: table.columns.clone(),
            index: table
                .index
                .as_ref()
                .map(|labels| labels.iter().cloned().map(IndexLabel::Text).collect()),
            data,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn assert_bit_identical(original: &Table, restored: &Table) {
        assert_eq!(restored.columns, original.columns);
        assert_eq!(restored.index, original.index);
        for (expected, copy) in original.values.iter().zip(restored.values.iter()) {
            if expected.is_nan() {
                assert!(copy.is_nan());
            } else {
                assert_eq!(
                    expected.to_bits(),
                    copy.to_bits(),
                    "{expected:e} came back as {copy:e}"
                );
            }
        }
    }

    #[test]
    fn split_json_round_trip_is_exact_for_edge_values() {
        let values = array![
            [0.1, 1.0 / 3.0, f64::NAN],
            [-2.5e-300, 7.0, 1e300],
            [f64::MIN_POSITIVE, -0.0, 42.0],
            [2.7917904547466506e-271, 5e-324, f64::MAX]
        ];
        let table = Table::with_index(
            vec!["a".into(), "b".into(), "c".into()],
            vec!["s1".into(), "s2".into(), "s3".into(), "s4".into()],
            values,
        )
        .unwrap();

        let restored = Table::from_split_json(&table.to_split_json().unwrap()).unwrap();
        assert_bit_identical(&table, &restored);
    }

    #[test]
    fn split_json_round_trip_is_exact_for_random_values() {
        let mut rng = StdRng::seed_from_u64(0x5EED_CAC4E);
        let rows = 5_000;

        // Column 0: arbitrary finite bit patterns, subnormals included.
        // Column 1: uniform values on [0, 1000), the typical measurement range.
        let mut values = Array2::<f64>::zeros((rows, 2));
        for i in 0..rows {
            values[[i, 0]] = loop {
                let candidate = f64::from_bits(rng.r#gen::<u64>());
                if candidate.is_finite() {
                    break candidate;
                }
            };
            values[[i, 1]] = rng.gen_range(0.0..1000.0);
        }
        let table = Table::new(vec!["bits".into(), "uniform".into()], values).unwrap();

        let restored = Table::from_split_json(&table.to_split_json().unwrap()).unwrap();
        assert_eq!(restored.index, None);
        assert_bit_identical(&table, &restored);
    }

    #[test]
    fn missing_cells_are_written_as_null() {
        let table = Table::new(vec!["y".into()], array![[1.0], [f64::NAN]]).unwrap();
        let text = table.to_split_json().unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed["data"], serde_json::json!([[1.0], [null]]));
    }

    #[test]
    fn mixed_cells_are_coerced() {
        let split: SplitTable = serde_json::from_str(
            r#"{"columns": ["age", "isControl"], "index": [10, "s2", 12], "data": [[23, true], ["41.5", false], ["", null]]}"#,
        )
        .unwrap();
        let table = split.into_table().unwrap();
        assert_eq!(
            table.index,
            Some(vec!["10".to_string(), "s2".to_string(), "12".to_string()])
        );
        assert_eq!(table.values[[0, 0]], 23.0);
        assert_eq!(table.values[[0, 1]], 1.0);
        assert_eq!(table.values[[1, 0]], 41.5);
        assert_eq!(table.values[[1, 1]], 0.0);
        assert!(table.values[[2, 0]].is_nan());
        assert!(table.values[[2, 1]].is_nan());
    }

    #[test]
    fn non_numeric_text_is_rejected() {
        let split: SplitTable =
            serde_json::from_str(r#"{"columns": ["site"], "data": [["boston"]]}"#).unwrap();
        match split.into_table().unwrap_err() {
            TableError::NonNumericCell { column, row, value } => {
                assert_eq!(column, "site");
                assert_eq!(row, 0);
                assert_eq!(value, "boston");
            }
            other => panic!("Expected NonNumericCell, got {other:?}"),
        }
    }

    #[test]
    fn ragged_rows_are_rejected() {
        let split: SplitTable =
            serde_json::from_str(r#"{"columns": ["a", "b"], "data": [[1, 2], [3]]}"#).unwrap();
        assert!(matches!(
            split.into_table().unwrap_err(),
            TableError::RaggedRow { row: 1, expected: 2, found: 1 }
        ));
    }

    #[test]
    fn duplicate_columns_are_rejected() {
        let err = Table::new(vec!["a".into(), "a".into()], array![[1.0, 2.0]]).unwrap_err();
        assert!(matches!(err, TableError::DuplicateColumn(name) if name == "a"));
    }
}
