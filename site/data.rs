//! # Site Data Loading and Validation
//!
//! Turns the `covariates` and `data` table references of a round-one request into two validated
//! `Table`s with aligned rows.
//!
//! - A table reference is either an inline split-orientation table or a path to a delimited text
//!   file with a header row. Files are read with `polars`.
//! - Covariates must be complete and finite. Dependent cells may be missing (they become `NaN`
//!   and are filtered per column later), but never infinite.
//! - Failures are assumed to be input errors, and `DataError` names the offending column.

use crate::stats::CONSTANT_LABEL;
use crate::table::{SplitTable, Table, TableError};
use ndarray::{Array2, ShapeBuilder};
use polars::prelude::*;
use serde::Deserialize;
use std::fs::File;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DataError {
    #[error("Error from the underlying Polars DataFrame library: {0}")]
    PolarsError(#[from] PolarsError),
    #[error("IO error while reading '{path}': {source}")]
    IoError {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error(transparent)]
    Table(#[from] TableError),
    #[error("The column '{0}' was not found in the input file. Please check spelling and case.")]
    ColumnNotFound(String),
    #[error(
        "The column '{column_name}' could not be converted to numbers. It contains non-numeric data. (Found type: {found_type})"
    )]
    ColumnWrongType {
        column_name: String,
        found_type: String,
    },
    #[error("Missing values were found in the covariate column '{0}'. Covariates must be complete.")]
    MissingValuesFound(String),
    #[error("Infinite values were found in the {role} column '{column}'.")]
    NonFiniteValuesFound { role: &'static str, column: String },
    #[error(
        "The covariate table has {covariates} rows but the dependent table has {dependents}; rows must be aligned."
    )]
    RowCountMismatch { covariates: usize, dependents: usize },
    #[error(
        "Row {row} is labelled '{covariate}' in the covariate table but '{dependent}' in the dependent table; rows must be aligned."
    )]
    IndexMismatch {
        row: usize,
        covariate: String,
        dependent: String,
    },
    #[error("The dependent table has no columns; at least one target is required.")]
    NoTargets,
    #[error("The covariate name '{0}' is reserved for the intercept column.")]
    ReservedColumnName(String),
}

/// Where a table comes from.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum TableRef {
    /// A delimited text file with a header row. `columns` selects and orders a subset.
    File {
        path: PathBuf,
        #[serde(default)]
        columns: Option<Vec<String>>,
    },
    Inline(SplitTable),
}

impl TableRef {
    pub fn load(&self, separator: u8) -> Result<Table, DataError> {
        match self {
            TableRef::Inline(split) => Ok(split.clone().into_table()?),
            TableRef::File { path, columns } => {
                internal::load_delimited(path, columns.as_deref(), separator)
            }
        }
    }
}

/// Validated covariate and dependent tables for one site.
#[derive(Clone, Debug, PartialEq)]
pub struct SiteData {
    pub covariates: Table,
    pub dependents: Table,
}

/// Loads both tables and checks that they can be regressed against each other.
pub fn parse_site_data(
    covariates: &TableRef,
    dependents: &TableRef,
    separator: u8,
) -> Result<SiteData, DataError> {
    let covariates = covariates.load(separator)?;
    let dependents = dependents.load(separator)?;
    validate(&covariates, &dependents)?;
    log::info!(
        "Loaded {} rows with {} covariates and {} target columns.",
        covariates.nrows(),
        covariates.ncols(),
        dependents.ncols()
    );
    Ok(SiteData {
        covariates,
        dependents,
    })
}

/// Checks the invariants both rounds rely on. Also applied to tables restored from the cache.
pub fn validate(covariates: &Table, dependents: &Table) -> Result<(), DataError> {
    if covariates.nrows() != dependents.nrows() {
        return Err(DataError::RowCountMismatch {
            covariates: covariates.nrows(),
            dependents: dependents.nrows(),
        });
    }
    // Unlabelled tables are aligned by position.
    if let (Some(covariate_index), Some(dependent_index)) = (&covariates.index, &dependents.index) {
        if let Some((row, (covariate, dependent))) = covariate_index
            .iter()
            .zip(dependent_index)
            .enumerate()
            .find(|(_, (c, d))| c != d)
        {
            return Err(DataError::IndexMismatch {
                row,
                covariate: covariate.clone(),
                dependent: dependent.clone(),
            });
        }
    }
    if dependents.ncols() == 0 {
        return Err(DataError::NoTargets);
    }
    if let Some(name) = covariates.columns.iter().find(|c| *c == CONSTANT_LABEL) {
        return Err(DataError::ReservedColumnName(name.clone()));
    }

    for (j, name) in covariates.columns.iter().enumerate() {
        let column = covariates.column(j);
        if column.iter().any(|v| v.is_nan()) {
            return Err(DataError::MissingValuesFound(name.clone()));
        }
        if column.iter().any(|v| v.is_infinite()) {
            return Err(DataError::NonFiniteValuesFound {
                role: "covariate",
                column: name.clone(),
            });
        }
    }
    for (j, name) in dependents.columns.iter().enumerate() {
        if dependents.column(j).iter().any(|v| v.is_infinite()) {
            return Err(DataError::NonFiniteValuesFound {
                role: "dependent",
                column: name.clone(),
            });
        }
    }
    Ok(())
}

mod internal {
    use super::*;
    use std::path::Path;

    /// Reads a delimited file into a `Table`; nulls become `NaN`.
    pub(super) fn load_delimited(
        path: &Path,
        columns: Option<&[String]>,
        separator: u8,
    ) -> Result<Table, DataError> {
        log::debug!("Loading table from '{}'", path.display());
        let file = File::open(path).map_err(|source| DataError::IoError {
            path: path.to_path_buf(),
            source,
        })?;
        let df = CsvReader::new(file)
            .with_options(
                CsvReadOptions::default()
                    .with_has_header(true)
                    .with_parse_options(CsvParseOptions::default().with_separator(separator)),
            )
            .finish()?;

        let available: Vec<String> = df
            .get_column_names()
            .into_iter()
            .map(|s| s.to_string())
            .collect();
        let names: Vec<String> = match columns {
            Some(selected) => {
                if let Some(missing) = selected.iter().find(|c| !available.contains(*c)) {
                    return Err(DataError::ColumnNotFound(missing.clone()));
                }
                selected.to_vec()
            }
            None => available,
        };

        let rows = df.height();
        let mut buffer = Vec::with_capacity(rows * names.len());
        for name in &names {
            buffer.extend(extract_numeric_column(&df, name)?);
        }
        let values = Array2::from_shape_vec((rows, names.len()).f(), buffer)
            .map_err(|_| DataError::ColumnNotFound(names.join(",")))?;

        Ok(Table::new(names, values.as_standard_layout().to_owned())?)
    }

    fn extract_numeric_column(df: &DataFrame, column_name: &str) -> Result<Vec<f64>, DataError> {
        let series = df.column(column_name)?;
        let casted = series
            .cast(&DataType::Float64)
            .map_err(|_| DataError::ColumnWrongType {
                column_name: column_name.to_string(),
                found_type: format!("{:?}", series.dtype()),
            })?;

        // A non-strict cast turns unparseable text into nulls; more nulls than before means
        // the column held something other than numbers.
        if casted.null_count() > series.null_count() {
            return Err(DataError::ColumnWrongType {
                column_name: column_name.to_string(),
                found_type: format!("{:?}", series.dtype()),
            });
        }

        Ok(casted
            .f64()?
            .into_iter()
            .map(|value| value.unwrap_or(f64::NAN))
            .collect())
    }
}
