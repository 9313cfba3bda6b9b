//! # Sample Table Loading and Validation
//!
//! This module is the exclusive entry point for the tables produced by the
//! simulation driver. It reads the parameter sample table and the outcome
//! table, validates them against each other, and turns them into dense
//! `ndarray` matrices for the analysis core.
//!
//! - Layout: the first column of every table is the trial identifier; the
//!   remaining columns are named numeric values.
//! - Alignment: row `i` of the parameter table and row `i` of the outcome
//!   table must carry the same identifier.
//! - Strictness: parameter columns must be complete and finite. Outcome
//!   columns may contain missing or non-numeric cells; those load as NaN and
//!   are rejected later for the affected metric only.

use ndarray::{Array1, Array2, ArrayView1, Axis};
use polars::prelude::*;
use std::collections::HashSet;
use std::fs::File;
use std::path::Path;
use thiserror::Error;

/// File name of the parameter sample table inside a work directory.
pub const PARAMETER_SAMPLES_FILE: &str = "input_parameter_samples.csv";
/// File name of the outcome table inside a work directory.
pub const OUTCOME_SAMPLES_FILE: &str = "output_loss_samples.csv";

/// A named, row-identified numeric table.
#[derive(Debug, Clone, PartialEq)]
pub struct Table {
    ids: Vec<String>,
    columns: Vec<String>,
    values: Array2<f64>,
}

/// Parameter samples together with the outcomes they produced.
#[derive(Debug, Clone)]
pub struct SampleSet {
    pub parameters: Table,
    pub outcomes: Table,
}

/// A comprehensive error type for all table loading and validation failures.
#[derive(Error, Debug)]
pub enum DataError {
    #[error("Error from the underlying Polars DataFrame library: {0}")]
    PolarsError(#[from] PolarsError),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("The table '{0}' has no data rows.")]
    EmptyTable(String),
    #[error("The table '{0}' has no value columns besides the identifier column.")]
    NoValueColumns(String),
    #[error("The column '{0}' appears more than once.")]
    DuplicateColumn(String),
    #[error(
        "The column '{column_name}' could not be converted to the expected type '{expected_type}'. It contains non-numeric data. (Found type: {found_type})"
    )]
    ColumnWrongType {
        column_name: String,
        expected_type: &'static str,
        found_type: String,
    },
    #[error(
        "Missing or null values were found in the parameter column '{0}'. Parameter samples must be complete."
    )]
    MissingValuesFound(String),
    #[error(
        "Non-finite values (NaN or Infinity) were found in the parameter column '{0}'. Parameter samples must be finite."
    )]
    NonFiniteValuesFound(String),
    #[error("Table shape mismatch: {ids} identifiers, {columns} column names, but a {rows}x{cols} value matrix.")]
    ShapeMismatch {
        ids: usize,
        columns: usize,
        rows: usize,
        cols: usize,
    },
    #[error("Row count mismatch: the parameter table has {parameters} rows but the outcome table has {outcomes}.")]
    RowCountMismatch { parameters: usize, outcomes: usize },
    #[error(
        "Row {row} is '{parameter_id}' in the parameter table but '{outcome_id}' in the outcome table."
    )]
    IdentifierMismatch {
        row: usize,
        parameter_id: String,
        outcome_id: String,
    },
    #[error("The column '{0}' was not found.")]
    ColumnNotFound(String),
}

impl Table {
    /// Builds a table from raw parts, checking that the shapes agree.
    pub fn new(
        ids: Vec<String>,
        columns: Vec<String>,
        values: Array2<f64>,
    ) -> Result<Self, DataError> {
        if values.nrows() != ids.len() || values.ncols() != columns.len() {
            return Err(DataError::ShapeMismatch {
                ids: ids.len(),
                columns: columns.len(),
                rows: values.nrows(),
                cols: values.ncols(),
            });
        }
        let mut seen = HashSet::with_capacity(columns.len());
        for name in &columns {
            if !seen.insert(name.as_str()) {
                return Err(DataError::DuplicateColumn(name.clone()));
            }
        }
        Ok(Self {
            ids,
            columns,
            values,
        })
    }

    pub fn ids(&self) -> &[String] {
        &self.ids
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn values(&self) -> &Array2<f64> {
        &self.values
    }

    pub fn n_rows(&self) -> usize {
        self.values.nrows()
    }

    pub fn n_columns(&self) -> usize {
        self.values.ncols()
    }

    /// Returns a view of the named column.
    pub fn column(&self, name: &str) -> Result<ArrayView1<'_, f64>, DataError> {
        let index = self
            .columns
            .iter()
            .position(|c| c == name)
            .ok_or_else(|| DataError::ColumnNotFound(name.to_string()))?;
        Ok(self.values.column(index))
    }

    /// Copies the given rows, in the given order, into a new matrix.
    pub fn select_rows(&self, rows: &[usize]) -> Array2<f64> {
        self.values.select(Axis(0), rows)
    }

    /// Identifiers of the given rows, in the given order.
    pub fn select_ids(&self, rows: &[usize]) -> Vec<String> {
        rows.iter().map(|&r| self.ids[r].clone()).collect()
    }
}

impl SampleSet {
    /// Pairs a parameter table with an outcome table, enforcing row alignment.
    pub fn new(parameters: Table, outcomes: Table) -> Result<Self, DataError> {
        if parameters.n_rows() != outcomes.n_rows() {
            return Err(DataError::RowCountMismatch {
                parameters: parameters.n_rows(),
                outcomes: outcomes.n_rows(),
            });
        }
        if parameters.n_rows() == 0 {
            return Err(DataError::EmptyTable("parameter samples".to_string()));
        }
        for (row, (p, o)) in parameters.ids.iter().zip(&outcomes.ids).enumerate() {
            if p != o {
                return Err(DataError::IdentifierMismatch {
                    row: row + 1,
                    parameter_id: p.clone(),
                    outcome_id: o.clone(),
                });
            }
        }
        Ok(Self {
            parameters,
            outcomes,
        })
    }

    pub fn n_trials(&self) -> usize {
        self.parameters.n_rows()
    }

    pub fn metrics(&self) -> &[String] {
        self.outcomes.columns()
    }

    /// The outcome vector of one metric. May contain NaN for unusable cells.
    pub fn outcome(&self, metric_index: usize) -> Array1<f64> {
        self.outcomes.values.column(metric_index).to_owned()
    }
}

/// Loads both tables from a work directory using the standard file names.
pub fn load_sample_set(workdir: &Path) -> Result<SampleSet, DataError> {
    let parameters = load_parameter_table(&workdir.join(PARAMETER_SAMPLES_FILE))?;
    let outcomes = load_outcome_table(&workdir.join(OUTCOME_SAMPLES_FILE))?;
    log::info!(
        "Loaded {} trials with {} parameters and {} metrics",
        parameters.n_rows(),
        parameters.n_columns(),
        outcomes.n_columns()
    );
    SampleSet::new(parameters, outcomes)
}

/// Loads a parameter table. Every cell must be present, numeric and finite.
pub fn load_parameter_table(path: &Path) -> Result<Table, DataError> {
    internal::load_table(path, true)
}

/// Loads an outcome table. Unusable cells become NaN.
pub fn load_outcome_table(path: &Path) -> Result<Table, DataError> {
    internal::load_table(path, false)
}

/// Internal module for shared table loading logic.
mod internal {
    use super::*;

    fn validate_is_finite(values: &[f64], column_name: &str) -> Result<(), DataError> {
        if values.iter().any(|&v| !v.is_finite()) {
            return Err(DataError::NonFiniteValuesFound(column_name.to_string()));
        }
        Ok(())
    }

    fn extract_numeric_column(
        df: &DataFrame,
        column_name: &str,
        strict: bool,
    ) -> Result<Vec<f64>, DataError> {
        let series = df.column(column_name)?;
        if strict && series.null_count() > 0 {
            return Err(DataError::MissingValuesFound(column_name.to_string()));
        }

        let casted = match series.cast(&DataType::Float64) {
            Ok(casted) => casted,
            Err(_) => {
                return Err(DataError::ColumnWrongType {
                    column_name: column_name.to_string(),
                    expected_type: "f64 (numeric)",
                    found_type: format!("{:?}", series.dtype()),
                });
            }
        };

        if strict && casted.null_count() > 0 {
            return Err(DataError::ColumnWrongType {
                column_name: column_name.to_string(),
                expected_type: "f64 (numeric)",
                found_type: format!("{:?}", series.dtype()),
            });
        }

        let values: Vec<f64> = casted
            .f64()?
            .into_iter()
            .map(|v| v.unwrap_or(f64::NAN))
            .collect();
        if strict {
            validate_is_finite(&values, column_name)?;
        }
        Ok(values)
    }

    fn extract_ids(df: &DataFrame, column_name: &str) -> Result<Vec<String>, DataError> {
        let casted = df.column(column_name)?.cast(&DataType::String)?;
        let ids = casted
            .str()?
            .into_iter()
            .enumerate()
            .map(|(i, value)| match value {
                Some(text) if !text.is_empty() => text.to_string(),
                _ => (i + 1).to_string(),
            })
            .collect();
        Ok(ids)
    }

    pub(super) fn load_table(path: &Path, strict: bool) -> Result<Table, DataError> {
        let separator = match path.extension().and_then(|e| e.to_str()) {
            Some("tsv") => b'\t',
            _ => b',',
        };

        log::debug!("Loading table from '{}'", path.display());
        let df = CsvReader::new(File::open(path)?)
            .with_options(
                CsvReadOptions::default()
                    .with_has_header(true)
                    .with_infer_schema_length(None)
                    .with_parse_options(CsvParseOptions::default().with_separator(separator)),
            )
            .finish()?;

        let label = path.display().to_string();
        if df.height() == 0 {
            return Err(DataError::EmptyTable(label));
        }

        let names: Vec<String> = df
            .get_column_names()
            .into_iter()
            .map(|s| s.to_string())
            .collect();
        let Some((id_column, value_columns)) = names.split_first() else {
            return Err(DataError::NoValueColumns(label));
        };
        if value_columns.is_empty() {
            return Err(DataError::NoValueColumns(label));
        }

        let ids = extract_ids(&df, id_column)?;
        let n_rows = df.height();
        let n_cols = value_columns.len();
        let mut values = Array2::<f64>::zeros((n_rows, n_cols));
        for (j, name) in value_columns.iter().enumerate() {
            let column = extract_numeric_column(&df, name, strict)?;
            values.column_mut(j).assign(&Array1::from_vec(column));
        }

        log::debug!("Table '{label}': {n_rows} rows, columns {value_columns:?}");
        Table::new(ids, value_columns.to_vec(), values)
    }
}

// --- Unit Tests ---
#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;
    use std::io::{self, Write};
    use tempfile::NamedTempFile;

    fn create_test_csv(content: &str) -> io::Result<NamedTempFile> {
        let mut file = tempfile::Builder::new().suffix(".csv").tempfile()?;
        writeln!(file, "{}", content)?;
        file.flush()?;
        Ok(file)
    }

    #[test]
    fn loads_identifiers_and_columns_in_file_order() {
        let file = create_test_csv("trial,beta,gamma\nt1,0.1,2\nt2,0.2,3\nt3,0.3,4").unwrap();
        let table = load_parameter_table(file.path()).unwrap();

        assert_eq!(table.ids(), &["t1", "t2", "t3"]);
        assert_eq!(table.columns(), &["beta", "gamma"]);
        assert_eq!(table.n_rows(), 3);
        assert_abs_diff_eq!(table.values()[[1, 0]], 0.2, epsilon = 1e-12);
        assert_abs_diff_eq!(table.values()[[2, 1]], 4.0, epsilon = 1e-12);
    }

    #[test]
    fn integer_identifiers_are_kept_as_text() {
        let file = create_test_csv("id,p1\n0,1.5\n1,2.5").unwrap();
        let table = load_parameter_table(file.path()).unwrap();
        assert_eq!(table.ids(), &["0", "1"]);
    }

    #[test]
    fn parameter_table_rejects_non_numeric_column() {
        let file = create_test_csv("id,p1,p2\na,1.0,x\nb,2.0,y").unwrap();
        match load_parameter_table(file.path()).unwrap_err() {
            DataError::ColumnWrongType { column_name, .. } => assert_eq!(column_name, "p2"),
            other => panic!("Expected ColumnWrongType(p2), got {other:?}"),
        }
    }

    #[test]
    fn parameter_table_rejects_missing_values() {
        let file = create_test_csv("id,p1,p2\na,1.0,2.0\nb,,3.0").unwrap();
        match load_parameter_table(file.path()).unwrap_err() {
            DataError::MissingValuesFound(col) => assert_eq!(col, "p1"),
            other => panic!("Expected MissingValuesFound(p1), got {other:?}"),
        }
    }

    #[test]
    fn outcome_table_keeps_missing_cells_as_nan() {
        let file = create_test_csv("id,deaths,peak\na,1.0,2.0\nb,,3.0").unwrap();
        let table = load_outcome_table(file.path()).unwrap();
        assert!(table.values()[[1, 0]].is_nan());
        assert_abs_diff_eq!(table.values()[[1, 1]], 3.0, epsilon = 1e-12);
    }

    #[test]
    fn table_without_value_columns_is_rejected() {
        let file = create_test_csv("id\na\nb").unwrap();
        assert!(matches!(
            load_parameter_table(file.path()),
            Err(DataError::NoValueColumns(_))
        ));
    }

    #[test]
    fn sample_set_requires_matching_identifiers() {
        let parameters = Table::new(
            vec!["a".into(), "b".into()],
            vec!["p".into()],
            array![[1.0], [2.0]],
        )
        .unwrap();
        let outcomes = Table::new(
            vec!["a".into(), "c".into()],
            vec!["m".into()],
            array![[1.0], [2.0]],
        )
        .unwrap();
        match SampleSet::new(parameters, outcomes).unwrap_err() {
            DataError::IdentifierMismatch { row, .. } => assert_eq!(row, 2),
            other => panic!("Expected IdentifierMismatch, got {other:?}"),
        }
    }

    #[test]
    fn sample_set_requires_matching_row_counts() {
        let parameters =
            Table::new(vec!["a".into()], vec!["p".into()], array![[1.0]]).unwrap();
        let outcomes = Table::new(
            vec!["a".into(), "b".into()],
            vec!["m".into()],
            array![[1.0], [2.0]],
        )
        .unwrap();
        assert!(matches!(
            SampleSet::new(parameters, outcomes),
            Err(DataError::RowCountMismatch {
                parameters: 1,
                outcomes: 2
            })
        ));
    }

    #[test]
    fn duplicate_column_names_are_rejected() {
        let result = Table::new(
            vec!["a".into()],
            vec!["p".into(), "p".into()],
            array![[1.0, 2.0]],
        );
        assert!(matches!(result, Err(DataError::DuplicateColumn(name)) if name == "p"));
    }

    #[test]
    fn select_rows_preserves_requested_order() {
        let table = Table::new(
            vec!["a".into(), "b".into(), "c".into()],
            vec!["p".into()],
            array![[1.0], [2.0], [3.0]],
        )
        .unwrap();
        assert_eq!(table.select_rows(&[2, 0]), array![[3.0], [1.0]]);
        assert_eq!(table.select_ids(&[2, 0]), vec!["c".to_string(), "a".to_string()]);
        assert_eq!(table.column("p").unwrap().to_vec(), vec![1.0, 2.0, 3.0]);
    }
}
