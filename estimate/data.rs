//! # Data Loading and Validation Module
//!
//! This module is the entry point for user-provided observations. It reads a
//! tab-separated file, validates it against a strict schema, and produces the
//! immutable `Observations` container consumed by every optimizer.
//!
//! - Strict Schema: response columns are named `Y1`, `Y2`, ... and hold
//!   category codes starting at 1. Covariate columns are named `X1`, `X2`, ...
//!   and hold finite numbers. An intercept column is always prepended to the
//!   covariate design.
//! - Fully Observed: a code of 0 or an empty cell marks a missing answer. The
//!   estimators assume complete data, so such files are rejected with a
//!   `DataError` rather than imputed.

use csv::{ReaderBuilder, WriterBuilder};
use ndarray::{Array2, ArrayView1, ArrayView2, Axis, s};
use thiserror::Error;

/// Validated, read-only data for one estimation problem.
///
/// `responses[[i, j]]` is the zero-based category of item `j` for unit `i`, and
/// `covariates` is the `n x P` design matrix whose first column is the intercept.
#[derive(Debug, Clone, PartialEq)]
pub struct Observations {
    responses: Array2<usize>,
    categories: Vec<usize>,
    covariates: Array2<f64>,
}

/// A comprehensive error type for all data loading and validation failures.
#[derive(Error, Debug)]
pub enum DataError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Error from the underlying CSV reader: {0}")]
    CsvError(#[from] csv::Error),
    #[error("The input file has no response columns. Expected 'Y1', 'Y2', ... in the header.")]
    NoResponseColumns,
    #[error(
        "The value '{value}' in column '{column}' at row {row} could not be parsed as {expected}."
    )]
    UnparsableValue {
        column: String,
        row: usize,
        value: String,
        expected: &'static str,
    },
    #[error(
        "Missing value in column '{column}' at row {row}. Responses must be fully observed and coded from 1."
    )]
    MissingValuesFound { column: String, row: usize },
    #[error("Non-finite values (NaN or Infinity) were found in covariate column '{0}'.")]
    NonFiniteValuesFound(String),
    #[error(
        "Item {item} has code {code} at unit {unit}, but only {categories} categories were declared."
    )]
    CategoryOutOfRange {
        item: usize,
        unit: usize,
        code: usize,
        categories: usize,
    },
    #[error("Item {item} declares {categories} categories; at least 2 are required.")]
    TooFewCategories { item: usize, categories: usize },
    #[error("Dimension mismatch: {0}")]
    DimensionMismatch(String),
    #[error("The data set contains no units.")]
    Empty,
}

impl Observations {
    /// Builds validated observations from zero-based response codes.
    pub fn new(
        responses: Array2<usize>,
        categories: Vec<usize>,
        covariates: Array2<f64>,
    ) -> Result<Self, DataError> {
        let (n, num_items) = responses.dim();
        if n == 0 {
            return Err(DataError::Empty);
        }
        if num_items == 0 {
            return Err(DataError::NoResponseColumns);
        }
        if categories.len() != num_items {
            return Err(DataError::DimensionMismatch(format!(
                "{} category counts supplied for {} items",
                categories.len(),
                num_items
            )));
        }
        if covariates.nrows() != n {
            return Err(DataError::DimensionMismatch(format!(
                "covariate matrix has {} rows but there are {} units",
                covariates.nrows(),
                n
            )));
        }
        if covariates.ncols() == 0 {
            return Err(DataError::DimensionMismatch(
                "covariate matrix needs at least an intercept column".to_string(),
            ));
        }
        for (item, &count) in categories.iter().enumerate() {
            if count < 2 {
                return Err(DataError::TooFewCategories {
                    item,
                    categories: count,
                });
            }
            if let Some((unit, &code)) = responses
                .column(item)
                .iter()
                .enumerate()
                .find(|&(_, &code)| code >= count)
            {
                return Err(DataError::CategoryOutOfRange {
                    item,
                    unit,
                    code,
                    categories: count,
                });
            }
        }
        for (k, column) in covariates.axis_iter(Axis(1)).enumerate() {
            if column.iter().any(|v| !v.is_finite()) {
                return Err(DataError::NonFiniteValuesFound(covariate_name(k)));
            }
        }

        Ok(Self {
            responses,
            categories,
            covariates,
        })
    }

    pub fn num_units(&self) -> usize {
        self.responses.nrows()
    }

    pub fn num_items(&self) -> usize {
        self.responses.ncols()
    }

    pub fn num_covariates(&self) -> usize {
        self.covariates.ncols()
    }

    pub fn categories(&self) -> &[usize] {
        &self.categories
    }

    pub fn responses(&self) -> ArrayView2<'_, usize> {
        self.responses.view()
    }

    pub fn item(&self, j: usize) -> ArrayView1<'_, usize> {
        self.responses.column(j)
    }

    pub fn covariates(&self) -> ArrayView2<'_, f64> {
        self.covariates.view()
    }

    /// The same responses paired with an intercept-only design.
    pub fn intercept_only(&self) -> Self {
        Self {
            responses: self.responses.clone(),
            categories: self.categories.clone(),
            covariates: Array2::ones((self.num_units(), 1)),
        }
    }
}

/// Column name for design column `k` (`k = 0` is the intercept).
fn covariate_name(k: usize) -> String {
    if k == 0 {
        "intercept".to_string()
    } else {
        format!("X{k}")
    }
}

/// Loads observations from a TSV file with `Y1..YJ` and optional `X1..XP` columns.
///
/// When `categories` is `None` the number of levels of each item is the largest
/// code observed for it.
pub fn load_observations(
    path: &str,
    categories: Option<&[usize]>,
) -> Result<Observations, DataError> {
    log::info!("Loading observations from '{path}'");
    let mut reader = ReaderBuilder::new()
        .delimiter(b'\t')
        .has_headers(true)
        .from_path(path)?;
    let headers = reader.headers()?.clone();

    let indexed = |prefix: &str| -> Vec<(String, usize)> {
        let mut found = Vec::new();
        for k in 1.. {
            let name = format!("{prefix}{k}");
            match headers.iter().position(|h| h.trim() == name) {
                Some(idx) => found.push((name, idx)),
                None => break,
            }
        }
        found
    };
    let response_cols = indexed("Y");
    let covariate_cols = indexed("X");
    if response_cols.is_empty() {
        return Err(DataError::NoResponseColumns);
    }

    let mut codes: Vec<usize> = Vec::new();
    let mut design: Vec<f64> = Vec::new();
    let mut n = 0;
    for (row_idx, record) in reader.records().enumerate() {
        let record = record?;
        let row = row_idx + 1;
        for (name, idx) in &response_cols {
            let raw = record.get(*idx).unwrap_or("").trim();
            if raw.is_empty() || raw.eq_ignore_ascii_case("na") {
                return Err(DataError::MissingValuesFound {
                    column: name.clone(),
                    row,
                });
            }
            let code: usize = raw.parse().map_err(|_| DataError::UnparsableValue {
                column: name.clone(),
                row,
                value: raw.to_string(),
                expected: "a positive integer code",
            })?;
            if code == 0 {
                return Err(DataError::MissingValuesFound {
                    column: name.clone(),
                    row,
                });
            }
            codes.push(code - 1);
        }
        design.push(1.0);
        for (name, idx) in &covariate_cols {
            let raw = record.get(*idx).unwrap_or("").trim();
            let value: f64 = raw.parse().map_err(|_| DataError::UnparsableValue {
                column: name.clone(),
                row,
                value: raw.to_string(),
                expected: "a number",
            })?;
            if !value.is_finite() {
                return Err(DataError::NonFiniteValuesFound(name.clone()));
            }
            design.push(value);
        }
        n += 1;
    }
    if n == 0 {
        return Err(DataError::Empty);
    }

    let num_items = response_cols.len();
    let responses = Array2::from_shape_vec((n, num_items), codes)
        .map_err(|e| DataError::DimensionMismatch(e.to_string()))?;
    let covariates = Array2::from_shape_vec((n, covariate_cols.len() + 1), design)
        .map_err(|e| DataError::DimensionMismatch(e.to_string()))?;

    let categories = match categories {
        Some(declared) => declared.to_vec(),
        None => responses
            .axis_iter(Axis(1))
            .map(|col| col.iter().copied().max().map_or(0, |m| m + 1))
            .collect(),
    };

    let observations = Observations::new(responses, categories, covariates)?;
    log::info!(
        "Loaded {} units with {} items and {} covariates (plus intercept)",
        observations.num_units(),
        observations.num_items(),
        observations.num_covariates() - 1
    );
    Ok(observations)
}

/// Writes observations in the schema read by [`load_observations`].
///
/// The first design column is taken to be the intercept and is not written.
pub fn write_observations(path: &str, data: &Observations) -> Result<(), DataError> {
    let mut writer = WriterBuilder::new().delimiter(b'\t').from_path(path)?;
    let mut header: Vec<String> = (1..=data.num_items()).map(|j| format!("Y{j}")).collect();
    header.extend((1..data.num_covariates()).map(covariate_name));
    writer.write_record(&header)?;

    let covariates = data.covariates.slice(s![.., 1..]);
    for (codes, xs) in data.responses.outer_iter().zip(covariates.outer_iter()) {
        let mut fields: Vec<String> = codes.iter().map(|&c| (c + 1).to_string()).collect();
        fields.extend(xs.iter().map(|x| x.to_string()));
        writer.write_record(&fields)?;
    }
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;
    use std::io::{self, Write};
    use tempfile::NamedTempFile;

    fn create_test_tsv(content: &str) -> io::Result<NamedTempFile> {
        let mut file = NamedTempFile::new()?;
        writeln!(file, "{}", content)?;
        file.flush()?;
        Ok(file)
    }

    #[test]
    fn test_load_observations_success() {
        let content = "Y1\tY2\tX1\n1\t2\t0.5\n2\t3\t-1.0\n1\t1\t2.25";
        let file = create_test_tsv(content).unwrap();
        let data = load_observations(file.path().to_str().unwrap(), None).unwrap();

        assert_eq!(data.num_units(), 3);
        assert_eq!(data.num_items(), 2);
        assert_eq!(data.categories(), &[2, 3]);
        assert_eq!(data.responses(), array![[0, 1], [1, 2], [0, 0]]);
        assert_eq!(data.num_covariates(), 2);
        assert_abs_diff_eq!(data.covariates()[[0, 0]], 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(data.covariates()[[1, 1]], -1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(data.covariates()[[2, 1]], 2.25, epsilon = 1e-12);
    }

    #[test]
    fn test_declared_categories_are_respected() {
        let content = "Y1\n1\n2";
        let file = create_test_tsv(content).unwrap();
        let data = load_observations(file.path().to_str().unwrap(), Some(&[4])).unwrap();
        assert_eq!(data.categories(), &[4]);
        assert_eq!(data.num_covariates(), 1);
    }

    #[test]
    fn test_zero_code_is_treated_as_missing() {
        let content = "Y1\tY2\n1\t2\n0\t1";
        let file = create_test_tsv(content).unwrap();
        let err = load_observations(file.path().to_str().unwrap(), None).unwrap_err();
        match err {
            DataError::MissingValuesFound { column, row } => {
                assert_eq!(column, "Y1");
                assert_eq!(row, 2);
            }
            other => panic!("Expected MissingValuesFound, got {:?}", other),
        }
    }

    #[test]
    fn test_non_finite_covariate_rejected() {
        let content = "Y1\tX1\n1\t0.1\n2\tNaN";
        let file = create_test_tsv(content).unwrap();
        let err = load_observations(file.path().to_str().unwrap(), None).unwrap_err();
        match err {
            DataError::NonFiniteValuesFound(col) => assert_eq!(col, "X1"),
            other => panic!("Expected NonFiniteValuesFound(X1), got {:?}", other),
        }
    }

    #[test]
    fn test_single_level_item_rejected() {
        let content = "Y1\tY2\n1\t1\n2\t1";
        let file = create_test_tsv(content).unwrap();
        let err = load_observations(file.path().to_str().unwrap(), None).unwrap_err();
        assert!(matches!(
            err,
            DataError::TooFewCategories {
                item: 1,
                categories: 1
            }
        ));
    }

    #[test]
    fn test_write_then_load_preserves_codes_and_design() {
        let data = Observations::new(
            array![[0, 2], [1, 0], [1, 1]],
            vec![2, 3],
            array![[1.0, 0.5, -3.0], [1.0, 1.5, 0.0], [1.0, -2.0, 4.0]],
        )
        .unwrap();
        let file = NamedTempFile::new().unwrap();
        let path = file.path().to_str().unwrap();
        write_observations(path, &data).unwrap();
        let loaded = load_observations(path, Some(data.categories())).unwrap();
        assert_eq!(loaded, data);
    }

    #[test]
    fn test_out_of_range_code_rejected_by_constructor() {
        let err = Observations::new(array![[0], [2]], vec![2], Array2::ones((2, 1))).unwrap_err();
        assert!(matches!(
            err,
            DataError::CategoryOutOfRange {
                item: 0,
                unit: 1,
                code: 2,
                categories: 2
            }
        ));
    }
}
