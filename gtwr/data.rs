//! # Tabular Input
//!
//! Reads delimited text tables into the arrays the rest of the crate expects.
//! Column names are configurable. Rows with an empty cell in any selected
//! column are dropped (and counted in the log); anything else that fails to
//! parse as a finite number is a hard error, reported with its 1-based data
//! row and column name.

use csv::{ReaderBuilder, StringRecord};
use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DataError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Malformed delimited input: {0}")]
    Csv(#[from] csv::Error),
    #[error("The required column '{0}' was not found in the input file. Please check spelling and case.")]
    ColumnNotFound(String),
    #[error("Value '{value}' in column '{column}' (data row {row}) is not a number.")]
    Parse {
        row: usize,
        column: String,
        value: String,
    },
    #[error("Non-finite value in column '{column}' (data row {row}).")]
    NonFinite { row: usize, column: String },
    #[error("At least one feature column must be named.")]
    NoFeatures,
    #[error("No complete rows remain after dropping rows with missing values.")]
    NoCompleteRows,
}

/// Which columns hold what.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnSpec {
    pub lat: String,
    pub lon: String,
    pub time: String,
    pub target: String,
    pub features: Vec<String>,
}

/// Validated columns of one table, rows in file order.
#[derive(Debug, Clone)]
pub struct TableData {
    pub x: Array2<f64>,
    /// Present only when the target column was requested.
    pub y: Option<Array1<f64>>,
    /// `[N, 2]` latitude/longitude.
    pub coords: Array2<f64>,
    pub times: Array1<f64>,
}

fn find_column(headers: &StringRecord, name: &str) -> Result<usize, DataError> {
    headers
        .iter()
        .position(|h| h.trim() == name)
        .ok_or_else(|| DataError::ColumnNotFound(name.to_string()))
}

fn parse_cell(value: &str, row: usize, column: &str) -> Result<f64, DataError> {
    let parsed: f64 = value.trim().parse().map_err(|_| DataError::Parse {
        row,
        column: column.to_string(),
        value: value.to_string(),
    })?;
    if !parsed.is_finite() {
        return Err(DataError::NonFinite {
            row,
            column: column.to_string(),
        });
    }
    Ok(parsed)
}

/// Loads a table. With `with_target`, the target column is required and
/// returned; otherwise it is ignored even if present.
pub fn load_table(
    path: impl AsRef<Path>,
    columns: &ColumnSpec,
    delimiter: u8,
    with_target: bool,
) -> Result<TableData, DataError> {
    if columns.features.is_empty() {
        return Err(DataError::NoFeatures);
    }
    let mut reader = ReaderBuilder::new()
        .delimiter(delimiter)
        .trim(csv::Trim::All)
        .from_path(path.as_ref())?;
    let headers = reader.headers()?.clone();

    // Column order: lat, lon, time, [target], features...
    let mut names: Vec<&str> = vec![
        columns.lat.as_str(),
        columns.lon.as_str(),
        columns.time.as_str(),
    ];
    if with_target {
        names.push(columns.target.as_str());
    }
    names.extend(columns.features.iter().map(String::as_str));
    let indices = names
        .iter()
        .map(|name| find_column(&headers, name))
        .collect::<Result<Vec<_>, _>>()?;

    let mut values: Vec<Vec<f64>> = Vec::new();
    let mut dropped = 0usize;
    for (row, record) in reader.records().enumerate() {
        let record = record?;
        let cells: Vec<&str> = indices.iter().map(|&i| record.get(i).unwrap_or("")).collect();
        if cells.iter().any(|c| c.trim().is_empty()) {
            dropped += 1;
            continue;
        }
        let parsed = cells
            .iter()
            .zip(&names)
            .map(|(cell, name)| parse_cell(cell, row + 1, name))
            .collect::<Result<Vec<_>, _>>()?;
        values.push(parsed);
    }
    if dropped > 0 {
        log::warn!("Dropped {dropped} rows with missing values in {}", path.as_ref().display());
    }
    if values.is_empty() {
        return Err(DataError::NoCompleteRows);
    }

    let n = values.len();
    let offset = if with_target { 4 } else { 3 };
    let p = columns.features.len();
    let coords = Array2::from_shape_fn((n, 2), |(i, j)| values[i][j]);
    let times = Array1::from_shape_fn(n, |i| values[i][2]);
    let y = with_target.then(|| Array1::from_shape_fn(n, |i| values[i][3]));
    let x = Array2::from_shape_fn((n, p), |(i, j)| values[i][offset + j]);
    log::info!(
        "Loaded {n} rows with {p} features from {}",
        path.as_ref().display()
    );
    Ok(TableData { x, y, coords, times })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn columns() -> ColumnSpec {
        ColumnSpec {
            lat: "lat".into(),
            lon: "lon".into(),
            time: "year".into(),
            target: "price".into(),
            features: vec!["area".into(), "rooms".into()],
        }
    }

    fn write_table(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn loads_selected_columns_and_drops_incomplete_rows() {
        let file = write_table(
            "year,lat,lon,rooms,area,price,notes\n\
             2020,10.0,20.0,3,75.5,1.5,a\n\
             2020,10.5,20.5,,80.0,1.7,b\n\
             2021,11.0,21.0,4,90.0,2.1,\n",
        );
        let table = load_table(file.path(), &columns(), b',', true).unwrap();
        assert_eq!(table.x.dim(), (2, 2));
        assert_eq!(table.x.row(1).to_vec(), vec![90.0, 4.0]);
        assert_eq!(table.coords.row(0).to_vec(), vec![10.0, 20.0]);
        assert_eq!(table.times.to_vec(), vec![2020.0, 2021.0]);
        assert_eq!(table.y.unwrap().to_vec(), vec![1.5, 2.1]);
    }

    #[test]
    fn target_is_optional_for_prediction_tables() {
        let file = write_table("lat\tlon\tyear\tarea\trooms\n1\t2\t2022\t50\t2\n");
        let table = load_table(file.path(), &columns(), b'\t', false).unwrap();
        assert!(table.y.is_none());
        assert_eq!(table.x.dim(), (1, 2));
    }

    #[test]
    fn reports_missing_columns_and_bad_values() {
        let file = write_table("lat,lon,year,area,price\n1,2,2020,5,1\n");
        assert!(matches!(
            load_table(file.path(), &columns(), b',', true),
            Err(DataError::ColumnNotFound(c)) if c == "rooms"
        ));

        let file = write_table("lat,lon,year,area,rooms,price\n1,2,2020,big,3,1\n");
        assert!(matches!(
            load_table(file.path(), &columns(), b',', true),
            Err(DataError::Parse { row: 1, ref column, .. }) if column == "area"
        ));

        let file = write_table("lat,lon,year,area,rooms,price\n1,2,2020,inf,3,1\n");
        assert!(matches!(
            load_table(file.path(), &columns(), b',', true),
            Err(DataError::NonFinite { .. })
        ));
    }
}
