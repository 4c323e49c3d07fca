//! Tabular loading for downloaded feed files plus schema normalization.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use calamine::{open_workbook_auto, Data, DataType, Reader};
use mfr_core::{Cell, Table, PROVENANCE_COLUMN};
use thiserror::Error;
use tracing::debug;

mod schema;

pub use schema::{
    is_duplicate, normalize_period, ColumnTransform, FeedSchema, Normalized, Rejection,
    SchemaConfigError, TransformKind,
};

pub const CRATE_NAME: &str = "mfr-tabular";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileFormat {
    Csv,
    Excel,
}

impl FileFormat {
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "csv" => Some(Self::Csv),
            "xls" | "xlsx" => Some(Self::Excel),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("{} is not a csv, xls or xlsx file", path.display())]
    UnsupportedFormat { path: PathBuf },
    #[error("reading csv {}: {source}", path.display())]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
    #[error("reading workbook {}: {source}", path.display())]
    Workbook {
        path: PathBuf,
        #[source]
        source: calamine::Error,
    },
    #[error("{}: {reason}", path.display())]
    Malformed { path: PathBuf, reason: String },
}

/// Parse a local csv or Excel file and stamp every row with its base file name.
pub fn load_table(path: &Path) -> Result<Table, LoadError> {
    let format = FileFormat::from_path(path).ok_or_else(|| LoadError::UnsupportedFormat {
        path: path.to_path_buf(),
    })?;

    let mut table = match format {
        FileFormat::Csv => read_csv(path)?,
        FileFormat::Excel => read_workbook(path)?,
    };

    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default()
        .to_string();
    table.set_constant_column(PROVENANCE_COLUMN, Cell::from(file_name.as_str()));

    debug!(
        path = %path.display(),
        columns = table.columns.len(),
        rows = table.row_count(),
        "loaded table"
    );
    Ok(table)
}

fn header_name(raw: &str, idx: usize) -> String {
    let trimmed = raw.trim_start_matches('\u{feff}').trim();
    if trimmed.is_empty() {
        format!("Unnamed: {idx}")
    } else {
        trimmed.to_string()
    }
}

/// Suffix repeated header names with `.1`, `.2`, ... so every column name is
/// unique, skipping suffixes that collide with a name already present.
fn unique_headers(columns: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut next_suffix: HashMap<String, usize> = HashMap::new();
    columns
        .into_iter()
        .map(|name| {
            if seen.insert(name.clone()) {
                return name;
            }
            let counter = next_suffix.entry(name.clone()).or_insert(1);
            loop {
                let candidate = format!("{name}.{counter}");
                *counter += 1;
                if seen.insert(candidate.clone()) {
                    break candidate;
                }
            }
        })
        .collect()
}

/// Fit a parsed row to the header width. Short rows are padded; long rows may
/// only carry blank overflow.
fn fit_row(path: &Path, line: usize, mut row: Vec<Cell>, width: usize) -> Result<Vec<Cell>, LoadError> {
    if row.len() > width {
        if row[width..].iter().any(|c| !c.is_blank()) {
            return Err(LoadError::Malformed {
                path: path.to_path_buf(),
                reason: format!(
                    "row {line} has {} fields but the header has {width}",
                    row.len()
                ),
            });
        }
        row.truncate(width);
    }
    row.resize(width, Cell::Empty);
    Ok(row)
}

fn read_csv(path: &Path) -> Result<Table, LoadError> {
    let csv_err = |source| LoadError::Csv {
        path: path.to_path_buf(),
        source,
    };

    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_path(path)
        .map_err(csv_err)?;

    let columns = unique_headers(
        reader
            .byte_headers()
            .map_err(csv_err)?
            .iter()
            .enumerate()
            .map(|(idx, raw)| header_name(&String::from_utf8_lossy(raw), idx))
            .collect(),
    );
    if columns.is_empty() {
        return Err(LoadError::Malformed {
            path: path.to_path_buf(),
            reason: "file has no header row".to_string(),
        });
    }

    let mut rows = Vec::new();
    for (line, record) in reader.byte_records().enumerate() {
        let record = record.map_err(csv_err)?;
        let cells = record
            .iter()
            .map(|raw| Cell::from(String::from_utf8_lossy(raw).as_ref()))
            .collect::<Vec<_>>();
        if cells.iter().all(Cell::is_blank) {
            continue;
        }
        rows.push(fit_row(path, line + 2, cells, columns.len())?);
    }

    Ok(Table::new(columns, rows))
}

fn excel_cell(cell: &Data) -> Cell {
    match cell {
        Data::Empty | Data::Error(_) => Cell::Empty,
        Data::String(s) => Cell::from(s.as_str()),
        Data::Float(f) => Cell::Number(*f),
        Data::Int(i) => Cell::Number(*i as f64),
        Data::Bool(b) => Cell::Bool(*b),
        Data::DateTime(_) | Data::DateTimeIso(_) => cell
            .as_datetime()
            .map(Cell::DateTime)
            .unwrap_or_else(|| Cell::Text(cell.to_string())),
        other => Cell::Text(other.to_string()),
    }
}

fn read_workbook(path: &Path) -> Result<Table, LoadError> {
    let wb_err = |source| LoadError::Workbook {
        path: path.to_path_buf(),
        source,
    };

    let mut workbook = open_workbook_auto(path).map_err(wb_err)?;
    let sheet = workbook
        .sheet_names()
        .first()
        .cloned()
        .ok_or_else(|| LoadError::Malformed {
            path: path.to_path_buf(),
            reason: "workbook has no worksheets".to_string(),
        })?;
    let range = workbook.worksheet_range(&sheet).map_err(wb_err)?;

    let mut raw_rows = range.rows();
    let columns = raw_rows
        .next()
        .map(|header| {
            unique_headers(
                header
                    .iter()
                    .enumerate()
                    .map(|(idx, cell)| header_name(&excel_cell(cell).to_string(), idx))
                    .collect(),
            )
        })
        .ok_or_else(|| LoadError::Malformed {
            path: path.to_path_buf(),
            reason: format!("worksheet {sheet:?} is empty"),
        })?;

    let mut rows = Vec::new();
    for (line, raw) in raw_rows.enumerate() {
        let cells = raw.iter().map(excel_cell).collect::<Vec<_>>();
        if cells.iter().all(Cell::is_blank) {
            continue;
        }
        rows.push(fit_row(path, line + 2, cells, columns.len())?);
    }

    Ok(Table::new(columns, rows))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn csv_rows_get_provenance_column() {
        let tmp = tempfile::tempdir().unwrap();
        let path = write(
            tmp.path(),
            "metrics.csv",
            "Metric Name,Period,Numerator\nA&E 4hr,01/04/2024,12\nRTT,01/04/2024,\n",
        );

        let table = load_table(&path).unwrap();
        assert_eq!(
            table.columns,
            vec!["Metric Name", "Period", "Numerator", PROVENANCE_COLUMN]
        );
        assert_eq!(table.row_count(), 2);
        assert_eq!(table.cell(0, "Numerator"), Some(&Cell::from("12")));
        assert_eq!(table.cell(1, "Numerator"), Some(&Cell::Empty));
        assert_eq!(table.cell(1, PROVENANCE_COLUMN), Some(&Cell::from("metrics.csv")));
    }

    #[test]
    fn existing_provenance_column_is_overwritten() {
        let tmp = tempfile::tempdir().unwrap();
        let path = write(tmp.path(), "new.csv", "A,SourceFile\n1,old.csv\n");

        let table = load_table(&path).unwrap();
        assert_eq!(table.columns, vec!["A", PROVENANCE_COLUMN]);
        assert_eq!(table.cell(0, PROVENANCE_COLUMN), Some(&Cell::from("new.csv")));
    }

    #[test]
    fn bom_short_rows_and_blank_lines_are_tolerated() {
        let tmp = tempfile::tempdir().unwrap();
        let path = write(tmp.path(), "bom.CSV", "\u{feff}A,B,C\n1,2\n,,\n3,4,5\n");

        let table = load_table(&path).unwrap();
        assert_eq!(table.columns[0], "A");
        assert_eq!(table.row_count(), 2);
        assert_eq!(table.rows[0][2], Cell::Empty);
        assert_eq!(table.rows[1][2], Cell::from("5"));
    }

    #[test]
    fn repeated_headers_get_numeric_suffixes() {
        let tmp = tempfile::tempdir().unwrap();
        let path = write(tmp.path(), "er.csv", "Trust,Value,Value,Value.1,Value
A,1,2,3,4
");

        let table = load_table(&path).unwrap();
        assert_eq!(
            table.columns,
            vec!["Trust", "Value", "Value.1", "Value.1.1", "Value.2", PROVENANCE_COLUMN]
        );
        assert_eq!(table.cell(0, "Value.1"), Some(&Cell::from("2")));
        assert_eq!(table.cell(0, "Value.2"), Some(&Cell::from("4")));
    }

    #[test]
    fn blank_headers_stay_unique_after_naming() {
        assert_eq!(
            unique_headers(vec!["A".into(), "A".into(), "Unnamed: 2".into()]),
            vec!["A", "A.1", "Unnamed: 2"]
        );
    }

    #[test]
    fn overlong_rows_are_malformed() {
        let tmp = tempfile::tempdir().unwrap();
        let path = write(tmp.path(), "wide.csv", "A,B\n1,2,3\n");

        let err = load_table(&path).unwrap_err();
        assert!(matches!(err, LoadError::Malformed { .. }), "{err}");
    }

    #[test]
    fn unsupported_extension_is_rejected_before_reading() {
        let err = load_table(Path::new("/nonexistent/report.pdf")).unwrap_err();
        assert!(matches!(err, LoadError::UnsupportedFormat { .. }));
        assert_eq!(FileFormat::from_path(Path::new("x.XLSX")), Some(FileFormat::Excel));
    }

    #[test]
    fn corrupt_workbook_is_a_load_error() {
        let tmp = tempfile::tempdir().unwrap();
        let path = write(tmp.path(), "broken.xlsx", "not a zip archive");

        let err = load_table(&path).unwrap_err();
        assert!(matches!(err, LoadError::Workbook { .. }), "{err}");
    }
}
