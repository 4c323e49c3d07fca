//! Per-feed schema contracts: required columns, projection, renaming and
//! column transforms.

use chrono::NaiveDate;
use mfr_core::{Cell, NormalizedTable, Table};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransformKind {
    /// Reformat a reporting period to `DD-MM-YYYY`.
    PeriodDate,
    Trim,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnTransform {
    pub column: String,
    pub kind: TransformKind,
}

/// Column contract for one feed.
///
/// `select` picks source columns in order (defaults to `columns`), which are then
/// renamed positionally to `columns`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FeedSchema {
    #[serde(default)]
    pub passthrough: bool,
    #[serde(default)]
    pub required: Vec<String>,
    #[serde(default)]
    pub select: Vec<String>,
    #[serde(default)]
    pub columns: Vec<String>,
    #[serde(default)]
    pub transforms: Vec<ColumnTransform>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchemaConfigError {
    #[error("schema selects {selected} columns but names {canonical} canonical columns")]
    ColumnCountMismatch { selected: usize, canonical: usize },
    #[error("selected column {0:?} is neither present in the file nor required")]
    UnknownSelectedColumn(String),
    #[error("transform targets column {0:?} which is not a canonical column")]
    UnknownTransformColumn(String),
    #[error("schema names no canonical columns")]
    NoColumns,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Rejection {
    MissingColumns(Vec<String>),
    InvalidValue {
        column: String,
        row: usize,
        value: String,
    },
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Rejection::MissingColumns(cols) => {
                write!(f, "missing required columns: {}", cols.join(", "))
            }
            Rejection::InvalidValue { column, row, value } => {
                write!(f, "row {row} has invalid {column} value {value:?}")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Normalized {
    Accepted(NormalizedTable),
    Rejected(Rejection),
}

impl FeedSchema {
    /// The generic metrics contract shared by the upload feeds.
    pub fn generic_metrics() -> Self {
        let required = ["Metric Name", "Period", "Specialty/Trust", "Numerator", "Denominator"]
            .map(String::from)
            .to_vec();
        let mut columns = required.clone();
        columns.push(mfr_core::PROVENANCE_COLUMN.to_string());
        Self {
            passthrough: false,
            required,
            select: Vec::new(),
            columns,
            transforms: vec![ColumnTransform {
                column: "Period".to_string(),
                kind: TransformKind::PeriodDate,
            }],
        }
    }

    pub fn selection(&self) -> &[String] {
        if self.select.is_empty() {
            &self.columns
        } else {
            &self.select
        }
    }

    /// Checks that hold regardless of file content.
    pub fn validate(&self) -> Result<(), SchemaConfigError> {
        if self.passthrough {
            return Ok(());
        }
        if self.columns.is_empty() {
            return Err(SchemaConfigError::NoColumns);
        }
        if self.selection().len() != self.columns.len() {
            return Err(SchemaConfigError::ColumnCountMismatch {
                selected: self.selection().len(),
                canonical: self.columns.len(),
            });
        }
        if let Some(t) = self
            .transforms
            .iter()
            .find(|t| !self.columns.contains(&t.column))
        {
            return Err(SchemaConfigError::UnknownTransformColumn(t.column.clone()));
        }
        Ok(())
    }

    pub fn normalize(&self, table: Table) -> Result<Normalized, SchemaConfigError> {
        if self.passthrough {
            return Ok(Normalized::Accepted(NormalizedTable::new(table)));
        }
        self.validate()?;

        let missing = self
            .required
            .iter()
            .filter(|c| !table.has_column(c))
            .cloned()
            .collect::<Vec<_>>();
        if !missing.is_empty() {
            return Ok(Normalized::Rejected(Rejection::MissingColumns(missing)));
        }

        let indices = self
            .selection()
            .iter()
            .map(|name| {
                table
                    .column_index(name)
                    .ok_or_else(|| SchemaConfigError::UnknownSelectedColumn(name.clone()))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut rows = table
            .rows
            .into_iter()
            .map(|row| {
                indices
                    .iter()
                    .map(|&i| row.get(i).cloned().unwrap_or_default())
                    .collect::<Vec<_>>()
            })
            .collect::<Vec<_>>();

        for transform in &self.transforms {
            let idx = self
                .columns
                .iter()
                .position(|c| c == &transform.column)
                .ok_or_else(|| SchemaConfigError::UnknownTransformColumn(transform.column.clone()))?;
            for (row_no, row) in rows.iter_mut().enumerate() {
                let cell = std::mem::take(&mut row[idx]);
                row[idx] = match apply_transform(transform.kind, cell) {
                    Ok(cell) => cell,
                    Err(value) => {
                        return Ok(Normalized::Rejected(Rejection::InvalidValue {
                            column: transform.column.clone(),
                            row: row_no + 1,
                            value,
                        }))
                    }
                };
            }
        }

        Ok(Normalized::Accepted(NormalizedTable::new(Table::new(
            self.columns.clone(),
            rows,
        ))))
    }
}

fn apply_transform(kind: TransformKind, cell: Cell) -> Result<Cell, String> {
    match kind {
        TransformKind::PeriodDate => normalize_period(&cell),
        TransformKind::Trim => Ok(match cell {
            Cell::Text(s) => Cell::from(s.trim()),
            other => other,
        }),
    }
}

/// Render a reporting period as `DD-MM-YYYY`.
///
/// A trailing time of day is ignored and a single leading `01/` is dropped, so
/// `01/04/2024 00:00:00` reads as April 2024. Blank cells stay blank. On failure
/// the offending text is returned.
pub fn normalize_period(cell: &Cell) -> Result<Cell, String> {
    let date = match cell {
        c if c.is_blank() => return Ok(Cell::Empty),
        Cell::DateTime(dt) => dt.date(),
        other => {
            let raw = other.to_string();
            let text = raw.split_whitespace().next().unwrap_or_default();
            let text = text.strip_prefix("01/").unwrap_or(text);
            parse_period_text(text).ok_or(raw)?
        }
    };
    Ok(Cell::Text(date.format("%d-%m-%Y").to_string()))
}

fn parse_period_text(text: &str) -> Option<NaiveDate> {
    if text.matches('/').count() == 1 {
        return NaiveDate::parse_from_str(&format!("01/{text}"), "%d/%m/%Y").ok();
    }
    const FORMATS: [&str; 3] = ["%d/%m/%Y", "%Y-%m-%d", "%d-%m-%Y"];
    if let Some(date) = FORMATS
        .iter()
        .find_map(|f| NaiveDate::parse_from_str(text, f).ok())
    {
        return Some(date);
    }
    chrono::NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S")
        .ok()
        .map(|dt| dt.date())
}

/// True when `current` is identical to the previously processed table of the
/// same feed.
pub fn is_duplicate(previous: Option<&NormalizedTable>, current: &NormalizedTable) -> bool {
    previous.is_some_and(|prev| prev == current)
}
