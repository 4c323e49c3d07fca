//! Core domain model shared by the MFR ingest and reconcile crates.

use std::fmt;
use std::ops::Deref;
use std::path::PathBuf;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "mfr-core";

/// Column appended to every loaded table naming the file it came from.
pub const PROVENANCE_COLUMN: &str = "SourceFile";

/// Last path segment, accepting both `/` and `\` separators.
pub fn base_name(path: &str) -> &str {
    path.rsplit(['/', '\\']).next().unwrap_or(path)
}

/// One object or file reported by a storage listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteEntry {
    /// Full path inside the container or share.
    pub path: String,
    pub name: String,
    pub last_modified: DateTime<Utc>,
    pub size: Option<u64>,
}

impl RemoteEntry {
    pub fn new(path: impl Into<String>, last_modified: DateTime<Utc>, size: Option<u64>) -> Self {
        let path = path.into();
        let name = base_name(&path).to_string();
        Self {
            path,
            name,
            last_modified,
            size,
        }
    }
}

/// A remote entry materialized on local scratch storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LocalFile {
    pub path: PathBuf,
    pub byte_size: u64,
    pub sha256: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub enum Cell {
    #[default]
    Empty,
    Text(String),
    Number(f64),
    Bool(bool),
    DateTime(NaiveDateTime),
}

impl Cell {
    /// Empty cells and whitespace-only text both count as blank.
    pub fn is_blank(&self) -> bool {
        match self {
            Cell::Empty => true,
            Cell::Text(s) => s.trim().is_empty(),
            _ => false,
        }
    }

    pub fn as_text(&self) -> Option<String> {
        if self.is_blank() {
            None
        } else {
            Some(self.to_string())
        }
    }
}

impl fmt::Display for Cell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cell::Empty => Ok(()),
            Cell::Text(s) => f.write_str(s),
            Cell::Number(n) => write!(f, "{n}"),
            Cell::Bool(b) => write!(f, "{b}"),
            Cell::DateTime(dt) => write!(f, "{}", dt.format("%Y-%m-%d %H:%M:%S")),
        }
    }
}

impl From<&str> for Cell {
    fn from(value: &str) -> Self {
        if value.is_empty() {
            Cell::Empty
        } else {
            Cell::Text(value.to_string())
        }
    }
}

/// Column-ordered table as parsed from a source file.
///
/// Equality is structural: same columns, same row count, same cells in order.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct Table {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Cell>>,
}

impl Table {
    pub fn new(columns: Vec<String>, rows: Vec<Vec<Cell>>) -> Self {
        Self { columns, rows }
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column_index(name).is_some()
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// Set every row's `name` cell to `value`, appending the column if missing.
    pub fn set_constant_column(&mut self, name: &str, value: Cell) {
        match self.column_index(name) {
            Some(idx) => {
                for row in &mut self.rows {
                    if row.len() <= idx {
                        row.resize(idx + 1, Cell::Empty);
                    }
                    row[idx] = value.clone();
                }
            }
            None => {
                let width = self.columns.len();
                self.columns.push(name.to_string());
                for row in &mut self.rows {
                    row.resize(width, Cell::Empty);
                    row.push(value.clone());
                }
            }
        }
    }

    pub fn cell(&self, row: usize, column: &str) -> Option<&Cell> {
        let idx = self.column_index(column)?;
        self.rows.get(row).and_then(|r| r.get(idx))
    }
}

/// A table already reshaped to a feed's canonical column list.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NormalizedTable(Table);

impl NormalizedTable {
    /// Wrap a table the caller has projected onto the canonical columns.
    pub fn new(table: Table) -> Self {
        Self(table)
    }

    pub fn into_table(self) -> Table {
        self.0
    }
}

impl Deref for NormalizedTable {
    type Target = Table;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// Row-level classification produced by the reconciler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeType {
    Inserted,
    Updated,
    Unchanged,
}

impl ChangeType {
    pub fn as_str(self) -> &'static str {
        match self {
            ChangeType::Inserted => "Inserted",
            ChangeType::Updated => "Updated",
            ChangeType::Unchanged => "Unchanged",
        }
    }
}

/// One row of the processed-file audit trail. The timestamp is server-assigned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuditRecord {
    pub file_name: String,
    pub source: String,
}
