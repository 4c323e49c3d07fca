use std::path::{Path, PathBuf};

use mfr_core::{Cell, PROVENANCE_COLUMN};
use mfr_tabular::{is_duplicate, load_table, FeedSchema, Normalized, Rejection};

fn fixture(name: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../../fixtures/generic")
        .join(name)
}

#[test]
fn generic_fixture_normalizes_to_canonical_columns() {
    let schema = FeedSchema::generic_metrics();
    let table = load_table(&fixture("metrics_2024_04.csv")).unwrap();
    assert!(table.has_column("Notes"));

    let Normalized::Accepted(normalized) = schema.normalize(table).unwrap() else {
        panic!("generic fixture should be accepted");
    };
    assert_eq!(normalized.columns, schema.columns);
    assert_eq!(normalized.row_count(), 4);
    assert_eq!(normalized.cell(3, "Period"), Some(&Cell::from("01-04-2024")));
    assert_eq!(normalized.cell(2, "Numerator"), Some(&Cell::Empty));
    assert_eq!(
        normalized.cell(0, PROVENANCE_COLUMN),
        Some(&Cell::from("metrics_2024_04.csv"))
    );
}

#[test]
fn reloading_the_same_file_is_a_duplicate() {
    let schema = FeedSchema::generic_metrics();
    let load = || match schema.normalize(load_table(&fixture("metrics_2024_04.csv")).unwrap()) {
        Ok(Normalized::Accepted(t)) => t,
        other => panic!("unexpected {other:?}"),
    };
    let first = load();
    assert!(is_duplicate(Some(&first), &load()));
}

#[test]
fn fixture_missing_columns_is_rejected() {
    let schema = FeedSchema::generic_metrics();
    let table = load_table(&fixture("metrics_missing_columns.csv")).unwrap();
    assert!(matches!(
        schema.normalize(table).unwrap(),
        Normalized::Rejected(Rejection::MissingColumns(ref cols)) if cols.len() == 2
    ));
}
