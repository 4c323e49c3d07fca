//! Pure classification of staged metric rows against the current target rows.

use std::collections::HashMap;

use chrono::NaiveDate;
use mfr_core::ChangeType;
use serde::Serialize;

/// Natural key of a target metric row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct MetricKey {
    pub measure_id: i64,
    pub period: NaiveDate,
    pub dim1: String,
}

/// A staged row after measure resolution and value parsing.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceRow {
    pub key: MetricKey,
    pub numerator: Option<f64>,
    pub denominator: Option<f64>,
    pub source_file: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TargetRow {
    pub key: MetricKey,
    pub numerator: Option<f64>,
    pub denominator: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MergeAction {
    pub change: ChangeType,
    pub row: SourceRow,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MergeSummary {
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    /// Staged rows excluded before planning: blank numerator or period, or an
    /// unknown measure.
    pub skipped: usize,
}

impl MergeSummary {
    pub fn written(&self) -> usize {
        self.inserted + self.updated
    }

    pub fn absorb(&mut self, other: MergeSummary) {
        self.inserted += other.inserted;
        self.updated += other.updated;
        self.unchanged += other.unchanged;
        self.skipped += other.skipped;
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MergePlan {
    pub actions: Vec<MergeAction>,
}

impl MergePlan {
    pub fn summary(&self) -> MergeSummary {
        let mut summary = MergeSummary::default();
        for action in &self.actions {
            match action.change {
                ChangeType::Inserted => summary.inserted += 1,
                ChangeType::Updated => summary.updated += 1,
                ChangeType::Unchanged => summary.unchanged += 1,
            }
        }
        summary
    }

    pub fn writes(&self) -> impl Iterator<Item = &MergeAction> {
        self.actions
            .iter()
            .filter(|a| a.change != ChangeType::Unchanged)
    }
}

/// Classify each staged row as an insert, an update or a no-op.
///
/// Rows sharing a key collapse to the last one staged. Target rows with no
/// staged counterpart are not represented in the plan.
pub fn plan_merge(source: Vec<SourceRow>, existing: &[TargetRow]) -> MergePlan {
    let mut order: Vec<SourceRow> = Vec::with_capacity(source.len());
    let mut positions: HashMap<MetricKey, usize> = HashMap::new();
    for row in source {
        match positions.get(&row.key) {
            Some(&idx) => order[idx] = row,
            None => {
                positions.insert(row.key.clone(), order.len());
                order.push(row);
            }
        }
    }

    let current = existing
        .iter()
        .map(|t| (&t.key, t))
        .collect::<HashMap<_, _>>();

    let actions = order
        .into_iter()
        .map(|row| {
            let change = match current.get(&row.key) {
                None => ChangeType::Inserted,
                Some(target)
                    if target.numerator != row.numerator
                        || target.denominator != row.denominator =>
                {
                    ChangeType::Updated
                }
                Some(_) => ChangeType::Unchanged,
            };
            MergeAction { change, row }
        })
        .collect();

    MergePlan { actions }
}
