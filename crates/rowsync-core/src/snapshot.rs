//! Versioned row snapshots.
//!
//! A [`Snapshot`] is an immutable copy of one database row's column values,
//! stamped with a monotonically increasing version. Snapshots never mutate:
//! diff application produces a new snapshot whose `replaces` field records
//! the version it superseded, which is what lets the cache detect torn or
//! out-of-order merges.

use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_VERSION: AtomicU64 = AtomicU64::new(1);

/// An immutable, versioned mapping of column names to scalar values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    values: BTreeMap<String, Value>,
    version: u64,
    replaces: Option<u64>,
}

/// A column-level difference between two snapshots of the same row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotDiff {
    changed: BTreeMap<String, Value>,
}

impl Snapshot {
    /// Build a snapshot from column/value pairs, stamping a fresh version.
    pub fn new(values: impl IntoIterator<Item = (String, Value)>) -> Self {
        Self {
            values: values.into_iter().collect(),
            version: NEXT_VERSION.fetch_add(1, Ordering::Relaxed),
            replaces: None,
        }
    }

    /// Build a snapshot that declares itself the successor of `replaces`.
    pub fn replacing(
        values: impl IntoIterator<Item = (String, Value)>,
        replaces: u64,
    ) -> Self {
        Self {
            values: values.into_iter().collect(),
            version: NEXT_VERSION.fetch_add(1, Ordering::Relaxed),
            replaces: Some(replaces),
        }
    }

    /// The snapshot's version stamp.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// The version this snapshot replaces, if it was derived from another.
    pub fn replaces(&self) -> Option<u64> {
        self.replaces
    }

    /// Get a column value.
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.values.get(column)
    }

    /// Whether the given column is present and NULL.
    pub fn is_null(&self, column: &str) -> bool {
        matches!(self.values.get(column), Some(Value::Null))
    }

    /// Iterate over column/value pairs in column order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Number of columns.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether the snapshot carries no columns.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Compute the columns on which `newer` differs from `self`.
    ///
    /// Returns `None` when the rows are value-identical (version stamps are
    /// not compared; only data matters for diffing). A column absent from
    /// this snapshot compares equal to NULL, so partial row images do not
    /// report phantom changes.
    pub fn diff(&self, newer: &Snapshot) -> Option<SnapshotDiff> {
        let mut changed = BTreeMap::new();
        for (col, val) in &newer.values {
            if self.values.get(col).unwrap_or(&Value::Null) != val {
                changed.insert(col.clone(), val.clone());
            }
        }
        if changed.is_empty() {
            None
        } else {
            Some(SnapshotDiff { changed })
        }
    }

    /// Produce a new snapshot with the diff overlaid on this one.
    ///
    /// The result gets a fresh version and records this snapshot's version
    /// as the one it replaces.
    pub fn apply_diff(&self, diff: &SnapshotDiff) -> Snapshot {
        let mut values = self.values.clone();
        for (col, val) in &diff.changed {
            values.insert(col.clone(), val.clone());
        }
        Self::replacing(values, self.version)
    }
}

impl FromIterator<(String, Value)> for Snapshot {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self::new(iter)
    }
}

impl SnapshotDiff {
    /// Build a diff directly from changed column/value pairs.
    pub fn new(changed: impl IntoIterator<Item = (String, Value)>) -> Self {
        Self {
            changed: changed.into_iter().collect(),
        }
    }

    /// The changed column/value pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.changed.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Whether any column changed.
    pub fn is_empty(&self) -> bool {
        self.changed.is_empty()
    }

    /// Whether the diff touches the given column.
    pub fn contains(&self, column: &str) -> bool {
        self.changed.contains_key(column)
    }
}
