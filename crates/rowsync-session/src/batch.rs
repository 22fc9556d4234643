//! DML batch construction.
//!
//! The commit pipeline folds per-object changes into multi-row batches, one
//! per statement shape. Updates batch together only when they touch the same
//! table with the same changed-column set and the same set of NULL qualifier
//! columns (NULL comparisons change the WHERE shape); batch discovery order
//! is preserved so execution is deterministic.

use rowsync_core::{DmlKind, DmlRow, DmlTemplate, ObjectId};
use std::collections::BTreeSet;

/// One row in a batch: binds plus the identity it came from, kept for
/// optimistic-lock diagnostics.
#[derive(Debug, Clone)]
pub struct BatchRow {
    /// The object the row belongs to; `None` for join-table rows.
    pub id: Option<ObjectId>,
    pub row: DmlRow,
}

/// A multi-row INSERT against one table.
#[derive(Debug, Clone)]
pub struct InsertBatch {
    pub table: String,
    pub columns: Vec<String>,
    pub rows: Vec<BatchRow>,
}

impl InsertBatch {
    pub fn new(table: impl Into<String>, columns: Vec<String>) -> Self {
        Self {
            table: table.into(),
            columns,
            rows: Vec::new(),
        }
    }

    pub fn template(&self) -> DmlTemplate {
        DmlTemplate {
            kind: DmlKind::Insert,
            table: self.table.clone(),
            columns: self.columns.clone(),
            qualifier: Vec::new(),
        }
    }
}

/// Structural identity of an update batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateKey {
    pub table: String,
    /// Columns the SET clause writes.
    pub changed: BTreeSet<String>,
    /// Qualifier columns whose value is NULL for these rows.
    pub null_qualifiers: BTreeSet<String>,
}

/// A multi-row UPDATE sharing one statement shape.
#[derive(Debug, Clone)]
pub struct UpdateBatch {
    pub key: UpdateKey,
    /// SET columns in deterministic (sorted) order.
    pub changed_columns: Vec<String>,
    /// WHERE columns: primary key first, then locking columns.
    pub qualifier_columns: Vec<String>,
    /// Whether zero affected rows signals a lock failure.
    pub uses_lock: bool,
    pub rows: Vec<BatchRow>,
}

impl UpdateBatch {
    pub fn template(&self) -> DmlTemplate {
        DmlTemplate {
            kind: DmlKind::Update,
            table: self.key.table.clone(),
            columns: self.changed_columns.clone(),
            qualifier: self.qualifier_columns.clone(),
        }
    }
}

/// Update batches in first-seen order.
#[derive(Debug, Default)]
pub struct UpdateBatchSet {
    batches: Vec<UpdateBatch>,
}

impl UpdateBatchSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Find the batch for a key, creating it at the end on first sight.
    pub fn get_or_insert(
        &mut self,
        key: UpdateKey,
        qualifier_columns: Vec<String>,
        uses_lock: bool,
    ) -> &mut UpdateBatch {
        if let Some(pos) = self.batches.iter().position(|b| b.key == key) {
            return &mut self.batches[pos];
        }
        let changed_columns: Vec<String> = key.changed.iter().cloned().collect();
        let idx = self.batches.len();
        self.batches.push(UpdateBatch {
            key,
            changed_columns,
            qualifier_columns,
            uses_lock,
            rows: Vec::new(),
        });
        &mut self.batches[idx]
    }

    pub fn iter(&self) -> impl Iterator<Item = &UpdateBatch> {
        self.batches.iter()
    }

    pub fn into_vec(self) -> Vec<UpdateBatch> {
        self.batches
    }

    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }
}

/// A multi-row DELETE sharing one qualifier shape.
#[derive(Debug, Clone)]
pub struct DeleteBatch {
    pub table: String,
    pub null_qualifiers: BTreeSet<String>,
    pub qualifier_columns: Vec<String>,
    pub uses_lock: bool,
    pub rows: Vec<BatchRow>,
}

impl DeleteBatch {
    pub fn template(&self) -> DmlTemplate {
        DmlTemplate {
            kind: DmlKind::Delete,
            table: self.table.clone(),
            columns: Vec::new(),
            qualifier: self.qualifier_columns.clone(),
        }
    }
}

/// Delete batches in first-seen order.
#[derive(Debug, Default)]
pub struct DeleteBatchSet {
    batches: Vec<DeleteBatch>,
}

impl DeleteBatchSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_insert(
        &mut self,
        table: &str,
        null_qualifiers: BTreeSet<String>,
        qualifier_columns: Vec<String>,
        uses_lock: bool,
    ) -> &mut DeleteBatch {
        if let Some(pos) = self
            .batches
            .iter()
            .position(|b| b.table == table && b.null_qualifiers == null_qualifiers)
        {
            return &mut self.batches[pos];
        }
        let idx = self.batches.len();
        self.batches.push(DeleteBatch {
            table: table.to_string(),
            null_qualifiers,
            qualifier_columns,
            uses_lock,
            rows: Vec::new(),
        });
        &mut self.batches[idx]
    }

    pub fn iter(&self) -> impl Iterator<Item = &DeleteBatch> {
        self.batches.iter()
    }

    pub fn into_vec(self) -> Vec<DeleteBatch> {
        self.batches
    }

    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }
}
