//! Commit pipeline.
//!
//! One commit pass turns the store's pending changes into executed SQL:
//!
//! 1. classify registered objects (insert / update / delete);
//! 2. reject writes through read-only entities before any SQL runs;
//! 3. generate permanent keys for new objects, masters before dependents;
//! 4. fold changes into per-table batches (updates grouped by changed-column
//!    and NULL-qualifier shape, in discovery order);
//! 5. execute everything inside one transaction per data source: inserts,
//!    join-row inserts, updates, join-row deletes, deletes;
//! 6. on success, re-key objects, settle states, refresh retained snapshots
//!    and hand the change set back for publication to the shared cache.
//!
//! Any failure before step 6 leaves the in-memory object graph untouched, so
//! a recoverable error (deny, optimistic lock) can be fixed and retried.

use crate::batch::{
    BatchRow, DeleteBatch, DeleteBatchSet, InsertBatch, UpdateBatch, UpdateBatchSet, UpdateKey,
};
use crate::execute;
use crate::object_store::{Classification, FlattenedArc, ObjectStore};
use rowsync_cache::SnapshotChanges;
use rowsync_core::entity::{EntityInfo, LockType};
use rowsync_core::error::{ConfigError, IntegrityError, ReadOnlyError};
use rowsync_core::{
    Connection, DbAdapter, DmlRow, EntitySorter, Error, ObjectId, Result, Snapshot, SnapshotDiff,
    Value,
};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Row counts from one successful commit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommitStats {
    pub inserted: usize,
    pub updated: usize,
    pub deleted: usize,
    /// Join-table rows written or removed for flattened relationships.
    pub join_rows: usize,
}

impl CommitStats {
    pub fn is_empty(&self) -> bool {
        self.inserted == 0 && self.updated == 0 && self.deleted == 0 && self.join_rows == 0
    }
}

enum Op {
    Insert(InsertBatch),
    Update(UpdateBatch),
    Delete(DeleteBatch),
}

/// Commit all pending changes in the store.
///
/// A no-op when nothing is pending. On success the store is settled and the
/// returned change set is ready to push into the shared cache (the caller
/// does that after releasing its store lock, so cache listeners can re-enter
/// the store freely); on failure the store is exactly as it was before the
/// call.
#[tracing::instrument(level = "info", skip_all)]
pub fn commit(
    store: &mut ObjectStore,
    adapters: &HashMap<String, Arc<dyn DbAdapter>>,
    sorter: &dyn EntitySorter,
) -> Result<(CommitStats, SnapshotChanges)> {
    let classification = store.classify_for_commit();
    let arc_inserts: Vec<FlattenedArc> = store.pending_flattened_inserts().to_vec();
    let arc_deletes: Vec<FlattenedArc> = store.pending_flattened_deletes().to_vec();
    if classification.is_empty() && arc_inserts.is_empty() && arc_deletes.is_empty() {
        debug!("nothing to commit");
        return Ok((CommitStats::default(), SnapshotChanges::default()));
    }

    check_read_only(store, &classification, &arc_inserts, &arc_deletes)?;

    let insert_order = sorted_insert_entities(store, &classification, sorter)?;
    let mut rekeys = generate_keys(store, adapters, &classification, &insert_order)?;

    let mut ops: Vec<(String, Op)> = Vec::new();
    let mut updated_snapshots: Vec<(ObjectId, Snapshot)> = Vec::new();
    let mut replaced: Vec<ObjectId> = Vec::new();

    build_inserts(
        store,
        &classification,
        &insert_order,
        &rekeys,
        &mut ops,
        &mut updated_snapshots,
    )?;
    build_flattened_inserts(store, &arc_inserts, &rekeys, &mut ops)?;
    build_updates(
        store,
        &classification,
        &mut rekeys,
        &mut ops,
        &mut updated_snapshots,
        &mut replaced,
    )?;
    build_flattened_deletes(store, &arc_deletes, &rekeys, &mut ops)?;
    build_deletes(store, &classification, sorter, &mut ops)?;

    execute_plan(&ops, adapters)?;

    let stats = CommitStats {
        inserted: classification.inserts.len(),
        updated: classification.updates.len(),
        deleted: classification.deletes.len(),
        join_rows: arc_inserts.len() + arc_deletes.len(),
    };
    info!(
        inserted = stats.inserted,
        updated = stats.updated,
        deleted = stats.deleted,
        join_rows = stats.join_rows,
        "commit executed"
    );

    let indirect: Vec<ObjectId> = store.indirectly_modified().cloned().collect();
    store.commit_finalize(&rekeys, updated_snapshots.clone(), &classification.deletes);

    let mut cache_deleted = classification.deletes.clone();
    // PK-changing updates retire their old identity from the cache.
    cache_deleted.extend(replaced);
    let changes = SnapshotChanges {
        updated: updated_snapshots,
        deleted: cache_deleted,
        invalidated: Vec::new(),
        indirectly_modified: indirect,
    };

    Ok((stats, changes))
}

fn check_read_only(
    store: &ObjectStore,
    classification: &Classification,
    arc_inserts: &[FlattenedArc],
    arc_deletes: &[FlattenedArc],
) -> Result<()> {
    let registry = store.registry();
    let object_entities = classification
        .inserts
        .iter()
        .chain(&classification.updates)
        .chain(&classification.deletes)
        .map(|id| id.entity());
    let arc_entities = arc_inserts
        .iter()
        .chain(arc_deletes)
        .map(|a| a.source.entity());
    for entity in object_entities.chain(arc_entities) {
        if registry.get(entity)?.read_only {
            return Err(Error::ReadOnly(ReadOnlyError {
                entity: entity.to_string(),
            }));
        }
    }
    Ok(())
}

fn sorted_insert_entities(
    store: &ObjectStore,
    classification: &Classification,
    sorter: &dyn EntitySorter,
) -> Result<Vec<String>> {
    let mut entities: Vec<String> = Vec::new();
    for id in &classification.inserts {
        if !entities.iter().any(|e| e == id.entity()) {
            entities.push(id.entity().to_string());
        }
    }
    sorter.sort_entities(store.registry(), &mut entities)?;
    Ok(entities)
}

/// Assign permanent identities to all new objects, masters first so
/// propagated (dependent) keys can be copied from already-keyed masters.
fn generate_keys(
    store: &ObjectStore,
    adapters: &HashMap<String, Arc<dyn DbAdapter>>,
    classification: &Classification,
    insert_order: &[String],
) -> Result<HashMap<ObjectId, ObjectId>> {
    let mut rekeys: HashMap<ObjectId, ObjectId> = HashMap::new();

    for entity in insert_order {
        let info = store.registry().get(entity)?.clone();
        for id in classification.inserts.iter().filter(|i| i.entity() == entity) {
            let current = store.current_values(id)?;
            let mut key: Vec<(String, Value)> = Vec::new();
            let mut pending_generation: Vec<String> = Vec::new();

            'attrs: for attr in info.pk_attributes() {
                if let Some(value) = current.get(&attr.column)
                    && !value.is_null()
                {
                    key.push((attr.column.clone(), value.clone()));
                    continue;
                }
                for rel in info.master_pk_relationships() {
                    if rel.fk_column.as_deref() != Some(attr.column.as_str()) {
                        continue;
                    }
                    let value = propagated_key_value(store, id, rel, &rekeys)?;
                    key.push((attr.column.clone(), value));
                    continue 'attrs;
                }
                if attr.generated {
                    pending_generation.push(attr.column.clone());
                    continue;
                }
                return Err(Error::Config(ConfigError {
                    message: format!(
                        "cannot determine primary key column '{}' for new '{}' object: \
                         not generated, not supplied, not propagated",
                        attr.column, entity
                    ),
                }));
            }

            if pending_generation.len() > 1 {
                return Err(Error::Config(ConfigError {
                    message: format!(
                        "entity '{}' needs {} generated key columns; at most one is supported",
                        entity,
                        pending_generation.len()
                    ),
                }));
            }
            for column in pending_generation {
                let adapter = adapters.get(&info.data_source).ok_or_else(|| {
                    Error::Config(ConfigError {
                        message: format!("no adapter for data source '{}'", info.data_source),
                    })
                })?;
                key.push((column, adapter.generate_key(&info)?));
            }

            rekeys.insert(id.clone(), id.with_key(key));
        }
    }
    Ok(rekeys)
}

fn propagated_key_value(
    store: &ObjectStore,
    id: &ObjectId,
    rel: &rowsync_core::RelationshipInfo,
    rekeys: &HashMap<ObjectId, ObjectId>,
) -> Result<Value> {
    let object = store.get(id).ok_or_else(|| {
        Error::Integrity(IntegrityError {
            message: format!("object {} is not registered", id),
        })
    })?;
    let target = match object.to_one(&rel.name) {
        Some(Some(target)) => target.clone(),
        _ => {
            return Err(Error::Config(ConfigError {
                message: format!(
                    "new '{}' object has no '{}' master to propagate its key from",
                    id.entity(),
                    rel.name
                ),
            }));
        }
    };
    let target = if target.is_temporary() {
        rekeys
            .get(&target)
            .cloned()
            .ok_or_else(|| {
                Error::Integrity(IntegrityError {
                    message: format!("master {} was not keyed before its dependent", target),
                })
            })?
    } else {
        target
    };
    let pk_column = rel.target_pk_column.as_deref().ok_or_else(|| {
        Error::Config(ConfigError {
            message: format!("relationship '{}' lacks a target key column", rel.name),
        })
    })?;
    target.key_value(pk_column).cloned().ok_or_else(|| {
        Error::Integrity(IntegrityError {
            message: format!("master {} has no '{}' key value", target, pk_column),
        })
    })
}

/// Current column values with FK references to new objects resolved through
/// the generated-key map.
fn resolved_values(
    store: &ObjectStore,
    id: &ObjectId,
    rekeys: &HashMap<ObjectId, ObjectId>,
) -> Result<BTreeMap<String, Value>> {
    let mut values = store.current_values(id)?;
    let info = store.registry().get(id.entity())?;
    let object = store.get(id).ok_or_else(|| {
        Error::Integrity(IntegrityError {
            message: format!("object {} is not registered", id),
        })
    })?;
    for rel in &info.relationships {
        if rel.to_many || rel.is_flattened() {
            continue;
        }
        let (Some(fk), Some(pk)) = (&rel.fk_column, &rel.target_pk_column) else {
            continue;
        };
        if let Some(Some(target)) = object.to_one(&rel.name)
            && target.is_temporary()
        {
            let final_id = rekeys.get(target).ok_or_else(|| {
                Error::Integrity(IntegrityError {
                    message: format!(
                        "object {} references unkeyed new object {}",
                        id, target
                    ),
                })
            })?;
            let value = final_id.key_value(pk).cloned().unwrap_or(Value::Null);
            values.insert(fk.clone(), value);
        }
    }
    Ok(values)
}

fn insert_columns(info: &EntityInfo) -> Vec<String> {
    let mut columns: Vec<String> = info.attributes.iter().map(|a| a.column.clone()).collect();
    for rel in &info.relationships {
        if rel.to_many || rel.is_flattened() {
            continue;
        }
        if let Some(fk) = &rel.fk_column
            && !columns.contains(fk)
        {
            columns.push(fk.clone());
        }
    }
    columns
}

fn build_inserts(
    store: &ObjectStore,
    classification: &Classification,
    insert_order: &[String],
    rekeys: &HashMap<ObjectId, ObjectId>,
    ops: &mut Vec<(String, Op)>,
    snapshots: &mut Vec<(ObjectId, Snapshot)>,
) -> Result<()> {
    for entity in insert_order {
        let info = store.registry().get(entity)?.clone();
        let columns = insert_columns(&info);
        let mut batch = InsertBatch::new(info.table.clone(), columns.clone());

        for id in classification.inserts.iter().filter(|i| i.entity() == entity) {
            let final_id = rekeys.get(id).cloned().ok_or_else(|| {
                Error::Integrity(IntegrityError {
                    message: format!("new object {} was never keyed", id),
                })
            })?;
            let mut values = resolved_values(store, id, rekeys)?;
            for (column, value) in final_id.key_values() {
                values.insert(column.clone(), value.clone());
            }

            let binds: Vec<Value> = columns
                .iter()
                .map(|c| values.get(c).cloned().unwrap_or(Value::Null))
                .collect();
            batch.rows.push(BatchRow {
                id: Some(final_id.clone()),
                row: DmlRow {
                    values: binds,
                    qualifier_values: Vec::new(),
                },
            });
            snapshots.push((final_id, Snapshot::new(values)));
        }

        if !batch.rows.is_empty() {
            ops.push((info.data_source.clone(), Op::Insert(batch)));
        }
    }
    Ok(())
}

/// Qualifier columns and values for one row: primary key first, then
/// optimistic-lock columns sourced from the retained snapshot.
fn qualifier_for(
    info: &EntityInfo,
    id: &ObjectId,
    retained: Option<&Snapshot>,
) -> (Vec<String>, Vec<Value>, BTreeSet<String>, bool) {
    let mut columns = Vec::new();
    let mut values = Vec::new();
    let mut nulls = BTreeSet::new();

    for attr in info.pk_attributes() {
        let value = id
            .key_value(&attr.column)
            .cloned()
            .or_else(|| retained.and_then(|s| s.get(&attr.column)).cloned())
            .unwrap_or(Value::Null);
        columns.push(attr.column.clone());
        values.push(value);
    }

    let uses_lock = info.lock_type == LockType::Optimistic;
    if uses_lock {
        let mut push_lock_column = |column: &str| {
            let value = retained
                .and_then(|s| s.get(column))
                .cloned()
                .unwrap_or(Value::Null);
            if value.is_null() {
                nulls.insert(column.to_string());
            }
            columns.push(column.to_string());
            values.push(value);
        };
        for attr in &info.attributes {
            if attr.used_for_locking && !attr.primary_key {
                push_lock_column(&attr.column);
            }
        }
        for rel in &info.relationships {
            if rel.used_for_locking
                && !rel.to_many
                && !rel.is_flattened()
                && let Some(fk) = &rel.fk_column
            {
                push_lock_column(fk);
            }
        }
    }

    (columns, values, nulls, uses_lock)
}

fn build_updates(
    store: &ObjectStore,
    classification: &Classification,
    rekeys: &mut HashMap<ObjectId, ObjectId>,
    ops: &mut Vec<(String, Op)>,
    snapshots: &mut Vec<(ObjectId, Snapshot)>,
    replaced: &mut Vec<ObjectId>,
) -> Result<()> {
    let mut per_source: Vec<(String, UpdateBatchSet)> = Vec::new();

    for id in &classification.updates {
        let info = store.registry().get(id.entity())?.clone();
        let retained = store.retained_snapshot(id).cloned().ok_or_else(|| {
            Error::Integrity(IntegrityError {
                message: format!("modified object {} has no retained snapshot", id),
            })
        })?;
        let current = resolved_values(store, id, rekeys)?;

        let mut changed: BTreeMap<String, Value> = BTreeMap::new();
        for (column, value) in &current {
            // Absent baseline columns compare as NULL; partial snapshots
            // must not produce phantom SET NULL entries.
            if retained.get(column).unwrap_or(&Value::Null) != value {
                changed.insert(column.clone(), value.clone());
            }
        }
        if changed.is_empty() {
            continue;
        }

        // A change to a key column replaces the object's identity.
        let changed_pairs: Vec<(String, Value)> =
            changed.iter().map(|(c, v)| (c.clone(), v.clone())).collect();
        let final_id = match id.replacement_with(&changed_pairs) {
            Some(replacement) => {
                debug!(old = %id, new = %replacement, "update changes primary key");
                rekeys.insert(id.clone(), replacement.clone());
                replaced.push(id.clone());
                replacement
            }
            None => id.clone(),
        };

        let (qualifier_columns, qualifier_values, nulls, uses_lock) =
            qualifier_for(&info, id, Some(&retained));
        let key = UpdateKey {
            table: info.table.clone(),
            changed: changed.keys().cloned().collect(),
            null_qualifiers: nulls,
        };

        let set = match per_source.iter().position(|(s, _)| *s == info.data_source) {
            Some(pos) => &mut per_source[pos].1,
            None => {
                per_source.push((info.data_source.clone(), UpdateBatchSet::new()));
                let last = per_source.len() - 1;
                &mut per_source[last].1
            }
        };
        let batch = set.get_or_insert(key, qualifier_columns, uses_lock);
        let binds: Vec<Value> = batch
            .changed_columns
            .iter()
            .map(|c| changed.get(c).cloned().unwrap_or(Value::Null))
            .collect();
        batch.rows.push(BatchRow {
            id: Some(id.clone()),
            row: DmlRow {
                values: binds,
                qualifier_values: qualifier_values.clone(),
            },
        });

        snapshots.push((final_id, retained.apply_diff(&SnapshotDiff::new(changed))));
    }

    for (source, set) in per_source {
        for batch in set.into_vec() {
            ops.push((source.clone(), Op::Update(batch)));
        }
    }
    Ok(())
}

fn build_deletes(
    store: &ObjectStore,
    classification: &Classification,
    sorter: &dyn EntitySorter,
    ops: &mut Vec<(String, Op)>,
) -> Result<()> {
    // Dependents drop before their masters: reverse of insert order.
    let mut entities: Vec<String> = Vec::new();
    for id in &classification.deletes {
        if !entities.iter().any(|e| e == id.entity()) {
            entities.push(id.entity().to_string());
        }
    }
    sorter.sort_entities(store.registry(), &mut entities)?;
    entities.reverse();

    for entity in &entities {
        let info = store.registry().get(entity)?.clone();
        let mut set = DeleteBatchSet::new();
        for id in classification.deletes.iter().filter(|i| i.entity() == entity) {
            let retained = store.retained_snapshot(id);
            let (qualifier_columns, qualifier_values, nulls, uses_lock) =
                qualifier_for(&info, id, retained);
            let batch = set.get_or_insert(&info.table, nulls, qualifier_columns, uses_lock);
            batch.rows.push(BatchRow {
                id: Some(id.clone()),
                row: DmlRow {
                    values: Vec::new(),
                    qualifier_values,
                },
            });
        }
        for batch in set.into_vec() {
            ops.push((info.data_source.clone(), Op::Delete(batch)));
        }
    }
    Ok(())
}

fn link_row(
    store: &ObjectStore,
    arc: &FlattenedArc,
    rekeys: &HashMap<ObjectId, ObjectId>,
) -> Result<(rowsync_core::LinkTableInfo, String, Value, Value)> {
    let info = store.registry().get(arc.source.entity())?;
    let rel = info.find_relationship(&arc.relationship).ok_or_else(|| {
        Error::Config(ConfigError {
            message: format!(
                "entity '{}' has no relationship '{}'",
                arc.source.entity(),
                arc.relationship
            ),
        })
    })?;
    let link = rel.link_table.clone().ok_or_else(|| {
        Error::Config(ConfigError {
            message: format!("relationship '{}' is not flattened", arc.relationship),
        })
    })?;

    let pk_of = |id: &ObjectId| -> Result<Value> {
        let final_id = if id.is_temporary() {
            rekeys.get(id).cloned().ok_or_else(|| {
                Error::Integrity(IntegrityError {
                    message: format!("join row references unkeyed new object {}", id),
                })
            })?
        } else {
            id.clone()
        };
        final_id
            .key_values()
            .first()
            .map(|(_, v)| v.clone())
            .ok_or_else(|| {
                Error::Integrity(IntegrityError {
                    message: format!("object {} has no key value for a join row", final_id),
                })
            })
    };

    let source_pk = pk_of(&arc.source)?;
    let target_pk = pk_of(&arc.destination)?;
    Ok((link, info.data_source.clone(), source_pk, target_pk))
}

fn build_flattened_inserts(
    store: &ObjectStore,
    arcs: &[FlattenedArc],
    rekeys: &HashMap<ObjectId, ObjectId>,
    ops: &mut Vec<(String, Op)>,
) -> Result<()> {
    let mut batches: Vec<(String, InsertBatch)> = Vec::new();
    for arc in arcs {
        let (link, source, source_pk, target_pk) = link_row(store, arc, rekeys)?;
        let pos = batches.iter().position(|(_, b)| b.table == link.table);
        let batch = match pos {
            Some(pos) => &mut batches[pos].1,
            None => {
                batches.push((
                    source,
                    InsertBatch::new(
                        link.table.clone(),
                        vec![link.source_column.clone(), link.target_column.clone()],
                    ),
                ));
                let last = batches.len() - 1;
                &mut batches[last].1
            }
        };
        batch.rows.push(BatchRow {
            id: None,
            row: DmlRow {
                values: vec![source_pk, target_pk],
                qualifier_values: Vec::new(),
            },
        });
    }
    for (source, batch) in batches {
        ops.push((source, Op::Insert(batch)));
    }
    Ok(())
}

fn build_flattened_deletes(
    store: &ObjectStore,
    arcs: &[FlattenedArc],
    rekeys: &HashMap<ObjectId, ObjectId>,
    ops: &mut Vec<(String, Op)>,
) -> Result<()> {
    let mut batches: Vec<(String, DeleteBatch)> = Vec::new();
    for arc in arcs {
        let (link, source, source_pk, target_pk) = link_row(store, arc, rekeys)?;
        let pos = batches.iter().position(|(_, b)| b.table == link.table);
        let batch = match pos {
            Some(pos) => &mut batches[pos].1,
            None => {
                batches.push((
                    source,
                    DeleteBatch {
                        table: link.table.clone(),
                        null_qualifiers: BTreeSet::new(),
                        qualifier_columns: vec![
                            link.source_column.clone(),
                            link.target_column.clone(),
                        ],
                        uses_lock: false,
                        rows: Vec::new(),
                    },
                ));
                let last = batches.len() - 1;
                &mut batches[last].1
            }
        };
        batch.rows.push(BatchRow {
            id: None,
            row: DmlRow {
                values: Vec::new(),
                qualifier_values: vec![source_pk, target_pk],
            },
        });
    }
    for (source, batch) in batches {
        ops.push((source, Op::Delete(batch)));
    }
    Ok(())
}

/// Run the whole plan, one transaction per data source, all committed
/// together at the end or all rolled back on the first failure.
fn execute_plan(ops: &[(String, Op)], adapters: &HashMap<String, Arc<dyn DbAdapter>>) -> Result<()> {
    let mut connections: Vec<(String, Box<dyn Connection>, bool)> = Vec::new();
    for (source, _) in ops {
        if connections.iter().any(|(s, _, _)| s == source) {
            continue;
        }
        let adapter = adapters.get(source).ok_or_else(|| {
            Error::Config(ConfigError {
                message: format!("no adapter for data source '{}'", source),
            })
        })?;
        connections.push((source.clone(), adapter.connection()?, adapter.supports_batching()));
    }

    let result = run_ops(ops, &mut connections);
    match result {
        Ok(()) => {
            for (source, conn, _) in &mut connections {
                if let Err(err) = conn.commit() {
                    warn!(source = %source, error = %err, "commit failed, rolling back remainder");
                    rollback_all(&mut connections);
                    return Err(err);
                }
            }
            Ok(())
        }
        Err(err) => {
            rollback_all(&mut connections);
            Err(err)
        }
    }
}

fn run_ops(
    ops: &[(String, Op)],
    connections: &mut [(String, Box<dyn Connection>, bool)],
) -> Result<()> {
    for (_, conn, _) in connections.iter_mut() {
        conn.begin()?;
    }
    for (source, op) in ops {
        let Some((_, conn, batching)) = connections.iter_mut().find(|(s, _, _)| s == source)
        else {
            return Err(Error::Integrity(IntegrityError {
                message: format!("no open connection for data source '{}'", source),
            }));
        };
        match op {
            Op::Insert(batch) => execute::run_insert(conn.as_mut(), batch, *batching)?,
            Op::Update(batch) => execute::run_update(conn.as_mut(), batch, *batching)?,
            Op::Delete(batch) => execute::run_delete(conn.as_mut(), batch, *batching)?,
        };
    }
    Ok(())
}

/// Best-effort rollback: failures here are logged and swallowed, the
/// original error is what the caller needs to see.
fn rollback_all(connections: &mut [(String, Box<dyn Connection>, bool)]) {
    for (source, conn, _) in connections.iter_mut() {
        if let Err(err) = conn.rollback() {
            warn!(source = %source, error = %err, "rollback failed");
        }
    }
}
