//! Database collaborator traits.
//!
//! The persistence core never talks SQL directly. It hands fully-shaped DML
//! work to a [`Connection`], asks a [`DbAdapter`] for key generation and
//! capability flags, and pulls rows through a [`SnapshotFetcher`]. All of it
//! is synchronous; the commit pipeline owns the calling thread for the
//! duration of a transaction.

use crate::entity::{EntityInfo, EntityRegistry, RelationshipInfo};
use crate::error::{DriverError, DriverErrorKind, Error, Result};
use crate::identity::ObjectId;
use crate::snapshot::Snapshot;
use crate::value::Value;
use std::collections::{HashMap, HashSet};
use tracing::warn;

/// The kind of DML statement a template describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmlKind {
    Insert,
    Update,
    Delete,
}

/// The shape of one DML statement: target table, written columns, and
/// qualifier (WHERE) columns. Bind values travel separately per row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DmlTemplate {
    pub kind: DmlKind,
    pub table: String,
    /// Columns written by INSERT/UPDATE; empty for DELETE.
    pub columns: Vec<String>,
    /// Qualifier columns for UPDATE/DELETE; empty for INSERT.
    pub qualifier: Vec<String>,
}

/// One row's bind values for a [`DmlTemplate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DmlRow {
    /// Values for `template.columns`, in order.
    pub values: Vec<Value>,
    /// Values for `template.qualifier`, in order.
    pub qualifier_values: Vec<Value>,
}

impl DmlRow {
    /// Render all binds for error output, each value truncated.
    pub fn render_binds(&self, max_len: usize) -> String {
        self.values
            .iter()
            .chain(self.qualifier_values.iter())
            .map(|v| v.render_truncated(max_len))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// A live database connection scoped to one data source.
///
/// The commit pipeline drives exactly one transaction per connection:
/// `begin`, a sequence of `execute_*` calls, then `commit` or `rollback`.
pub trait Connection {
    fn begin(&mut self) -> Result<()>;
    fn commit(&mut self) -> Result<()>;
    fn rollback(&mut self) -> Result<()>;

    /// Execute the template once per row, returning affected counts per row.
    ///
    /// Used when per-row counts matter, i.e. optimistic locking.
    fn execute_rows(&mut self, template: &DmlTemplate, rows: &[DmlRow]) -> Result<Vec<u64>>;

    /// Execute all rows as one batched statement, returning total affected.
    fn execute_batched(&mut self, template: &DmlTemplate, rows: &[DmlRow]) -> Result<u64>;
}

/// Per-data-source adapter: connection factory, key generation, capabilities.
pub trait DbAdapter: Send + Sync {
    /// Open a connection for one commit pass.
    fn connection(&self) -> Result<Box<dyn Connection>>;

    /// Generate one fresh primary key value for the entity.
    fn generate_key(&self, entity: &EntityInfo) -> Result<Value>;

    /// Whether multi-row batched execution is worth routing to.
    fn supports_batching(&self) -> bool {
        true
    }
}

/// Fetches current row snapshots from the backing store, outside any
/// commit transaction. Used for cache misses and fault resolution.
pub trait SnapshotFetcher {
    /// Fetch all rows matching the id's key. More than one row is a mapping
    /// defect; the caller turns it into an integrity error.
    fn fetch(&self, id: &ObjectId) -> Result<Vec<Snapshot>>;

    /// Fetch rows for a set of ids in one round trip where possible.
    fn fetch_many(&self, ids: &[ObjectId]) -> Result<Vec<(ObjectId, Snapshot)>>;

    /// Rows related to `source` through a to-many relationship.
    ///
    /// The default reports no related rows; fetchers backing delete-rule
    /// processing must override it.
    fn fetch_related(
        &self,
        source: &ObjectId,
        relationship: &RelationshipInfo,
    ) -> Result<Vec<(ObjectId, Snapshot)>> {
        let _ = (source, relationship);
        Ok(Vec::new())
    }
}

/// Orders entities so referential integrity holds during a commit.
pub trait EntitySorter {
    /// Sort entity names so every FK target ("master") precedes the entities
    /// referencing it. Deletes run in the reverse of this order.
    fn sort_entities(&self, registry: &EntityRegistry, entities: &mut Vec<String>) -> Result<()>;
}

/// Dependency-graph sorter over to-one FK relationships.
///
/// Kahn's algorithm with name-ordered tie breaking, so the output is
/// deterministic for a given mapping. Entities left over after a cycle
/// (reflexive relationships, mutual FKs) are appended in name order; the
/// executor falls back to row-by-row handling for those.
#[derive(Debug, Default, Clone, Copy)]
pub struct TopologicalSorter;

impl EntitySorter for TopologicalSorter {
    fn sort_entities(&self, registry: &EntityRegistry, entities: &mut Vec<String>) -> Result<()> {
        let members: HashSet<&str> = entities.iter().map(String::as_str).collect();

        // in_deps[e] = masters of e within the working set.
        let mut in_deps: HashMap<&str, HashSet<&str>> = HashMap::new();
        for name in entities.iter() {
            let entity = registry.get(name)?;
            let deps = in_deps.entry(name.as_str()).or_default();
            for rel in &entity.relationships {
                if rel.to_many || rel.is_flattened() || rel.fk_column.is_none() {
                    continue;
                }
                if rel.target != *name && members.contains(rel.target.as_str()) {
                    deps.insert(
                        entities
                            .iter()
                            .find(|e| **e == rel.target)
                            .map(String::as_str)
                            .unwrap_or(rel.target.as_str()),
                    );
                }
            }
        }

        let mut sorted: Vec<String> = Vec::with_capacity(entities.len());
        let mut remaining: Vec<&str> = {
            let mut r: Vec<&str> = entities.iter().map(String::as_str).collect();
            r.sort_unstable();
            r
        };

        while !remaining.is_empty() {
            let ready: Vec<&str> = remaining
                .iter()
                .copied()
                .filter(|e| {
                    in_deps
                        .get(e)
                        .is_none_or(|deps| deps.iter().all(|d| !remaining.contains(d)))
                })
                .collect();
            if ready.is_empty() {
                // Cycle: emit the rest in name order.
                warn!(entities = ?remaining, "dependency cycle among entities");
                sorted.extend(remaining.iter().map(|s| (*s).to_string()));
                break;
            }
            for e in &ready {
                sorted.push((*e).to_string());
            }
            remaining.retain(|e| !ready.contains(e));
        }

        *entities = sorted;
        Ok(())
    }
}

/// Wrap a driver-level failure on one statement into a [`DriverError`],
/// recording the table and the offending row's binds.
pub fn execute_error(
    template: &DmlTemplate,
    row: Option<&DmlRow>,
    message: impl Into<String>,
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
) -> Error {
    Error::Driver(DriverError {
        kind: DriverErrorKind::Execute,
        table: Some(template.table.clone()),
        binds: row.map(|r| r.render_binds(64)),
        message: message.into(),
        source,
    })
}
