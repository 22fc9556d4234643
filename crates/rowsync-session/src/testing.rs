//! Shared fixtures for unit and integration tests.
//!
//! Not part of the public API surface; shapes here change freely.

use crate::delete::FaultResolver;
use parking_lot::Mutex;
use rowsync_core::entity::{
    AttributeInfo, DeleteRule, EntityInfo, EntityRegistry, LinkTableInfo, LockType,
    RelationshipInfo,
};
use rowsync_core::error::{DriverError, DriverErrorKind};
use rowsync_core::{
    Connection, DbAdapter, DmlRow, DmlTemplate, Error, ObjectId, Result, Snapshot,
    SnapshotFetcher, Value,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

/// The canonical test mapping: an art-gallery schema exercising every
/// delete rule, a flattened relationship, dependent keys, a reflexive
/// cascade and a read-only entity.
pub fn gallery_registry() -> EntityRegistry {
    build_registry(LockType::None)
}

/// Same mapping with optimistic locking on `painting` (TITLE and the
/// artist FK participate in qualifiers).
pub fn locked_registry() -> EntityRegistry {
    build_registry(LockType::Optimistic)
}

fn build_registry(painting_lock: LockType) -> EntityRegistry {
    let mut reg = EntityRegistry::new();

    reg.register(
        EntityInfo::new("artist", "ARTIST")
            .attribute(
                AttributeInfo::new("id", "ARTIST_ID")
                    .primary_key(true)
                    .generated(true),
            )
            .attribute(AttributeInfo::new("name", "ARTIST_NAME"))
            .relationship(
                RelationshipInfo::new("paintings", "painting", true)
                    .delete_rule(DeleteRule::Cascade)
                    .reverse("artist"),
            )
            .relationship(
                RelationshipInfo::new("exhibits", "gallery", true)
                    .link_table(LinkTableInfo::new("ARTIST_EXHIBIT", "ARTIST_ID", "GALLERY_ID")),
            )
            .relationship(
                RelationshipInfo::new("dealer", "dealer", false)
                    .fk_column("DEALER_ID", "DEALER_ID")
                    .reverse("artists"),
            ),
    );

    reg.register(
        EntityInfo::new("painting", "PAINTING")
            .lock_type(painting_lock)
            .attribute(
                AttributeInfo::new("id", "PAINTING_ID")
                    .primary_key(true)
                    .generated(true),
            )
            .attribute(
                AttributeInfo::new("title", "TITLE")
                    .used_for_locking(painting_lock == LockType::Optimistic),
            )
            .attribute(AttributeInfo::new("estimate", "ESTIMATE"))
            .relationship(
                RelationshipInfo::new("artist", "artist", false)
                    .fk_column("ARTIST_ID", "ARTIST_ID")
                    .reverse("paintings")
                    .used_for_locking(painting_lock == LockType::Optimistic),
            )
            .relationship(
                RelationshipInfo::new("gallery", "gallery", false)
                    .fk_column("GALLERY_ID", "GALLERY_ID")
                    .reverse("paintings"),
            ),
    );

    reg.register(
        EntityInfo::new("gallery", "GALLERY")
            .attribute(
                AttributeInfo::new("id", "GALLERY_ID")
                    .primary_key(true)
                    .generated(true),
            )
            .attribute(AttributeInfo::new("name", "GALLERY_NAME"))
            .relationship(
                RelationshipInfo::new("paintings", "painting", true)
                    .delete_rule(DeleteRule::Nullify)
                    .reverse("gallery"),
            ),
    );

    reg.register(
        EntityInfo::new("dealer", "DEALER")
            .attribute(
                AttributeInfo::new("id", "DEALER_ID")
                    .primary_key(true)
                    .generated(true),
            )
            .attribute(AttributeInfo::new("name", "DEALER_NAME"))
            .relationship(
                RelationshipInfo::new("artists", "artist", true)
                    .delete_rule(DeleteRule::Deny)
                    .reverse("dealer"),
            ),
    );

    reg.register(
        EntityInfo::new("employee", "EMPLOYEE")
            .attribute(
                AttributeInfo::new("id", "EMP_ID")
                    .primary_key(true)
                    .generated(true),
            )
            .attribute(AttributeInfo::new("name", "EMP_NAME"))
            .relationship(
                RelationshipInfo::new("manager", "employee", false)
                    .fk_column("MANAGER_ID", "EMP_ID")
                    .reverse("reports"),
            )
            .relationship(
                RelationshipInfo::new("reports", "employee", true)
                    .delete_rule(DeleteRule::Cascade)
                    .reverse("manager"),
            ),
    );

    reg.register(
        EntityInfo::new("artist_detail", "ARTIST_DETAIL")
            .attribute(AttributeInfo::new("id", "ARTIST_ID").primary_key(true))
            .attribute(AttributeInfo::new("bio", "BIO"))
            .relationship(
                RelationshipInfo::new("artist", "artist", false)
                    .fk_column("ARTIST_ID", "ARTIST_ID")
                    .to_dependent_pk(true),
            ),
    );

    reg.register(
        EntityInfo::new("archive", "ARCHIVE")
            .read_only(true)
            .attribute(
                AttributeInfo::new("id", "ARCHIVE_ID")
                    .primary_key(true)
                    .generated(true),
            )
            .attribute(AttributeInfo::new("name", "ARCHIVE_NAME")),
    );

    reg
}

/// Snapshot from column/value pairs.
pub fn snapshot_of(pairs: &[(&str, Value)]) -> Snapshot {
    Snapshot::new(pairs.iter().map(|(c, v)| ((*c).to_string(), v.clone())))
}

/// Canned fault resolver backed by in-memory maps.
#[derive(Default)]
pub struct MapResolver {
    rows: HashMap<ObjectId, Snapshot>,
    related: HashMap<(ObjectId, String), Vec<ObjectId>>,
}

impl MapResolver {
    pub fn add_row(&mut self, id: ObjectId, snapshot: Snapshot) {
        self.rows.insert(id, snapshot);
    }

    pub fn add_related(&mut self, source: ObjectId, relationship: &str, ids: Vec<ObjectId>) {
        self.related
            .insert((source, relationship.to_string()), ids);
    }
}

impl FaultResolver for MapResolver {
    fn resolve(&self, id: &ObjectId) -> Result<Option<Snapshot>> {
        Ok(self.rows.get(id).cloned())
    }

    fn fetch_related(
        &self,
        source: &ObjectId,
        relationship: &rowsync_core::RelationshipInfo,
    ) -> Result<Vec<ObjectId>> {
        Ok(self
            .related
            .get(&(source.clone(), relationship.name.clone()))
            .cloned()
            .unwrap_or_default())
    }
}

/// In-memory snapshot fetcher with scriptable related-row sets.
#[derive(Default)]
pub struct MapFetcher {
    pub rows: Mutex<HashMap<ObjectId, Snapshot>>,
    related: Mutex<HashMap<(ObjectId, String), Vec<ObjectId>>>,
}

impl MapFetcher {
    pub fn insert(&self, id: ObjectId, snapshot: Snapshot) {
        self.rows.lock().insert(id, snapshot);
    }

    pub fn insert_related(&self, source: ObjectId, relationship: &str, ids: Vec<ObjectId>) {
        self.related
            .lock()
            .insert((source, relationship.to_string()), ids);
    }
}

impl SnapshotFetcher for MapFetcher {
    fn fetch(&self, id: &ObjectId) -> Result<Vec<Snapshot>> {
        Ok(self.rows.lock().get(id).cloned().into_iter().collect())
    }

    fn fetch_many(&self, ids: &[ObjectId]) -> Result<Vec<(ObjectId, Snapshot)>> {
        let rows = self.rows.lock();
        Ok(ids
            .iter()
            .filter_map(|id| rows.get(id).map(|s| (id.clone(), s.clone())))
            .collect())
    }

    fn fetch_related(
        &self,
        source: &ObjectId,
        relationship: &rowsync_core::RelationshipInfo,
    ) -> Result<Vec<(ObjectId, Snapshot)>> {
        let ids = self
            .related
            .lock()
            .get(&(source.clone(), relationship.name.clone()))
            .cloned()
            .unwrap_or_default();
        let rows = self.rows.lock();
        Ok(ids
            .into_iter()
            .filter_map(|id| rows.get(&id).map(|s| (id.clone(), s.clone())))
            .collect())
    }
}

/// One statement execution recorded by the mock connection.
#[derive(Debug, Clone)]
pub struct LoggedOp {
    pub template: DmlTemplate,
    pub rows: Vec<DmlRow>,
    pub batched: bool,
}

/// Shared log of everything a [`MockAdapter`]'s connections executed.
#[derive(Default)]
pub struct ExecLog {
    pub ops: Mutex<Vec<LoggedOp>>,
    /// Transaction calls in order: "begin", "commit", "rollback".
    pub tx: Mutex<Vec<&'static str>>,
}

impl ExecLog {
    /// Tables in statement execution order.
    pub fn tables(&self) -> Vec<String> {
        self.ops.lock().iter().map(|o| o.template.table.clone()).collect()
    }

    pub fn ops_for(&self, table: &str) -> Vec<LoggedOp> {
        self.ops
            .lock()
            .iter()
            .filter(|o| o.template.table == table)
            .cloned()
            .collect()
    }
}

/// Scriptable adapter: sequential generated keys, configurable staleness
/// (zero affected rows) and failure injection.
pub struct MockAdapter {
    pub log: Arc<ExecLog>,
    next_key: AtomicI64,
    /// Qualifier first-values that report zero affected rows.
    pub stale: Arc<Mutex<Vec<Value>>>,
    /// Table whose statements fail with a driver error.
    pub fail_table: Arc<Mutex<Option<String>>>,
    pub batching: bool,
}

impl MockAdapter {
    pub fn new() -> Self {
        Self {
            log: Arc::new(ExecLog::default()),
            next_key: AtomicI64::new(1000),
            stale: Arc::new(Mutex::new(Vec::new())),
            fail_table: Arc::new(Mutex::new(None)),
            batching: true,
        }
    }

    pub fn last_generated_key(&self) -> i64 {
        self.next_key.load(Ordering::Relaxed) - 1
    }
}

impl Default for MockAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl DbAdapter for MockAdapter {
    fn connection(&self) -> Result<Box<dyn Connection>> {
        Ok(Box::new(MockConnection {
            log: self.log.clone(),
            stale: self.stale.clone(),
            fail_table: self.fail_table.clone(),
        }))
    }

    fn generate_key(&self, _entity: &rowsync_core::EntityInfo) -> Result<Value> {
        Ok(Value::BigInt(self.next_key.fetch_add(1, Ordering::Relaxed)))
    }

    fn supports_batching(&self) -> bool {
        self.batching
    }
}

struct MockConnection {
    log: Arc<ExecLog>,
    stale: Arc<Mutex<Vec<Value>>>,
    fail_table: Arc<Mutex<Option<String>>>,
}

impl MockConnection {
    fn check_fail(&self, template: &DmlTemplate) -> Result<()> {
        if self.fail_table.lock().as_deref() == Some(template.table.as_str()) {
            return Err(Error::Driver(DriverError {
                kind: DriverErrorKind::Execute,
                table: Some(template.table.clone()),
                binds: None,
                message: "injected failure".to_string(),
                source: None,
            }));
        }
        Ok(())
    }
}

impl Connection for MockConnection {
    fn begin(&mut self) -> Result<()> {
        self.log.tx.lock().push("begin");
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        self.log.tx.lock().push("commit");
        Ok(())
    }

    fn rollback(&mut self) -> Result<()> {
        self.log.tx.lock().push("rollback");
        Ok(())
    }

    fn execute_rows(&mut self, template: &DmlTemplate, rows: &[DmlRow]) -> Result<Vec<u64>> {
        self.check_fail(template)?;
        self.log.ops.lock().push(LoggedOp {
            template: template.clone(),
            rows: rows.to_vec(),
            batched: false,
        });
        let stale = self.stale.lock();
        Ok(rows
            .iter()
            .map(|r| {
                let hit = r
                    .qualifier_values
                    .first()
                    .is_some_and(|v| stale.contains(v));
                u64::from(!hit)
            })
            .collect())
    }

    fn execute_batched(&mut self, template: &DmlTemplate, rows: &[DmlRow]) -> Result<u64> {
        self.check_fail(template)?;
        self.log.ops.lock().push(LoggedOp {
            template: template.clone(),
            rows: rows.to_vec(),
            batched: true,
        });
        Ok(rows.len() as u64)
    }
}
