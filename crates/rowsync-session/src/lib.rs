//! Session layer: change tracking, delete rules and the commit pipeline.
//!
//! A [`Session`] owns one [`ObjectStore`] behind a mutex and coordinates it
//! with the shared [`SnapshotCache`]: reads fault through the cache, deletes
//! walk mapping delete rules, and [`Session::commit`] drives the full
//! classify / key-generate / batch / execute / finalize pipeline.
//!
//! Lock ordering: the store mutex is always taken before any cache lock,
//! and released before cache events are published, so cache listeners
//! (including this session's own) may re-enter the store.

pub mod batch;
pub mod commit;
pub mod delete;
pub mod execute;
pub mod fault_list;
pub mod object_store;

#[doc(hidden)]
pub mod testing;

pub use commit::CommitStats;
pub use delete::{delete_object, FaultResolver};
pub use fault_list::{PagedList, DEFAULT_PAGE_SIZE};
pub use object_store::{
    Classification, FlattenedArc, ObjectStore, PersistenceState, PersistentObject, Property,
};

use parking_lot::Mutex;
use rowsync_cache::SnapshotCache;
use rowsync_core::entity::{EntityRegistry, RelationshipInfo};
use rowsync_core::{
    DbAdapter, EntitySorter, ObjectId, Result, Snapshot, SnapshotFetcher, SnapshotListener,
    TopologicalSorter, Value,
};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tracing::debug;

type BeforeCommitHook = Box<dyn Fn() -> Result<()> + Send + Sync>;
type AfterCommitHook = Box<dyn Fn(&CommitStats) + Send + Sync>;
type AfterRollbackHook = Box<dyn Fn() + Send + Sync>;

/// Builder for [`Session`].
pub struct SessionBuilder {
    registry: Arc<EntityRegistry>,
    cache: Arc<SnapshotCache>,
    fetcher: Arc<dyn SnapshotFetcher + Send + Sync>,
    adapters: HashMap<String, Arc<dyn DbAdapter>>,
    sorter: Box<dyn EntitySorter + Send + Sync>,
    page_size: usize,
}

impl SessionBuilder {
    pub fn new(
        registry: Arc<EntityRegistry>,
        cache: Arc<SnapshotCache>,
        fetcher: Arc<dyn SnapshotFetcher + Send + Sync>,
    ) -> Self {
        Self {
            registry,
            cache,
            fetcher,
            adapters: HashMap::new(),
            sorter: Box::new(TopologicalSorter),
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    /// Register the adapter serving one named data source.
    #[must_use]
    pub fn adapter(mut self, data_source: impl Into<String>, adapter: Arc<dyn DbAdapter>) -> Self {
        self.adapters.insert(data_source.into(), adapter);
        self
    }

    #[must_use]
    pub fn sorter(mut self, sorter: Box<dyn EntitySorter + Send + Sync>) -> Self {
        self.sorter = sorter;
        self
    }

    #[must_use]
    pub fn page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn build(self) -> Arc<Session> {
        Arc::new(Session {
            store: Mutex::new(ObjectStore::new(self.registry.clone())),
            registry: self.registry,
            cache: self.cache,
            fetcher: self.fetcher,
            adapters: self.adapters,
            sorter: self.sorter,
            page_size: self.page_size,
            before_commit: Mutex::new(Vec::new()),
            after_commit: Mutex::new(Vec::new()),
            after_rollback: Mutex::new(Vec::new()),
        })
    }
}

/// One unit-of-work over the shared snapshot cache.
pub struct Session {
    registry: Arc<EntityRegistry>,
    cache: Arc<SnapshotCache>,
    fetcher: Arc<dyn SnapshotFetcher + Send + Sync>,
    adapters: HashMap<String, Arc<dyn DbAdapter>>,
    sorter: Box<dyn EntitySorter + Send + Sync>,
    store: Mutex<ObjectStore>,
    page_size: usize,
    before_commit: Mutex<Vec<BeforeCommitHook>>,
    after_commit: Mutex<Vec<AfterCommitHook>>,
    after_rollback: Mutex<Vec<AfterRollbackHook>>,
}

impl Session {
    pub fn builder(
        registry: Arc<EntityRegistry>,
        cache: Arc<SnapshotCache>,
        fetcher: Arc<dyn SnapshotFetcher + Send + Sync>,
    ) -> SessionBuilder {
        SessionBuilder::new(registry, cache, fetcher)
    }

    pub fn registry(&self) -> &EntityRegistry {
        &self.registry
    }

    pub fn cache(&self) -> &SnapshotCache {
        &self.cache
    }

    /// Subscribe this session's store to the cache's change events, so
    /// commits by sibling sessions merge into it.
    pub fn attach_cache_listener(self: &Arc<Self>) {
        self.cache.add_listener(Arc::new(StoreListener {
            session: Arc::downgrade(self),
        }));
    }

    /// Create and register a new object with a temporary identity.
    pub fn create(&self, entity: &str) -> Result<ObjectId> {
        self.store.lock().register_new(entity)
    }

    /// Persistence state of an identity; unknown ids are `Transient`.
    pub fn state_of(&self, id: &ObjectId) -> PersistenceState {
        self.store.lock().state_of(id)
    }

    /// Make sure the object is registered and resolved.
    ///
    /// Returns `false` when the backing row does not exist (a hollow
    /// registration for it is dropped).
    pub fn fetch(&self, id: &ObjectId) -> Result<bool> {
        let mut store = self.store.lock();
        match store.state_of(id) {
            PersistenceState::Transient => match self.cache.get_or_fetch(id, &*self.fetcher)? {
                Some(snapshot) => {
                    store.register_committed(id.clone(), &snapshot)?;
                    Ok(true)
                }
                None => Ok(false),
            },
            PersistenceState::Hollow => match self.cache.get_or_fetch(id, &*self.fetcher)? {
                Some(snapshot) => {
                    store.resolve_hollow(id, &snapshot)?;
                    Ok(true)
                }
                None => {
                    store.unregister(id);
                    Ok(false)
                }
            },
            _ => Ok(true),
        }
    }

    /// Read a scalar property, resolving the object first if needed.
    pub fn scalar(&self, id: &ObjectId, property: &str) -> Result<Option<Value>> {
        self.fetch(id)?;
        Ok(self
            .store
            .lock()
            .get(id)
            .and_then(|o| o.scalar(property))
            .cloned())
    }

    /// Write a scalar property, marking the object modified.
    pub fn set_scalar(&self, id: &ObjectId, property: &str, value: Value) -> Result<()> {
        self.fetch(id)?;
        self.store.lock().modify_scalar(id, property, value)
    }

    /// Point a to-one relationship at a target (or clear it with `None`).
    pub fn set_to_one(
        &self,
        id: &ObjectId,
        relationship: &str,
        target: Option<ObjectId>,
    ) -> Result<()> {
        self.fetch(id)?;
        self.store.lock().set_to_one(id, relationship, target)
    }

    /// Add a join row to a flattened relationship.
    pub fn link(&self, source: &ObjectId, relationship: &str, destination: &ObjectId) -> Result<()> {
        self.fetch(source)?;
        self.store
            .lock()
            .add_flattened(source, relationship, destination)
    }

    /// Remove a join row from a flattened relationship.
    pub fn unlink(
        &self,
        source: &ObjectId,
        relationship: &str,
        destination: &ObjectId,
    ) -> Result<()> {
        self.fetch(source)?;
        self.store
            .lock()
            .remove_flattened(source, relationship, destination)
    }

    /// Schedule an object for deletion, applying mapping delete rules.
    pub fn delete(&self, id: &ObjectId) -> Result<()> {
        let mut store = self.store.lock();
        let resolver = CacheResolver {
            cache: &self.cache,
            fetcher: &*self.fetcher,
        };
        delete_object(&mut store, &resolver, id)
    }

    /// Whether a commit would write anything.
    pub fn has_changes(&self) -> bool {
        self.store.lock().has_pending_changes()
    }

    /// Commit all pending changes in one transaction per data source.
    pub fn commit(&self) -> Result<CommitStats> {
        for hook in self.before_commit.lock().iter() {
            hook()?;
        }

        let (stats, changes) = {
            let mut store = self.store.lock();
            commit::commit(&mut store, &self.adapters, self.sorter.as_ref())?
        };
        // Store lock released: listeners may re-enter the store.
        self.cache.process_changes(changes)?;

        for hook in self.after_commit.lock().iter() {
            hook(&stats);
        }
        Ok(stats)
    }

    /// Discard all uncommitted changes.
    pub fn rollback(&self) {
        self.store.lock().rollback();
        debug!("session rolled back");
        for hook in self.after_rollback.lock().iter() {
            hook();
        }
    }

    /// Build a paged list over the given identities with the session's
    /// default page size.
    pub fn paged_list(&self, ids: Vec<ObjectId>) -> Result<PagedList> {
        PagedList::new(ids, self.page_size, self.fetcher.clone())
    }

    /// Run a hook before each commit; an error from it aborts the commit
    /// before any SQL executes.
    pub fn on_before_commit(&self, hook: BeforeCommitHook) {
        self.before_commit.lock().push(hook);
    }

    /// Run a hook after each successful commit.
    pub fn on_after_commit(&self, hook: AfterCommitHook) {
        self.after_commit.lock().push(hook);
    }

    /// Run a hook after each rollback.
    pub fn on_after_rollback(&self, hook: AfterRollbackHook) {
        self.after_rollback.lock().push(hook);
    }

    /// Direct, locked access to the store. Test and tooling hatch.
    #[doc(hidden)]
    pub fn with_store<R>(&self, f: impl FnOnce(&mut ObjectStore) -> R) -> R {
        f(&mut self.store.lock())
    }
}

/// Resolves faults through the shared cache.
struct CacheResolver<'a> {
    cache: &'a SnapshotCache,
    fetcher: &'a dyn SnapshotFetcher,
}

impl FaultResolver for CacheResolver<'_> {
    fn resolve(&self, id: &ObjectId) -> Result<Option<Snapshot>> {
        self.cache.get_or_fetch(id, self.fetcher)
    }

    fn fetch_related(
        &self,
        source: &ObjectId,
        relationship: &RelationshipInfo,
    ) -> Result<Vec<ObjectId>> {
        Ok(self
            .fetcher
            .fetch_related(source, relationship)?
            .into_iter()
            .map(|(id, _)| id)
            .collect())
    }
}

/// Cache listener feeding peer commits into a session's store.
struct StoreListener {
    session: Weak<Session>,
}

impl SnapshotListener for StoreListener {
    fn snapshots_changed(&self, event: &rowsync_core::SnapshotEvent) {
        if let Some(session) = self.session.upgrade() {
            session.store.lock().merge_external(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{gallery_registry, snapshot_of, MapFetcher, MockAdapter};
    use rowsync_cache::CacheConfig;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn session_with(adapter: Arc<MockAdapter>) -> (Arc<Session>, Arc<MapFetcher>) {
        let fetcher = Arc::new(MapFetcher::default());
        let cache = Arc::new(SnapshotCache::new(CacheConfig::new("session-test")));
        let session = Session::builder(
            Arc::new(gallery_registry()),
            cache,
            fetcher.clone(),
        )
        .adapter("default", adapter)
        .build();
        (session, fetcher)
    }

    #[test]
    fn create_set_commit_roundtrip() {
        let adapter = Arc::new(MockAdapter::new());
        let log = adapter.log.clone();
        let (session, _) = session_with(adapter);

        let artist = session.create("artist").unwrap();
        session
            .set_scalar(&artist, "name", Value::Text("Matisse".into()))
            .unwrap();
        assert!(session.has_changes());

        let stats = session.commit().unwrap();
        assert_eq!(stats.inserted, 1);
        assert!(!session.has_changes());
        assert_eq!(log.tables(), vec!["ARTIST".to_string()]);
        assert_eq!(log.tx.lock().as_slice(), &["begin", "commit"]);

        // The object settled under its generated permanent id.
        assert_eq!(session.state_of(&artist), PersistenceState::Transient);
    }

    #[test]
    fn fetch_resolves_through_cache() {
        let adapter = Arc::new(MockAdapter::new());
        let (session, fetcher) = session_with(adapter);
        let id = ObjectId::single("artist", "ARTIST_ID", Value::BigInt(7));
        fetcher.insert(
            id.clone(),
            snapshot_of(&[("ARTIST_ID", Value::BigInt(7)), ("ARTIST_NAME", "Goya".into())]),
        );

        assert!(session.fetch(&id).unwrap());
        assert_eq!(
            session.scalar(&id, "name").unwrap(),
            Some(Value::Text("Goya".into()))
        );
        // Second time it comes straight from the cache.
        assert!(session.cache().contains(&id));

        let missing = ObjectId::single("artist", "ARTIST_ID", Value::BigInt(404));
        assert!(!session.fetch(&missing).unwrap());
    }

    #[test]
    fn before_commit_hook_can_veto() {
        let adapter = Arc::new(MockAdapter::new());
        let log = adapter.log.clone();
        let (session, _) = session_with(adapter);
        session.on_before_commit(Box::new(|| {
            Err(rowsync_core::Error::Custom("vetoed".to_string()))
        }));

        let artist = session.create("artist").unwrap();
        session
            .set_scalar(&artist, "name", Value::Text("x".into()))
            .unwrap();
        assert!(session.commit().is_err());
        // Nothing executed, changes still pending.
        assert!(log.ops.lock().is_empty());
        assert!(session.has_changes());
    }

    #[test]
    fn after_commit_and_rollback_hooks_fire() {
        let adapter = Arc::new(MockAdapter::new());
        let (session, _) = session_with(adapter);
        let commits = Arc::new(AtomicUsize::new(0));
        let rollbacks = Arc::new(AtomicUsize::new(0));
        {
            let commits = commits.clone();
            session.on_after_commit(Box::new(move |stats| {
                assert_eq!(stats.inserted, 1);
                commits.fetch_add(1, Ordering::SeqCst);
            }));
        }
        {
            let rollbacks = rollbacks.clone();
            session.on_after_rollback(Box::new(move || {
                rollbacks.fetch_add(1, Ordering::SeqCst);
            }));
        }

        let artist = session.create("artist").unwrap();
        session
            .set_scalar(&artist, "name", Value::Text("x".into()))
            .unwrap();
        session.commit().unwrap();
        assert_eq!(commits.load(Ordering::SeqCst), 1);

        let other = session.create("artist").unwrap();
        session
            .set_scalar(&other, "name", Value::Text("y".into()))
            .unwrap();
        session.rollback();
        assert_eq!(rollbacks.load(Ordering::SeqCst), 1);
        assert!(!session.has_changes());
    }

    #[test]
    fn sibling_sessions_see_each_others_commits() {
        let adapter = Arc::new(MockAdapter::new());
        let fetcher = Arc::new(MapFetcher::default());
        let cache = Arc::new(SnapshotCache::new(CacheConfig::new("shared")));
        let registry = Arc::new(gallery_registry());

        let writer = Session::builder(registry.clone(), cache.clone(), fetcher.clone())
            .adapter("default", adapter.clone())
            .build();
        let reader = Session::builder(registry, cache, fetcher.clone())
            .adapter("default", adapter)
            .build();
        reader.attach_cache_listener();

        // Reader loads the row first.
        let id = ObjectId::single("artist", "ARTIST_ID", Value::BigInt(7));
        fetcher.insert(
            id.clone(),
            snapshot_of(&[("ARTIST_ID", Value::BigInt(7)), ("ARTIST_NAME", "Old".into())]),
        );
        assert!(reader.fetch(&id).unwrap());

        // Writer updates and commits the same row.
        assert!(writer.fetch(&id).unwrap());
        writer
            .set_scalar(&id, "name", Value::Text("New".into()))
            .unwrap();
        writer.commit().unwrap();

        // The reader's store was refreshed by the cache event.
        assert_eq!(
            reader.scalar(&id, "name").unwrap(),
            Some(Value::Text("New".into()))
        );
    }

    #[test]
    fn delete_then_commit_removes_row() {
        let adapter = Arc::new(MockAdapter::new());
        let log = adapter.log.clone();
        let (session, fetcher) = session_with(adapter);
        let id = ObjectId::single("gallery", "GALLERY_ID", Value::BigInt(3));
        fetcher.insert(
            id.clone(),
            snapshot_of(&[("GALLERY_ID", Value::BigInt(3)), ("GALLERY_NAME", "Uffizi".into())]),
        );

        assert!(session.fetch(&id).unwrap());
        session.delete(&id).unwrap();
        assert_eq!(session.state_of(&id), PersistenceState::Deleted);

        let stats = session.commit().unwrap();
        assert_eq!(stats.deleted, 1);
        assert_eq!(session.state_of(&id), PersistenceState::Transient);
        assert_eq!(log.tables(), vec!["GALLERY".to_string()]);
        // And the cache no longer serves the dead row.
        assert!(!session.cache().contains(&id));
    }
}
