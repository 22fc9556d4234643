//! Shared LRU cache of row snapshots.
//!
//! A [`SnapshotCache`] is the process-wide source of truth for committed row
//! state. Object stores read through it on faults, commits push fresh
//! snapshots into it, and an optional [`EventTransport`] keeps sibling caches
//! in other processes coherent through invalidation events.
//!
//! Locking: the cache uses its own mutexes and never calls out while holding
//! one. Listeners and the transport are invoked strictly after locks are
//! released, so a listener may re-enter the cache (or an object store may
//! hold its own lock across a cache call) without deadlocking.

use lru::LruCache;
use parking_lot::Mutex;
use rowsync_core::error::IntegrityError;
use rowsync_core::{
    Error, EventTransport, ObjectId, Result, Snapshot, SnapshotEvent, SnapshotFetcher,
    SnapshotListener,
};
use std::num::NonZeroUsize;
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Default number of row snapshots retained before LRU eviction.
pub const DEFAULT_CAPACITY: usize = 10_000;

/// Default number of named query result lists retained.
pub const DEFAULT_QUERY_LIST_CAPACITY: usize = 100;

/// Construction-time settings for a [`SnapshotCache`].
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Cache name, stamped on outgoing events so remote echoes can be
    /// recognized and dropped. Must be unique per process group.
    pub name: String,
    /// Maximum retained snapshots.
    pub capacity: usize,
    /// Maximum retained query result lists.
    pub query_list_capacity: usize,
}

impl CacheConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            capacity: DEFAULT_CAPACITY,
            query_list_capacity: DEFAULT_QUERY_LIST_CAPACITY,
        }
    }

    #[must_use]
    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }
}

/// Changes applied to the cache by one committed transaction.
#[derive(Debug, Default)]
pub struct SnapshotChanges {
    /// Post-commit snapshots for inserted and updated rows.
    pub updated: Vec<(ObjectId, Snapshot)>,
    /// Ids of deleted rows.
    pub deleted: Vec<ObjectId>,
    /// Ids whose cached state must be dropped and refetched.
    pub invalidated: Vec<ObjectId>,
    /// Objects touched only through join-table rows.
    pub indirectly_modified: Vec<ObjectId>,
}

impl SnapshotChanges {
    pub fn is_empty(&self) -> bool {
        self.updated.is_empty()
            && self.deleted.is_empty()
            && self.invalidated.is_empty()
            && self.indirectly_modified.is_empty()
    }
}

/// LRU-bounded, shared cache of committed row snapshots.
pub struct SnapshotCache {
    name: String,
    snapshots: Mutex<LruCache<ObjectId, Snapshot>>,
    query_lists: Mutex<LruCache<String, Vec<Snapshot>>>,
    listeners: Mutex<Vec<Arc<dyn SnapshotListener>>>,
    transport: Mutex<Option<Box<dyn EventTransport>>>,
}

impl SnapshotCache {
    pub fn new(config: CacheConfig) -> Self {
        let capacity = NonZeroUsize::new(config.capacity)
            .unwrap_or_else(|| NonZeroUsize::new(DEFAULT_CAPACITY).unwrap());
        let query_capacity = NonZeroUsize::new(config.query_list_capacity)
            .unwrap_or_else(|| NonZeroUsize::new(DEFAULT_QUERY_LIST_CAPACITY).unwrap());
        Self {
            name: config.name,
            snapshots: Mutex::new(LruCache::new(capacity)),
            query_lists: Mutex::new(LruCache::new(query_capacity)),
            listeners: Mutex::new(Vec::new()),
            transport: Mutex::new(None),
        }
    }

    /// Attach a cross-process event transport. Outgoing change events are
    /// published through it; inbound events are fed back via
    /// [`process_external_event`](Self::process_external_event).
    pub fn set_transport(&self, transport: Box<dyn EventTransport>) {
        *self.transport.lock() = Some(transport);
    }

    /// The cache's event-origin name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register a local listener for snapshot change events.
    pub fn add_listener(&self, listener: Arc<dyn SnapshotListener>) {
        self.listeners.lock().push(listener);
    }

    /// Look up a cached snapshot, refreshing its LRU position.
    pub fn get(&self, id: &ObjectId) -> Option<Snapshot> {
        self.snapshots.lock().get(id).cloned()
    }

    /// Whether the id currently has a cached snapshot.
    pub fn contains(&self, id: &ObjectId) -> bool {
        self.snapshots.lock().contains(id)
    }

    /// Number of cached snapshots.
    pub fn len(&self) -> usize {
        self.snapshots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.lock().len() == 0
    }

    /// Look up a snapshot, going to the database on a miss.
    ///
    /// The fetch runs outside the cache lock. Zero rows yields `Ok(None)`
    /// (the row is gone); more than one row for a single identity is a
    /// mapping defect and fails with an integrity error.
    pub fn get_or_fetch(
        &self,
        id: &ObjectId,
        fetcher: &dyn SnapshotFetcher,
    ) -> Result<Option<Snapshot>> {
        if let Some(hit) = self.get(id) {
            return Ok(Some(hit));
        }

        trace!(id = %id, "snapshot cache miss");
        let mut rows = fetcher.fetch(id)?;
        if rows.len() > 1 {
            return Err(Error::Integrity(IntegrityError {
                message: format!("found {} rows for single object id {}", rows.len(), id),
            }));
        }
        match rows.pop() {
            None => Ok(None),
            Some(snapshot) => {
                self.snapshots.lock().put(id.clone(), snapshot.clone());
                Ok(Some(snapshot))
            }
        }
    }

    /// Drop one cached snapshot.
    pub fn evict(&self, id: &ObjectId) {
        self.snapshots.lock().pop(id);
    }

    /// Drop all cached snapshots and query lists.
    pub fn clear(&self) {
        self.snapshots.lock().clear();
        self.query_lists.lock().clear();
    }

    /// Store a named query result list.
    pub fn store_query_list(&self, name: impl Into<String>, rows: Vec<Snapshot>) {
        self.query_lists.lock().put(name.into(), rows);
    }

    /// Retrieve a named query result list, refreshing its LRU position.
    pub fn cached_query_list(&self, name: &str) -> Option<Vec<Snapshot>> {
        self.query_lists.lock().get(name).cloned()
    }

    /// Apply one committed transaction's changes and broadcast the event.
    ///
    /// Merge rules per updated entry:
    /// - no cached entry: the fresh snapshot is stored as-is;
    /// - cached entry whose version matches the fresh snapshot's `replaces`
    ///   stamp (or a fresh snapshot with no lineage): stored, superseding it;
    /// - version mismatch: the cached entry cannot be merged safely, so it is
    ///   evicted and the id is demoted to the invalidated set.
    ///
    /// Empty change sets produce no event. Listeners and the transport are
    /// invoked after the lock is released.
    #[tracing::instrument(level = "debug", skip_all, fields(cache = %self.name))]
    pub fn process_changes(&self, changes: SnapshotChanges) -> Result<()> {
        if changes.is_empty() {
            return Ok(());
        }
        let event = self.apply(changes, true);
        if event.is_empty() {
            return Ok(());
        }

        self.notify_listeners(&event);
        if let Some(transport) = self.transport.lock().as_ref() {
            transport.publish(&event)?;
        }
        Ok(())
    }

    /// Apply an event received from a sibling cache in another process.
    ///
    /// Echoes of this cache's own commits (matching origin) are dropped. The
    /// event is not re-published; only local listeners are notified.
    pub fn process_external_event(&self, event: SnapshotEvent) {
        if event.origin == self.name {
            trace!(origin = %event.origin, "dropping echo of local commit");
            return;
        }
        debug!(origin = %event.origin, updated = event.updated.len(),
            deleted = event.deleted.len(), "merging remote snapshot event");

        let changes = SnapshotChanges {
            updated: event.updated,
            deleted: event.deleted,
            invalidated: event.invalidated,
            indirectly_modified: event.indirectly_modified,
        };
        let merged = self.apply(changes, false);
        if !merged.is_empty() {
            self.notify_listeners(&merged);
        }
    }

    /// Stop the event transport, if any. Safe to call more than once.
    pub fn shutdown(&self) -> Result<()> {
        if let Some(transport) = self.transport.lock().take() {
            transport.shutdown()?;
        }
        Ok(())
    }

    fn apply(&self, changes: SnapshotChanges, store_unseen: bool) -> SnapshotEvent {
        let mut event = SnapshotEvent::new(self.name.clone());
        let mut cache = self.snapshots.lock();

        for (id, fresh) in changes.updated {
            match cache.peek(&id) {
                Some(cached) => {
                    let mergeable = match fresh.replaces() {
                        Some(replaces) => replaces == cached.version(),
                        None => true,
                    };
                    if mergeable {
                        cache.put(id.clone(), fresh.clone());
                        event.updated.push((id, fresh));
                    } else {
                        warn!(id = %id, cached_version = cached.version(),
                            replaces = ?fresh.replaces(),
                            "snapshot version mismatch, evicting instead of merging");
                        cache.pop(&id);
                        event.invalidated.push(id);
                    }
                }
                None if store_unseen => {
                    cache.put(id.clone(), fresh.clone());
                    event.updated.push((id, fresh));
                }
                // Remote update for a row this process never cached: nothing
                // to refresh, but listeners still want to hear about it.
                None => event.updated.push((id, fresh)),
            }
        }

        for id in changes.deleted {
            cache.pop(&id);
            event.deleted.push(id);
        }
        for id in changes.invalidated {
            cache.pop(&id);
            event.invalidated.push(id);
        }
        event.indirectly_modified = changes.indirectly_modified;

        event
    }

    fn notify_listeners(&self, event: &SnapshotEvent) {
        let listeners: Vec<Arc<dyn SnapshotListener>> = self.listeners.lock().clone();
        for listener in listeners {
            listener.snapshots_changed(event);
        }
    }
}

impl Drop for SnapshotCache {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            warn!(error = %err, "snapshot cache transport shutdown failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as PlMutex;
    use rowsync_core::Value;

    fn id(n: i64) -> ObjectId {
        ObjectId::single("artist", "artist_id", Value::BigInt(n))
    }

    fn snap(name: &str) -> Snapshot {
        Snapshot::new([("ARTIST_NAME".to_string(), Value::Text(name.into()))])
    }

    struct RecordingListener {
        events: PlMutex<Vec<SnapshotEvent>>,
    }

    impl SnapshotListener for RecordingListener {
        fn snapshots_changed(&self, event: &SnapshotEvent) {
            self.events.lock().push(event.clone());
        }
    }

    struct FixedFetcher {
        rows: Vec<Snapshot>,
    }

    impl SnapshotFetcher for FixedFetcher {
        fn fetch(&self, _id: &ObjectId) -> Result<Vec<Snapshot>> {
            Ok(self.rows.clone())
        }

        fn fetch_many(&self, ids: &[ObjectId]) -> Result<Vec<(ObjectId, Snapshot)>> {
            Ok(ids
                .iter()
                .cloned()
                .zip(self.rows.iter().cloned())
                .collect())
        }
    }

    fn cache() -> SnapshotCache {
        SnapshotCache::new(CacheConfig::new("test-cache").capacity(4))
    }

    #[test]
    fn lru_evicts_oldest_at_capacity() {
        let cache = cache();
        for n in 0..5 {
            cache.process_changes(SnapshotChanges {
                updated: vec![(id(n), snap("x"))],
                ..Default::default()
            })
            .unwrap();
        }
        assert_eq!(cache.len(), 4);
        assert!(!cache.contains(&id(0)));
        assert!(cache.contains(&id(4)));
    }

    #[test]
    fn get_or_fetch_misses_to_fetcher() {
        let cache = cache();
        let fetcher = FixedFetcher { rows: vec![snap("fetched")] };

        let got = cache.get_or_fetch(&id(1), &fetcher).unwrap().unwrap();
        assert_eq!(got.get("ARTIST_NAME"), Some(&Value::Text("fetched".into())));
        // Cached now.
        assert!(cache.contains(&id(1)));
    }

    #[test]
    fn get_or_fetch_zero_rows_is_none() {
        let cache = cache();
        let fetcher = FixedFetcher { rows: vec![] };
        assert!(cache.get_or_fetch(&id(1), &fetcher).unwrap().is_none());
    }

    #[test]
    fn get_or_fetch_duplicate_rows_is_integrity_error() {
        let cache = cache();
        let fetcher = FixedFetcher { rows: vec![snap("a"), snap("b")] };
        let err = cache.get_or_fetch(&id(1), &fetcher).unwrap_err();
        assert!(matches!(err, Error::Integrity(_)));
    }

    #[test]
    fn version_mismatch_evicts_instead_of_merging() {
        let cache = cache();
        let original = snap("old");
        cache.process_changes(SnapshotChanges {
            updated: vec![(id(1), original.clone())],
            ..Default::default()
        })
        .unwrap();

        // A snapshot claiming to replace some other lineage.
        let unrelated = Snapshot::replacing(
            [("ARTIST_NAME".to_string(), Value::Text("new".into()))],
            original.version() + 1_000_000,
        );
        let listener = Arc::new(RecordingListener { events: PlMutex::new(Vec::new()) });
        cache.add_listener(listener.clone());

        cache.process_changes(SnapshotChanges {
            updated: vec![(id(1), unrelated)],
            ..Default::default()
        })
        .unwrap();

        assert!(!cache.contains(&id(1)));
        let events = listener.events.lock();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].invalidated, vec![id(1)]);
        assert!(events[0].updated.is_empty());
    }

    #[test]
    fn matching_lineage_merges() {
        let cache = cache();
        let original = snap("old");
        cache.process_changes(SnapshotChanges {
            updated: vec![(id(1), original.clone())],
            ..Default::default()
        })
        .unwrap();

        let successor = Snapshot::replacing(
            [("ARTIST_NAME".to_string(), Value::Text("new".into()))],
            original.version(),
        );
        cache.process_changes(SnapshotChanges {
            updated: vec![(id(1), successor)],
            ..Default::default()
        })
        .unwrap();

        let got = cache.get(&id(1)).unwrap();
        assert_eq!(got.get("ARTIST_NAME"), Some(&Value::Text("new".into())));
    }

    #[test]
    fn empty_changes_produce_no_event() {
        let cache = cache();
        let listener = Arc::new(RecordingListener { events: PlMutex::new(Vec::new()) });
        cache.add_listener(listener.clone());

        cache.process_changes(SnapshotChanges::default()).unwrap();
        assert!(listener.events.lock().is_empty());
    }

    #[test]
    fn external_echo_is_dropped() {
        let cache = cache();
        let listener = Arc::new(RecordingListener { events: PlMutex::new(Vec::new()) });
        cache.add_listener(listener.clone());

        let mut echo = SnapshotEvent::new("test-cache");
        echo.deleted.push(id(1));
        cache.process_external_event(echo);
        assert!(listener.events.lock().is_empty());

        let mut remote = SnapshotEvent::new("other-cache");
        remote.deleted.push(id(1));
        cache.process_external_event(remote);
        assert_eq!(listener.events.lock().len(), 1);
    }

    #[test]
    fn invalidated_ids_are_evicted() {
        let cache = cache();
        cache.process_changes(SnapshotChanges {
            updated: vec![(id(1), snap("x"))],
            ..Default::default()
        })
        .unwrap();

        cache.process_changes(SnapshotChanges {
            invalidated: vec![id(1)],
            ..Default::default()
        })
        .unwrap();
        assert!(!cache.contains(&id(1)));
    }

    #[test]
    fn query_lists_round_trip() {
        let cache = cache();
        cache.store_query_list("all-artists", vec![snap("a"), snap("b")]);
        assert_eq!(cache.cached_query_list("all-artists").unwrap().len(), 2);
        assert!(cache.cached_query_list("missing").is_none());

        cache.clear();
        assert!(cache.cached_query_list("all-artists").is_none());
    }
}
