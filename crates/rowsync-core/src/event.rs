//! Snapshot change events.
//!
//! A [`SnapshotEvent`] describes one committed batch of row changes. Events
//! flow two ways: locally to registered [`SnapshotListener`]s (object stores
//! merging peer commits), and remotely through an [`EventTransport`] so
//! sibling caches in other processes can invalidate or update their entries.

use crate::identity::ObjectId;
use crate::snapshot::Snapshot;
use serde::{Deserialize, Serialize};

/// One batch of committed row changes, keyed by object identity.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SnapshotEvent {
    /// Name of the cache that produced the event. Caches drop remote events
    /// carrying their own name; those are echoes of local commits.
    pub origin: String,
    /// Rows inserted or updated, with their post-commit snapshots.
    pub updated: Vec<(ObjectId, Snapshot)>,
    /// Rows deleted.
    pub deleted: Vec<ObjectId>,
    /// Ids whose cached state can no longer be trusted and must be refetched.
    pub invalidated: Vec<ObjectId>,
    /// Objects whose join-table rows changed without touching their own row.
    pub indirectly_modified: Vec<ObjectId>,
}

impl SnapshotEvent {
    pub fn new(origin: impl Into<String>) -> Self {
        Self {
            origin: origin.into(),
            ..Self::default()
        }
    }

    /// Whether the event carries no changes at all. Empty events are
    /// suppressed rather than delivered.
    pub fn is_empty(&self) -> bool {
        self.updated.is_empty()
            && self.deleted.is_empty()
            && self.invalidated.is_empty()
            && self.indirectly_modified.is_empty()
    }
}

/// Local observer of snapshot changes, typically an object store merging
/// peer commits into its retained state.
///
/// Listeners are invoked after all cache locks are released; a listener may
/// re-enter the cache freely.
pub trait SnapshotListener: Send + Sync {
    fn snapshots_changed(&self, event: &SnapshotEvent);
}

/// Cross-process event channel.
///
/// Implementations serialize events (they are `serde`-friendly) onto some
/// shared medium and feed inbound events back into the local cache. The
/// cache calls `shutdown` exactly once when it is dropped or closed.
pub trait EventTransport: Send + Sync {
    fn publish(&self, event: &SnapshotEvent) -> crate::error::Result<()>;
    fn shutdown(&self) -> crate::error::Result<()>;
}
