//! Rowsync - object-relational persistence core with a dependency-aware
//! commit pipeline.
//!
//! Rowsync keeps graphs of in-memory objects synchronized with relational
//! rows:
//!
//! - A shared, LRU-bounded [`SnapshotCache`] of versioned row images, with
//!   change events for cross-session and cross-process invalidation
//! - A per-session [`ObjectStore`] tracking object state, retained baseline
//!   snapshots and flattened (join-table) bookkeeping
//! - Delete-rule processing (deny / nullify / cascade) over the mapped
//!   relationship graph
//! - A commit pipeline that generates primary keys master-first, groups
//!   changes into batched DML by statement shape, orders statements by FK
//!   dependency and executes them in one transaction per data source
//! - [`PagedList`]: query results materialized one page at a time
//!
//! # Quick start
//!
//! ```ignore
//! use rowsync::{CacheConfig, Session, SnapshotCache, Value};
//! use std::sync::Arc;
//!
//! let cache = Arc::new(SnapshotCache::new(CacheConfig::new("main")));
//! let session = Session::builder(registry, cache, fetcher)
//!     .adapter("default", adapter)
//!     .build();
//!
//! let artist = session.create("artist")?;
//! session.set_scalar(&artist, "name", Value::Text("Monet".into()))?;
//! let stats = session.commit()?;
//! assert_eq!(stats.inserted, 1);
//! ```
//!
//! The database side is pluggable: implement [`DbAdapter`], [`Connection`]
//! and [`SnapshotFetcher`] for your driver and the rest of the stack is
//! driver-agnostic.

pub use rowsync_core::{
    // Mapping metadata
    AttributeInfo,
    // Collaborator traits
    Connection,
    DbAdapter,
    DeleteRule,
    // DML shapes handed to connections
    DmlKind,
    DmlRow,
    DmlTemplate,
    EntityInfo,
    EntityRegistry,
    EntitySorter,
    // Errors
    Error,
    EventTransport,
    LinkTableInfo,
    LockOperation,
    LockType,
    // Core value types
    ObjectId,
    RelationshipInfo,
    Result,
    Snapshot,
    SnapshotDiff,
    // Change events
    SnapshotEvent,
    SnapshotFetcher,
    SnapshotListener,
    TopologicalSorter,
    Value,
};

pub use rowsync_core::error::{
    ConfigError, DeleteDenyError, DriverError, DriverErrorKind, IntegrityError,
    OptimisticLockError, ReadOnlyError, TransportError,
};

pub use rowsync_cache::{CacheConfig, SnapshotCache, SnapshotChanges};

pub use rowsync_session::{
    delete_object, CommitStats, FaultResolver, ObjectStore, PagedList, PersistenceState,
    PersistentObject, Property, Session, SessionBuilder, DEFAULT_PAGE_SIZE,
};
