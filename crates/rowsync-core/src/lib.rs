//! Core types and collaborator traits for the rowsync persistence stack.
//!
//! This crate defines the vocabulary the higher layers speak:
//!
//! - [`Value`]: dynamically-typed SQL scalars
//! - [`ObjectId`]: entity name + primary key, with temporary surrogates
//! - [`Snapshot`]: immutable, versioned row images and their diffs
//! - [`EntityRegistry`]: string-keyed mapping metadata
//! - [`Error`]: the error enum shared by every rowsync crate
//! - collaborator traits ([`DbAdapter`], [`Connection`], [`SnapshotFetcher`],
//!   [`EntitySorter`], [`EventTransport`], [`SnapshotListener`])
//!
//! It carries no locking, no caching, and no commit logic; those live in
//! `rowsync-cache` and `rowsync-session`.

pub mod adapter;
pub mod entity;
pub mod error;
pub mod event;
pub mod identity;
pub mod snapshot;
pub mod value;

pub use adapter::{
    Connection, DbAdapter, DmlKind, DmlRow, DmlTemplate, EntitySorter, SnapshotFetcher,
    TopologicalSorter,
};
pub use entity::{
    AttributeInfo, DeleteRule, EntityInfo, EntityRegistry, LinkTableInfo, LockType,
    RelationshipInfo,
};
pub use error::{
    ConfigError, DeleteDenyError, DriverError, DriverErrorKind, Error, IntegrityError,
    LockOperation, OptimisticLockError, ReadOnlyError, Result, TransportError,
};
pub use event::{EventTransport, SnapshotEvent, SnapshotListener};
pub use identity::ObjectId;
pub use snapshot::{Snapshot, SnapshotDiff};
pub use value::Value;
