//! Error types for rowsync operations.

use crate::identity::ObjectId;
use std::fmt;

/// The primary error type for all rowsync operations.
#[derive(Debug)]
pub enum Error {
    /// Mapping/configuration errors (unmapped entity, bad key layout)
    Config(ConfigError),
    /// A delete was refused by a deny rule
    DeleteDeny(DeleteDenyError),
    /// An optimistic-lock qualifier matched zero rows
    OptimisticLock(OptimisticLockError),
    /// Internal consistency violation (duplicate rows for one id, torn state)
    Integrity(IntegrityError),
    /// An attempt to write through a read-only entity
    ReadOnly(ReadOnlyError),
    /// Database driver failures (execute, transaction, key generation)
    Driver(DriverError),
    /// Remote invalidation transport failures
    Transport(TransportError),
    /// Custom error with message
    Custom(String),
}

#[derive(Debug)]
pub struct ConfigError {
    pub message: String,
}

/// Raised when a deny delete rule finds related objects still attached.
#[derive(Debug)]
pub struct DeleteDenyError {
    /// The object whose delete was refused.
    pub object: ObjectId,
    /// The relationship that still has related objects.
    pub relationship: String,
    pub message: String,
}

/// Which statement detected the stale row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockOperation {
    Update,
    Delete,
}

/// Raised when an UPDATE/DELETE qualified on locking columns touches no rows.
#[derive(Debug)]
pub struct OptimisticLockError {
    /// The object whose underlying row was concurrently changed or removed.
    pub object: ObjectId,
    pub operation: LockOperation,
    /// Rendered qualifier column/value pairs, bind values truncated.
    pub qualifier: String,
}

#[derive(Debug)]
pub struct IntegrityError {
    pub message: String,
}

#[derive(Debug)]
pub struct ReadOnlyError {
    /// The entity whose mapping forbids DML.
    pub entity: String,
}

#[derive(Debug)]
pub struct DriverError {
    pub kind: DriverErrorKind,
    /// Table the failing statement targeted, when known.
    pub table: Option<String>,
    /// Rendered bind values of the failing row, truncated.
    pub binds: Option<String>,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverErrorKind {
    /// Statement execution failed
    Execute,
    /// Begin/commit/rollback failed
    Transaction,
    /// Primary key generation failed
    KeyGeneration,
    /// Row fetch failed
    Fetch,
}

#[derive(Debug)]
pub struct TransportError {
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl Error {
    /// Whether the session remains usable after this error.
    ///
    /// Deny and lock failures leave in-memory state intact so the caller can
    /// adjust and retry; driver and integrity failures do not.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::DeleteDeny(_) | Error::OptimisticLock(_) | Error::ReadOnly(_)
        )
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Config(e) => write!(f, "Configuration error: {}", e.message),
            Error::DeleteDeny(e) => write!(f, "Delete denied: {}", e.message),
            Error::OptimisticLock(e) => {
                let op = match e.operation {
                    LockOperation::Update => "update",
                    LockOperation::Delete => "delete",
                };
                write!(
                    f,
                    "Optimistic lock failure: {} of {} matched no rows (qualifier: {})",
                    op, e.object, e.qualifier
                )
            }
            Error::Integrity(e) => write!(f, "Integrity error: {}", e.message),
            Error::ReadOnly(e) => write!(
                f,
                "Attempt to modify object(s) mapped to a read-only entity: '{}'",
                e.entity
            ),
            Error::Driver(e) => {
                if let Some(table) = &e.table {
                    write!(f, "Driver error on table '{}': {}", table, e.message)?;
                } else {
                    write!(f, "Driver error: {}", e.message)?;
                }
                if let Some(binds) = &e.binds {
                    write!(f, " [binds: {}]", binds)?;
                }
                Ok(())
            }
            Error::Transport(e) => write!(f, "Transport error: {}", e.message),
            Error::Custom(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Driver(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Transport(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            _ => None,
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for DeleteDenyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for IntegrityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for DriverError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl From<ConfigError> for Error {
    fn from(err: ConfigError) -> Self {
        Error::Config(err)
    }
}

impl From<DeleteDenyError> for Error {
    fn from(err: DeleteDenyError) -> Self {
        Error::DeleteDeny(err)
    }
}

impl From<OptimisticLockError> for Error {
    fn from(err: OptimisticLockError) -> Self {
        Error::OptimisticLock(err)
    }
}

impl From<IntegrityError> for Error {
    fn from(err: IntegrityError) -> Self {
        Error::Integrity(err)
    }
}

impl From<DriverError> for Error {
    fn from(err: DriverError) -> Self {
        Error::Driver(err)
    }
}

impl From<TransportError> for Error {
    fn from(err: TransportError) -> Self {
        Error::Transport(err)
    }
}

/// Result type alias for rowsync operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    #[test]
    fn recoverable_flags() {
        let deny = Error::DeleteDeny(DeleteDenyError {
            object: ObjectId::single("artist", "artist_id", Value::BigInt(1)),
            relationship: "paintings".to_string(),
            message: "related paintings exist".to_string(),
        });
        assert!(deny.is_recoverable());

        let driver = Error::Driver(DriverError {
            kind: DriverErrorKind::Execute,
            table: Some("ARTIST".to_string()),
            binds: None,
            message: "constraint violated".to_string(),
            source: None,
        });
        assert!(!driver.is_recoverable());
    }

    #[test]
    fn driver_display_includes_table_and_binds() {
        let err = Error::Driver(DriverError {
            kind: DriverErrorKind::Execute,
            table: Some("PAINTING".to_string()),
            binds: Some("'Mona Lisa', 42".to_string()),
            message: "not null violation".to_string(),
            source: None,
        });
        let rendered = err.to_string();
        assert!(rendered.contains("PAINTING"));
        assert!(rendered.contains("Mona Lisa"));
    }

    #[test]
    fn lock_failure_display_names_operation() {
        let err = Error::OptimisticLock(OptimisticLockError {
            object: ObjectId::single("artist", "artist_id", Value::BigInt(7)),
            operation: LockOperation::Delete,
            qualifier: "ARTIST_NAME='x'".to_string(),
        });
        assert!(err.to_string().contains("delete"));
    }
}
