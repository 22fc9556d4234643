//! Object identity.
//!
//! An [`ObjectId`] names one logical row/object: an entity tag plus the
//! primary key column values. Newly created objects that have not been
//! through primary key generation get a *temporary* id carrying a
//! process-unique surrogate key; the permanent id replaces it at commit.

use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_TEMP_KEY: AtomicU64 = AtomicU64::new(1);

/// Unique identity of a persistent object: entity name + primary key values.
///
/// Identities are immutable values. Two ids are equal iff the entity and all
/// key values match; temporary ids compare by their surrogate key and are
/// never reused within a process.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectId {
    entity: String,
    key: IdKey,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
enum IdKey {
    /// Permanent key: PK column/value pairs, sorted by column name.
    Permanent(Vec<(String, Value)>),
    /// Surrogate key for an object awaiting key generation.
    Temporary(u64),
}

impl ObjectId {
    /// Create a permanent identity from primary key column/value pairs.
    pub fn new(entity: impl Into<String>, key: Vec<(String, Value)>) -> Self {
        let mut key = key;
        key.sort_by(|a, b| a.0.cmp(&b.0));
        Self {
            entity: entity.into(),
            key: IdKey::Permanent(key),
        }
    }

    /// Create a permanent identity with a single-column key.
    pub fn single(entity: impl Into<String>, column: impl Into<String>, value: Value) -> Self {
        Self::new(entity, vec![(column.into(), value)])
    }

    /// Allocate a temporary identity for a newly created object.
    pub fn temporary(entity: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            key: IdKey::Temporary(NEXT_TEMP_KEY.fetch_add(1, Ordering::Relaxed)),
        }
    }

    /// The entity this identity belongs to.
    pub fn entity(&self) -> &str {
        &self.entity
    }

    /// Whether this identity still carries a surrogate key.
    pub fn is_temporary(&self) -> bool {
        matches!(self.key, IdKey::Temporary(_))
    }

    /// The primary key column/value pairs, empty for a temporary id.
    pub fn key_values(&self) -> &[(String, Value)] {
        match &self.key {
            IdKey::Permanent(kv) => kv,
            IdKey::Temporary(_) => &[],
        }
    }

    /// Look up a single key column value.
    pub fn key_value(&self, column: &str) -> Option<&Value> {
        self.key_values()
            .iter()
            .find(|(c, _)| c == column)
            .map(|(_, v)| v)
    }

    /// Build the permanent identity that replaces this one once the given
    /// key values are known. The entity tag is preserved.
    pub fn with_key(&self, key: Vec<(String, Value)>) -> Self {
        Self::new(self.entity.clone(), key)
    }

    /// Derive a replacement id by overlaying updated key column values.
    ///
    /// Returns `None` when none of the updated columns participate in this
    /// id's key, i.e. no replacement is needed.
    pub fn replacement_with(&self, updated: &[(String, Value)]) -> Option<Self> {
        let current = self.key_values();
        let mut replaced = false;
        let mut next: Vec<(String, Value)> = current.to_vec();
        for (col, val) in updated {
            if let Some(slot) = next.iter_mut().find(|(c, _)| c == col) {
                if slot.1 != *val {
                    slot.1 = val.clone();
                    replaced = true;
                }
            }
        }
        replaced.then(|| Self::new(self.entity.clone(), next))
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.key {
            IdKey::Temporary(n) => write!(f, "{}:temp[{}]", self.entity, n),
            IdKey::Permanent(kv) => {
                write!(f, "{}:{{", self.entity)?;
                for (i, (col, val)) in kv.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}={:?}", col, val)?;
                }
                write!(f, "}}")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permanent_ids_equal_by_entity_and_key() {
        let a = ObjectId::single("artist", "artist_id", Value::BigInt(5));
        let b = ObjectId::new("artist", vec![("artist_id".into(), Value::BigInt(5))]);
        assert_eq!(a, b);

        let c = ObjectId::single("gallery", "artist_id", Value::BigInt(5));
        assert_ne!(a, c);
    }

    #[test]
    fn key_order_is_canonical() {
        let a = ObjectId::new(
            "order_line",
            vec![
                ("product_id".into(), Value::BigInt(2)),
                ("order_id".into(), Value::BigInt(1)),
            ],
        );
        let b = ObjectId::new(
            "order_line",
            vec![
                ("order_id".into(), Value::BigInt(1)),
                ("product_id".into(), Value::BigInt(2)),
            ],
        );
        assert_eq!(a, b);
    }

    #[test]
    fn temporary_ids_are_unique() {
        let a = ObjectId::temporary("artist");
        let b = ObjectId::temporary("artist");
        assert_ne!(a, b);
        assert!(a.is_temporary());
        assert!(a.key_values().is_empty());
    }

    #[test]
    fn replacement_only_when_key_column_touched() {
        let id = ObjectId::single("artist", "artist_id", Value::BigInt(1));

        let unrelated = vec![("name".to_string(), Value::Text("x".into()))];
        assert!(id.replacement_with(&unrelated).is_none());

        let same = vec![("artist_id".to_string(), Value::BigInt(1))];
        assert!(id.replacement_with(&same).is_none());

        let rekey = vec![("artist_id".to_string(), Value::BigInt(9))];
        let replacement = id.replacement_with(&rekey).unwrap();
        assert_eq!(replacement.key_value("artist_id"), Some(&Value::BigInt(9)));
        assert_eq!(replacement.entity(), "artist");
    }
}
