//! Entity mapping metadata.
//!
//! Mapping descriptors are produced once at mapping-load time by an external
//! loader and consumed read-only by the store and commit pipeline. Entities
//! are resolved through a string-keyed [`EntityRegistry`]; the core never
//! dispatches on Rust types to find a mapping.

use crate::error::{ConfigError, Error, Result};
use std::collections::HashMap;

/// Delete rule applied to a relationship when its source object is deleted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DeleteRule {
    /// Refuse the delete while related objects exist.
    Deny,
    /// Clear the inverse side of the relationship on related objects.
    Nullify,
    /// Recursively delete related objects.
    Cascade,
    /// Leave related objects alone.
    #[default]
    NoAction,
}

/// Row-locking strategy for an entity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LockType {
    /// Primary key qualifiers only.
    #[default]
    None,
    /// Attributes/relationships flagged `used_for_locking` join the
    /// UPDATE/DELETE qualifier, sourced from the retained snapshot.
    Optimistic,
}

/// A persistent attribute: one object property backed by one column.
#[derive(Debug, Clone)]
pub struct AttributeInfo {
    /// Property name on the object.
    pub name: String,
    /// Backing column name.
    pub column: String,
    /// Whether the column is part of the primary key.
    pub primary_key: bool,
    /// Whether the column value is produced by the key generator.
    pub generated: bool,
    /// Whether the attribute participates in optimistic-lock qualifiers.
    pub used_for_locking: bool,
}

impl AttributeInfo {
    pub fn new(name: impl Into<String>, column: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            column: column.into(),
            primary_key: false,
            generated: false,
            used_for_locking: false,
        }
    }

    #[must_use]
    pub fn primary_key(mut self, value: bool) -> Self {
        self.primary_key = value;
        self
    }

    #[must_use]
    pub fn generated(mut self, value: bool) -> Self {
        self.generated = value;
        self
    }

    #[must_use]
    pub fn used_for_locking(mut self, value: bool) -> Self {
        self.used_for_locking = value;
        self
    }
}

/// Join-table descriptor for a flattened (many-to-many) relationship.
///
/// The join table is invisible in the object model; the store tracks pending
/// join-row inserts/deletes against it directly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkTableInfo {
    /// The join table name.
    pub table: String,
    /// Column holding the source object's primary key.
    pub source_column: String,
    /// Column holding the destination object's primary key.
    pub target_column: String,
}

impl LinkTableInfo {
    pub fn new(
        table: impl Into<String>,
        source_column: impl Into<String>,
        target_column: impl Into<String>,
    ) -> Self {
        Self {
            table: table.into(),
            source_column: source_column.into(),
            target_column: target_column.into(),
        }
    }
}

/// Metadata about a relationship between two entities.
#[derive(Debug, Clone)]
pub struct RelationshipInfo {
    /// Property name on the source object.
    pub name: String,
    /// Target entity name.
    pub target: String,
    /// Multiplicity: to-many vs. to-one.
    pub to_many: bool,
    /// Delete rule applied when the source object is deleted.
    pub delete_rule: DeleteRule,
    /// Join table, present iff the relationship is flattened.
    pub link_table: Option<LinkTableInfo>,
    /// Whether source-row dirtiness is independent of this relationship.
    ///
    /// Changes to an independent relationship only touch the join table, so
    /// the source is reported as *indirectly modified* rather than dirty.
    pub independent: bool,
    /// The relationship on the target entity pointing back, if mapped.
    pub reverse: Option<String>,
    /// FK column on the source table (to-one only).
    pub fk_column: Option<String>,
    /// PK column on the target table the FK joins to (to-one only).
    pub target_pk_column: Option<String>,
    /// Whether the source's primary key is propagated from the target
    /// ("master") object, i.e. the FK column is also a PK column.
    pub to_dependent_pk: bool,
    /// Whether the relationship participates in optimistic-lock qualifiers.
    pub used_for_locking: bool,
}

impl RelationshipInfo {
    pub fn new(name: impl Into<String>, target: impl Into<String>, to_many: bool) -> Self {
        Self {
            name: name.into(),
            target: target.into(),
            to_many,
            delete_rule: DeleteRule::NoAction,
            link_table: None,
            independent: false,
            reverse: None,
            fk_column: None,
            target_pk_column: None,
            to_dependent_pk: false,
            used_for_locking: false,
        }
    }

    #[must_use]
    pub fn delete_rule(mut self, rule: DeleteRule) -> Self {
        self.delete_rule = rule;
        self
    }

    #[must_use]
    pub fn link_table(mut self, link: LinkTableInfo) -> Self {
        self.link_table = Some(link);
        self.independent = true;
        self
    }

    #[must_use]
    pub fn reverse(mut self, name: impl Into<String>) -> Self {
        self.reverse = Some(name.into());
        self
    }

    #[must_use]
    pub fn fk_column(mut self, fk: impl Into<String>, target_pk: impl Into<String>) -> Self {
        self.fk_column = Some(fk.into());
        self.target_pk_column = Some(target_pk.into());
        self
    }

    #[must_use]
    pub fn to_dependent_pk(mut self, value: bool) -> Self {
        self.to_dependent_pk = value;
        self
    }

    #[must_use]
    pub fn used_for_locking(mut self, value: bool) -> Self {
        self.used_for_locking = value;
        self
    }

    /// Whether this relationship is realized through a join table.
    pub fn is_flattened(&self) -> bool {
        self.link_table.is_some()
    }
}

/// Metadata about one mapped entity.
#[derive(Debug, Clone)]
pub struct EntityInfo {
    /// Entity name (the identity tag).
    pub name: String,
    /// Backing table name.
    pub table: String,
    /// Name of the data source owning the table's schema.
    pub data_source: String,
    /// Read-only entities reject all DML.
    pub read_only: bool,
    /// Locking strategy.
    pub lock_type: LockType,
    /// Persistent attributes.
    pub attributes: Vec<AttributeInfo>,
    /// Relationships to other entities.
    pub relationships: Vec<RelationshipInfo>,
}

impl EntityInfo {
    pub fn new(name: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            table: table.into(),
            data_source: "default".to_string(),
            read_only: false,
            lock_type: LockType::None,
            attributes: Vec::new(),
            relationships: Vec::new(),
        }
    }

    #[must_use]
    pub fn data_source(mut self, name: impl Into<String>) -> Self {
        self.data_source = name.into();
        self
    }

    #[must_use]
    pub fn read_only(mut self, value: bool) -> Self {
        self.read_only = value;
        self
    }

    #[must_use]
    pub fn lock_type(mut self, lock: LockType) -> Self {
        self.lock_type = lock;
        self
    }

    #[must_use]
    pub fn attribute(mut self, attr: AttributeInfo) -> Self {
        self.attributes.push(attr);
        self
    }

    #[must_use]
    pub fn relationship(mut self, rel: RelationshipInfo) -> Self {
        self.relationships.push(rel);
        self
    }

    /// Attributes forming the primary key.
    pub fn pk_attributes(&self) -> impl Iterator<Item = &AttributeInfo> {
        self.attributes.iter().filter(|a| a.primary_key)
    }

    /// Primary key column names.
    pub fn pk_columns(&self) -> Vec<&str> {
        self.pk_attributes().map(|a| a.column.as_str()).collect()
    }

    /// Find an attribute by property name.
    pub fn find_attribute(&self, name: &str) -> Option<&AttributeInfo> {
        self.attributes.iter().find(|a| a.name == name)
    }

    /// Find a relationship by property name.
    pub fn find_relationship(&self, name: &str) -> Option<&RelationshipInfo> {
        self.relationships.iter().find(|r| r.name == name)
    }

    /// To-one relationships whose target master propagates this entity's key.
    pub fn master_pk_relationships(&self) -> impl Iterator<Item = &RelationshipInfo> {
        self.relationships
            .iter()
            .filter(|r| !r.to_many && r.to_dependent_pk)
    }

    /// Primary key columns not populated by the generator and not
    /// propagated from a master relationship.
    ///
    /// More than one such column on an entity whose key must still be
    /// generated is a mapping error; the commit pipeline fails fast on it.
    pub fn ungenerated_pk_columns(&self) -> Vec<&str> {
        let propagated: Vec<&str> = self
            .master_pk_relationships()
            .filter_map(|r| r.fk_column.as_deref())
            .collect();
        self.pk_attributes()
            .filter(|a| !a.generated && !propagated.contains(&a.column.as_str()))
            .map(|a| a.column.as_str())
            .collect()
    }
}

/// String-keyed registry of all mapped entities, built once at load time.
#[derive(Debug, Default, Clone)]
pub struct EntityRegistry {
    entities: HashMap<String, EntityInfo>,
}

impl EntityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an entity descriptor, replacing any previous mapping.
    pub fn register(&mut self, entity: EntityInfo) {
        self.entities.insert(entity.name.clone(), entity);
    }

    /// Resolve an entity by name.
    pub fn get(&self, name: &str) -> Result<&EntityInfo> {
        self.entities.get(name).ok_or_else(|| {
            Error::Config(ConfigError {
                message: format!("entity '{}' is not mapped", name),
            })
        })
    }

    /// Resolve an entity, panicking on unmapped names. Test fixtures only.
    pub fn expect(&self, name: &str) -> &EntityInfo {
        &self.entities[name]
    }

    /// Iterate over all registered entities.
    pub fn iter(&self) -> impl Iterator<Item = &EntityInfo> {
        self.entities.values()
    }

    /// Number of registered entities.
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn artist() -> EntityInfo {
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
    }

    #[test]
    fn registry_resolves_by_name() {
        let mut reg = EntityRegistry::new();
        reg.register(artist());

        assert!(reg.get("artist").is_ok());
        assert!(matches!(reg.get("missing"), Err(Error::Config(_))));
    }

    #[test]
    fn pk_helpers() {
        let e = artist();
        assert_eq!(e.pk_columns(), vec!["ARTIST_ID"]);
        assert!(e.ungenerated_pk_columns().is_empty());
    }

    #[test]
    fn dependent_pk_excluded_from_ungenerated() {
        let e = EntityInfo::new("artist_detail", "ARTIST_DETAIL").attribute(
            AttributeInfo::new("id", "ARTIST_ID").primary_key(true),
        );
        assert_eq!(e.ungenerated_pk_columns(), vec!["ARTIST_ID"]);

        let e = e.relationship(
            RelationshipInfo::new("artist", "artist", false)
                .fk_column("ARTIST_ID", "ARTIST_ID")
                .to_dependent_pk(true),
        );
        assert!(e.ungenerated_pk_columns().is_empty());
    }

    #[test]
    fn link_table_marks_flattened_and_independent() {
        let rel = RelationshipInfo::new("exhibits", "gallery", true)
            .link_table(LinkTableInfo::new("ARTIST_EXHIBIT", "ARTIST_ID", "GALLERY_ID"));
        assert!(rel.is_flattened());
        assert!(rel.independent);
    }
}
