//! Change-tracking object store.
//!
//! The store holds every object a session has touched, keyed by identity,
//! together with the committed snapshot each dirty object was loaded from.
//! It records flattened (join-table) arc changes separately from object
//! state, since those never dirty the row of either endpoint.
//!
//! The store is a plain single-threaded structure; the session wraps it in a
//! mutex and owns the store-before-cache lock ordering.

use rowsync_core::entity::{EntityRegistry, RelationshipInfo};
use rowsync_core::error::IntegrityError;
use rowsync_core::{Error, ObjectId, Result, Snapshot, SnapshotEvent, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, trace};

/// Lifecycle state of a registered object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistenceState {
    /// Not registered with any session.
    Transient,
    /// Registered identity with no property data; resolves on first access.
    Hollow,
    /// In sync with the last committed row.
    Committed,
    /// Has uncommitted property changes.
    Modified,
    /// Scheduled for deletion at next commit.
    Deleted,
    /// Created in this session, not yet in the database.
    New,
}

/// One object property: a column-backed scalar or a relationship edge.
///
/// Relationship edges hold object identities, never object references; a
/// `Fault` marks an edge that has not been resolved from the database yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Property {
    Scalar(Value),
    ToOne(Option<ObjectId>),
    ToMany(Vec<ObjectId>),
    Fault,
}

/// A registered persistent object: identity, state, and a property map.
#[derive(Debug, Clone)]
pub struct PersistentObject {
    id: ObjectId,
    state: PersistenceState,
    properties: HashMap<String, Property>,
}

impl PersistentObject {
    pub fn id(&self) -> &ObjectId {
        &self.id
    }

    pub fn state(&self) -> PersistenceState {
        self.state
    }

    pub fn property(&self, name: &str) -> Option<&Property> {
        self.properties.get(name)
    }

    /// Scalar property value, if set and scalar.
    pub fn scalar(&self, name: &str) -> Option<&Value> {
        match self.properties.get(name) {
            Some(Property::Scalar(v)) => Some(v),
            _ => None,
        }
    }

    /// Resolved to-one target, `None` when the edge is a fault or unset.
    pub fn to_one(&self, name: &str) -> Option<&Option<ObjectId>> {
        match self.properties.get(name) {
            Some(Property::ToOne(target)) => Some(target),
            _ => None,
        }
    }

    /// Resolved to-many members, `None` when the edge is a fault.
    pub fn to_many(&self, name: &str) -> Option<&[ObjectId]> {
        match self.properties.get(name) {
            Some(Property::ToMany(ids)) => Some(ids),
            _ => None,
        }
    }
}

/// One pending join-table row change for a flattened relationship.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlattenedArc {
    pub source: ObjectId,
    pub destination: ObjectId,
    /// Relationship name on the source entity.
    pub relationship: String,
}

/// Objects classified for a commit pass, in registration order.
#[derive(Debug, Default)]
pub struct Classification {
    pub inserts: Vec<ObjectId>,
    pub updates: Vec<ObjectId>,
    pub deletes: Vec<ObjectId>,
}

impl Classification {
    pub fn is_empty(&self) -> bool {
        self.inserts.is_empty() && self.updates.is_empty() && self.deletes.is_empty()
    }
}

/// The session's uncommitted object graph.
pub struct ObjectStore {
    registry: Arc<EntityRegistry>,
    objects: HashMap<ObjectId, PersistentObject>,
    /// Registration order, for deterministic classification.
    order: Vec<ObjectId>,
    /// Committed snapshots retained for diffing and lock qualifiers.
    retained: HashMap<ObjectId, Snapshot>,
    flattened_inserts: Vec<FlattenedArc>,
    flattened_deletes: Vec<FlattenedArc>,
    indirectly_modified: HashSet<ObjectId>,
}

impl ObjectStore {
    pub fn new(registry: Arc<EntityRegistry>) -> Self {
        Self {
            registry,
            objects: HashMap::new(),
            order: Vec::new(),
            retained: HashMap::new(),
            flattened_inserts: Vec::new(),
            flattened_deletes: Vec::new(),
            indirectly_modified: HashSet::new(),
        }
    }

    pub fn registry(&self) -> &EntityRegistry {
        &self.registry
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn contains(&self, id: &ObjectId) -> bool {
        self.objects.contains_key(id)
    }

    pub fn get(&self, id: &ObjectId) -> Option<&PersistentObject> {
        self.objects.get(id)
    }

    /// State of a registered object; unknown ids are `Transient`.
    pub fn state_of(&self, id: &ObjectId) -> PersistenceState {
        self.objects
            .get(id)
            .map_or(PersistenceState::Transient, |o| o.state)
    }

    pub fn retained_snapshot(&self, id: &ObjectId) -> Option<&Snapshot> {
        self.retained.get(id)
    }

    pub fn pending_flattened_inserts(&self) -> &[FlattenedArc] {
        &self.flattened_inserts
    }

    pub fn pending_flattened_deletes(&self) -> &[FlattenedArc] {
        &self.flattened_deletes
    }

    pub fn indirectly_modified(&self) -> impl Iterator<Item = &ObjectId> {
        self.indirectly_modified.iter()
    }

    /// Create and register a brand-new object with a temporary identity.
    ///
    /// Scalars start NULL, to-one edges unset, to-many edges empty.
    pub fn register_new(&mut self, entity: &str) -> Result<ObjectId> {
        let info = self.registry.get(entity)?;
        let mut properties = HashMap::new();
        for attr in &info.attributes {
            properties.insert(attr.name.clone(), Property::Scalar(Value::Null));
        }
        for rel in &info.relationships {
            let edge = if rel.to_many {
                Property::ToMany(Vec::new())
            } else {
                Property::ToOne(None)
            };
            properties.insert(rel.name.clone(), edge);
        }

        let id = ObjectId::temporary(entity);
        trace!(id = %id, "registering new object");
        self.insert_object(PersistentObject {
            id: id.clone(),
            state: PersistenceState::New,
            properties,
        });
        Ok(id)
    }

    /// Register a committed object hydrated from a row snapshot.
    pub fn register_committed(&mut self, id: ObjectId, snapshot: &Snapshot) -> Result<()> {
        let properties = self.hydrate_properties(&id, snapshot)?;
        self.retained.insert(id.clone(), snapshot.clone());
        self.insert_object(PersistentObject {
            id,
            state: PersistenceState::Committed,
            properties,
        });
        Ok(())
    }

    /// Register an identity without data; the first access resolves it.
    pub fn register_hollow(&mut self, id: ObjectId) -> Result<()> {
        self.registry.get(id.entity())?;
        self.insert_object(PersistentObject {
            id,
            state: PersistenceState::Hollow,
            properties: HashMap::new(),
        });
        Ok(())
    }

    /// Turn a hollow object into a committed one using a fetched snapshot.
    pub fn resolve_hollow(&mut self, id: &ObjectId, snapshot: &Snapshot) -> Result<()> {
        let properties = self.hydrate_properties(id, snapshot)?;
        let object = self.object_mut(id)?;
        object.state = PersistenceState::Committed;
        object.properties = properties;
        self.retained.insert(id.clone(), snapshot.clone());
        Ok(())
    }

    /// Set a scalar property, marking the object modified.
    pub fn modify_scalar(
        &mut self,
        id: &ObjectId,
        property: &str,
        value: Value,
    ) -> Result<()> {
        let info = self.registry.get(id.entity())?;
        if info.find_attribute(property).is_none() {
            return Err(Error::Config(rowsync_core::ConfigError {
                message: format!("entity '{}' has no attribute '{}'", id.entity(), property),
            }));
        }
        self.mark_modified(id)?;
        let object = self.object_mut(id)?;
        object
            .properties
            .insert(property.to_string(), Property::Scalar(value));
        Ok(())
    }

    /// Point a to-one relationship at a new target (or clear it).
    pub fn set_to_one(
        &mut self,
        id: &ObjectId,
        relationship: &str,
        target: Option<ObjectId>,
    ) -> Result<()> {
        let info = self.registry.get(id.entity())?;
        let rel = require_relationship(info.find_relationship(relationship), id, relationship)?;
        if rel.to_many || rel.is_flattened() {
            return Err(Error::Config(rowsync_core::ConfigError {
                message: format!(
                    "relationship '{}.{}' is not a plain to-one",
                    id.entity(),
                    relationship
                ),
            }));
        }
        self.mark_modified(id)?;
        let object = self.object_mut(id)?;
        object
            .properties
            .insert(relationship.to_string(), Property::ToOne(target));
        Ok(())
    }

    /// Record a join-table row insert for a flattened relationship.
    ///
    /// A pending delete of the same arc cancels out instead; the source is
    /// marked indirectly modified either way, never dirty.
    pub fn add_flattened(
        &mut self,
        source: &ObjectId,
        relationship: &str,
        destination: &ObjectId,
    ) -> Result<()> {
        self.require_flattened(source, relationship)?;
        let arc = FlattenedArc {
            source: source.clone(),
            destination: destination.clone(),
            relationship: relationship.to_string(),
        };
        if let Some(pos) = self.flattened_deletes.iter().position(|a| *a == arc) {
            self.flattened_deletes.remove(pos);
        } else if !self.flattened_inserts.contains(&arc) {
            self.flattened_inserts.push(arc);
        }
        self.indirectly_modified.insert(source.clone());
        self.edge_add(source, relationship, destination);
        Ok(())
    }

    /// Record a join-table row delete for a flattened relationship.
    pub fn remove_flattened(
        &mut self,
        source: &ObjectId,
        relationship: &str,
        destination: &ObjectId,
    ) -> Result<()> {
        self.require_flattened(source, relationship)?;
        let arc = FlattenedArc {
            source: source.clone(),
            destination: destination.clone(),
            relationship: relationship.to_string(),
        };
        if let Some(pos) = self.flattened_inserts.iter().position(|a| *a == arc) {
            self.flattened_inserts.remove(pos);
        } else if !self.flattened_deletes.contains(&arc) {
            self.flattened_deletes.push(arc);
        }
        self.indirectly_modified.insert(source.clone());
        self.edge_remove(source, relationship, destination);
        Ok(())
    }

    /// Install resolved members on a to-many edge without dirtying anything.
    pub fn resolve_to_many(
        &mut self,
        id: &ObjectId,
        relationship: &str,
        members: Vec<ObjectId>,
    ) -> Result<()> {
        let object = self.object_mut(id)?;
        object
            .properties
            .insert(relationship.to_string(), Property::ToMany(members));
        Ok(())
    }

    /// Bookkeeping-only membership update on a non-flattened to-many edge.
    /// Dirtiness comes from the FK holder's to-one side.
    pub fn edge_add(&mut self, id: &ObjectId, relationship: &str, member: &ObjectId) {
        if let Some(object) = self.objects.get_mut(id)
            && let Some(Property::ToMany(ids)) = object.properties.get_mut(relationship)
            && !ids.contains(member)
        {
            ids.push(member.clone());
        }
    }

    /// Bookkeeping-only membership removal on a to-many edge.
    pub fn edge_remove(&mut self, id: &ObjectId, relationship: &str, member: &ObjectId) {
        if let Some(object) = self.objects.get_mut(id)
            && let Some(Property::ToMany(ids)) = object.properties.get_mut(relationship)
        {
            ids.retain(|m| m != member);
        }
    }

    /// Force a state transition. The delete engine uses this for its
    /// tentative pre-recursion flips and deny restores.
    pub(crate) fn set_state(&mut self, id: &ObjectId, state: PersistenceState) -> Result<()> {
        self.object_mut(id)?.state = state;
        Ok(())
    }

    /// Remove all trace of an object, including arcs touching it.
    pub fn unregister(&mut self, id: &ObjectId) {
        self.objects.remove(id);
        self.order.retain(|o| o != id);
        self.retained.remove(id);
        self.flattened_inserts
            .retain(|a| a.source != *id && a.destination != *id);
        self.flattened_deletes
            .retain(|a| a.source != *id && a.destination != *id);
        self.indirectly_modified.remove(id);
    }

    /// Current column values for the object, for diffing and DML building.
    ///
    /// Scalars come from properties, falling back to the retained snapshot.
    /// FK columns come from resolved to-one edges with permanent targets;
    /// edges at temporary targets are omitted (the commit pipeline fills
    /// them in after key generation).
    pub fn current_values(&self, id: &ObjectId) -> Result<BTreeMap<String, Value>> {
        let info = self.registry.get(id.entity())?;
        let object = self.objects.get(id).ok_or_else(|| {
            Error::Integrity(IntegrityError {
                message: format!("object {} is not registered", id),
            })
        })?;
        let retained = self.retained.get(id);

        let mut values = BTreeMap::new();
        for attr in &info.attributes {
            let value = match object.scalar(&attr.name) {
                Some(v) => v.clone(),
                None => retained
                    .and_then(|s| s.get(&attr.column))
                    .cloned()
                    .unwrap_or(Value::Null),
            };
            values.insert(attr.column.clone(), value);
        }
        for rel in &info.relationships {
            if rel.to_many || rel.is_flattened() {
                continue;
            }
            let Some(fk) = &rel.fk_column else { continue };
            match object.to_one(&rel.name) {
                Some(Some(target)) if target.is_temporary() => {}
                Some(Some(target)) => {
                    let pk = rel
                        .target_pk_column
                        .as_deref()
                        .and_then(|col| target.key_value(col))
                        .cloned()
                        .unwrap_or(Value::Null);
                    values.insert(fk.clone(), pk);
                }
                Some(None) => {
                    values.insert(fk.clone(), Value::Null);
                }
                None => {
                    if let Some(v) = retained.and_then(|s| s.get(fk)) {
                        values.insert(fk.clone(), v.clone());
                    }
                }
            }
        }
        Ok(values)
    }

    /// Whether the store holds anything a commit would write.
    ///
    /// Modified objects whose current values match their retained snapshot
    /// (a change that was manually reverted) do not count.
    pub fn has_pending_changes(&self) -> bool {
        if !self.flattened_inserts.is_empty() || !self.flattened_deletes.is_empty() {
            return true;
        }
        self.order.iter().any(|id| match self.state_of(id) {
            PersistenceState::New | PersistenceState::Deleted => true,
            PersistenceState::Modified => self.has_real_diff(id),
            _ => false,
        })
    }

    /// Single classification pass over all registered objects.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn classify_for_commit(&self) -> Classification {
        let mut classification = Classification::default();
        for id in &self.order {
            match self.state_of(id) {
                PersistenceState::New => classification.inserts.push(id.clone()),
                PersistenceState::Modified => {
                    if self.has_real_diff(id) {
                        classification.updates.push(id.clone());
                    }
                }
                PersistenceState::Deleted => classification.deletes.push(id.clone()),
                _ => {}
            }
        }
        debug!(
            inserts = classification.inserts.len(),
            updates = classification.updates.len(),
            deletes = classification.deletes.len(),
            "classified objects for commit"
        );
        classification
    }

    /// Fold a successful commit back into the store.
    ///
    /// Objects are re-keyed from temporary (or replaced) ids to their final
    /// identities, relationship edges are remapped, surviving objects go to
    /// `Committed` with fresh retained snapshots, deleted objects are
    /// dropped, and all flattened/indirect bookkeeping is cleared.
    pub fn commit_finalize(
        &mut self,
        rekeys: &HashMap<ObjectId, ObjectId>,
        snapshots: Vec<(ObjectId, Snapshot)>,
        deleted: &[ObjectId],
    ) {
        for id in deleted {
            self.unregister(id);
        }

        // Re-key identities before touching properties, so edge remapping
        // can find the objects under their final keys.
        for (old, new) in rekeys {
            if let Some(mut object) = self.objects.remove(old) {
                object.id = new.clone();
                self.objects.insert(new.clone(), object);
            }
            for slot in &mut self.order {
                if slot == old {
                    *slot = new.clone();
                }
            }
            if let Some(snapshot) = self.retained.remove(old) {
                self.retained.insert(new.clone(), snapshot);
            }
        }
        if !rekeys.is_empty() {
            for object in self.objects.values_mut() {
                for property in object.properties.values_mut() {
                    match property {
                        Property::ToOne(Some(target)) => {
                            if let Some(new) = rekeys.get(target) {
                                *target = new.clone();
                            }
                        }
                        Property::ToMany(ids) => {
                            for target in ids {
                                if let Some(new) = rekeys.get(target) {
                                    *target = new.clone();
                                }
                            }
                        }
                        _ => {}
                    }
                }
            }
        }

        for (id, snapshot) in snapshots {
            if let Some(object) = self.objects.get_mut(&id) {
                object.state = PersistenceState::Committed;
            }
            self.retained.insert(id, snapshot);
        }
        // Modified objects whose diff turned out empty still settle.
        for object in self.objects.values_mut() {
            if object.state == PersistenceState::Modified {
                object.state = PersistenceState::Committed;
            }
        }

        self.flattened_inserts.clear();
        self.flattened_deletes.clear();
        self.indirectly_modified.clear();
    }

    /// Discard all uncommitted changes.
    ///
    /// New objects are unregistered; modified and deleted objects collapse
    /// to hollow and rehydrate from the cache on next access.
    pub fn rollback(&mut self) {
        let ids: Vec<ObjectId> = self.order.clone();
        for id in ids {
            match self.state_of(&id) {
                PersistenceState::New => self.unregister(&id),
                PersistenceState::Modified | PersistenceState::Deleted => {
                    if let Some(object) = self.objects.get_mut(&id) {
                        object.state = PersistenceState::Hollow;
                        object.properties.clear();
                    }
                    self.retained.remove(&id);
                }
                _ => {}
            }
        }
        self.flattened_inserts.clear();
        self.flattened_deletes.clear();
        self.indirectly_modified.clear();
    }

    /// Merge a peer commit's snapshot event into local state.
    ///
    /// Clean objects follow the event wholesale. Modified objects are
    /// force-merged property by property: anything still equal to the old
    /// baseline takes the peer's value, diverged local edits win. Deleted
    /// local objects keep their pending delete. Invalidated objects
    /// collapse to hollow.
    pub fn merge_external(&mut self, event: &SnapshotEvent) {
        for (id, snapshot) in &event.updated {
            match self.state_of(id) {
                PersistenceState::Committed | PersistenceState::Hollow => {
                    if let Ok(properties) = self.hydrate_properties(id, snapshot)
                        && let Some(object) = self.objects.get_mut(id)
                    {
                        object.state = PersistenceState::Committed;
                        object.properties = properties;
                        self.retained.insert(id.clone(), snapshot.clone());
                    }
                }
                PersistenceState::Modified => {
                    self.force_merge(id, snapshot);
                    self.retained.insert(id.clone(), snapshot.clone());
                }
                _ => {}
            }
        }
        for id in &event.deleted {
            match self.state_of(id) {
                PersistenceState::Committed | PersistenceState::Hollow => self.unregister(id),
                _ => {}
            }
        }
        for id in &event.invalidated {
            if self.state_of(id) == PersistenceState::Committed {
                if let Some(object) = self.objects.get_mut(id) {
                    object.state = PersistenceState::Hollow;
                    object.properties.clear();
                }
                self.retained.remove(id);
            }
        }
    }

    /// Layer a modified object's local edits over a fresher peer snapshot.
    ///
    /// Every property still equal to the old retained baseline is safe to
    /// overwrite with the peer's value; a property the session already
    /// changed keeps the local value. Without this, an untouched column
    /// would be written back from stale memory at the next commit,
    /// reverting the peer's change.
    fn force_merge(&mut self, id: &ObjectId, snapshot: &Snapshot) {
        let Some(prev) = self.retained.get(id) else {
            return;
        };
        let (Ok(fresh), Ok(baseline)) = (
            self.hydrate_properties(id, snapshot),
            self.hydrate_properties(id, prev),
        ) else {
            return;
        };
        let Some(object) = self.objects.get_mut(id) else {
            return;
        };
        for (name, fresh_prop) in fresh {
            match (object.properties.get(&name), baseline.get(&name)) {
                (Some(current), Some(base)) if current == base => {
                    object.properties.insert(name, fresh_prop);
                }
                (None, _) => {
                    object.properties.insert(name, fresh_prop);
                }
                _ => {}
            }
        }
    }

    fn has_real_diff(&self, id: &ObjectId) -> bool {
        let Some(retained) = self.retained.get(id) else {
            return true;
        };
        // An edge re-pointed at a not-yet-keyed object has no FK value to
        // diff against until key generation, but it is a real change.
        if let Some(object) = self.objects.get(id)
            && object
                .properties
                .values()
                .any(|p| matches!(p, Property::ToOne(Some(target)) if target.is_temporary()))
        {
            return true;
        }
        let Ok(current) = self.current_values(id) else {
            return true;
        };
        let candidate = Snapshot::new(current);
        retained.diff(&candidate).is_some()
    }

    fn mark_modified(&mut self, id: &ObjectId) -> Result<()> {
        let object = self.object_mut(id)?;
        match object.state {
            PersistenceState::Committed => {
                object.state = PersistenceState::Modified;
                Ok(())
            }
            PersistenceState::New | PersistenceState::Modified => Ok(()),
            PersistenceState::Hollow => Err(Error::Integrity(IntegrityError {
                message: format!("object {} is hollow; resolve it before writing", id),
            })),
            PersistenceState::Deleted => Err(Error::Integrity(IntegrityError {
                message: format!("object {} is scheduled for deletion", id),
            })),
            PersistenceState::Transient => Err(Error::Integrity(IntegrityError {
                message: format!("object {} is not registered", id),
            })),
        }
    }

    fn require_flattened(&self, id: &ObjectId, relationship: &str) -> Result<()> {
        let info = self.registry.get(id.entity())?;
        let rel = require_relationship(info.find_relationship(relationship), id, relationship)?;
        if !rel.is_flattened() {
            return Err(Error::Config(rowsync_core::ConfigError {
                message: format!(
                    "relationship '{}.{}' is not flattened",
                    id.entity(),
                    relationship
                ),
            }));
        }
        Ok(())
    }

    fn hydrate_properties(
        &self,
        id: &ObjectId,
        snapshot: &Snapshot,
    ) -> Result<HashMap<String, Property>> {
        let info = self.registry.get(id.entity())?;
        let mut properties = HashMap::new();
        for attr in &info.attributes {
            let value = snapshot.get(&attr.column).cloned().unwrap_or(Value::Null);
            properties.insert(attr.name.clone(), Property::Scalar(value));
        }
        for rel in &info.relationships {
            let edge = if rel.to_many || rel.is_flattened() {
                Property::Fault
            } else if let (Some(fk), Some(pk)) = (&rel.fk_column, &rel.target_pk_column) {
                match snapshot.get(fk) {
                    Some(Value::Null) | None => Property::ToOne(None),
                    Some(value) => Property::ToOne(Some(ObjectId::single(
                        rel.target.clone(),
                        pk.clone(),
                        value.clone(),
                    ))),
                }
            } else {
                Property::Fault
            };
            properties.insert(rel.name.clone(), edge);
        }
        Ok(properties)
    }

    fn insert_object(&mut self, object: PersistentObject) {
        let id = object.id.clone();
        if self.objects.insert(id.clone(), object).is_none() {
            self.order.push(id);
        }
    }

    fn object_mut(&mut self, id: &ObjectId) -> Result<&mut PersistentObject> {
        self.objects.get_mut(id).ok_or_else(|| {
            Error::Integrity(IntegrityError {
                message: format!("object {} is not registered", id),
            })
        })
    }
}

fn require_relationship<'a>(
    rel: Option<&'a RelationshipInfo>,
    id: &ObjectId,
    name: &str,
) -> Result<&'a RelationshipInfo> {
    rel.ok_or_else(|| {
        Error::Config(rowsync_core::ConfigError {
            message: format!("entity '{}' has no relationship '{}'", id.entity(), name),
        })
    })
}
