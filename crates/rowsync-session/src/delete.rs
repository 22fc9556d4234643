//! Delete-rule processing.
//!
//! Deleting an object walks its relationships and applies each one's delete
//! rule: deny aborts the whole operation, nullify clears reverse pointers on
//! related objects, cascade recurses. Flattened relationships always get
//! their join rows scheduled for deletion, whatever the rule says.
//!
//! Cycle safety: the object's state flips to `Deleted` *before* recursion,
//! so mutually cascading entities terminate. A deny failure restores the
//! pre-delete state of the object it fired on.

use crate::object_store::{ObjectStore, PersistenceState, Property};
use rowsync_core::entity::{DeleteRule, RelationshipInfo};
use rowsync_core::error::DeleteDenyError;
use rowsync_core::{Error, ObjectId, Result, Snapshot};
use tracing::{debug, trace};

/// Resolves faults encountered while walking delete rules.
///
/// The session backs this with the snapshot cache; tests use canned maps.
pub trait FaultResolver {
    /// Current row for an id, `None` when the row no longer exists.
    fn resolve(&self, id: &ObjectId) -> Result<Option<Snapshot>>;

    /// Identities related to `source` through a to-many relationship.
    fn fetch_related(
        &self,
        source: &ObjectId,
        relationship: &RelationshipInfo,
    ) -> Result<Vec<ObjectId>>;
}

/// Schedule an object for deletion, applying delete rules transitively.
///
/// Idempotent: deleting an already-deleted or unregistered object is a
/// no-op. Objects that were `New` are simply unregistered; they have no row
/// to remove.
#[tracing::instrument(level = "debug", skip(store, resolver), fields(id = %id))]
pub fn delete_object(
    store: &mut ObjectStore,
    resolver: &dyn FaultResolver,
    id: &ObjectId,
) -> Result<()> {
    match store.state_of(id) {
        PersistenceState::Deleted | PersistenceState::Transient => return Ok(()),
        PersistenceState::Hollow => match resolver.resolve(id)? {
            Some(snapshot) => store.resolve_hollow(id, &snapshot)?,
            None => {
                // Row already gone; nothing to delete.
                store.unregister(id);
                return Ok(());
            }
        },
        _ => {}
    }

    let old_state = store.state_of(id);
    let was_new = old_state == PersistenceState::New;

    // Tentative flip before recursion keeps cascade cycles finite.
    store.set_state(id, PersistenceState::Deleted)?;

    let info = store.registry().get(id.entity())?.clone();
    for rel in &info.relationships {
        let related = related_ids(store, resolver, id, rel)?;

        if rel.is_flattened() {
            // Join rows go regardless of the delete rule.
            for destination in &related {
                store.remove_flattened(id, &rel.name, destination)?;
            }
            continue;
        }

        match rel.delete_rule {
            DeleteRule::NoAction => {}
            DeleteRule::Deny => {
                let live: Vec<&ObjectId> = related
                    .iter()
                    .filter(|d| store.state_of(d) != PersistenceState::Deleted)
                    .collect();
                if !live.is_empty() {
                    store.set_state(id, old_state)?;
                    return Err(Error::DeleteDeny(DeleteDenyError {
                        object: id.clone(),
                        relationship: rel.name.clone(),
                        message: format!(
                            "cannot delete {}: {} related object(s) via '{}'",
                            id,
                            live.len(),
                            rel.name
                        ),
                    }));
                }
            }
            DeleteRule::Nullify => {
                for destination in &related {
                    nullify_reverse(store, resolver, id, rel, destination)?;
                }
            }
            DeleteRule::Cascade => {
                trace!(relationship = %rel.name, count = related.len(), "cascading delete");
                for destination in &related {
                    // Destinations known only by id enter hollow and get
                    // resolved by the recursive call.
                    if !store.contains(destination) {
                        store.register_hollow(destination.clone())?;
                    }
                    delete_object(store, resolver, destination)?;
                }
            }
        }
    }

    if was_new {
        debug!(id = %id, "unregistering never-committed object");
        store.unregister(id);
    }
    Ok(())
}

/// Resolve the destinations of one relationship, faulting as needed.
fn related_ids(
    store: &mut ObjectStore,
    resolver: &dyn FaultResolver,
    id: &ObjectId,
    rel: &RelationshipInfo,
) -> Result<Vec<ObjectId>> {
    let Some(object) = store.get(id) else {
        return Ok(Vec::new());
    };
    match object.property(&rel.name) {
        Some(Property::ToMany(ids)) => Ok(ids.clone()),
        Some(Property::ToOne(Some(target))) => Ok(vec![target.clone()]),
        Some(Property::ToOne(None)) => Ok(Vec::new()),
        Some(Property::Fault) if rel.to_many => {
            let members = resolver.fetch_related(id, rel)?;
            store.resolve_to_many(id, &rel.name, members.clone())?;
            Ok(members)
        }
        _ => Ok(Vec::new()),
    }
}

/// Clear the reverse pointer on one related object.
fn nullify_reverse(
    store: &mut ObjectStore,
    resolver: &dyn FaultResolver,
    id: &ObjectId,
    rel: &RelationshipInfo,
    destination: &ObjectId,
) -> Result<()> {
    let Some(reverse_name) = rel.reverse.clone() else {
        return Ok(());
    };
    let target_info = store.registry().get(destination.entity())?.clone();
    let Some(reverse) = target_info.find_relationship(&reverse_name) else {
        return Ok(());
    };

    if reverse.to_many {
        store.edge_remove(destination, &reverse_name, id);
        return Ok(());
    }

    // The FK lives on the destination: it must be registered and resolved
    // before its to-one edge can be cleared.
    match store.state_of(destination) {
        PersistenceState::Transient => match resolver.resolve(destination)? {
            Some(snapshot) => store.register_committed(destination.clone(), &snapshot)?,
            None => return Ok(()),
        },
        PersistenceState::Hollow => match resolver.resolve(destination)? {
            Some(snapshot) => store.resolve_hollow(destination, &snapshot)?,
            None => return Ok(()),
        },
        PersistenceState::Deleted => return Ok(()),
        _ => {}
    }
    store.set_to_one(destination, &reverse_name, None)
}
