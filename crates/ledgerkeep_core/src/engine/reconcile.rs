//! Graph reconciler: merges a detached payload into a tracked aggregate.
//!
//! # Responsibility
//! - Copy changed scalar fields onto the tracked graph.
//! - Match owned members by key, inserting new ones and scheduling
//!   removed ones for deletion.
//! - Report what changed, inserted and removed.
//!
//! # Invariants
//! - `Id` is never copied and the soft-delete marker is never merged.
//! - Non-owned navigations are never read or written.
//! - Every tracked entity key is processed at most once per merge.

use crate::engine::graph::{prepare_new_subtree, unknown_navigation};
use crate::engine::tracker::{read_field, ChangeTracker};
use crate::engine::{EngineError, EngineResult};
use crate::model::entity::{EdgeShape, Entity, EntityKey, OwnedEdge};
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

/// Outcome of one merge.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeReport {
    pub changed: bool,
    /// Keys of entities attached from the payload, parents first.
    pub inserted: Vec<EntityKey>,
    /// Keys of tracked entities detached from the aggregate. Nested
    /// members of a removed subtree are not listed separately.
    pub removed: Vec<EntityKey>,
}

impl MergeReport {
    fn absorb(&mut self, changed: bool) {
        self.changed |= changed;
    }
}

/// Merges `incoming` into `tracked`.
///
/// `visited` holds the tracked keys already processed; an entity whose key
/// is present is skipped, which bounds the work on cyclic key graphs.
///
/// On error `tracked` and `tracker` may hold part of the merge.
/// `Session::merge` runs this on copies and keeps them only on success.
pub fn merge(
    tracker: &mut ChangeTracker,
    tracked: &mut dyn Entity,
    incoming: &dyn Entity,
    visited: &mut HashSet<EntityKey>,
) -> EngineResult<MergeReport> {
    let mut report = MergeReport::default();
    merge_entity(tracker, tracked, incoming, visited, &mut report)?;
    Ok(report)
}

fn merge_entity(
    tracker: &mut ChangeTracker,
    tracked: &mut dyn Entity,
    incoming: &dyn Entity,
    visited: &mut HashSet<EntityKey>,
    report: &mut MergeReport,
) -> EngineResult<()> {
    let descriptor = tracked.descriptor();
    let incoming_type = incoming.descriptor().type_name;
    if incoming_type != descriptor.type_name {
        return Err(EngineError::Invariant(format!(
            "cannot merge `{incoming_type}` into `{}`",
            descriptor.type_name
        )));
    }

    let key = tracked.key();
    if !visited.insert(key) {
        return Ok(());
    }

    let incoming_id = incoming.id();
    if !incoming_id.is_nil() && incoming_id != key.id {
        return Err(EngineError::Invariant(format!(
            "payload key {incoming_id} does not match tracked {key}"
        )));
    }

    let client_version = incoming.version();
    if client_version != 0 && tracker.persisted_version(&key) != Some(client_version) {
        tracker.expect_version(key, client_version);
    }

    for field in descriptor.fields {
        let next = read_field(incoming, field.name)?;
        if read_field(tracked, field.name)? != next {
            tracked.set_field(field.name, next)?;
            report.absorb(true);
        }
    }

    for edge in descriptor.owned {
        match edge.shape {
            EdgeShape::Reference => {
                merge_reference(tracker, tracked, incoming, edge, visited, report)?
            }
            EdgeShape::Collection => {
                merge_collection(tracker, tracked, incoming, edge, visited, report)?
            }
        }
    }

    Ok(())
}

fn merge_reference(
    tracker: &mut ChangeTracker,
    tracked: &mut dyn Entity,
    incoming: &dyn Entity,
    edge: &'static OwnedEdge,
    visited: &mut HashSet<EntityKey>,
    report: &mut MergeReport,
) -> EngineResult<()> {
    let owner = tracked.key();
    let descriptor = tracked.descriptor();
    let nav = tracked
        .reference_mut(edge.name)
        .ok_or_else(|| unknown_navigation(descriptor, edge.name))?;
    if !nav.is_loaded() {
        return Err(not_loaded(owner, edge));
    }

    let incoming_nav = incoming
        .reference(edge.name)
        .ok_or_else(|| unknown_navigation(descriptor, edge.name))?;
    if !incoming_nav.is_loaded() {
        return Ok(());
    }

    let current_id = nav.entity().map(|current| current.id());
    match (current_id, incoming_nav.entity()) {
        (None, None) => Ok(()),
        (Some(current_id), Some(next)) if next.id().is_nil() || next.id() == current_id => {
            let Some(current) = nav.entity_mut() else {
                return Ok(());
            };
            merge_entity(tracker, current, next, visited, report)
        }
        (_, next) => {
            let replacement = match next {
                Some(next) => Some(attach_new(tracker, next, report)?),
                None => None,
            };
            if let Some(previous) = nav.replace_entity(replacement)? {
                tracker.schedule_delete(&*previous, Some(owner))?;
                report.removed.push(previous.key());
            }
            report.absorb(true);
            Ok(())
        }
    }
}

fn merge_collection(
    tracker: &mut ChangeTracker,
    tracked: &mut dyn Entity,
    incoming: &dyn Entity,
    edge: &'static OwnedEdge,
    visited: &mut HashSet<EntityKey>,
    report: &mut MergeReport,
) -> EngineResult<()> {
    let owner = tracked.key();
    let descriptor = tracked.descriptor();
    let nav = tracked
        .collection_mut(edge.name)
        .ok_or_else(|| unknown_navigation(descriptor, edge.name))?;
    if !nav.is_loaded() {
        return Err(not_loaded(owner, edge));
    }

    let incoming_nav = incoming
        .collection(edge.name)
        .ok_or_else(|| unknown_navigation(descriptor, edge.name))?;
    if !incoming_nav.is_loaded() {
        return Ok(());
    }

    let mut incoming_positions: HashMap<Uuid, usize> = HashMap::new();
    for index in 0..incoming_nav.len() {
        let Some(member) = incoming_nav.entity_at(index) else {
            continue;
        };
        let id = member.id();
        if id.is_nil() {
            continue;
        }
        if incoming_positions.insert(id, index).is_some() {
            return Err(EngineError::Invariant(format!(
                "payload collection `{}.{}` lists member {id} twice",
                descriptor.type_name, edge.name
            )));
        }
    }

    // Tracked members missing from the payload, highest index first so
    // earlier indexes stay valid while removing.
    let mut stale: Vec<usize> = (0..nav.len())
        .filter(|index| {
            nav.entity_at(*index)
                .map_or(false, |member| !incoming_positions.contains_key(&member.id()))
        })
        .collect();
    stale.reverse();
    for index in stale {
        if let Some(removed) = nav.remove_entity(index) {
            tracker.schedule_delete(&*removed, Some(owner))?;
            report.removed.push(removed.key());
            report.absorb(true);
        }
    }

    for index in 0..incoming_nav.len() {
        let Some(next) = incoming_nav.entity_at(index) else {
            continue;
        };
        let matched = if next.id().is_nil() {
            None
        } else {
            nav.position_of(next.id())
        };
        match matched {
            Some(position) => {
                if let Some(current) = nav.entity_at_mut(position) {
                    merge_entity(tracker, current, next, visited, report)?;
                }
            }
            None => {
                let member = attach_new(tracker, next, report)?;
                nav.push_entity(member)?;
                report.absorb(true);
            }
        }
    }

    Ok(())
}

/// Clones a payload subtree for insertion.
fn attach_new(
    tracker: &ChangeTracker,
    incoming: &dyn Entity,
    report: &mut MergeReport,
) -> EngineResult<Box<dyn Entity>> {
    let mut entity = incoming.clone_entity();
    let keys = prepare_new_subtree(&mut *entity)?;
    for key in &keys {
        let existing = tracker.tracked_key_for_id(key.id).or_else(|| {
            report
                .inserted
                .iter()
                .find(|inserted| inserted.id == key.id)
                .copied()
        });
        match existing {
            Some(existing) if existing == *key => {
                return Err(EngineError::Invariant(format!(
                    "payload member {key} is already part of a tracked aggregate"
                )));
            }
            Some(existing) => {
                return Err(EngineError::Invariant(format!(
                    "payload member {key} reuses the id of {existing}"
                )));
            }
            None => {}
        }
    }
    report.inserted.extend(keys);
    Ok(entity)
}

fn not_loaded(owner: EntityKey, edge: &OwnedEdge) -> EngineError {
    EngineError::NavigationNotLoaded {
        entity_type: owner.entity_type,
        entity_id: owner.id,
        navigation: edge.name,
    }
}
