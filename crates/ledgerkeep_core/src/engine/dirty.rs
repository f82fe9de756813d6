//! Recursive dirty check across an ownership tree.

use crate::engine::graph::owned_children;
use crate::engine::tracker::{ChangeTracker, EntryState};
use crate::engine::EngineResult;
use crate::model::entity::{Entity, EntityKey};
use std::collections::HashSet;

/// Returns `true` when `entity`, or any currently loaded owned descendant,
/// is added, modified or deleted, or lost an owned child since the last
/// commit.
///
/// Unloaded navigations are skipped. Keys already in `visited` count as
/// unchanged.
pub fn is_changed_recursive(
    tracker: &ChangeTracker,
    entity: &dyn Entity,
    visited: &mut HashSet<EntityKey>,
) -> EngineResult<bool> {
    let key = entity.key();
    if !visited.insert(key) {
        return Ok(false);
    }

    if tracker.entry_state(entity)? != EntryState::Unchanged || tracker.has_removed_children(&key)
    {
        return Ok(true);
    }

    for (_, child) in owned_children(entity)? {
        if is_changed_recursive(tracker, child, visited)? {
            return Ok(true);
        }
    }

    Ok(false)
}
