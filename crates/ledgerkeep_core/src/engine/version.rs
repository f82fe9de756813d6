//! Version updater.
//!
//! Every entity that is changed-recursive gets `persisted + 1`, exactly
//! once per commit. New entities start from 0 and therefore get 1.

use crate::engine::dirty::is_changed_recursive;
use crate::engine::graph::{visit_mut, walk_tree};
use crate::engine::tracker::ChangeTracker;
use crate::engine::EngineResult;
use crate::model::entity::{Entity, EntityKey};
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionBump {
    pub key: EntityKey,
    /// In-memory version before the bump.
    pub previous: i64,
    pub next: i64,
}

/// Decides the bumps for one aggregate without mutating it.
pub fn plan_version_bumps(
    tracker: &ChangeTracker,
    root: &dyn Entity,
) -> EngineResult<Vec<VersionBump>> {
    let mut bumps = Vec::new();
    walk_tree(root, &mut |entity, _| {
        let mut visited = HashSet::new();
        if is_changed_recursive(tracker, entity, &mut visited)? {
            let key = entity.key();
            bumps.push(VersionBump {
                key,
                previous: entity.version(),
                next: tracker.persisted_version(&key).unwrap_or(0) + 1,
            });
        }
        Ok(())
    })?;
    Ok(bumps)
}

pub fn apply_version_bumps(root: &mut dyn Entity, bumps: &[VersionBump]) -> EngineResult<()> {
    let targets: HashMap<EntityKey, i64> =
        bumps.iter().map(|bump| (bump.key, bump.next)).collect();
    set_versions(root, &targets)
}

/// Restores the versions seen before `apply_version_bumps`.
pub fn revert_version_bumps(root: &mut dyn Entity, bumps: &[VersionBump]) -> EngineResult<()> {
    let targets: HashMap<EntityKey, i64> =
        bumps.iter().map(|bump| (bump.key, bump.previous)).collect();
    set_versions(root, &targets)
}

fn set_versions(root: &mut dyn Entity, targets: &HashMap<EntityKey, i64>) -> EngineResult<()> {
    if targets.is_empty() {
        return Ok(());
    }
    visit_mut(root, &mut |entity| {
        if let Some(version) = targets.get(&entity.key()) {
            entity.meta_mut().version = *version;
        }
        Ok(())
    })
}
