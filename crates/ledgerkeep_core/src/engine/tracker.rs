//! Snapshot-based change tracking for one session.
//!
//! # Responsibility
//! - Remember the persisted state of every loaded entity.
//! - Classify entities as added, modified, deleted or unchanged.
//! - Hold pending deletions, removal markers and concurrency tokens until
//!   the next successful commit.
//!
//! # Invariants
//! - Pending deletions are ordered children first.
//! - Only persisted entities (those with a snapshot) are ever scheduled
//!   for deletion.

use crate::engine::graph::{edge_is_loaded, owned_children, walk_tree, ParentLink};
use crate::engine::{EngineError, EngineResult};
use crate::model::entity::{Entity, EntityDescriptor, EntityId, EntityKey, ModelError};
use crate::model::value::FieldValue;
use std::collections::{BTreeMap, HashMap, HashSet};

/// Storage state of one entity relative to its snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    Added,
    Modified,
    Deleted,
    Unchanged,
}

/// Persisted state of one entity as of the last load or commit.
#[derive(Debug, Clone)]
pub(crate) struct Snapshot {
    pub descriptor: &'static EntityDescriptor,
    pub version: i64,
    pub is_soft_deleted: bool,
    pub fields: BTreeMap<&'static str, FieldValue>,
    pub parent: Option<ParentLink>,
    pub root: EntityKey,
    pub depth: usize,
}

#[derive(Debug, Clone, Default)]
pub struct ChangeTracker {
    snapshots: HashMap<EntityKey, Snapshot>,
    deleted: Vec<EntityKey>,
    deleted_set: HashSet<EntityKey>,
    removed_children: HashSet<EntityKey>,
    expected_versions: HashMap<EntityKey, i64>,
}

impl ChangeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshots every loaded entity of an aggregate as persisted state.
    pub fn track_loaded(&mut self, root: &dyn Entity) -> EngineResult<()> {
        let mut captured = Vec::new();
        walk_tree(root, &mut |entity, placement| {
            captured.push((
                entity.key(),
                Snapshot {
                    descriptor: entity.descriptor(),
                    version: entity.version(),
                    is_soft_deleted: entity.is_soft_deleted(),
                    fields: capture_fields(entity)?,
                    parent: placement.parent,
                    root: placement.root,
                    depth: placement.depth,
                },
            ));
            Ok(())
        })?;
        self.snapshots.extend(captured);
        Ok(())
    }

    pub fn is_tracked(&self, key: &EntityKey) -> bool {
        self.snapshots.contains_key(key)
    }

    /// Tracked key carrying `id`, whatever its entity type.
    pub fn tracked_key_for_id(&self, id: EntityId) -> Option<EntityKey> {
        self.snapshots.keys().find(|key| key.id == id).copied()
    }

    /// Every tracked key, in no particular order.
    pub(crate) fn tracked_keys(&self) -> impl Iterator<Item = &EntityKey> {
        self.snapshots.keys()
    }

    /// Version persisted for `key` as of the last load or commit.
    pub fn persisted_version(&self, key: &EntityKey) -> Option<i64> {
        self.snapshots.get(key).map(|snapshot| snapshot.version)
    }

    pub fn entry_state(&self, entity: &dyn Entity) -> EngineResult<EntryState> {
        let key = entity.key();
        if self.deleted_set.contains(&key) {
            return Ok(EntryState::Deleted);
        }
        let Some(snapshot) = self.snapshots.get(&key) else {
            return Ok(EntryState::Added);
        };

        if snapshot.version != entity.version()
            || snapshot.is_soft_deleted != entity.is_soft_deleted()
        {
            return Ok(EntryState::Modified);
        }

        for field in entity.descriptor().fields {
            let current = read_field(entity, field.name)?;
            if snapshot.fields.get(field.name) != Some(&current) {
                return Ok(EntryState::Modified);
            }
        }

        Ok(EntryState::Unchanged)
    }

    /// `true` when `key` is scheduled for deletion by the next commit.
    pub fn is_deleted(&self, key: &EntityKey) -> bool {
        self.deleted_set.contains(key)
    }

    /// `true` when an owned child was detached from `key` since the last
    /// commit.
    pub fn has_removed_children(&self, key: &EntityKey) -> bool {
        self.removed_children.contains(key)
    }

    /// Schedules the persisted part of a detached subtree for deletion.
    ///
    /// `parent` is the owner the subtree was detached from, if any. Fails
    /// without side effects when a persisted entity in the subtree has an
    /// owned navigation that was never loaded.
    pub fn schedule_delete(
        &mut self,
        subtree: &dyn Entity,
        parent: Option<EntityKey>,
    ) -> EngineResult<()> {
        let mut pending = Vec::new();
        let mut visited = HashSet::new();
        self.collect_deletions(subtree, &mut visited, &mut pending)?;

        let detached_persisted = self.snapshots.contains_key(&subtree.key());
        for key in pending {
            if self.deleted_set.insert(key) {
                self.deleted.push(key);
            }
        }
        if let (true, Some(parent)) = (detached_persisted, parent) {
            self.removed_children.insert(parent);
        }
        Ok(())
    }

    fn collect_deletions(
        &self,
        entity: &dyn Entity,
        visited: &mut HashSet<EntityKey>,
        pending: &mut Vec<EntityKey>,
    ) -> EngineResult<()> {
        let key = entity.key();
        if !visited.insert(key) {
            return Ok(());
        }
        let persisted = self.snapshots.contains_key(&key);
        if persisted {
            for edge in entity.descriptor().owned {
                if !edge_is_loaded(entity, edge)? {
                    return Err(EngineError::NavigationNotLoaded {
                        entity_type: key.entity_type,
                        entity_id: key.id,
                        navigation: edge.name,
                    });
                }
            }
        }
        for (_, child) in owned_children(entity)? {
            self.collect_deletions(child, visited, pending)?;
        }
        if persisted {
            pending.push(key);
        }
        Ok(())
    }

    /// Schedules deletion of persisted entities that no longer appear in
    /// any live aggregate because they were detached by direct mutation.
    ///
    /// An entity is only considered detached when the navigation it was
    /// detached from is still loaded on its nearest live ancestor.
    pub(crate) fn detect_detached(&mut self, roots: &[&dyn Entity]) -> EngineResult<()> {
        let mut live: HashMap<EntityKey, &dyn Entity> = HashMap::new();
        for root in roots {
            walk_tree(*root, &mut |entity, _| {
                live.insert(entity.key(), entity);
                Ok(())
            })?;
        }

        let mut detached: Vec<(usize, EntityKey, EntityKey)> = Vec::new();
        for (key, snapshot) in &self.snapshots {
            if live.contains_key(key) || self.deleted_set.contains(key) {
                continue;
            }
            if !live.contains_key(&snapshot.root) {
                continue;
            }

            // Climb to the nearest live ancestor and check the edge the
            // chain hangs from.
            let mut link = snapshot.parent;
            let mut attached_from = None;
            while let Some(current) = link {
                if let Some(owner) = live.get(&current.key) {
                    attached_from = Some((current.key, *owner, current.edge));
                    break;
                }
                link = self
                    .snapshots
                    .get(&current.key)
                    .and_then(|ancestor| ancestor.parent);
            }
            let Some((owner_key, owner, edge_name)) = attached_from else {
                continue;
            };
            let Some(edge) = owner.descriptor().edge(edge_name) else {
                return Err(ModelError::UnknownNavigation {
                    entity_type: owner_key.entity_type,
                    navigation: edge_name.to_string(),
                }
                .into());
            };
            if edge_is_loaded(owner, edge)? {
                detached.push((snapshot.depth, *key, owner_key));
            }
        }

        // Deepest first keeps children ahead of their parents.
        detached.sort_by(|left, right| right.0.cmp(&left.0).then(left.1.cmp(&right.1)));
        for (_, key, owner_key) in detached {
            if self.deleted_set.insert(key) {
                self.deleted.push(key);
            }
            self.removed_children.insert(owner_key);
        }
        Ok(())
    }

    /// Uses `version` instead of the persisted one as the concurrency
    /// token for `key`.
    pub fn expect_version(&mut self, key: EntityKey, version: i64) {
        self.expected_versions.insert(key, version);
    }

    /// Concurrency token checked when writing `key`.
    pub fn expected_version(&self, key: &EntityKey) -> Option<i64> {
        self.expected_versions
            .get(key)
            .copied()
            .or_else(|| self.persisted_version(key))
    }

    pub(crate) fn snapshot(&self, key: &EntityKey) -> Option<&Snapshot> {
        self.snapshots.get(key)
    }

    /// Pending deletions, children first.
    pub(crate) fn deleted(&self) -> &[EntityKey] {
        &self.deleted
    }

    pub fn has_pending_deletions(&self) -> bool {
        !self.deleted.is_empty()
    }

    /// Makes the current state of `roots` the new persisted state.
    pub(crate) fn accept(&mut self, roots: &[&dyn Entity]) -> EngineResult<()> {
        self.snapshots.clear();
        self.deleted.clear();
        self.deleted_set.clear();
        self.removed_children.clear();
        self.expected_versions.clear();
        for root in roots {
            self.track_loaded(*root)?;
        }
        Ok(())
    }
}

/// Current values of every declared scalar field.
pub(crate) fn capture_fields(
    entity: &dyn Entity,
) -> EngineResult<BTreeMap<&'static str, FieldValue>> {
    let mut fields = BTreeMap::new();
    for field in entity.descriptor().fields {
        fields.insert(field.name, read_field(entity, field.name)?);
    }
    Ok(fields)
}

pub(crate) fn read_field(entity: &dyn Entity, name: &str) -> EngineResult<FieldValue> {
    entity.field(name).ok_or_else(|| {
        ModelError::UnknownField {
            entity_type: entity.descriptor().type_name,
            field: name.to_string(),
        }
        .into()
    })
}
