//! Unit-of-work session over one SQLite connection.
//!
//! # Responsibility
//! - Load aggregates with their owned navigations and track them.
//! - Accept new aggregates, merges, soft deletes and hard deletes.
//! - Run the orchestrated commit: version bumps, audit records, cascade
//!   cleanup and entity writes in one `BEGIN IMMEDIATE` transaction.
//!
//! # Invariants
//! - One live instance per aggregate key (identity map).
//! - A failed commit leaves SQLite untouched and restores in-memory
//!   versions; pending changes stay pending.
//! - One timestamp is used for every audit record of a commit.

use crate::engine::audit::record_changes;
use crate::engine::cascade::{execute_cleanup, plan_cleanup};
use crate::engine::context::{Clock, RequestContext, SystemClock};
use crate::engine::dirty::is_changed_recursive;
use crate::engine::graph::{assign_missing_ids, prepare_new_subtree, walk_tree, ParentLink};
use crate::engine::reconcile::{self, MergeReport};
use crate::engine::tracker::{capture_fields, ChangeTracker, EntryState};
use crate::engine::version::{
    apply_version_bumps, plan_version_bumps, revert_version_bumps, VersionBump,
};
use crate::engine::{ConcurrencyConflict, EngineError, EngineResult};
use crate::model::entity::{
    downcast_entity_mut, downcast_entity_ref, Entity, EntityDescriptor, EntityId, EntityKey,
};
use crate::model::value::FieldValue;
use crate::repo::audit_repo::insert_entries;
use crate::repo::entity_repo::{
    delete_row, insert_row, update_row, LoadPlan, RowWrite, SqliteEntityStore, WriteOutcome,
};
use log::{debug, error, info, warn};
use rusqlite::{Connection, Transaction, TransactionBehavior};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt::{Debug, Formatter};
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Instant;

/// Typed reference to one live aggregate of a session.
pub struct AggregateHandle<T> {
    index: usize,
    key: EntityKey,
    _marker: PhantomData<fn() -> T>,
}

impl<T> AggregateHandle<T> {
    fn new(index: usize, key: EntityKey) -> Self {
        Self {
            index,
            key,
            _marker: PhantomData,
        }
    }

    pub fn id(&self) -> EntityId {
        self.key.id
    }

    pub fn key(&self) -> EntityKey {
        self.key
    }
}

impl<T> Clone for AggregateHandle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for AggregateHandle<T> {}

impl<T> Debug for AggregateHandle<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AggregateHandle")
            .field("index", &self.index)
            .field("key", &self.key)
            .finish()
    }
}

/// Counts reported by a successful commit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommitSummary {
    pub inserted: usize,
    pub updated: usize,
    pub deleted: usize,
    pub audit_records: usize,
    pub cleaned_access_links: usize,
    pub cleaned_audit_records: usize,
    /// Commit timestamp; `None` when there was nothing to write.
    pub timestamp_ms: Option<i64>,
}

impl CommitSummary {
    pub fn is_empty(&self) -> bool {
        self.timestamp_ms.is_none()
    }
}

struct PendingWrite {
    key: EntityKey,
    root_id: EntityId,
    parent: Option<ParentLink>,
    version: i64,
    is_soft_deleted: bool,
    fields: BTreeMap<&'static str, FieldValue>,
    /// `None` inserts; `Some` updates guarded by this version.
    expected: Option<i64>,
}

impl PendingWrite {
    fn row(&self) -> RowWrite<'_> {
        RowWrite {
            entity_id: self.key.id,
            entity_type: self.key.entity_type,
            root_id: self.root_id,
            parent: self.parent.map(|link| (link.key.id, link.edge)),
            version: self.version,
            is_soft_deleted: self.is_soft_deleted,
            fields: &self.fields,
        }
    }
}

pub struct Session<'conn> {
    conn: &'conn Connection,
    context: RequestContext,
    clock: Arc<dyn Clock>,
    tracker: ChangeTracker,
    roots: Vec<Option<Box<dyn Entity>>>,
    validated: HashSet<&'static str>,
}

impl<'conn> Session<'conn> {
    pub fn new(conn: &'conn Connection, context: RequestContext) -> Self {
        Self {
            conn,
            context,
            clock: Arc::new(SystemClock),
            tracker: ChangeTracker::new(),
            roots: Vec::new(),
            validated: HashSet::new(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn context(&self) -> &RequestContext {
        &self.context
    }

    pub fn tracker(&self) -> &ChangeTracker {
        &self.tracker
    }

    /// Loads an aggregate with every owned navigation.
    pub fn load<T: Entity>(&mut self, id: EntityId) -> EngineResult<AggregateHandle<T>> {
        self.load_with(id, &LoadPlan::all())
    }

    pub fn load_with<T: Entity>(
        &mut self,
        id: EntityId,
        plan: &LoadPlan,
    ) -> EngineResult<AggregateHandle<T>> {
        self.find(id, plan)?
            .ok_or(EngineError::AggregateNotFound {
                entity_type: T::entity_descriptor().type_name,
                entity_id: id,
            })
    }

    /// Like `load_with`, but a missing aggregate is `Ok(None)`.
    ///
    /// An aggregate already live in this session is returned as is,
    /// whatever `plan` says.
    pub fn find<T: Entity>(
        &mut self,
        id: EntityId,
        plan: &LoadPlan,
    ) -> EngineResult<Option<AggregateHandle<T>>> {
        let descriptor = T::entity_descriptor();
        validate_schema(&mut self.validated, descriptor)?;

        let key = EntityKey::new(descriptor.type_name, id);
        if let Some(index) = self.position(&key) {
            return Ok(Some(AggregateHandle::new(index, key)));
        }
        if self.tracker.is_deleted(&key) {
            return Ok(None);
        }

        let store = SqliteEntityStore::new(self.conn);
        let Some(root) = store.load_aggregate(descriptor, id, plan)? else {
            debug!(
                "event=aggregate_load module=engine status=not_found entity_type={} entity_id={}",
                descriptor.type_name, id
            );
            return Ok(None);
        };

        self.tracker.track_loaded(&*root)?;
        self.roots.push(Some(root));
        debug!(
            "event=aggregate_load module=engine status=ok entity_type={} entity_id={}",
            descriptor.type_name, id
        );
        Ok(Some(AggregateHandle::new(self.roots.len() - 1, key)))
    }

    /// Tracks a brand-new aggregate; it is inserted by the next commit.
    pub fn add<T: Entity>(&mut self, root: T) -> EngineResult<AggregateHandle<T>> {
        validate_schema(&mut self.validated, T::entity_descriptor())?;

        let mut root: Box<dyn Entity> = Box::new(root);
        let keys = prepare_new_subtree(&mut *root)?;
        for key in &keys {
            if self.tracker.is_tracked(key) || self.position(key).is_some() {
                return Err(EngineError::Invariant(format!(
                    "{key} is already tracked by this session"
                )));
            }
        }
        let mut live = live_roots(&self.roots);
        live.push(&*root);
        ensure_unique_ids(&self.tracker, &live)?;

        let key = root.key();
        self.roots.push(Some(root));
        Ok(AggregateHandle::new(self.roots.len() - 1, key))
    }

    pub fn aggregate<T: Entity>(&self, handle: &AggregateHandle<T>) -> EngineResult<&T> {
        let root = live_root(&self.roots, handle.index, &handle.key)?;
        Ok(downcast_entity_ref::<T>(root)?)
    }

    /// Direct mutable access. Changes made here are detected at commit
    /// like merged ones, including members removed from owned navigations.
    pub fn aggregate_mut<T: Entity>(
        &mut self,
        handle: &AggregateHandle<T>,
    ) -> EngineResult<&mut T> {
        let root = live_root_mut(&mut self.roots, handle.index, &handle.key)?;
        Ok(downcast_entity_mut::<T>(root)?)
    }

    /// Merges a detached payload into the tracked aggregate.
    ///
    /// All or nothing: when the merge fails the tracked aggregate, its
    /// pending deletions and its concurrency tokens are left as they were.
    pub fn merge<T: Entity>(
        &mut self,
        handle: &AggregateHandle<T>,
        incoming: &T,
    ) -> EngineResult<MergeReport> {
        let mut candidate = live_root(&self.roots, handle.index, &handle.key)?.clone_entity();
        let mut tracker = self.tracker.clone();
        let mut visited = HashSet::new();
        let merged = reconcile::merge(&mut tracker, &mut *candidate, incoming, &mut visited)
            .and_then(|report| {
                let mut live = self.live_roots_except(handle.index);
                live.push(&*candidate);
                ensure_unique_ids(&tracker, &live)?;
                Ok(report)
            });
        let report = match merged {
            Ok(report) => report,
            Err(err) => {
                debug!(
                    "event=aggregate_merge module=engine status=rejected entity_type={} entity_id={} error={}",
                    handle.key.entity_type, handle.key.id, err
                );
                return Err(err);
            }
        };

        if let Some(slot) = self.roots.get_mut(handle.index) {
            *slot = Some(candidate);
        }
        self.tracker = tracker;
        debug!(
            "event=aggregate_merge module=engine status=ok entity_type={} entity_id={} changed={} inserted={} removed={}",
            handle.key.entity_type,
            handle.key.id,
            report.changed,
            report.inserted.len(),
            report.removed.len()
        );
        Ok(report)
    }

    /// Sets the soft-delete marker on the root; saved as an update.
    pub fn soft_delete<T: Entity>(&mut self, handle: &AggregateHandle<T>) -> EngineResult<()> {
        let root = live_root_mut(&mut self.roots, handle.index, &handle.key)?;
        root.meta_mut().is_soft_deleted = true;
        Ok(())
    }

    /// Schedules a hard delete of the whole aggregate. The handle is dead
    /// afterwards.
    pub fn remove<T: Entity>(&mut self, handle: &AggregateHandle<T>) -> EngineResult<()> {
        let slot = self
            .roots
            .get_mut(handle.index)
            .filter(|slot| slot.as_deref().map(|root| root.key()) == Some(handle.key))
            .ok_or(EngineError::UnknownHandle)?;
        let Some(root) = slot.take() else {
            return Err(EngineError::UnknownHandle);
        };
        if let Err(err) = self.tracker.schedule_delete(&*root, None) {
            *slot = Some(root);
            return Err(err);
        }
        Ok(())
    }

    pub fn entry_state(&self, entity: &dyn Entity) -> EngineResult<EntryState> {
        self.tracker.entry_state(entity)
    }

    /// `true` when the next commit would write something.
    pub fn has_changes(&self) -> EngineResult<bool> {
        if self.tracker.has_pending_deletions() {
            return Ok(true);
        }
        for root in live_roots(&self.roots) {
            let mut visited = HashSet::new();
            if is_changed_recursive(&self.tracker, root, &mut visited)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Commits every pending change atomically.
    ///
    /// # Errors
    /// - `EngineError::Conflict` when a row's persisted version no longer
    ///   matches the version this session expects.
    /// - Storage and model errors otherwise. In every error case nothing
    ///   is written and in-memory versions are restored.
    pub fn save_changes(&mut self) -> EngineResult<CommitSummary> {
        let started_at = Instant::now();

        for root in self.roots.iter_mut().flatten() {
            assign_missing_ids(&mut **root)?;
        }
        self.tracker.detect_detached(&live_roots(&self.roots))?;

        let mut bumps: Vec<VersionBump> = Vec::new();
        for root in live_roots(&self.roots) {
            bumps.extend(plan_version_bumps(&self.tracker, root)?);
        }
        for root in self.roots.iter_mut().flatten() {
            apply_version_bumps(&mut **root, &bumps)?;
        }

        match self.commit() {
            Ok(summary) => {
                info!(
                    "event=session_commit module=engine status=ok inserted={} updated={} deleted={} audit_records={} duration_ms={}",
                    summary.inserted,
                    summary.updated,
                    summary.deleted,
                    summary.audit_records,
                    started_at.elapsed().as_millis()
                );
                Ok(summary)
            }
            Err(err) => {
                for root in self.roots.iter_mut().flatten() {
                    if let Err(revert_err) = revert_version_bumps(&mut **root, &bumps) {
                        error!(
                            "event=session_commit module=engine status=error error_code=version_revert_failed error={}",
                            revert_err
                        );
                    }
                }
                match err.as_conflict() {
                    Some(conflict) => warn!(
                        "event=session_commit module=engine status=conflict entity_type={} entity_id={} version_in_request={} version_in_database={:?} duration_ms={}",
                        conflict.entity_type,
                        conflict.entity_id,
                        conflict.version_in_request,
                        conflict.version_in_database,
                        started_at.elapsed().as_millis()
                    ),
                    None => error!(
                        "event=session_commit module=engine status=error duration_ms={} error={}",
                        started_at.elapsed().as_millis(),
                        err
                    ),
                }
                Err(err)
            }
        }
    }

    fn commit(&mut self) -> EngineResult<CommitSummary> {
        let live = live_roots(&self.roots);
        let writes = plan_writes(&self.tracker, &live)?;
        let mut deletions = Vec::with_capacity(self.tracker.deleted().len());
        for key in self.tracker.deleted() {
            let expected = self.tracker.expected_version(key).ok_or_else(|| {
                EngineError::Invariant(format!("{key} is scheduled for deletion but untracked"))
            })?;
            deletions.push((*key, expected));
        }

        let timestamp_ms = self.clock.now_ms();
        let entries = record_changes(&self.tracker, &live, &self.context, timestamp_ms)?;
        let cleanup_targets = plan_cleanup(&self.tracker);

        if writes.is_empty() && deletions.is_empty() && entries.is_empty() {
            return Ok(CommitSummary::default());
        }

        let tx = Transaction::new_unchecked(self.conn, TransactionBehavior::Immediate)?;
        let mut summary = CommitSummary {
            timestamp_ms: Some(timestamp_ms),
            ..CommitSummary::default()
        };

        for write in &writes {
            let row = write.row();
            match write.expected {
                None => {
                    insert_row(&tx, &row)?;
                    summary.inserted += 1;
                }
                Some(expected) => match update_row(&tx, &row, expected)? {
                    WriteOutcome::Applied => summary.updated += 1,
                    WriteOutcome::VersionMismatch { current } => {
                        return Err(conflict(write.key, expected, current));
                    }
                },
            }
        }

        for (key, expected) in &deletions {
            match delete_row(&tx, key.id, *expected)? {
                WriteOutcome::Applied => summary.deleted += 1,
                WriteOutcome::VersionMismatch { current } => {
                    return Err(conflict(*key, *expected, current));
                }
            }
        }

        let cleanup = execute_cleanup(&tx, &cleanup_targets)?;
        summary.cleaned_access_links = cleanup.access_links;
        summary.cleaned_audit_records = cleanup.entity_changes;

        insert_entries(&tx, &entries)?;
        summary.audit_records = entries.len();

        tx.commit()?;
        self.tracker.accept(&live)?;
        Ok(summary)
    }

    fn live_roots_except(&self, index: usize) -> Vec<&dyn Entity> {
        self.roots
            .iter()
            .enumerate()
            .filter(|(position, _)| *position != index)
            .filter_map(|(_, slot)| slot.as_deref())
            .collect()
    }

    fn position(&self, key: &EntityKey) -> Option<usize> {
        self.roots
            .iter()
            .position(|slot| slot.as_deref().map(|root| root.key()) == Some(*key))
    }
}

fn plan_writes(tracker: &ChangeTracker, live: &[&dyn Entity]) -> EngineResult<Vec<PendingWrite>> {
    let mut writes = Vec::new();
    for root in live {
        walk_tree(*root, &mut |entity, placement| {
            let key = entity.key();
            let expected = match tracker.entry_state(entity)? {
                EntryState::Added => None,
                EntryState::Modified => Some(tracker.expected_version(&key).ok_or_else(|| {
                    EngineError::Invariant(format!("{key} is modified but untracked"))
                })?),
                EntryState::Deleted | EntryState::Unchanged => return Ok(()),
            };
            writes.push(PendingWrite {
                key,
                root_id: placement.root.id,
                parent: placement.parent,
                version: entity.version(),
                is_soft_deleted: entity.is_soft_deleted(),
                fields: capture_fields(entity)?,
                expected,
            });
            Ok(())
        })?;
    }
    Ok(writes)
}

fn conflict(key: EntityKey, expected: i64, current: Option<i64>) -> EngineError {
    EngineError::Conflict(ConcurrencyConflict {
        entity_type: key.entity_type,
        entity_id: key.id,
        version_in_request: expected,
        version_in_database: current,
    })
}

/// Checks that every id names one entity across tracked snapshots and the
/// live `roots`, and that no key is live in two aggregates.
fn ensure_unique_ids(tracker: &ChangeTracker, roots: &[&dyn Entity]) -> EngineResult<()> {
    let mut owners: HashMap<EntityId, EntityKey> = tracker
        .tracked_keys()
        .map(|key| (key.id, *key))
        .collect();
    let mut live_in: HashMap<EntityKey, usize> = HashMap::new();
    for (position, root) in roots.iter().enumerate() {
        walk_tree(*root, &mut |entity, _| {
            let key = entity.key();
            if let Some(existing) = owners.insert(key.id, key) {
                if existing != key {
                    return Err(EngineError::Invariant(format!(
                        "{key} reuses the id of {existing}"
                    )));
                }
            }
            if let Some(other) = live_in.insert(key, position) {
                if other != position {
                    return Err(EngineError::Invariant(format!(
                        "{key} is live in two aggregates"
                    )));
                }
            }
            Ok(())
        })?;
    }
    Ok(())
}

/// Validates a descriptor and every descriptor reachable through owned
/// edges, once per type.
fn validate_schema(
    validated: &mut HashSet<&'static str>,
    descriptor: &'static EntityDescriptor,
) -> EngineResult<()> {
    let mut pending = vec![descriptor];
    while let Some(next) = pending.pop() {
        if validated.contains(next.type_name) {
            continue;
        }
        next.validate()?;
        validated.insert(next.type_name);
        pending.extend(next.owned.iter().map(|edge| (edge.target)()));
    }
    Ok(())
}

fn live_roots(roots: &[Option<Box<dyn Entity>>]) -> Vec<&dyn Entity> {
    roots.iter().flatten().map(|root| &**root).collect()
}

fn live_root<'s>(
    roots: &'s [Option<Box<dyn Entity>>],
    index: usize,
    key: &EntityKey,
) -> EngineResult<&'s dyn Entity> {
    roots
        .get(index)
        .and_then(|slot| slot.as_deref())
        .filter(|root| root.key() == *key)
        .ok_or(EngineError::UnknownHandle)
}

fn live_root_mut<'s>(
    roots: &'s mut [Option<Box<dyn Entity>>],
    index: usize,
    key: &EntityKey,
) -> EngineResult<&'s mut dyn Entity> {
    roots
        .get_mut(index)
        .and_then(|slot| slot.as_deref_mut())
        .filter(|root| root.key() == *key)
        .ok_or(EngineError::UnknownHandle)
}
