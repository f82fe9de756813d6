//! Aggregate use-case service.
//!
//! # Responsibility
//! - Provide one-shot create/get/update/delete entry points, each running
//!   in its own session and commit.
//! - Expose the audit history of an entity.
//!
//! # Invariants
//! - Every mutating call commits atomically or not at all.
//! - Updates always load every owned navigation before merging.

use crate::engine::context::{Clock, RequestContext, SystemClock};
use crate::engine::session::{CommitSummary, Session};
use crate::engine::{EngineError, EngineResult};
use crate::model::audit::AuditEntry;
use crate::model::entity::{Entity, EntityId};
use crate::repo::audit_repo::{AuditRepository, SqliteAuditRepository};
use crate::repo::entity_repo::LoadPlan;
use rusqlite::Connection;
use std::sync::Arc;

/// Result of `AggregateService::update`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateOutcome<T> {
    /// `true` when the payload differed from the stored aggregate.
    pub changed: bool,
    /// Aggregate as stored after the commit.
    pub aggregate: T,
    pub summary: CommitSummary,
}

/// Use-case service over one SQLite connection.
pub struct AggregateService<'conn> {
    conn: &'conn Connection,
    clock: Arc<dyn Clock>,
}

impl<'conn> AggregateService<'conn> {
    pub fn new(conn: &'conn Connection) -> Self {
        Self {
            conn,
            clock: Arc::new(SystemClock),
        }
    }

    /// Uses `clock` for every commit timestamp.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Opens a session sharing this service's connection and clock.
    pub fn session(&self, context: &RequestContext) -> Session<'conn> {
        Session::new(self.conn, context.clone()).with_clock(Arc::clone(&self.clock))
    }

    /// Inserts a new aggregate and returns it with assigned ids and
    /// versions.
    pub fn create<T: Entity + Clone>(&self, context: &RequestContext, root: T) -> EngineResult<T> {
        let mut session = self.session(context);
        let handle = session.add(root)?;
        session.save_changes()?;
        Ok(session.aggregate(&handle)?.clone())
    }

    /// Reads an aggregate. Soft-deleted roots are hidden unless the plan
    /// includes them.
    pub fn get<T: Entity + Clone>(&self, id: EntityId, plan: &LoadPlan) -> EngineResult<Option<T>> {
        let mut session = self.session(&RequestContext::anonymous());
        match session.find::<T>(id, plan)? {
            Some(handle) => Ok(Some(session.aggregate(&handle)?.clone())),
            None => Ok(None),
        }
    }

    /// Loads the aggregate named by `incoming`, merges the payload into it
    /// and commits.
    ///
    /// # Errors
    /// - `EngineError::Invariant` when the payload carries no key.
    /// - `EngineError::AggregateNotFound` when nothing is stored under it.
    /// - `EngineError::Conflict` when a non-zero payload version is stale
    ///   or another writer committed first.
    pub fn update<T: Entity + Clone>(
        &self,
        context: &RequestContext,
        incoming: &T,
    ) -> EngineResult<UpdateOutcome<T>> {
        let id = incoming.id();
        if id.is_nil() {
            return Err(EngineError::Invariant(format!(
                "`{}` update payload carries no key",
                T::entity_descriptor().type_name
            )));
        }

        let mut session = self.session(context);
        let handle = session.load::<T>(id)?;
        let report = session.merge(&handle, incoming)?;
        let summary = session.save_changes()?;
        Ok(UpdateOutcome {
            changed: report.changed,
            aggregate: session.aggregate(&handle)?.clone(),
            summary,
        })
    }

    /// Marks the root soft-deleted. Already soft-deleted roots are not
    /// found.
    pub fn soft_delete<T: Entity>(
        &self,
        context: &RequestContext,
        id: EntityId,
    ) -> EngineResult<CommitSummary> {
        let mut session = self.session(context);
        let handle = session.load_with::<T>(id, &LoadPlan::root_only())?;
        session.soft_delete(&handle)?;
        session.save_changes()
    }

    /// Hard-deletes the aggregate, soft-deleted or not, together with its
    /// access links and prior audit records.
    pub fn delete<T: Entity>(
        &self,
        context: &RequestContext,
        id: EntityId,
    ) -> EngineResult<CommitSummary> {
        let mut session = self.session(context);
        let handle = session.load_with::<T>(id, &LoadPlan::all().including_soft_deleted())?;
        session.remove(&handle)?;
        session.save_changes()
    }

    /// Audit history of one entity, oldest first.
    pub fn history(&self, entity_type: &str, id: EntityId) -> EngineResult<Vec<AuditEntry>> {
        let repo = SqliteAuditRepository::new(self.conn);
        Ok(repo.entity_history(entity_type, id)?)
    }
}
