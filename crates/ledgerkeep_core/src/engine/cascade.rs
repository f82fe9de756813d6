//! Cascade cleanup of rows that point at hard-deleted entities through the
//! polymorphic `(entity_type, entity_id)` pair.
//!
//! Runs inside the commit transaction, after entity rows are deleted and
//! before this commit's audit records are inserted.

use crate::engine::tracker::ChangeTracker;
use crate::engine::EngineResult;
use crate::model::entity::EntityKey;
use crate::repo::access_repo::delete_links_for_entity;
use crate::repo::audit_repo::delete_entries_for_entity;
use rusqlite::Connection;

/// Rows removed by one cleanup run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub access_links: usize,
    pub entity_changes: usize,
}

/// Keys whose dependent rows must go, children first.
pub fn plan_cleanup(tracker: &ChangeTracker) -> Vec<EntityKey> {
    tracker.deleted().to_vec()
}

pub fn execute_cleanup(conn: &Connection, targets: &[EntityKey]) -> EngineResult<CleanupReport> {
    let mut report = CleanupReport::default();
    for key in targets {
        report.access_links += delete_links_for_entity(conn, key.entity_type, key.id)?;
        report.entity_changes += delete_entries_for_entity(conn, key.entity_type, key.id)?;
    }
    Ok(report)
}
