//! Core domain logic for ledgerkeep.
//! This crate owns aggregate merge, optimistic concurrency and the audit
//! trail; hosts only supply a connection and a request context.

pub mod config;
pub mod db;
pub mod engine;
pub mod logging;
pub mod model;
pub mod repo;
pub mod service;

pub use config::{ConfigError, CoreConfig};
pub use db::{open_db, open_db_from_config, open_db_in_memory, DbError, DbResult};
pub use engine::context::{Clock, FixedClock, RequestContext, SystemClock};
pub use engine::reconcile::MergeReport;
pub use engine::session::{AggregateHandle, CommitSummary, Session};
pub use engine::tracker::{ChangeTracker, EntryState};
pub use engine::{ConcurrencyConflict, EngineError, EngineResult, ErrorKind};
pub use logging::{default_log_level, init_logging, init_logging_from_config, logging_status};
pub use model::audit::{AuditEntry, ChangeType, EntityChange, PropertyChange};
pub use model::entity::{
    assign_field, unknown_field, EdgeShape, Entity, EntityDescriptor, EntityId, EntityKey,
    EntityMeta, FieldDescriptor, ModelError, ModelResult, OwnedEdge,
};
pub use model::navigation::{CollectionNav, OwnedMany, OwnedRef, ReferenceNav, Related};
pub use model::value::{FieldType, FieldValue};
pub use repo::access_repo::{AccessLink, AccessLinkRepository, SqliteAccessLinkRepository};
pub use repo::audit_repo::{AuditQuery, AuditRepository, SqliteAuditRepository};
pub use repo::entity_repo::{LoadPlan, SqliteEntityStore};
pub use repo::{RepoError, RepoResult};
pub use service::aggregate_service::{AggregateService, UpdateOutcome};

/// Minimal health-check API for hosts.
pub fn ping() -> &'static str {
    "pong"
}

/// Returns the core crate version.
pub fn core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
