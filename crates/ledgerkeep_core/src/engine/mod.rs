//! Aggregate reconciliation, versioning and audit engine.
//!
//! # Responsibility
//! - Merge detached client payloads into tracked aggregates.
//! - Bump versions, record the audit trail and purge dangling rows inside
//!   one atomic commit.
//!
//! # Invariants
//! - Commit order is versions, audit records, cascade cleanup, then the
//!   SQLite transaction; any failure rolls back everything.
//! - Only `EngineError::Conflict` is retryable.

use crate::db::DbError;
use crate::model::entity::{EntityId, ModelError};
use crate::repo::RepoError;
use std::error::Error;
use std::fmt::{Display, Formatter};

pub mod audit;
pub mod cascade;
pub mod context;
pub mod dirty;
mod graph;
pub mod reconcile;
pub mod session;
pub mod tracker;
pub mod version;

pub type EngineResult<T> = Result<T, EngineError>;

/// Optimistic-concurrency failure detected at commit time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConcurrencyConflict {
    pub entity_type: &'static str,
    pub entity_id: EntityId,
    /// Version the caller last observed.
    pub version_in_request: i64,
    /// Version currently persisted; `None` when the row is gone.
    pub version_in_database: Option<i64>,
}

impl Display for ConcurrencyConflict {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self.version_in_database {
            Some(current) => write!(
                f,
                "concurrency conflict on {}:{}: request version {}, database version {}",
                self.entity_type, self.entity_id, self.version_in_request, current
            ),
            None => write!(
                f,
                "concurrency conflict on {}:{}: request version {}, row no longer exists",
                self.entity_type, self.entity_id, self.version_in_request
            ),
        }
    }
}

/// Coarse classification callers can branch on without parsing text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Wiring bug such as a missing eager load. Never retry.
    Configuration,
    /// Stale version. Re-fetch and retry.
    Conflict,
    /// Broken graph or key invariant. Abort.
    Invariant,
    NotFound,
    Storage,
}

#[derive(Debug)]
pub enum EngineError {
    Repo(RepoError),
    Model(ModelError),
    NavigationNotLoaded {
        entity_type: &'static str,
        entity_id: EntityId,
        navigation: &'static str,
    },
    Conflict(ConcurrencyConflict),
    Invariant(String),
    AggregateNotFound {
        entity_type: &'static str,
        entity_id: EntityId,
    },
    /// The handle does not belong to a live aggregate of this session.
    UnknownHandle,
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Repo(RepoError::NotFound(_)) => ErrorKind::NotFound,
            Self::Repo(RepoError::Model(_)) => ErrorKind::Configuration,
            Self::Repo(_) => ErrorKind::Storage,
            Self::Model(_) | Self::NavigationNotLoaded { .. } | Self::UnknownHandle => {
                ErrorKind::Configuration
            }
            Self::Conflict(_) => ErrorKind::Conflict,
            Self::Invariant(_) => ErrorKind::Invariant,
            Self::AggregateNotFound { .. } => ErrorKind::NotFound,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Conflict
    }

    pub fn as_conflict(&self) -> Option<&ConcurrencyConflict> {
        match self {
            Self::Conflict(conflict) => Some(conflict),
            _ => None,
        }
    }
}

impl Display for EngineError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Repo(err) => write!(f, "{err}"),
            Self::Model(err) => write!(f, "{err}"),
            Self::NavigationNotLoaded {
                entity_type,
                entity_id,
                navigation,
            } => write!(
                f,
                "owned navigation `{entity_type}.{navigation}` of {entity_id} was not loaded"
            ),
            Self::Conflict(conflict) => write!(f, "{conflict}"),
            Self::Invariant(message) => write!(f, "invariant violated: {message}"),
            Self::AggregateNotFound {
                entity_type,
                entity_id,
            } => write!(f, "aggregate not found: {entity_type}:{entity_id}"),
            Self::UnknownHandle => write!(f, "aggregate handle is not live in this session"),
        }
    }
}

impl Error for EngineError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Repo(err) => Some(err),
            Self::Model(err) => Some(err),
            _ => None,
        }
    }
}

impl From<RepoError> for EngineError {
    fn from(value: RepoError) -> Self {
        Self::Repo(value)
    }
}

impl From<ModelError> for EngineError {
    fn from(value: ModelError) -> Self {
        Self::Model(value)
    }
}

impl From<DbError> for EngineError {
    fn from(value: DbError) -> Self {
        Self::Repo(RepoError::Db(value))
    }
}

impl From<rusqlite::Error> for EngineError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Repo(RepoError::from(value))
    }
}
