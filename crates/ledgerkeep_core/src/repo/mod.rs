//! Repository layer: SQL details for entity rows, audit records and
//! access links.
//!
//! # Responsibility
//! - Keep every SQL statement of the crate inside this boundary.
//! - Return semantic errors (`NotFound`, `InvalidData`) in addition to DB
//!   transport errors.
//!
//! # Invariants
//! - Read paths reject malformed persisted state instead of masking it.
//! - Audit tables are only ever inserted into or purged per subject.

use crate::db::DbError;
use crate::model::entity::ModelError;
use std::error::Error;
use std::fmt::{Display, Formatter};

pub mod access_repo;
pub mod audit_repo;
pub mod entity_repo;

pub type RepoResult<T> = Result<T, RepoError>;

/// Repository error shared by every SQLite-backed repository.
#[derive(Debug)]
pub enum RepoError {
    Db(DbError),
    /// Entity materialization disagreed with the type descriptor.
    Model(ModelError),
    NotFound(String),
    InvalidData(String),
    InvalidPermission(String),
}

impl Display for RepoError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Db(err) => write!(f, "{err}"),
            Self::Model(err) => write!(f, "{err}"),
            Self::NotFound(what) => write!(f, "not found: {what}"),
            Self::InvalidData(message) => write!(f, "invalid persisted data: {message}"),
            Self::InvalidPermission(value) => write!(f, "invalid permission name: `{value}`"),
        }
    }
}

impl Error for RepoError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Db(err) => Some(err),
            Self::Model(err) => Some(err),
            Self::NotFound(_) | Self::InvalidData(_) | Self::InvalidPermission(_) => None,
        }
    }
}

impl From<DbError> for RepoError {
    fn from(value: DbError) -> Self {
        Self::Db(value)
    }
}

impl From<rusqlite::Error> for RepoError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Db(DbError::Sqlite(value))
    }
}

impl From<ModelError> for RepoError {
    fn from(value: ModelError) -> Self {
        Self::Model(value)
    }
}

pub(crate) fn parse_uuid(value: &str, column: &'static str) -> RepoResult<uuid::Uuid> {
    uuid::Uuid::parse_str(value)
        .map_err(|_| RepoError::InvalidData(format!("invalid uuid `{value}` in {column}")))
}

pub(crate) fn bool_to_int(value: bool) -> i64 {
    if value {
        1
    } else {
        0
    }
}

pub(crate) fn int_to_bool(value: i64, column: &'static str) -> RepoResult<bool> {
    match value {
        0 => Ok(false),
        1 => Ok(true),
        other => Err(RepoError::InvalidData(format!(
            "invalid boolean value `{other}` in {column}"
        ))),
    }
}
