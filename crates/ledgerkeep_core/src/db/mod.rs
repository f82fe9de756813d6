//! Aggregate store bootstrap: connections, pragmas and schema.
//!
//! # Responsibility
//! - Hand out connections with the pragmas the engine relies on: foreign
//!   keys for the entity parent chain and a busy timeout for
//!   `BEGIN IMMEDIATE` commits.
//! - Bring the `entities`, audit and access-link tables up to the schema
//!   this build knows.
//!
//! # Invariants
//! - Schema version lives in `PRAGMA user_version`.
//! - A store written by a newer schema is refused, never downgraded.
//! - No entity, audit or access-link row is touched before migrations
//!   succeed.

use rusqlite::Connection;
use std::error::Error;
use std::fmt::{Display, Formatter};

pub mod migrations;
mod open;

pub use open::{open_db, open_db_from_config, open_db_in_memory};

pub type DbResult<T> = Result<T, DbError>;

/// Schema version recorded in the store file.
pub fn schema_version(conn: &Connection) -> DbResult<u32> {
    let version = conn.query_row("PRAGMA user_version;", [], |row| row.get::<_, u32>(0))?;
    Ok(version)
}

/// Failures while opening or migrating the aggregate store.
#[derive(Debug)]
pub enum DbError {
    /// SQLite failed while opening the file or running a migration.
    Sqlite(rusqlite::Error),
    /// A connection setting the engine depends on could not be applied.
    Pragma {
        pragma: &'static str,
        source: rusqlite::Error,
    },
    /// The store was last migrated by a newer build.
    SchemaTooNew { found: u32, supported: u32 },
}

impl Display for DbError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sqlite(err) => write!(f, "aggregate store: {err}"),
            Self::Pragma { pragma, source } => {
                write!(f, "aggregate store: cannot apply `{pragma}`: {source}")
            }
            Self::SchemaTooNew { found, supported } => write!(
                f,
                "aggregate store schema {found} is newer than this build supports ({supported})"
            ),
        }
    }
}

impl Error for DbError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Sqlite(err) | Self::Pragma { source: err, .. } => Some(err),
            Self::SchemaTooNew { .. } => None,
        }
    }
}

impl From<rusqlite::Error> for DbError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Sqlite(value)
    }
}
