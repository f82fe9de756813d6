//! Authorization links from principals to entities.
//!
//! Links point at their subject through the polymorphic
//! `(entity_type, entity_id)` pair and are purged by cascade cleanup when
//! the subject is hard-deleted.

use crate::model::entity::EntityId;
use crate::repo::{parse_uuid, RepoError, RepoResult};
use once_cell::sync::Lazy;
use regex::Regex;
use rusqlite::{params, Connection, OptionalExtension, Row};

static PERMISSION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z][a-z0-9_.:-]*$").expect("valid permission regex"));

const LINK_SELECT_SQL: &str = "SELECT
    entity_type,
    entity_id,
    principal_id,
    permission,
    created_at
FROM access_links";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessLink {
    pub entity_type: String,
    pub entity_id: EntityId,
    pub principal_id: String,
    pub permission: String,
    /// Unix epoch milliseconds.
    pub created_at: i64,
}

pub trait AccessLinkRepository {
    /// Returns `false` when the link already existed.
    fn grant(
        &self,
        entity_type: &str,
        entity_id: EntityId,
        principal_id: &str,
        permission: &str,
    ) -> RepoResult<bool>;
    /// Returns `false` when no such link existed.
    fn revoke(
        &self,
        entity_type: &str,
        entity_id: EntityId,
        principal_id: &str,
        permission: &str,
    ) -> RepoResult<bool>;
    fn list_for_entity(&self, entity_type: &str, entity_id: EntityId)
        -> RepoResult<Vec<AccessLink>>;
    fn list_for_principal(&self, principal_id: &str) -> RepoResult<Vec<AccessLink>>;
}

pub struct SqliteAccessLinkRepository<'conn> {
    conn: &'conn Connection,
}

impl<'conn> SqliteAccessLinkRepository<'conn> {
    pub fn new(conn: &'conn Connection) -> Self {
        Self { conn }
    }

    fn ensure_subject_exists(&self, entity_type: &str, entity_id: EntityId) -> RepoResult<()> {
        let found: Option<i64> = self
            .conn
            .query_row(
                "SELECT 1 FROM entities WHERE entity_id = ?1 AND entity_type = ?2;",
                params![entity_id.to_string(), entity_type],
                |row| row.get(0),
            )
            .optional()?;
        if found.is_none() {
            return Err(RepoError::NotFound(format!("{entity_type}:{entity_id}")));
        }
        Ok(())
    }
}

impl AccessLinkRepository for SqliteAccessLinkRepository<'_> {
    fn grant(
        &self,
        entity_type: &str,
        entity_id: EntityId,
        principal_id: &str,
        permission: &str,
    ) -> RepoResult<bool> {
        validate_permission(permission)?;
        if principal_id.trim().is_empty() {
            return Err(RepoError::InvalidData(
                "principal id cannot be empty".to_string(),
            ));
        }
        self.ensure_subject_exists(entity_type, entity_id)?;

        let inserted = self.conn.execute(
            "INSERT OR IGNORE INTO access_links (
                entity_type,
                entity_id,
                principal_id,
                permission
            ) VALUES (?1, ?2, ?3, ?4);",
            params![entity_type, entity_id.to_string(), principal_id, permission],
        )?;
        Ok(inserted == 1)
    }

    fn revoke(
        &self,
        entity_type: &str,
        entity_id: EntityId,
        principal_id: &str,
        permission: &str,
    ) -> RepoResult<bool> {
        validate_permission(permission)?;
        let removed = self.conn.execute(
            "DELETE FROM access_links
             WHERE entity_type = ?1
               AND entity_id = ?2
               AND principal_id = ?3
               AND permission = ?4;",
            params![entity_type, entity_id.to_string(), principal_id, permission],
        )?;
        Ok(removed == 1)
    }

    fn list_for_entity(
        &self,
        entity_type: &str,
        entity_id: EntityId,
    ) -> RepoResult<Vec<AccessLink>> {
        let mut stmt = self.conn.prepare(&format!(
            "{LINK_SELECT_SQL}
             WHERE entity_type = ?1 AND entity_id = ?2
             ORDER BY principal_id ASC, permission ASC;"
        ))?;
        let mut rows = stmt.query(params![entity_type, entity_id.to_string()])?;
        collect_links(&mut rows)
    }

    fn list_for_principal(&self, principal_id: &str) -> RepoResult<Vec<AccessLink>> {
        let mut stmt = self.conn.prepare(&format!(
            "{LINK_SELECT_SQL}
             WHERE principal_id = ?1
             ORDER BY entity_type ASC, entity_id ASC, permission ASC;"
        ))?;
        let mut rows = stmt.query([principal_id])?;
        collect_links(&mut rows)
    }
}

/// Deletes every link whose subject is `(entity_type, entity_id)`.
pub(crate) fn delete_links_for_entity(
    conn: &Connection,
    entity_type: &str,
    entity_id: EntityId,
) -> RepoResult<usize> {
    let removed = conn.execute(
        "DELETE FROM access_links WHERE entity_type = ?1 AND entity_id = ?2;",
        params![entity_type, entity_id.to_string()],
    )?;
    Ok(removed)
}

fn validate_permission(permission: &str) -> RepoResult<()> {
    if PERMISSION_RE.is_match(permission) {
        Ok(())
    } else {
        Err(RepoError::InvalidPermission(permission.to_string()))
    }
}

fn collect_links(rows: &mut rusqlite::Rows<'_>) -> RepoResult<Vec<AccessLink>> {
    let mut links = Vec::new();
    while let Some(row) = rows.next()? {
        links.push(parse_link_row(row)?);
    }
    Ok(links)
}

fn parse_link_row(row: &Row<'_>) -> RepoResult<AccessLink> {
    let entity_id: String = row.get("entity_id")?;
    Ok(AccessLink {
        entity_type: row.get("entity_type")?,
        entity_id: parse_uuid(&entity_id, "access_links.entity_id")?,
        principal_id: row.get("principal_id")?,
        permission: row.get("permission")?,
        created_at: row.get("created_at")?,
    })
}
