//! Audit trail persistence and read-only query surface.
//!
//! # Responsibility
//! - Insert the records produced by one commit.
//! - Query `entity_changes` by subject and `property_changes` by change id.
//! - Purge all records of one subject during cascade cleanup.
//!
//! # Invariants
//! - Reads are ordered by `timestamp_ms`, then insertion sequence.
//! - Nothing here updates a stored record; the schema triggers reject it.

use crate::model::audit::{AuditEntry, ChangeType, EntityChange, PropertyChange};
use crate::model::entity::EntityId;
use crate::model::value::FieldValue;
use crate::repo::{parse_uuid, RepoError, RepoResult};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, Row};
use uuid::Uuid;

const CHANGE_SELECT_SQL: &str = "SELECT
    change_id,
    entity_type,
    entity_id,
    change_type,
    entity_version,
    timestamp_ms,
    actor_id,
    causation_id
FROM entity_changes";

/// Filters for listing entity changes.
#[derive(Debug, Clone, Default)]
pub struct AuditQuery {
    pub entity_type: Option<String>,
    pub entity_id: Option<EntityId>,
    pub change_type: Option<ChangeType>,
    pub limit: Option<u32>,
    pub offset: u32,
}

impl AuditQuery {
    /// All changes of one subject.
    pub fn for_entity(entity_type: &str, entity_id: EntityId) -> Self {
        Self {
            entity_type: Some(entity_type.to_string()),
            entity_id: Some(entity_id),
            ..Self::default()
        }
    }
}

/// Read-only audit query interface.
pub trait AuditRepository {
    fn list_entity_changes(&self, query: &AuditQuery) -> RepoResult<Vec<EntityChange>>;
    fn list_property_changes(&self, change_id: Uuid) -> RepoResult<Vec<PropertyChange>>;
    /// Changes of one subject, each with its property changes.
    fn entity_history(&self, entity_type: &str, entity_id: EntityId)
        -> RepoResult<Vec<AuditEntry>>;
}

/// SQLite-backed audit repository.
pub struct SqliteAuditRepository<'conn> {
    conn: &'conn Connection,
}

impl<'conn> SqliteAuditRepository<'conn> {
    pub fn new(conn: &'conn Connection) -> Self {
        Self { conn }
    }
}

impl AuditRepository for SqliteAuditRepository<'_> {
    fn list_entity_changes(&self, query: &AuditQuery) -> RepoResult<Vec<EntityChange>> {
        let mut sql = format!("{CHANGE_SELECT_SQL} WHERE 1 = 1");
        let mut bind_values: Vec<Value> = Vec::new();

        if let Some(entity_type) = query.entity_type.as_ref() {
            sql.push_str(" AND entity_type = ?");
            bind_values.push(Value::Text(entity_type.clone()));
        }

        if let Some(entity_id) = query.entity_id {
            sql.push_str(" AND entity_id = ?");
            bind_values.push(Value::Text(entity_id.to_string()));
        }

        if let Some(change_type) = query.change_type {
            sql.push_str(" AND change_type = ?");
            bind_values.push(Value::Text(change_type.as_str().to_string()));
        }

        sql.push_str(" ORDER BY timestamp_ms ASC, seq ASC");

        if let Some(limit) = query.limit {
            sql.push_str(" LIMIT ?");
            bind_values.push(Value::Integer(i64::from(limit)));
            if query.offset > 0 {
                sql.push_str(" OFFSET ?");
                bind_values.push(Value::Integer(i64::from(query.offset)));
            }
        } else if query.offset > 0 {
            sql.push_str(" LIMIT -1 OFFSET ?");
            bind_values.push(Value::Integer(i64::from(query.offset)));
        }

        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = stmt.query(params_from_iter(bind_values))?;
        let mut changes = Vec::new();
        while let Some(row) = rows.next()? {
            changes.push(parse_change_row(row)?);
        }

        Ok(changes)
    }

    fn list_property_changes(&self, change_id: Uuid) -> RepoResult<Vec<PropertyChange>> {
        let mut stmt = self.conn.prepare(
            "SELECT change_id, property_name, old_value, new_value
             FROM property_changes
             WHERE change_id = ?1
             ORDER BY seq ASC;",
        )?;
        let mut rows = stmt.query([change_id.to_string()])?;
        let mut properties = Vec::new();
        while let Some(row) = rows.next()? {
            properties.push(parse_property_row(row)?);
        }

        Ok(properties)
    }

    fn entity_history(
        &self,
        entity_type: &str,
        entity_id: EntityId,
    ) -> RepoResult<Vec<AuditEntry>> {
        let changes = self.list_entity_changes(&AuditQuery::for_entity(entity_type, entity_id))?;
        changes
            .into_iter()
            .map(|change| {
                let properties = self.list_property_changes(change.id)?;
                Ok(AuditEntry { change, properties })
            })
            .collect()
    }
}

/// Inserts the records of one commit, in order.
pub(crate) fn insert_entries(conn: &Connection, entries: &[AuditEntry]) -> RepoResult<()> {
    let mut change_stmt = conn.prepare(
        "INSERT INTO entity_changes (
            change_id,
            entity_type,
            entity_id,
            change_type,
            entity_version,
            timestamp_ms,
            actor_id,
            causation_id
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8);",
    )?;
    let mut property_stmt = conn.prepare(
        "INSERT INTO property_changes (
            change_id,
            property_name,
            old_value,
            new_value
        ) VALUES (?1, ?2, ?3, ?4);",
    )?;

    for entry in entries {
        let change = &entry.change;
        change_stmt.execute(params![
            change.id.to_string(),
            change.entity_type.as_str(),
            change.entity_id.to_string(),
            change.change_type.as_str(),
            change.entity_version,
            change.timestamp_ms,
            change.actor_id.as_deref(),
            change.causation_id.as_deref(),
        ])?;

        for property in &entry.properties {
            property_stmt.execute(params![
                property.entity_change_id.to_string(),
                property.property_name.as_str(),
                encode_value(property.old_value.as_ref())?,
                encode_value(property.new_value.as_ref())?,
            ])?;
        }
    }

    Ok(())
}

/// Deletes every audit record whose subject is `(entity_type, entity_id)`.
///
/// Returns the number of `entity_changes` rows removed.
pub(crate) fn delete_entries_for_entity(
    conn: &Connection,
    entity_type: &str,
    entity_id: EntityId,
) -> RepoResult<usize> {
    let id_text = entity_id.to_string();
    conn.execute(
        "DELETE FROM property_changes
         WHERE change_id IN (
            SELECT change_id
            FROM entity_changes
            WHERE entity_type = ?1 AND entity_id = ?2
         );",
        params![entity_type, id_text],
    )?;
    let removed = conn.execute(
        "DELETE FROM entity_changes WHERE entity_type = ?1 AND entity_id = ?2;",
        params![entity_type, id_text],
    )?;
    Ok(removed)
}

fn encode_value(value: Option<&FieldValue>) -> RepoResult<Option<String>> {
    value
        .map(|value| {
            serde_json::to_string(value)
                .map_err(|err| RepoError::InvalidData(format!("cannot encode audit value: {err}")))
        })
        .transpose()
}

fn decode_value(text: Option<String>, column: &'static str) -> RepoResult<Option<FieldValue>> {
    text.map(|text| {
        serde_json::from_str(&text).map_err(|err| {
            RepoError::InvalidData(format!("invalid value `{text}` in {column}: {err}"))
        })
    })
    .transpose()
}

fn parse_change_row(row: &Row<'_>) -> RepoResult<EntityChange> {
    let change_id: String = row.get("change_id")?;
    let entity_id: String = row.get("entity_id")?;
    let change_type_text: String = row.get("change_type")?;
    let change_type = ChangeType::parse(&change_type_text).ok_or_else(|| {
        RepoError::InvalidData(format!(
            "invalid change type `{change_type_text}` in entity_changes.change_type"
        ))
    })?;

    Ok(EntityChange {
        id: parse_uuid(&change_id, "entity_changes.change_id")?,
        entity_type: row.get("entity_type")?,
        entity_id: parse_uuid(&entity_id, "entity_changes.entity_id")?,
        change_type,
        entity_version: row.get("entity_version")?,
        timestamp_ms: row.get("timestamp_ms")?,
        actor_id: row.get("actor_id")?,
        causation_id: row.get("causation_id")?,
    })
}

fn parse_property_row(row: &Row<'_>) -> RepoResult<PropertyChange> {
    let change_id: String = row.get("change_id")?;
    Ok(PropertyChange {
        entity_change_id: parse_uuid(&change_id, "property_changes.change_id")?,
        property_name: row.get("property_name")?,
        old_value: decode_value(row.get("old_value")?, "property_changes.old_value")?,
        new_value: decode_value(row.get("new_value")?, "property_changes.new_value")?,
    })
}
