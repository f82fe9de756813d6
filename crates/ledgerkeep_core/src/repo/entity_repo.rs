//! Entity row storage for aggregates.
//!
//! # Responsibility
//! - Materialize an aggregate root and its eagerly loaded owned children.
//! - Apply row inserts, version-checked updates and version-checked deletes
//!   inside the caller's transaction.
//!
//! # Invariants
//! - Scalar fields are stored as one JSON object keyed by field name.
//! - Updates and deletes only apply when the persisted `version` equals the
//!   expected concurrency token.
//! - Navigations not named by the `LoadPlan` stay in the not-loaded state.

use crate::model::entity::{
    EdgeShape, Entity, EntityDescriptor, EntityId, EntityMeta, ModelError,
};
use crate::model::value::FieldValue;
use crate::repo::{bool_to_int, int_to_bool, parse_uuid, RepoError, RepoResult};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::{BTreeMap, BTreeSet, HashSet};

const ENTITY_SELECT_SQL: &str = "SELECT
    entity_id,
    entity_type,
    version,
    is_soft_deleted,
    fields
FROM entities";

/// Which owned navigations to fetch together with a root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadPlan {
    includes: Includes,
    include_soft_deleted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Includes {
    All,
    Paths(BTreeSet<String>),
}

impl LoadPlan {
    /// Eagerly fetches every owned navigation, recursively.
    pub fn all() -> Self {
        Self {
            includes: Includes::All,
            include_soft_deleted: false,
        }
    }

    /// Fetches the root row only.
    pub fn root_only() -> Self {
        Self {
            includes: Includes::Paths(BTreeSet::new()),
            include_soft_deleted: false,
        }
    }

    /// Fetches the named navigation paths (`"Items"`, `"Child.Details"`).
    ///
    /// Every prefix of a dotted path is fetched as well.
    pub fn paths<I, S>(paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut expanded = BTreeSet::new();
        for path in paths {
            let mut prefix = String::new();
            for segment in path.as_ref().split('.').filter(|segment| !segment.is_empty()) {
                if !prefix.is_empty() {
                    prefix.push('.');
                }
                prefix.push_str(segment.trim());
                expanded.insert(prefix.clone());
            }
        }
        Self {
            includes: Includes::Paths(expanded),
            include_soft_deleted: false,
        }
    }

    /// Also returns soft-deleted roots.
    pub fn including_soft_deleted(mut self) -> Self {
        self.include_soft_deleted = true;
        self
    }

    pub fn includes(&self, path: &str) -> bool {
        match &self.includes {
            Includes::All => true,
            Includes::Paths(paths) => paths.contains(path),
        }
    }

    pub fn includes_soft_deleted(&self) -> bool {
        self.include_soft_deleted
    }
}

impl Default for LoadPlan {
    fn default() -> Self {
        Self::all()
    }
}

/// Values written for one entity row.
#[derive(Debug, Clone)]
pub(crate) struct RowWrite<'a> {
    pub entity_id: EntityId,
    pub entity_type: &'static str,
    pub root_id: EntityId,
    pub parent: Option<(EntityId, &'static str)>,
    pub version: i64,
    pub is_soft_deleted: bool,
    pub fields: &'a BTreeMap<&'static str, FieldValue>,
}

/// Result of a version-checked write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WriteOutcome {
    Applied,
    /// No row matched the expected version; `current` is the persisted
    /// version, or `None` when the row is gone.
    VersionMismatch { current: Option<i64> },
}

struct StoredRow {
    entity_id: EntityId,
    entity_type: String,
    version: i64,
    is_soft_deleted: bool,
    fields: BTreeMap<String, FieldValue>,
}

/// SQLite-backed reader for aggregate rows.
pub struct SqliteEntityStore<'conn> {
    conn: &'conn Connection,
}

impl<'conn> SqliteEntityStore<'conn> {
    pub fn new(conn: &'conn Connection) -> Self {
        Self { conn }
    }

    /// Loads one aggregate root by id with owned navigations per `plan`.
    ///
    /// Returns `Ok(None)` when no root of this type exists, or when it is
    /// soft-deleted and the plan does not include soft-deleted rows.
    pub fn load_aggregate(
        &self,
        descriptor: &'static EntityDescriptor,
        id: EntityId,
        plan: &LoadPlan,
    ) -> RepoResult<Option<Box<dyn Entity>>> {
        let mut stmt = self.conn.prepare(&format!(
            "{ENTITY_SELECT_SQL}
             WHERE entity_id = ?1
               AND entity_type = ?2
               AND parent_id IS NULL
               AND (?3 = 1 OR is_soft_deleted = 0);"
        ))?;
        let row = stmt
            .query_row(
                params![
                    id.to_string(),
                    descriptor.type_name,
                    bool_to_int(plan.includes_soft_deleted())
                ],
                |row| Ok(read_row(row)),
            )
            .optional()?
            .transpose()?;

        let Some(row) = row else {
            return Ok(None);
        };

        let mut seen = HashSet::new();
        self.materialize(descriptor, row, "", plan, &mut seen)
            .map(Some)
    }

    /// Lists root ids of one entity type, oldest first.
    pub fn list_root_ids(
        &self,
        descriptor: &'static EntityDescriptor,
        include_soft_deleted: bool,
    ) -> RepoResult<Vec<EntityId>> {
        let mut stmt = self.conn.prepare(
            "SELECT entity_id
             FROM entities
             WHERE entity_type = ?1
               AND parent_id IS NULL
               AND (?2 = 1 OR is_soft_deleted = 0)
             ORDER BY created_at ASC, entity_id ASC;",
        )?;
        let mut rows = stmt.query(params![
            descriptor.type_name,
            bool_to_int(include_soft_deleted)
        ])?;
        let mut ids = Vec::new();
        while let Some(row) = rows.next()? {
            let text: String = row.get(0)?;
            ids.push(parse_uuid(&text, "entities.entity_id")?);
        }
        Ok(ids)
    }

    /// Persisted version of any entity row.
    pub fn current_version(&self, id: EntityId) -> RepoResult<Option<i64>> {
        current_version(self.conn, id)
    }

    fn materialize(
        &self,
        descriptor: &'static EntityDescriptor,
        row: StoredRow,
        path: &str,
        plan: &LoadPlan,
        seen: &mut HashSet<EntityId>,
    ) -> RepoResult<Box<dyn Entity>> {
        if row.entity_type != descriptor.type_name {
            return Err(RepoError::InvalidData(format!(
                "row {} has type `{}`, expected `{}`",
                row.entity_id, row.entity_type, descriptor.type_name
            )));
        }
        if !seen.insert(row.entity_id) {
            return Err(RepoError::InvalidData(format!(
                "row {} appears twice in one aggregate",
                row.entity_id
            )));
        }

        let mut entity = (descriptor.create)();
        *entity.meta_mut() = EntityMeta {
            id: row.entity_id,
            version: row.version,
            is_soft_deleted: row.is_soft_deleted,
        };

        let mut stored_fields = row.fields;
        for field in descriptor.fields {
            // Columns added after the row was written keep the type's default.
            if let Some(value) = stored_fields.remove(field.name) {
                entity.set_field(field.name, value)?;
            }
        }

        for edge in descriptor.owned {
            let edge_path = if path.is_empty() {
                edge.name.to_string()
            } else {
                format!("{path}.{}", edge.name)
            };
            if !plan.includes(&edge_path) {
                continue;
            }

            let target = (edge.target)();
            let child_rows = self.child_rows(row.entity_id, edge.name)?;
            match edge.shape {
                EdgeShape::Reference => {
                    if child_rows.len() > 1 {
                        return Err(RepoError::InvalidData(format!(
                            "reference `{}.{}` of {} has {} rows",
                            descriptor.type_name,
                            edge.name,
                            row.entity_id,
                            child_rows.len()
                        )));
                    }
                    let child = match child_rows.into_iter().next() {
                        Some(child_row) => {
                            Some(self.materialize(target, child_row, &edge_path, plan, seen)?)
                        }
                        None => None,
                    };
                    let nav = entity
                        .reference_mut(edge.name)
                        .ok_or_else(|| unknown_navigation(descriptor, edge.name))?;
                    nav.replace_entity(child)?;
                }
                EdgeShape::Collection => {
                    let mut children = Vec::with_capacity(child_rows.len());
                    for child_row in child_rows {
                        children.push(self.materialize(target, child_row, &edge_path, plan, seen)?);
                    }
                    let nav = entity
                        .collection_mut(edge.name)
                        .ok_or_else(|| unknown_navigation(descriptor, edge.name))?;
                    nav.mark_loaded();
                    for child in children {
                        nav.push_entity(child)?;
                    }
                }
            }
        }

        Ok(entity)
    }

    fn child_rows(&self, parent_id: EntityId, edge: &str) -> RepoResult<Vec<StoredRow>> {
        let mut stmt = self.conn.prepare(&format!(
            "{ENTITY_SELECT_SQL}
             WHERE parent_id = ?1
               AND parent_edge = ?2
             ORDER BY created_at ASC, entity_id ASC;"
        ))?;
        let mut rows = stmt.query(params![parent_id.to_string(), edge])?;
        let mut result = Vec::new();
        while let Some(row) = rows.next()? {
            result.push(read_row(row)?);
        }
        Ok(result)
    }
}

pub(crate) fn current_version(conn: &Connection, id: EntityId) -> RepoResult<Option<i64>> {
    let version = conn
        .query_row(
            "SELECT version FROM entities WHERE entity_id = ?1;",
            [id.to_string()],
            |row| row.get(0),
        )
        .optional()?;
    Ok(version)
}

pub(crate) fn insert_row(conn: &Connection, row: &RowWrite<'_>) -> RepoResult<()> {
    let (parent_id, parent_edge) = split_parent(row.parent);
    conn.execute(
        "INSERT INTO entities (
            entity_id,
            entity_type,
            root_id,
            parent_id,
            parent_edge,
            version,
            is_soft_deleted,
            fields
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8);",
        params![
            row.entity_id.to_string(),
            row.entity_type,
            row.root_id.to_string(),
            parent_id,
            parent_edge,
            row.version,
            bool_to_int(row.is_soft_deleted),
            encode_fields(row.fields)?,
        ],
    )?;
    Ok(())
}

pub(crate) fn update_row(
    conn: &Connection,
    row: &RowWrite<'_>,
    expected_version: i64,
) -> RepoResult<WriteOutcome> {
    let (parent_id, parent_edge) = split_parent(row.parent);
    let changed = conn.execute(
        "UPDATE entities
         SET
            root_id = ?3,
            parent_id = ?4,
            parent_edge = ?5,
            version = ?6,
            is_soft_deleted = ?7,
            fields = ?8,
            updated_at = (strftime('%s', 'now') * 1000)
         WHERE entity_id = ?1
           AND version = ?2;",
        params![
            row.entity_id.to_string(),
            expected_version,
            row.root_id.to_string(),
            parent_id,
            parent_edge,
            row.version,
            bool_to_int(row.is_soft_deleted),
            encode_fields(row.fields)?,
        ],
    )?;
    outcome(conn, row.entity_id, changed)
}

pub(crate) fn delete_row(
    conn: &Connection,
    entity_id: EntityId,
    expected_version: i64,
) -> RepoResult<WriteOutcome> {
    let changed = conn.execute(
        "DELETE FROM entities WHERE entity_id = ?1 AND version = ?2;",
        params![entity_id.to_string(), expected_version],
    )?;
    outcome(conn, entity_id, changed)
}

fn outcome(conn: &Connection, entity_id: EntityId, changed: usize) -> RepoResult<WriteOutcome> {
    if changed == 1 {
        return Ok(WriteOutcome::Applied);
    }
    Ok(WriteOutcome::VersionMismatch {
        current: current_version(conn, entity_id)?,
    })
}

fn split_parent(parent: Option<(EntityId, &'static str)>) -> (Option<String>, Option<&'static str>) {
    match parent {
        Some((id, edge)) => (Some(id.to_string()), Some(edge)),
        None => (None, None),
    }
}

fn encode_fields(fields: &BTreeMap<&'static str, FieldValue>) -> RepoResult<String> {
    serde_json::to_string(fields)
        .map_err(|err| RepoError::InvalidData(format!("cannot encode entity fields: {err}")))
}

fn read_row(row: &Row<'_>) -> RepoResult<StoredRow> {
    let id_text: String = row.get("entity_id")?;
    let fields_text: String = row.get("fields")?;
    let fields = serde_json::from_str(&fields_text).map_err(|err| {
        RepoError::InvalidData(format!(
            "invalid fields document for entity {id_text}: {err}"
        ))
    })?;

    Ok(StoredRow {
        entity_id: parse_uuid(&id_text, "entities.entity_id")?,
        entity_type: row.get("entity_type")?,
        version: row.get("version")?,
        is_soft_deleted: int_to_bool(row.get("is_soft_deleted")?, "entities.is_soft_deleted")?,
        fields,
    })
}

fn unknown_navigation(descriptor: &'static EntityDescriptor, name: &str) -> RepoError {
    RepoError::Model(ModelError::UnknownNavigation {
        entity_type: descriptor.type_name,
        navigation: name.to_string(),
    })
}
