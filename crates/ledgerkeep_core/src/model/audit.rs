//! Audit trail records.
//!
//! # Invariants
//! - Records are append-only; nothing in the crate updates a stored record.
//! - `entity_version` is the version the entity carries after the commit
//!   that produced the record (last known version for deletions).

use crate::model::entity::EntityId;
use crate::model::value::FieldValue;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Kind of mutation an `EntityChange` describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    Created,
    Updated,
    Deleted,
}

impl ChangeType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Updated => "updated",
            Self::Deleted => "deleted",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "created" => Some(Self::Created),
            "updated" => Some(Self::Updated),
            "deleted" => Some(Self::Deleted),
            _ => None,
        }
    }
}

/// One audited mutation of one entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityChange {
    pub id: Uuid,
    pub entity_type: String,
    pub entity_id: EntityId,
    pub change_type: ChangeType,
    pub entity_version: i64,
    /// Unix epoch milliseconds (UTC).
    pub timestamp_ms: i64,
    pub actor_id: Option<String>,
    pub causation_id: Option<String>,
}

/// One field-level difference belonging to an `EntityChange`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertyChange {
    pub entity_change_id: Uuid,
    pub property_name: String,
    pub old_value: Option<FieldValue>,
    pub new_value: Option<FieldValue>,
}

/// An entity change together with its property changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub change: EntityChange,
    pub properties: Vec<PropertyChange>,
}

impl AuditEntry {
    /// Finds the property change for `name`, if recorded.
    pub fn property(&self, name: &str) -> Option<&PropertyChange> {
        self.properties
            .iter()
            .find(|property| property.property_name == name)
    }
}
