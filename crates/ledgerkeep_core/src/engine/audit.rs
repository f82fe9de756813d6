//! Change audit recorder.
//!
//! # Responsibility
//! - Derive `EntityChange`/`PropertyChange` records from the tracked
//!   mutation set, after version bumps and before the commit.
//!
//! # Invariants
//! - Audit-exempt types never produce a record; audit-exempt fields never
//!   produce a property change.
//! - Created lists every audited field, Deleted lists every audited field
//!   with its persisted value, Updated lists only fields that changed.
//! - Version is carried as `entity_version`, never as a property change.

use crate::engine::context::RequestContext;
use crate::engine::graph::walk_tree;
use crate::engine::tracker::{read_field, ChangeTracker, EntryState};
use crate::engine::EngineResult;
use crate::model::audit::{AuditEntry, ChangeType, EntityChange, PropertyChange};
use crate::model::entity::Entity;
use crate::model::value::FieldValue;
use uuid::Uuid;

/// Property name used when the soft-delete marker flips.
pub const SOFT_DELETE_PROPERTY: &str = "IsSoftDeleted";

/// Records for live aggregates (pre-order) followed by pending deletions
/// (children first).
pub fn record_changes(
    tracker: &ChangeTracker,
    roots: &[&dyn Entity],
    context: &RequestContext,
    timestamp_ms: i64,
) -> EngineResult<Vec<AuditEntry>> {
    let mut entries = Vec::new();

    for root in roots {
        walk_tree(*root, &mut |entity, _| {
            let descriptor = entity.descriptor();
            if !descriptor.audited {
                return Ok(());
            }
            let change_type = match tracker.entry_state(entity)? {
                EntryState::Added => ChangeType::Created,
                EntryState::Modified => ChangeType::Updated,
                EntryState::Deleted | EntryState::Unchanged => return Ok(()),
            };

            let change = new_change(
                descriptor.type_name,
                entity.id(),
                change_type,
                entity.version(),
                context,
                timestamp_ms,
            );
            let mut properties = Vec::new();
            let snapshot = tracker.snapshot(&entity.key());
            for field in descriptor.fields.iter().filter(|field| field.audited) {
                let current = read_field(entity, field.name)?;
                match (change_type, snapshot) {
                    (ChangeType::Updated, Some(snapshot)) => {
                        let before = snapshot
                            .fields
                            .get(field.name)
                            .cloned()
                            .unwrap_or(FieldValue::Null);
                        if before != current {
                            properties.push(property(change.id, field.name, before, current));
                        }
                    }
                    _ => properties.push(property(change.id, field.name, FieldValue::Null, current)),
                }
            }

            if let (ChangeType::Updated, Some(snapshot)) = (change_type, snapshot) {
                if snapshot.is_soft_deleted != entity.is_soft_deleted() {
                    properties.push(property(
                        change.id,
                        SOFT_DELETE_PROPERTY,
                        FieldValue::Bool(snapshot.is_soft_deleted),
                        FieldValue::Bool(entity.is_soft_deleted()),
                    ));
                }
            }

            entries.push(AuditEntry { change, properties });
            Ok(())
        })?;
    }

    for key in tracker.deleted() {
        let Some(snapshot) = tracker.snapshot(key) else {
            continue;
        };
        if !snapshot.descriptor.audited {
            continue;
        }
        let change = new_change(
            key.entity_type,
            key.id,
            ChangeType::Deleted,
            snapshot.version,
            context,
            timestamp_ms,
        );
        let properties = snapshot
            .descriptor
            .fields
            .iter()
            .filter(|field| field.audited)
            .map(|field| {
                let before = snapshot
                    .fields
                    .get(field.name)
                    .cloned()
                    .unwrap_or(FieldValue::Null);
                property(change.id, field.name, before, FieldValue::Null)
            })
            .collect();
        entries.push(AuditEntry { change, properties });
    }

    Ok(entries)
}

fn new_change(
    entity_type: &str,
    entity_id: Uuid,
    change_type: ChangeType,
    entity_version: i64,
    context: &RequestContext,
    timestamp_ms: i64,
) -> EntityChange {
    EntityChange {
        id: Uuid::new_v4(),
        entity_type: entity_type.to_string(),
        entity_id,
        change_type,
        entity_version,
        timestamp_ms,
        actor_id: context.actor_id.clone(),
        causation_id: context.causation_id.clone(),
    }
}

fn property(change_id: Uuid, name: &str, old: FieldValue, new: FieldValue) -> PropertyChange {
    PropertyChange {
        entity_change_id: change_id,
        property_name: name.to_string(),
        old_value: old.into_option(),
        new_value: new.into_option(),
    }
}
