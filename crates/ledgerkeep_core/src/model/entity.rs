//! Entity contract and static type descriptors.
//!
//! # Responsibility
//! - Define identity/version bookkeeping shared by aggregate roots and
//!   owned members.
//! - Describe each entity type's scalar fields and ownership edges so the
//!   engine can walk any aggregate without runtime reflection.
//!
//! # Invariants
//! - `EntityMeta::id` is assigned once and never regenerated; the nil UUID
//!   means "not assigned yet".
//! - `EntityMeta::version` starts at 1 for persisted rows and is only
//!   changed by the version updater.
//! - Ownership is declared on the descriptor, never per instance.

use crate::model::navigation::{CollectionNav, ReferenceNav};
use crate::model::value::{FieldType, FieldValue};
use once_cell::sync::Lazy;
use regex::Regex;
use std::any::Any;
use std::collections::BTreeSet;
use std::error::Error;
use std::fmt::{Debug, Display, Formatter};
use uuid::Uuid;

static IDENTIFIER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z][A-Za-z0-9_]*$").expect("valid identifier regex"));

/// Stable identifier shared by every entity, owned or root.
pub type EntityId = Uuid;

pub type ModelResult<T> = Result<T, ModelError>;

/// Errors raised when an entity implementation disagrees with its descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelError {
    UnknownField {
        entity_type: &'static str,
        field: String,
    },
    FieldTypeMismatch {
        entity_type: &'static str,
        field: String,
        expected: &'static str,
        actual: &'static str,
    },
    UnknownNavigation {
        entity_type: &'static str,
        navigation: String,
    },
    EntityTypeMismatch {
        expected: &'static str,
        actual: &'static str,
    },
    InvalidDescriptor {
        entity_type: &'static str,
        message: String,
    },
}

impl Display for ModelError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownField { entity_type, field } => {
                write!(f, "entity type `{entity_type}` has no field `{field}`")
            }
            Self::FieldTypeMismatch {
                entity_type,
                field,
                expected,
                actual,
            } => write!(
                f,
                "field `{entity_type}.{field}` expects {expected}, got {actual}"
            ),
            Self::UnknownNavigation {
                entity_type,
                navigation,
            } => write!(
                f,
                "entity type `{entity_type}` has no owned navigation `{navigation}`"
            ),
            Self::EntityTypeMismatch { expected, actual } => {
                write!(f, "expected entity type `{expected}`, got `{actual}`")
            }
            Self::InvalidDescriptor {
                entity_type,
                message,
            } => write!(f, "invalid descriptor for `{entity_type}`: {message}"),
        }
    }
}

impl Error for ModelError {}

/// Identity of one entity across the whole store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EntityKey {
    pub entity_type: &'static str,
    pub id: EntityId,
}

impl EntityKey {
    pub fn new(entity_type: &'static str, id: EntityId) -> Self {
        Self { entity_type, id }
    }
}

impl Display for EntityKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.entity_type, self.id)
    }
}

/// Identity/version bookkeeping embedded in every entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityMeta {
    pub id: EntityId,
    /// Optimistic-concurrency token. `0` on detached payloads means
    /// "not supplied by the client".
    pub version: i64,
    /// Logical-delete marker; soft-deleted roots are hidden from normal reads.
    pub is_soft_deleted: bool,
}

impl EntityMeta {
    /// Meta for a brand-new entity with a generated id.
    pub fn new() -> Self {
        Self::with_id(Uuid::new_v4())
    }

    /// Meta for an entity whose id is already known.
    pub fn with_id(id: EntityId) -> Self {
        Self {
            id,
            version: 0,
            is_soft_deleted: false,
        }
    }

    /// Meta with the unset key; the engine assigns an id on insert.
    pub fn unassigned() -> Self {
        Self::with_id(Uuid::nil())
    }
}

impl Default for EntityMeta {
    fn default() -> Self {
        Self::unassigned()
    }
}

/// Scalar field declaration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldDescriptor {
    pub name: &'static str,
    /// `false` excludes this field from every audit record.
    pub audited: bool,
}

impl FieldDescriptor {
    pub const fn audited(name: &'static str) -> Self {
        Self { name, audited: true }
    }

    pub const fn exempt(name: &'static str) -> Self {
        Self {
            name,
            audited: false,
        }
    }
}

/// Shape of an owned navigation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeShape {
    Reference,
    Collection,
}

/// Owned navigation declaration.
#[derive(Clone, Copy)]
pub struct OwnedEdge {
    pub name: &'static str,
    pub shape: EdgeShape,
    /// Target descriptor, resolved lazily so schemas may own their own type.
    pub target: fn() -> &'static EntityDescriptor,
}

impl OwnedEdge {
    pub const fn reference(name: &'static str, target: fn() -> &'static EntityDescriptor) -> Self {
        Self {
            name,
            shape: EdgeShape::Reference,
            target,
        }
    }

    pub const fn collection(
        name: &'static str,
        target: fn() -> &'static EntityDescriptor,
    ) -> Self {
        Self {
            name,
            shape: EdgeShape::Collection,
            target,
        }
    }
}

impl Debug for OwnedEdge {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OwnedEdge")
            .field("name", &self.name)
            .field("shape", &self.shape)
            .field("target", &(self.target)().type_name)
            .finish()
    }
}

/// Static per-type schema consumed by the engine.
pub struct EntityDescriptor {
    pub type_name: &'static str,
    /// `false` means the type never produces audit records.
    pub audited: bool,
    pub fields: &'static [FieldDescriptor],
    pub owned: &'static [OwnedEdge],
    /// Non-owned navigations. Listed for introspection only; the engine
    /// never reads or writes them.
    pub related: &'static [&'static str],
    /// Blank instance factory used when materializing stored rows.
    pub create: fn() -> Box<dyn Entity>,
}

impl EntityDescriptor {
    pub fn field(&self, name: &str) -> Option<&'static FieldDescriptor> {
        self.fields.iter().find(|field| field.name == name)
    }

    pub fn edge(&self, name: &str) -> Option<&'static OwnedEdge> {
        self.owned.iter().find(|edge| edge.name == name)
    }

    /// Checks identifier shape and name uniqueness.
    pub fn validate(&self) -> ModelResult<()> {
        let invalid = |message: String| ModelError::InvalidDescriptor {
            entity_type: self.type_name,
            message,
        };

        if !IDENTIFIER_RE.is_match(self.type_name) {
            return Err(invalid("type name is not an identifier".to_string()));
        }

        let mut seen = BTreeSet::new();
        let names = self
            .fields
            .iter()
            .map(|field| field.name)
            .chain(self.owned.iter().map(|edge| edge.name))
            .chain(self.related.iter().copied());
        for name in names {
            if !IDENTIFIER_RE.is_match(name) {
                return Err(invalid(format!("member `{name}` is not an identifier")));
            }
            if !seen.insert(name) {
                return Err(invalid(format!("member `{name}` is declared twice")));
            }
        }

        Ok(())
    }
}

impl Debug for EntityDescriptor {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityDescriptor")
            .field("type_name", &self.type_name)
            .field("audited", &self.audited)
            .field("fields", &self.fields)
            .field("owned", &self.owned)
            .field("related", &self.related)
            .finish()
    }
}

/// Upcast helpers, implemented for every `'static` type.
pub trait AsAny: Any {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
    fn into_any(self: Box<Self>) -> Box<dyn Any>;
}

impl<T: Any> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any> {
        self
    }
}

/// Object-safe clone, implemented for every `Entity + Clone`.
pub trait EntityClone {
    fn clone_entity(&self) -> Box<dyn Entity>;
}

impl<T: Entity + Clone> EntityClone for T {
    fn clone_entity(&self) -> Box<dyn Entity> {
        Box::new(self.clone())
    }
}

/// Contract every aggregate root and owned member implements.
///
/// Implementations map descriptor names onto struct fields. The engine
/// only goes through these methods, so an implementation that answers
/// `None` for a declared name is reported as a model error.
pub trait Entity: AsAny + EntityClone + Debug {
    /// Descriptor for the concrete type, without an instance.
    fn entity_descriptor() -> &'static EntityDescriptor
    where
        Self: Sized;

    fn descriptor(&self) -> &'static EntityDescriptor;
    fn meta(&self) -> &EntityMeta;
    fn meta_mut(&mut self) -> &mut EntityMeta;

    /// Current value of a declared scalar field.
    fn field(&self, name: &str) -> Option<FieldValue>;
    /// Overwrites a declared scalar field.
    fn set_field(&mut self, name: &str, value: FieldValue) -> ModelResult<()>;

    fn reference(&self, _name: &str) -> Option<&dyn ReferenceNav> {
        None
    }

    fn reference_mut(&mut self, _name: &str) -> Option<&mut dyn ReferenceNav> {
        None
    }

    fn collection(&self, _name: &str) -> Option<&dyn CollectionNav> {
        None
    }

    fn collection_mut(&mut self, _name: &str) -> Option<&mut dyn CollectionNav> {
        None
    }

    /// Drops any data held in non-owned navigations.
    fn clear_related(&mut self) {}

    fn id(&self) -> EntityId {
        self.meta().id
    }

    fn version(&self) -> i64 {
        self.meta().version
    }

    fn is_soft_deleted(&self) -> bool {
        self.meta().is_soft_deleted
    }

    fn key(&self) -> EntityKey {
        EntityKey::new(self.descriptor().type_name, self.meta().id)
    }
}

/// Assigns a typed struct field from an engine value.
pub fn assign_field<T: FieldType>(
    slot: &mut T,
    value: FieldValue,
    entity_type: &'static str,
    field: &str,
) -> ModelResult<()> {
    match T::from_field_value(value) {
        Ok(parsed) => {
            *slot = parsed;
            Ok(())
        }
        Err(rejected) => Err(ModelError::FieldTypeMismatch {
            entity_type,
            field: field.to_string(),
            expected: T::KIND,
            actual: rejected.kind_name(),
        }),
    }
}

/// Error for a name the descriptor does not declare.
pub fn unknown_field(entity_type: &'static str, field: &str) -> ModelError {
    ModelError::UnknownField {
        entity_type,
        field: field.to_string(),
    }
}

/// Converts a boxed entity back into its concrete type.
pub fn downcast_entity<T: Entity>(entity: Box<dyn Entity>) -> ModelResult<Box<T>> {
    let actual = entity.descriptor().type_name;
    entity
        .into_any()
        .downcast::<T>()
        .map_err(|_| ModelError::EntityTypeMismatch {
            expected: T::entity_descriptor().type_name,
            actual,
        })
}

/// Borrows a dynamic entity as its concrete type.
pub fn downcast_entity_ref<T: Entity>(entity: &dyn Entity) -> ModelResult<&T> {
    entity
        .as_any()
        .downcast_ref::<T>()
        .ok_or(ModelError::EntityTypeMismatch {
            expected: T::entity_descriptor().type_name,
            actual: entity.descriptor().type_name,
        })
}

/// Mutably borrows a dynamic entity as its concrete type.
pub fn downcast_entity_mut<T: Entity>(entity: &mut dyn Entity) -> ModelResult<&mut T> {
    let actual = entity.descriptor().type_name;
    entity
        .as_any_mut()
        .downcast_mut::<T>()
        .ok_or(ModelError::EntityTypeMismatch {
            expected: T::entity_descriptor().type_name,
            actual,
        })
}
