//! Scalar field values shared by the engine, storage and audit layers.
//!
//! # Responsibility
//! - Define the closed set of scalar shapes an entity field may hold.
//! - Convert between typed struct fields and engine-level values.
//!
//! # Invariants
//! - `FieldValue` equality is the only notion of "changed" used by merge,
//!   dirty detection and audit diffs.
//! - `FieldValue::Null` is the canonical absent value; audit records store
//!   it as a missing old/new value.

use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use uuid::Uuid;

/// One scalar field value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum FieldValue {
    Null,
    Bool(bool),
    Integer(i64),
    Text(String),
    Id(Uuid),
}

impl FieldValue {
    /// Short lowercase name used in error messages.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Integer(_) => "integer",
            Self::Text(_) => "text",
            Self::Id(_) => "id",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Maps `Null` to `None` for audit storage.
    pub fn into_option(self) -> Option<FieldValue> {
        if self.is_null() {
            None
        } else {
            Some(self)
        }
    }
}

impl Display for FieldValue {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Null => write!(f, "null"),
            Self::Bool(value) => write!(f, "{value}"),
            Self::Integer(value) => write!(f, "{value}"),
            Self::Text(value) => write!(f, "{value}"),
            Self::Id(value) => write!(f, "{value}"),
        }
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

/// Conversion contract between a typed struct field and `FieldValue`.
///
/// `from_field_value` returns the rejected value on shape mismatch so the
/// caller can build a precise error.
pub trait FieldType: Sized {
    /// Expected shape name for error messages.
    const KIND: &'static str;

    fn to_field_value(&self) -> FieldValue;
    fn from_field_value(value: FieldValue) -> Result<Self, FieldValue>;
}

impl FieldType for String {
    const KIND: &'static str = "text";

    fn to_field_value(&self) -> FieldValue {
        FieldValue::Text(self.clone())
    }

    fn from_field_value(value: FieldValue) -> Result<Self, FieldValue> {
        match value {
            FieldValue::Text(text) => Ok(text),
            other => Err(other),
        }
    }
}

impl FieldType for i64 {
    const KIND: &'static str = "integer";

    fn to_field_value(&self) -> FieldValue {
        FieldValue::Integer(*self)
    }

    fn from_field_value(value: FieldValue) -> Result<Self, FieldValue> {
        match value {
            FieldValue::Integer(number) => Ok(number),
            other => Err(other),
        }
    }
}

impl FieldType for bool {
    const KIND: &'static str = "bool";

    fn to_field_value(&self) -> FieldValue {
        FieldValue::Bool(*self)
    }

    fn from_field_value(value: FieldValue) -> Result<Self, FieldValue> {
        match value {
            FieldValue::Bool(flag) => Ok(flag),
            other => Err(other),
        }
    }
}

impl FieldType for Uuid {
    const KIND: &'static str = "id";

    fn to_field_value(&self) -> FieldValue {
        FieldValue::Id(*self)
    }

    fn from_field_value(value: FieldValue) -> Result<Self, FieldValue> {
        match value {
            FieldValue::Id(id) => Ok(id),
            // Ids that went through a text column come back as text.
            FieldValue::Text(text) => Uuid::parse_str(&text).map_err(|_| FieldValue::Text(text)),
            other => Err(other),
        }
    }
}

impl<T: FieldType> FieldType for Option<T> {
    const KIND: &'static str = T::KIND;

    fn to_field_value(&self) -> FieldValue {
        match self {
            Some(value) => value.to_field_value(),
            None => FieldValue::Null,
        }
    }

    fn from_field_value(value: FieldValue) -> Result<Self, FieldValue> {
        match value {
            FieldValue::Null => Ok(None),
            other => T::from_field_value(other).map(Some),
        }
    }
}
