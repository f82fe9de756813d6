//! Owned and non-owned navigation containers.
//!
//! # Responsibility
//! - Hold owned children (single reference or collection) together with
//!   their eager-load state.
//! - Expose object-safe views so the engine can walk any aggregate.
//!
//! # Invariants
//! - `Default` is the not-loaded state; constructors used for payloads and
//!   fresh aggregates produce loaded navigations.
//! - `Related<T>` is never exposed to the engine.

use crate::model::entity::{downcast_entity, Entity, ModelResult};

/// Engine view over an owned single reference.
pub trait ReferenceNav {
    fn is_loaded(&self) -> bool;
    fn entity(&self) -> Option<&dyn Entity>;
    fn entity_mut(&mut self) -> Option<&mut dyn Entity>;
    /// Replaces the referenced entity, marks the navigation loaded and
    /// returns the previous value.
    fn replace_entity(
        &mut self,
        value: Option<Box<dyn Entity>>,
    ) -> ModelResult<Option<Box<dyn Entity>>>;
}

/// Engine view over an owned collection.
pub trait CollectionNav {
    fn is_loaded(&self) -> bool;
    fn len(&self) -> usize;
    fn entity_at(&self, index: usize) -> Option<&dyn Entity>;
    fn entity_at_mut(&mut self, index: usize) -> Option<&mut dyn Entity>;
    fn push_entity(&mut self, value: Box<dyn Entity>) -> ModelResult<()>;
    fn remove_entity(&mut self, index: usize) -> Option<Box<dyn Entity>>;
    fn mark_loaded(&mut self);

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Position of the member with the given id.
    fn position_of(&self, id: uuid::Uuid) -> Option<usize> {
        (0..self.len()).find(|index| self.entity_at(*index).map(|member| member.id()) == Some(id))
    }
}

/// Owned single reference (nullable or required by convention).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnedRef<T> {
    loaded: bool,
    value: Option<Box<T>>,
}

impl<T> OwnedRef<T> {
    /// Loaded reference to `value`.
    pub fn new(value: T) -> Self {
        Self {
            loaded: true,
            value: Some(Box::new(value)),
        }
    }

    /// Loaded, empty reference.
    pub fn empty() -> Self {
        Self {
            loaded: true,
            value: None,
        }
    }

    /// Reference that was not fetched from storage.
    pub fn not_loaded() -> Self {
        Self {
            loaded: false,
            value: None,
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    pub fn get(&self) -> Option<&T> {
        self.value.as_deref()
    }

    pub fn get_mut(&mut self) -> Option<&mut T> {
        self.value.as_deref_mut()
    }

    pub fn set(&mut self, value: Option<T>) {
        self.loaded = true;
        self.value = value.map(Box::new);
    }
}

impl<T> Default for OwnedRef<T> {
    fn default() -> Self {
        Self::not_loaded()
    }
}

impl<T: Entity> ReferenceNav for OwnedRef<T> {
    fn is_loaded(&self) -> bool {
        self.loaded
    }

    fn entity(&self) -> Option<&dyn Entity> {
        self.value.as_deref().map(|value| value as &dyn Entity)
    }

    fn entity_mut(&mut self) -> Option<&mut dyn Entity> {
        self.value.as_deref_mut().map(|value| value as &mut dyn Entity)
    }

    fn replace_entity(
        &mut self,
        value: Option<Box<dyn Entity>>,
    ) -> ModelResult<Option<Box<dyn Entity>>> {
        let next = value.map(downcast_entity::<T>).transpose()?;
        self.loaded = true;
        let previous = std::mem::replace(&mut self.value, next);
        Ok(previous.map(|value| value as Box<dyn Entity>))
    }
}

/// Owned collection; members are told apart by id, order is irrelevant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnedMany<T> {
    loaded: bool,
    items: Vec<T>,
}

impl<T> OwnedMany<T> {
    /// Loaded collection holding `items`.
    pub fn new(items: Vec<T>) -> Self {
        Self {
            loaded: true,
            items,
        }
    }

    /// Loaded, empty collection.
    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    /// Collection that was not fetched from storage.
    pub fn not_loaded() -> Self {
        Self {
            loaded: false,
            items: Vec::new(),
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    pub fn items(&self) -> &[T] {
        &self.items
    }

    pub fn items_mut(&mut self) -> &mut Vec<T> {
        &mut self.items
    }

    pub fn push(&mut self, item: T) {
        self.loaded = true;
        self.items.push(item);
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl<T> Default for OwnedMany<T> {
    fn default() -> Self {
        Self::not_loaded()
    }
}

impl<T: Entity> CollectionNav for OwnedMany<T> {
    fn is_loaded(&self) -> bool {
        self.loaded
    }

    fn len(&self) -> usize {
        self.items.len()
    }

    fn entity_at(&self, index: usize) -> Option<&dyn Entity> {
        self.items.get(index).map(|item| item as &dyn Entity)
    }

    fn entity_at_mut(&mut self, index: usize) -> Option<&mut dyn Entity> {
        self.items.get_mut(index).map(|item| item as &mut dyn Entity)
    }

    fn push_entity(&mut self, value: Box<dyn Entity>) -> ModelResult<()> {
        let item = downcast_entity::<T>(value)?;
        self.loaded = true;
        self.items.push(*item);
        Ok(())
    }

    fn remove_entity(&mut self, index: usize) -> Option<Box<dyn Entity>> {
        if index >= self.items.len() {
            return None;
        }
        let item = self.items.remove(index);
        Some(Box::new(item))
    }

    fn mark_loaded(&mut self) {
        self.loaded = true;
    }
}

/// Non-owned navigation to an independent aggregate (for example a lookup).
///
/// Populated by callers for display purposes only. Merge never reads it and
/// storage never writes it; the persisted relationship lives in a scalar
/// foreign-key field on the owning entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Related<T> {
    value: Option<T>,
}

impl<T> Related<T> {
    pub fn new(value: T) -> Self {
        Self { value: Some(value) }
    }

    pub fn none() -> Self {
        Self { value: None }
    }

    pub fn get(&self) -> Option<&T> {
        self.value.as_ref()
    }

    pub fn clear(&mut self) {
        self.value = None;
    }
}

impl<T> Default for Related<T> {
    fn default() -> Self {
        Self::none()
    }
}
