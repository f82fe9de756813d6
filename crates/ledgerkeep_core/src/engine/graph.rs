//! Generic walks over owned navigations.
//!
//! All walks only descend into loaded navigations and never touch
//! non-owned ones.

use crate::engine::{EngineError, EngineResult};
use crate::model::entity::{EdgeShape, Entity, EntityDescriptor, EntityKey, ModelError, OwnedEdge};
use std::collections::HashSet;
use uuid::Uuid;

/// Owning parent and edge of an owned entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ParentLink {
    pub key: EntityKey,
    pub edge: &'static str,
}

/// Position of an entity inside its aggregate.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Placement {
    pub root: EntityKey,
    pub parent: Option<ParentLink>,
    pub depth: usize,
}

pub(crate) fn unknown_navigation(descriptor: &'static EntityDescriptor, name: &str) -> ModelError {
    ModelError::UnknownNavigation {
        entity_type: descriptor.type_name,
        navigation: name.to_string(),
    }
}

pub(crate) fn edge_is_loaded(entity: &dyn Entity, edge: &OwnedEdge) -> EngineResult<bool> {
    let descriptor = entity.descriptor();
    let loaded = match edge.shape {
        EdgeShape::Reference => entity
            .reference(edge.name)
            .ok_or_else(|| unknown_navigation(descriptor, edge.name))?
            .is_loaded(),
        EdgeShape::Collection => entity
            .collection(edge.name)
            .ok_or_else(|| unknown_navigation(descriptor, edge.name))?
            .is_loaded(),
    };
    Ok(loaded)
}

/// Currently present owned children, in descriptor order.
pub(crate) fn owned_children<'a>(
    entity: &'a dyn Entity,
) -> EngineResult<Vec<(&'static OwnedEdge, &'a dyn Entity)>> {
    let descriptor = entity.descriptor();
    let mut children = Vec::new();
    for edge in descriptor.owned {
        match edge.shape {
            EdgeShape::Reference => {
                let nav = entity
                    .reference(edge.name)
                    .ok_or_else(|| unknown_navigation(descriptor, edge.name))?;
                if let Some(child) = nav.entity() {
                    children.push((edge, child));
                }
            }
            EdgeShape::Collection => {
                let nav = entity
                    .collection(edge.name)
                    .ok_or_else(|| unknown_navigation(descriptor, edge.name))?;
                for index in 0..nav.len() {
                    if let Some(child) = nav.entity_at(index) {
                        children.push((edge, child));
                    }
                }
            }
        }
    }
    Ok(children)
}

/// Pre-order walk from an aggregate root. An entity whose key was already
/// visited is skipped together with its subtree.
pub(crate) fn walk_tree<'a>(
    root: &'a dyn Entity,
    visit: &mut dyn FnMut(&'a dyn Entity, &Placement) -> EngineResult<()>,
) -> EngineResult<()> {
    let placement = Placement {
        root: root.key(),
        parent: None,
        depth: 0,
    };
    let mut visited = HashSet::new();
    walk_from(root, placement, &mut visited, visit)
}

fn walk_from<'a>(
    entity: &'a dyn Entity,
    placement: Placement,
    visited: &mut HashSet<EntityKey>,
    visit: &mut dyn FnMut(&'a dyn Entity, &Placement) -> EngineResult<()>,
) -> EngineResult<()> {
    let key = entity.key();
    if !visited.insert(key) {
        return Ok(());
    }
    visit(entity, &placement)?;

    for (edge, child) in owned_children(entity)? {
        let child_placement = Placement {
            root: placement.root,
            parent: Some(ParentLink {
                key,
                edge: edge.name,
            }),
            depth: placement.depth + 1,
        };
        walk_from(child, child_placement, visited, visit)?;
    }
    Ok(())
}

/// Pre-order mutable walk over present owned children.
pub(crate) fn visit_mut(
    entity: &mut dyn Entity,
    visit: &mut dyn FnMut(&mut dyn Entity) -> EngineResult<()>,
) -> EngineResult<()> {
    visit(entity)?;

    let descriptor = entity.descriptor();
    for edge in descriptor.owned {
        match edge.shape {
            EdgeShape::Reference => {
                let nav = entity
                    .reference_mut(edge.name)
                    .ok_or_else(|| unknown_navigation(descriptor, edge.name))?;
                if let Some(child) = nav.entity_mut() {
                    visit_mut(child, visit)?;
                }
            }
            EdgeShape::Collection => {
                let nav = entity
                    .collection_mut(edge.name)
                    .ok_or_else(|| unknown_navigation(descriptor, edge.name))?;
                for index in 0..nav.len() {
                    if let Some(child) = nav.entity_at_mut(index) {
                        visit_mut(child, visit)?;
                    }
                }
            }
        }
    }
    Ok(())
}

/// Gives every entity still carrying the nil key a fresh id.
pub(crate) fn assign_missing_ids(entity: &mut dyn Entity) -> EngineResult<()> {
    visit_mut(entity, &mut |member| {
        if member.meta().id.is_nil() {
            member.meta_mut().id = Uuid::new_v4();
        }
        Ok(())
    })
}

/// Readies a subtree that is about to be inserted: keys assigned, versions
/// reset, non-owned data dropped, unloaded navigations marked loaded-empty.
///
/// Returns the subtree keys in pre-order. A key listed twice is an
/// invariant violation.
pub(crate) fn prepare_new_subtree(entity: &mut dyn Entity) -> EngineResult<Vec<EntityKey>> {
    let mut keys = Vec::new();
    let mut seen = HashSet::new();
    visit_mut(entity, &mut |member| {
        let meta = member.meta_mut();
        if meta.id.is_nil() {
            meta.id = Uuid::new_v4();
        }
        meta.version = 0;
        meta.is_soft_deleted = false;
        member.clear_related();

        let descriptor = member.descriptor();
        for edge in descriptor.owned {
            match edge.shape {
                EdgeShape::Reference => {
                    let nav = member
                        .reference_mut(edge.name)
                        .ok_or_else(|| unknown_navigation(descriptor, edge.name))?;
                    if !nav.is_loaded() {
                        nav.replace_entity(None)?;
                    }
                }
                EdgeShape::Collection => member
                    .collection_mut(edge.name)
                    .ok_or_else(|| unknown_navigation(descriptor, edge.name))?
                    .mark_loaded(),
            }
        }

        let key = member.key();
        if !seen.insert(key) {
            return Err(EngineError::Invariant(format!(
                "new subtree lists {key} twice"
            )));
        }
        keys.push(key);
        Ok(())
    })?;
    Ok(keys)
}
