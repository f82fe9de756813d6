//! Aggregate model shared by the engine and storage layers.
//!
//! # Responsibility
//! - Define identity/version/soft-delete bookkeeping for every entity.
//! - Declare ownership edges statically through per-type descriptors.
//! - Define the audit record shapes.
//!
//! # Invariants
//! - Every entity is identified by a stable `EntityId`.
//! - Owned children live inside their parent's navigations; non-owned
//!   relationships are plain foreign-key fields plus `Related<T>` holders.

pub mod audit;
pub mod entity;
pub mod navigation;
pub mod value;
