//! Core use-case services.
//!
//! # Responsibility
//! - Orchestrate sessions and repositories into use-case level APIs.
//! - Keep hosts (CLI, transport layers) decoupled from storage details.

pub mod aggregate_service;
