//! Core types and error definitions for the Orkestra workspace.
//!
//! This crate provides the foundational types shared across all Orkestra crates:
//! the unified error enum, task type taxonomy, and agent roles.
//!
//! # Main types
//!
//! - [`OrkestraError`]: Unified error enum for all Orkestra subsystems.
//! - [`OrkestraResult`]: Convenience alias for `Result<T, OrkestraError>`.
//! - [`TaskType`]: The kind of work a task performs (plan, code, test, ...).
//! - [`AgentRole`]: The role an agent plays; drives bus permissions and ownership.

/// Error types.
pub mod error;
/// Task types and agent roles.
pub mod role;

pub use error::{OrkestraError, OrkestraResult};
pub use role::{AgentRole, TaskType};

/// Identifier of a task inside a task graph.
pub type TaskId = String;
