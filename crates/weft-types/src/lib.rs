//! Shared domain types for the weft workflow engine.
//!
//! Definitions (the immutable step DAG), instances (one execution with its
//! tasks and optimistic-concurrency version), compensation records, lifecycle
//! events, and the error taxonomy.
//!
//! Zero infrastructure dependencies -- only serde, serde_json, uuid, chrono,
//! thiserror.

pub mod compensation;
pub mod definition;
pub mod error;
pub mod event;
pub mod instance;
pub mod predicate;
