//! Workflow orchestration engine.
//!
//! Definitions are versioned, immutable DAGs of typed steps; instances
//! execute against a pinned version under optimistic concurrency. The
//! scheduler resolves one step per read-compute-write cycle, with retry
//! and circuit-breaker middleware around executor calls, saga
//! compensation on failure, and lifecycle events published after each
//! persisted mutation.

pub mod breaker;
pub mod compensator;
pub mod config;
pub mod dag;
pub mod definitions;
pub mod engine;
pub mod events;
pub mod executor;
pub mod retry;
pub mod scheduler;
pub mod store;

pub use config::EngineConfig;
pub use engine::Engine;
pub use scheduler::EngineError;
