//! Error taxonomy shared across the engine.
//!
//! Failures fall into four classes (spelled out so call sites never guess):
//! transient step failures are retried, permanent ones trigger compensation,
//! version conflicts are retried locally by re-reading, and structural
//! problems are rejected at publish time.

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ---------------------------------------------------------------------------
// Step failure classification
// ---------------------------------------------------------------------------

/// Classification of a step executor failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The call exceeded its per-attempt timeout.
    Timeout,
    /// The collaborator was unreachable or signalled unavailability.
    Unavailable,
    /// The collaborator rejected the call for load reasons.
    RateLimited,
    /// The collaborator rejected the input (permanent).
    Validation,
    /// A business rule rejected the operation (permanent).
    Business,
}

impl FailureKind {
    /// Whether failures of this kind are worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            FailureKind::Timeout | FailureKind::Unavailable | FailureKind::RateLimited
        )
    }
}

/// A classified failure returned by a step executor call.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[error("{kind:?}: {message}")]
pub struct StepFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl StepFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Timeout, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Unavailable, message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Validation, message)
    }

    pub fn business(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Business, message)
    }

    pub fn is_transient(&self) -> bool {
        self.kind.is_transient()
    }
}

// ---------------------------------------------------------------------------
// Lifecycle errors
// ---------------------------------------------------------------------------

/// A requested state transition is not in the transition table.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid transition from '{from}' to '{to}'")]
pub struct InvalidTransition {
    pub from: String,
    pub to: String,
}

impl InvalidTransition {
    pub fn new(from: impl std::fmt::Debug, to: impl std::fmt::Debug) -> Self {
        Self {
            from: format!("{from:?}").to_lowercase(),
            to: format!("{to:?}").to_lowercase(),
        }
    }
}

// ---------------------------------------------------------------------------
// Store errors
// ---------------------------------------------------------------------------

/// Errors from the instance persistence boundary.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// No record for the requested id.
    #[error("instance not found")]
    NotFound,

    /// Another writer persisted a mutation since this writer's read.
    #[error("version conflict: expected {expected}, found {found}")]
    VersionConflict { expected: u64, found: u64 },
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(FailureKind::Timeout.is_transient());
        assert!(FailureKind::Unavailable.is_transient());
        assert!(FailureKind::RateLimited.is_transient());
        assert!(!FailureKind::Validation.is_transient());
        assert!(!FailureKind::Business.is_transient());
    }

    #[test]
    fn step_failure_display() {
        let failure = StepFailure::timeout("no response after 30s");
        assert!(failure.to_string().contains("Timeout"));
        assert!(failure.to_string().contains("no response after 30s"));
        assert!(failure.is_transient());

        let failure = StepFailure::validation("schema mismatch");
        assert!(!failure.is_transient());
    }

    #[test]
    fn invalid_transition_display() {
        #[derive(Debug)]
        struct Completed;
        #[derive(Debug)]
        struct Running;
        let err = InvalidTransition::new(Completed, Running);
        assert_eq!(err.to_string(), "invalid transition from 'completed' to 'running'");
    }

    #[test]
    fn version_conflict_display() {
        let err = StoreError::VersionConflict {
            expected: 4,
            found: 6,
        };
        assert!(err.to_string().contains("expected 4"));
        assert!(err.to_string().contains("found 6"));
    }
}
