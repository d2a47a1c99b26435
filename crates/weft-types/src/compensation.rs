//! Saga compensation as first-class data.
//!
//! Instead of exception-driven rollback, every undo is a queued record with
//! its own status, so a partially failed unwind stays observable and
//! operable rather than swallowed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::definition::StepId;

// ---------------------------------------------------------------------------
// Compensation action
// ---------------------------------------------------------------------------

/// Descriptor of the action that semantically undoes a completed task.
///
/// Actions must be idempotent: the compensator may retry them through the
/// same retry middleware as forward execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompensationAction {
    /// Action name understood by the executor (e.g. "delete-draft").
    pub name: String,
    /// Opaque action payload handed to the executor.
    #[serde(default)]
    pub config: Value,
}

// ---------------------------------------------------------------------------
// Compensation record
// ---------------------------------------------------------------------------

/// Status of one compensation record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompensationStatus {
    Pending,
    Executing,
    Completed,
    Failed,
}

/// One queued undo for a previously completed task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompensationRecord {
    /// UUIDv7 record id.
    pub id: Uuid,
    /// The completed task this record compensates.
    pub task_id: Uuid,
    /// Step that produced the task (denormalized for operators).
    pub step_id: StepId,
    /// The registered compensation action.
    pub action: CompensationAction,
    /// Current record status.
    pub status: CompensationStatus,
    /// Error detail when the action failed after its own retries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// When the record was created (unwind start).
    pub created_at: DateTime<Utc>,
    /// When the action finished, successfully or not.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl CompensationRecord {
    /// Create a pending record for a task.
    pub fn new(task_id: Uuid, step_id: StepId, action: CompensationAction) -> Self {
        Self {
            id: Uuid::now_v7(),
            task_id,
            step_id,
            action,
            status: CompensationStatus::Pending,
            error: None,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    /// Mark the action as in flight.
    pub fn start(&mut self) {
        self.status = CompensationStatus::Executing;
    }

    /// Mark the action as completed.
    pub fn complete(&mut self) {
        self.status = CompensationStatus::Completed;
        self.completed_at = Some(Utc::now());
    }

    /// Mark the action as failed; the unwind continues past it.
    pub fn fail(&mut self, error: impl Into<String>) {
        self.status = CompensationStatus::Failed;
        self.error = Some(error.into());
        self.completed_at = Some(Utc::now());
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
