//! Lifecycle events published to the external event collaborator.
//!
//! Events are fire-and-forget notifications; nothing in the engine depends
//! on a subscriber existing.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::definition::StepId;
use crate::error::FailureKind;

/// A lifecycle transition worth telling the outside world about.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    InstanceStarted {
        instance_id: Uuid,
        definition_id: Uuid,
        definition_version: u32,
    },
    StepCompleted {
        instance_id: Uuid,
        step_id: StepId,
        task_id: Uuid,
        duration_ms: u64,
    },
    StepFailed {
        instance_id: Uuid,
        step_id: StepId,
        task_id: Uuid,
        kind: FailureKind,
        error: String,
    },
    InstancePaused {
        instance_id: Uuid,
        step_id: Option<StepId>,
    },
    InstanceResumed {
        instance_id: Uuid,
    },
    InstanceCompleted {
        instance_id: Uuid,
        tasks: u32,
    },
    InstanceFailed {
        instance_id: Uuid,
        step_id: StepId,
        error: String,
        unresolved_compensations: u32,
    },
    InstanceCancelled {
        instance_id: Uuid,
    },
    CompensationTriggered {
        instance_id: Uuid,
        records: u32,
    },
}

impl EngineEvent {
    /// The instance the event concerns.
    pub fn instance_id(&self) -> Uuid {
        match self {
            EngineEvent::InstanceStarted { instance_id, .. }
            | EngineEvent::StepCompleted { instance_id, .. }
            | EngineEvent::StepFailed { instance_id, .. }
            | EngineEvent::InstancePaused { instance_id, .. }
            | EngineEvent::InstanceResumed { instance_id }
            | EngineEvent::InstanceCompleted { instance_id, .. }
            | EngineEvent::InstanceFailed { instance_id, .. }
            | EngineEvent::InstanceCancelled { instance_id }
            | EngineEvent::CompensationTriggered { instance_id, .. } => *instance_id,
        }
    }
}
