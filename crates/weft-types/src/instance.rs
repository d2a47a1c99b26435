//! Workflow instance and task execution records.
//!
//! `WorkflowInstance` is the single mutable shared resource in the engine:
//! every persisted mutation bumps its `version`, and writers must present the
//! version they read (optimistic concurrency, enforced by the store). The
//! state machines for instances and tasks are explicit transition tables so
//! illegal moves fail with `InvalidTransition` instead of silently happening.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::compensation::CompensationRecord;
use crate::definition::{StepId, WorkflowDefinition};
use crate::error::{FailureKind, InvalidTransition, StepFailure};
use crate::predicate::Context;

// ---------------------------------------------------------------------------
// Instance state machine
// ---------------------------------------------------------------------------

/// Lifecycle state of a workflow instance.
///
/// `pending -> running -> {completed | failed | cancelled}`, with
/// `running <-> paused` as the reversible side transition. Terminal states
/// are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl InstanceState {
    /// Whether this state admits no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            InstanceState::Completed | InstanceState::Failed | InstanceState::Cancelled
        )
    }

    /// The transition table from §state machine, as a predicate.
    pub fn can_transition(&self, to: InstanceState) -> bool {
        use InstanceState::*;
        matches!(
            (self, to),
            (Pending, Running)
                | (Pending, Cancelled)
                | (Running, Paused)
                | (Paused, Running)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Paused, Cancelled)
                | (Paused, Failed)
        )
    }
}

// ---------------------------------------------------------------------------
// DAG cursor
// ---------------------------------------------------------------------------

/// Where the scheduler resumes within the definition graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Position {
    /// About to process the named step.
    Step { id: StepId },
    /// A loop body finished; evaluate the named loop's predicate next.
    LoopEval { id: StepId },
}

impl Position {
    pub fn step(id: impl Into<StepId>) -> Self {
        Position::Step { id: id.into() }
    }
}

// ---------------------------------------------------------------------------
// Tasks
// ---------------------------------------------------------------------------

/// Status of one task. Transitions are strictly monotonic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
    Compensated,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TaskStatus::Pending | TaskStatus::Running)
    }

    /// Monotonic transition table: no status ever returns toward `Pending`.
    pub fn can_transition(&self, to: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, to),
            (Pending, Running)
                | (Pending, Skipped)
                | (Running, Completed)
                | (Running, Failed)
                | (Completed, Compensated)
        )
    }
}

/// What kind of work a task records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// An executor-backed agent call.
    Agent,
    /// An executor-backed validation call.
    Validation,
    /// A decision evaluation (records the branch taken).
    Decision,
    /// A loop-iteration evaluation (records the verdict).
    LoopEval,
    /// A human-approval gate (completes on resume).
    Approval,
}

/// The execution record of one step within one instance.
///
/// Exactly one task exists per reached step per attempt-batch; retries
/// increment `attempt_count` on the same record rather than creating a new
/// one, and `attempt_count` never exceeds `max_attempts`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// UUIDv7 task id.
    pub id: Uuid,
    /// The step this task executes.
    pub step_id: StepId,
    /// Task kind.
    pub kind: TaskKind,
    /// Current status.
    pub status: TaskStatus,
    /// Input snapshot handed to the executor.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
    /// Executor output on completion.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    /// Attempts consumed so far (1-based once running).
    pub attempt_count: u32,
    /// Attempt ceiling.
    pub max_attempts: u32,
    /// Final failure when the task failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StepFailure>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Wall-clock duration in milliseconds, set at completion.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

impl Task {
    /// Create a pending task for a step.
    pub fn new(step_id: impl Into<StepId>, kind: TaskKind, max_attempts: u32) -> Self {
        Self {
            id: Uuid::now_v7(),
            step_id: step_id.into(),
            kind,
            status: TaskStatus::Pending,
            input: None,
            output: None,
            attempt_count: 0,
            max_attempts,
            error: None,
            started_at: None,
            completed_at: None,
            duration_ms: None,
        }
    }

    fn transition(&mut self, to: TaskStatus) -> Result<(), InvalidTransition> {
        if !self.status.can_transition(to) {
            return Err(InvalidTransition::new(self.status, to));
        }
        self.status = to;
        Ok(())
    }

    /// Mark the task as running.
    pub fn start(&mut self) -> Result<(), InvalidTransition> {
        self.transition(TaskStatus::Running)?;
        self.started_at = Some(Utc::now());
        Ok(())
    }

    /// Mark the task completed with its output.
    pub fn complete(&mut self, output: Value) -> Result<(), InvalidTransition> {
        self.transition(TaskStatus::Completed)?;
        self.output = Some(output);
        self.finish_clock();
        Ok(())
    }

    /// Mark the task failed with its classified error.
    pub fn fail(&mut self, error: StepFailure) -> Result<(), InvalidTransition> {
        self.transition(TaskStatus::Failed)?;
        self.error = Some(error);
        self.finish_clock();
        Ok(())
    }

    /// Mark a never-started task as skipped.
    pub fn skip(&mut self) -> Result<(), InvalidTransition> {
        self.transition(TaskStatus::Skipped)?;
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    /// Mark a completed task as compensated.
    pub fn mark_compensated(&mut self) -> Result<(), InvalidTransition> {
        self.transition(TaskStatus::Compensated)
    }

    fn finish_clock(&mut self) {
        let now = Utc::now();
        if let Some(started) = self.started_at {
            self.duration_ms = Some((now - started).num_milliseconds().max(0) as u64);
        }
        self.completed_at = Some(now);
    }
}

// ---------------------------------------------------------------------------
// Failure detail
// ---------------------------------------------------------------------------

/// Structured failure reason surfaced through the control API.
///
/// Never raw stack detail: the failed step, the error classification, and the
/// ids of compensations left unresolved for operator attention.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureDetail {
    pub step_id: StepId,
    pub kind: FailureKind,
    pub message: String,
    #[serde(default)]
    pub unresolved_compensations: Vec<Uuid>,
}

// ---------------------------------------------------------------------------
// Workflow instance
// ---------------------------------------------------------------------------

/// One execution of a workflow definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowInstance {
    /// UUIDv7 instance id.
    pub id: Uuid,
    /// Definition identity this instance executes.
    pub definition_id: Uuid,
    /// Pinned definition version.
    pub definition_version: u32,
    /// Lifecycle state.
    pub state: InstanceState,
    /// Shared key/value context; step outputs land under their step id.
    pub context: Context,
    /// Ordered task records, in dispatch order.
    pub tasks: Vec<Task>,
    /// Optimistic-concurrency version, bumped on every persisted mutation.
    pub version: u64,
    /// Scheduler cursor; `None` on a terminal or not-yet-started instance.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<Position>,
    /// Innermost-last stack of active loop step ids.
    #[serde(default)]
    pub loop_stack: Vec<StepId>,
    /// Iterations consumed per loop step.
    #[serde(default)]
    pub loop_iterations: HashMap<StepId, u32>,
    /// Approval step the instance is parked on, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub awaiting_approval: Option<StepId>,
    /// Cancellation flag, observed at the next scheduler decision point.
    #[serde(default)]
    pub cancel_requested: bool,
    /// Failure reason once the instance fails.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureDetail>,
    /// Saga unwind records, in execution (reverse-completion) order.
    #[serde(default)]
    pub compensations: Vec<CompensationRecord>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl WorkflowInstance {
    /// Create a pending instance for a definition, seeding the context with
    /// the request input under `"input"`.
    pub fn new(definition: &WorkflowDefinition, input: Value) -> Self {
        let mut context = Context::new();
        context.insert("input".to_string(), input);
        Self {
            id: Uuid::now_v7(),
            definition_id: definition.id,
            definition_version: definition.version,
            state: InstanceState::Pending,
            context,
            tasks: Vec::new(),
            version: 0,
            position: Some(Position::step(definition.entry.clone())),
            loop_stack: Vec::new(),
            loop_iterations: HashMap::new(),
            awaiting_approval: None,
            cancel_requested: false,
            failure: None,
            compensations: Vec::new(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    /// Apply a lifecycle transition, with timestamp side effects.
    pub fn transition(&mut self, to: InstanceState) -> Result<(), InvalidTransition> {
        if !self.state.can_transition(to) {
            return Err(InvalidTransition::new(self.state, to));
        }
        match to {
            InstanceState::Running if self.started_at.is_none() => {
                self.started_at = Some(Utc::now());
            }
            InstanceState::Completed | InstanceState::Failed | InstanceState::Cancelled => {
                self.completed_at = Some(Utc::now());
            }
            _ => {}
        }
        self.state = to;
        Ok(())
    }

    /// Mutable access to a task by id.
    pub fn task_mut(&mut self, task_id: Uuid) -> Option<&mut Task> {
        self.tasks.iter_mut().find(|t| t.id == task_id)
    }

    /// Record a step output into the shared context under the step id.
    pub fn record_output(&mut self, step_id: &str, output: Value) {
        self.context.insert(step_id.to_string(), output);
    }

    /// Completed tasks in strictly reverse completion order (most recent
    /// first; ties broken by reverse dispatch order).
    pub fn completed_tasks_newest_first(&self) -> Vec<&Task> {
        let mut completed: Vec<(usize, &Task)> = self
            .tasks
            .iter()
            .enumerate()
            .filter(|(_, t)| t.status == TaskStatus::Completed)
            .collect();
        completed.sort_by(|(ia, a), (ib, b)| {
            b.completed_at
                .cmp(&a.completed_at)
                .then_with(|| ib.cmp(ia))
        });
        completed.into_iter().map(|(_, t)| t).collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
