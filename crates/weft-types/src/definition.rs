//! Workflow definition IR: a versioned, immutable DAG of typed steps.
//!
//! Definitions arrive as already-validated data (no DSL here). Step dispatch
//! is a closed tagged union, so the scheduler can match exhaustively instead
//! of relying on open-ended subclassing. Loop constructs carry their bound
//! and re-enter their body implicitly; there are no raw back edges, which
//! keeps the edge graph acyclic by construction.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::compensation::CompensationAction;
use crate::predicate::{Context, Predicate};

/// User-assigned step identifier, unique within a definition.
pub type StepId = String;

// ---------------------------------------------------------------------------
// Workflow definition
// ---------------------------------------------------------------------------

/// Publication status of a definition version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DefinitionStatus {
    Draft,
    Active,
    Deprecated,
}

/// An immutable, versioned workflow definition.
///
/// Versions are monotonic and frozen once published; a change is a new
/// version, never a mutation of an existing row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// Stable definition id shared by all versions.
    pub id: Uuid,
    /// Human-readable workflow name.
    pub name: String,
    /// Monotonic version number.
    pub version: u32,
    /// Publication status.
    pub status: DefinitionStatus,
    /// Entry step id.
    pub entry: StepId,
    /// The step graph.
    pub steps: Vec<Step>,
    /// When this version was created.
    pub created_at: DateTime<Utc>,
}

impl WorkflowDefinition {
    /// Look up a step by id.
    pub fn step(&self, id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == id)
    }
}

// ---------------------------------------------------------------------------
// Steps
// ---------------------------------------------------------------------------

/// A node in the definition graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    /// Unique step id (e.g. "generate").
    pub id: StepId,
    /// Human-readable step name.
    pub name: String,
    /// The kind of step, with kind-specific structure.
    pub kind: StepKind,
    /// Opaque configuration handed to the step executor.
    #[serde(default)]
    pub config: Value,
    /// Collaborator key for circuit breaking (task steps only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    /// Skip guard: when present and false at dispatch, the task is skipped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<Predicate>,
    /// Per-attempt timeout in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    /// Maximum executor attempts for this step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
    /// Outgoing edges, evaluated in definition order.
    #[serde(default)]
    pub edges: Vec<Edge>,
    /// Registered undo action for saga compensation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compensation: Option<CompensationAction>,
}

/// The closed set of step kinds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepKind {
    /// Invoke an external agent collaborator.
    Agent,
    /// Invoke an external validation collaborator.
    Validation,
    /// Fan out the listed child steps concurrently; join when all resolve.
    Parallel { children: Vec<StepId> },
    /// Evaluate branches in order; the first matching branch is taken.
    Decision { branches: Vec<DecisionBranch> },
    /// Re-enter `body` while `predicate` holds, up to `max_iterations`.
    Loop {
        body: StepId,
        predicate: Predicate,
        max_iterations: u32,
    },
    /// Park the instance until an explicit resume-with-decision arrives.
    HumanApproval { prompt: String },
}

impl Step {
    /// Whether this step dispatches one executor call (Agent or Validation).
    pub fn is_task_step(&self) -> bool {
        matches!(self.kind, StepKind::Agent | StepKind::Validation)
    }

    /// Successor after a successful resolution, honoring `When` guards.
    pub fn next_on_success(&self, ctx: &Context) -> Option<&StepId> {
        self.edges.iter().find_map(|edge| match &edge.guard {
            Guard::Success => Some(&edge.to),
            Guard::When { predicate } if predicate.matches(ctx) => Some(&edge.to),
            _ => None,
        })
    }

    /// Fallback successor taken when the step's task fails permanently.
    pub fn next_on_failure(&self) -> Option<&StepId> {
        self.edges
            .iter()
            .find(|edge| matches!(edge.guard, Guard::Failure))
            .map(|edge| &edge.to)
    }
}

/// One branch of a decision step.
///
/// `to: None` ends the current chain: the enclosing loop re-evaluates, or
/// the instance completes when no loop is active.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionBranch {
    pub when: Predicate,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<StepId>,
}

// ---------------------------------------------------------------------------
// Edges
// ---------------------------------------------------------------------------

/// Guard on an outgoing edge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Guard {
    /// Taken on successful step resolution.
    Success,
    /// Taken when the step's task fails permanently (absorbs the failure).
    Failure,
    /// Taken on success when the predicate matches the context.
    When { predicate: Predicate },
}

/// A directed edge to a successor step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub guard: Guard,
    pub to: StepId,
}

impl Edge {
    /// Unconditional success edge.
    pub fn success(to: impl Into<StepId>) -> Self {
        Self {
            guard: Guard::Success,
            to: to.into(),
        }
    }

    /// Failure fallback edge.
    pub fn failure(to: impl Into<StepId>) -> Self {
        Self {
            guard: Guard::Failure,
            to: to.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
