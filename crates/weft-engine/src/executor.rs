//! Step executor contract: the boundary to external collaborators.
//!
//! The engine owns no step logic. Agent runners, validators, and notifiers
//! live behind this trait; implementations classify their errors through
//! `StepFailure` so the retry middleware can tell transient from permanent.
//!
//! Uses RPITIT (return-position `impl Trait` in traits) for async methods,
//! consistent with the workspace's Rust 2024 edition approach.

use serde_json::Value;
use weft_types::compensation::CompensationAction;
use weft_types::definition::Step;
use weft_types::error::StepFailure;
use weft_types::instance::Task;
use weft_types::predicate::Context;

/// Contract invoked by the scheduler to run one step against an external
/// collaborator, and to undo a completed task during a saga unwind.
///
/// Implementations must be cheap to share (`Arc`) and must classify every
/// error: transient kinds are retried, permanent kinds are not.
pub trait StepExecutor: Send + Sync + 'static {
    /// Execute one step. `input` is the context snapshot at dispatch time;
    /// `context` is the live shared state for reads.
    fn execute(
        &self,
        step: &Step,
        input: &Value,
        context: &Context,
    ) -> impl std::future::Future<Output = Result<Value, StepFailure>> + Send;

    /// Execute a compensation action for a previously completed task.
    ///
    /// Must be idempotent: the compensator retries transient failures.
    fn compensate(
        &self,
        action: &CompensationAction,
        task: &Task,
    ) -> impl std::future::Future<Output = Result<(), StepFailure>> + Send;
}
