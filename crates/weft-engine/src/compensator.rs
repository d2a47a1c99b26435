//! Saga compensation: best-effort undo of completed work.
//!
//! When an instance fails or is cancelled, completed tasks whose step
//! declares a compensation action are undone in strictly reverse
//! completion order. Each action gets its own retry budget; a
//! compensation that still fails is recorded and the unwind continues
//! with the remaining tasks. The instance reaches its terminal state
//! either way, carrying the ids of unresolved compensations.

use std::time::Duration;

use uuid::Uuid;
use weft_types::compensation::CompensationRecord;
use weft_types::definition::WorkflowDefinition;
use weft_types::error::{InvalidTransition, StepFailure};
use weft_types::instance::{Task, WorkflowInstance};

use crate::executor::StepExecutor;
use crate::retry::{self, RetryPolicy};

pub struct SagaCompensator;

impl SagaCompensator {
    /// Undo every compensable completed task, newest first. Returns the
    /// record ids of compensations that could not be resolved.
    pub async fn unwind<E: StepExecutor>(
        executor: &E,
        policy: &RetryPolicy,
        max_attempts: u32,
        timeout: Duration,
        definition: &WorkflowDefinition,
        instance: &mut WorkflowInstance,
    ) -> Result<Vec<Uuid>, InvalidTransition> {
        let targets: Vec<Task> = instance
            .completed_tasks_newest_first()
            .into_iter()
            .filter(|task| {
                definition
                    .step(&task.step_id)
                    .is_some_and(|step| step.compensation.is_some())
            })
            .cloned()
            .collect();

        if targets.is_empty() {
            return Ok(Vec::new());
        }
        tracing::info!(
            instance_id = %instance.id,
            records = targets.len(),
            "starting compensation unwind"
        );

        let mut unresolved = Vec::new();
        for task in targets {
            // filtered above, so the step and its action both exist
            let Some(action) = definition
                .step(&task.step_id)
                .and_then(|step| step.compensation.clone())
            else {
                continue;
            };

            let mut record = CompensationRecord::new(task.id, task.step_id.clone(), action.clone());
            record.start();

            let (result, attempts) = retry::run_with_retry(policy, max_attempts, || async {
                match tokio::time::timeout(timeout, executor.compensate(&action, &task)).await {
                    Ok(outcome) => outcome,
                    Err(_) => Err(StepFailure::timeout(format!(
                        "compensation gave no response within {}s",
                        timeout.as_secs()
                    ))),
                }
            })
            .await;

            match result {
                Ok(()) => {
                    record.complete();
                    if let Some(stored) = instance.task_mut(task.id) {
                        stored.mark_compensated()?;
                    }
                    tracing::info!(
                        instance_id = %instance.id,
                        step_id = %task.step_id,
                        attempts,
                        "compensation completed"
                    );
                }
                Err(failure) => {
                    tracing::error!(
                        instance_id = %instance.id,
                        step_id = %task.step_id,
                        attempts,
                        error = %failure,
                        "compensation unresolved"
                    );
                    record.fail(failure.to_string());
                    unresolved.push(record.id);
                }
            }
            instance.compensations.push(record);
        }
        Ok(unresolved)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
