//! The scheduler: drives one instance through its definition graph.
//!
//! Each dispatch cycle is a pure read-compute-write round: load the
//! instance snapshot, resolve the step at the execution cursor, apply the
//! resulting mutation, and persist it with a compare-and-swap on the
//! instance version. A writer that loses the version race discards its
//! mutation and re-reads; lifecycle events are published only after a
//! successful write, so observers never see a losing branch.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use thiserror::Error;
use uuid::Uuid;
use weft_types::definition::{Step, StepKind, WorkflowDefinition};
use weft_types::error::{InvalidTransition, StepFailure, StoreError};
use weft_types::event::EngineEvent;
use weft_types::instance::{
    FailureDetail, InstanceState, Position, Task, TaskKind, WorkflowInstance,
};
use weft_types::predicate::Context;

use crate::breaker::BreakerRegistry;
use crate::compensator::SagaCompensator;
use crate::config::EngineConfig;
use crate::definitions::DefinitionStore;
use crate::events::EventPublisher;
use crate::executor::StepExecutor;
use crate::retry::{self, RetryPolicy};
use crate::store::InstanceStore;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("definition {id} version {version} not found")]
    DefinitionNotFound { id: Uuid, version: u32 },

    #[error("no active definition published for {0}")]
    NoActiveDefinition(Uuid),

    #[error("instance not found: {0}")]
    InstanceNotFound(Uuid),

    #[error("instance references unknown step '{0}'")]
    UnknownStep(String),

    #[error("instance is not awaiting approval")]
    NotAwaitingApproval,

    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("worker task failed: {0}")]
    Join(String),
}

// ---------------------------------------------------------------------------
// Cycle outcome
// ---------------------------------------------------------------------------

/// What one resolved dispatch cycle produced: events to publish once the
/// write lands, and whether the scheduler should release the instance
/// (parked on approval or pause).
struct CycleOutcome {
    events: Vec<EngineEvent>,
    parked: bool,
}

impl CycleOutcome {
    fn advance(events: Vec<EngineEvent>) -> Self {
        Self {
            events,
            parked: false,
        }
    }

    fn parked(events: Vec<EngineEvent>) -> Self {
        Self {
            events,
            parked: true,
        }
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

pub struct Scheduler<S, D, E> {
    store: Arc<S>,
    definitions: Arc<D>,
    executor: Arc<E>,
    publisher: Arc<dyn EventPublisher>,
    breakers: Arc<BreakerRegistry>,
    retry: RetryPolicy,
    config: EngineConfig,
}

impl<S, D, E> Scheduler<S, D, E>
where
    S: InstanceStore,
    D: DefinitionStore,
    E: StepExecutor,
{
    pub fn new(
        store: Arc<S>,
        definitions: Arc<D>,
        executor: Arc<E>,
        publisher: Arc<dyn EventPublisher>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            definitions,
            executor,
            publisher,
            breakers: Arc::new(BreakerRegistry::new(config.breaker_config())),
            retry: config.retry_policy(),
            config,
        }
    }

    /// Drive an instance until it reaches a terminal state or parks
    /// (paused, or waiting on human approval). Returns the last persisted
    /// snapshot.
    pub async fn dispatch(&self, instance_id: Uuid) -> Result<WorkflowInstance, EngineError> {
        loop {
            let mut instance = match self.store.load(instance_id).await {
                Ok(instance) => instance,
                Err(StoreError::NotFound) => {
                    return Err(EngineError::InstanceNotFound(instance_id));
                }
                Err(other) => return Err(other.into()),
            };
            let expected = instance.version;

            if instance.state.is_terminal() {
                return Ok(instance);
            }

            let definition = self
                .definitions
                .get(instance.definition_id, instance.definition_version)
                .await
                .ok_or(EngineError::DefinitionNotFound {
                    id: instance.definition_id,
                    version: instance.definition_version,
                })?;

            // Cancellation is observed here, before any further dispatch.
            if instance.cancel_requested {
                let outcome = self.finalize_cancelled(&definition, &mut instance).await?;
                match self.persist(instance, expected, outcome).await? {
                    Some(saved) => return Ok(saved),
                    None => continue,
                }
            }

            match instance.state {
                InstanceState::Pending => {
                    instance.transition(InstanceState::Running)?;
                    let outcome = CycleOutcome::advance(vec![EngineEvent::InstanceStarted {
                        instance_id: instance.id,
                        definition_id: instance.definition_id,
                        definition_version: instance.definition_version,
                    }]);
                    self.persist(instance, expected, outcome).await?;
                    continue;
                }
                InstanceState::Paused => return Ok(instance),
                InstanceState::Running => {}
                // terminal states returned above
                _ => return Ok(instance),
            }

            let Some(position) = instance.position.clone() else {
                instance.transition(InstanceState::Completed)?;
                let outcome = CycleOutcome::advance(vec![EngineEvent::InstanceCompleted {
                    instance_id: instance.id,
                    tasks: instance.tasks.len() as u32,
                }]);
                match self.persist(instance, expected, outcome).await? {
                    Some(saved) => {
                        tracing::info!(instance_id = %saved.id, "instance completed");
                        return Ok(saved);
                    }
                    None => continue,
                }
            };

            let outcome = match &position {
                Position::Step { id } => {
                    self.process_step(&definition, &mut instance, id).await?
                }
                Position::LoopEval { id } => {
                    self.process_loop_eval(&definition, &mut instance, id).await?
                }
            };
            let parked = outcome.parked;
            match self.persist(instance, expected, outcome).await? {
                Some(saved) if parked => return Ok(saved),
                Some(_) => {}
                None => {}
            }
        }
    }

    /// Compare-and-swap write, publishing events only when it lands.
    /// Returns `None` when the version race was lost (caller re-reads).
    async fn persist(
        &self,
        instance: WorkflowInstance,
        expected: u64,
        outcome: CycleOutcome,
    ) -> Result<Option<WorkflowInstance>, EngineError> {
        let id = instance.id;
        let mut snapshot = instance.clone();
        match self.store.save(instance, expected).await {
            Ok(new_version) => {
                snapshot.version = new_version;
                for event in outcome.events {
                    self.publisher.publish(event);
                }
                Ok(Some(snapshot))
            }
            Err(StoreError::VersionConflict { expected, found }) => {
                tracing::debug!(
                    instance_id = %id,
                    expected,
                    found,
                    "lost version race, discarding mutation"
                );
                Ok(None)
            }
            Err(other) => Err(other.into()),
        }
    }

    // -----------------------------------------------------------------------
    // Step dispatch
    // -----------------------------------------------------------------------

    async fn process_step(
        &self,
        definition: &WorkflowDefinition,
        instance: &mut WorkflowInstance,
        step_id: &str,
    ) -> Result<CycleOutcome, EngineError> {
        let step = definition
            .step(step_id)
            .ok_or_else(|| EngineError::UnknownStep(step_id.to_string()))?;

        // Skip guard applies to every kind.
        if let Some(predicate) = &step.when
            && !predicate.matches(&instance.context)
        {
            tracing::debug!(instance_id = %instance.id, step_id, "skip guard held, skipping step");
            let mut task = Task::new(&step.id, task_kind_of(step), 1);
            task.skip()?;
            instance.tasks.push(task);
            let next = step.next_on_success(&instance.context).cloned();
            advance(instance, next);
            return Ok(CycleOutcome::advance(Vec::new()));
        }

        match &step.kind {
            StepKind::Agent | StepKind::Validation => {
                self.run_task_step(definition, instance, step).await
            }
            StepKind::Parallel { children } => {
                self.run_parallel(definition, instance, step, children).await
            }
            StepKind::Decision { branches } => {
                self.run_decision(definition, instance, step, branches).await
            }
            StepKind::Loop { body, .. } => {
                // Entering a loop resets its iteration counter and pushes it
                // onto the stack; the body chain runs before any evaluation.
                instance.loop_stack.push(step.id.clone());
                instance.loop_iterations.insert(step.id.clone(), 1);
                instance.position = Some(Position::step(body.clone()));
                Ok(CycleOutcome::advance(Vec::new()))
            }
            StepKind::HumanApproval { prompt } => {
                let mut task = Task::new(&step.id, TaskKind::Approval, 1);
                task.input = Some(json!({ "prompt": prompt }));
                task.start()?;
                instance.tasks.push(task);
                instance.awaiting_approval = Some(step.id.clone());
                instance.transition(InstanceState::Paused)?;
                tracing::info!(instance_id = %instance.id, step_id, "parked awaiting approval");
                Ok(CycleOutcome::parked(vec![EngineEvent::InstancePaused {
                    instance_id: instance.id,
                    step_id: Some(step.id.clone()),
                }]))
            }
        }
    }

    async fn run_task_step(
        &self,
        definition: &WorkflowDefinition,
        instance: &mut WorkflowInstance,
        step: &Step,
    ) -> Result<CycleOutcome, EngineError> {
        let task = run_step_once(
            self.executor.as_ref(),
            &self.breakers,
            &self.retry,
            step,
            &instance.context,
            self.config.default_max_attempts,
            self.config.default_step_timeout_secs,
        )
        .await?;
        self.apply_task_result(definition, instance, step, task).await
    }

    /// Fold a resolved task into the instance: record it, advance the
    /// cursor or route the failure, and collect the events to publish.
    async fn apply_task_result(
        &self,
        definition: &WorkflowDefinition,
        instance: &mut WorkflowInstance,
        step: &Step,
        task: Task,
    ) -> Result<CycleOutcome, EngineError> {
        let failed = task.error.clone();
        let task_id = task.id;
        let duration_ms = task.duration_ms.unwrap_or(0);
        if let Some(output) = task.output.clone() {
            instance.record_output(&step.id, output);
        }
        instance.tasks.push(task);

        match failed {
            None => {
                tracing::info!(
                    instance_id = %instance.id,
                    step_id = %step.id,
                    duration_ms,
                    "step completed"
                );
                let next = step.next_on_success(&instance.context).cloned();
                advance(instance, next);
                Ok(CycleOutcome::advance(vec![EngineEvent::StepCompleted {
                    instance_id: instance.id,
                    step_id: step.id.clone(),
                    task_id,
                    duration_ms,
                }]))
            }
            Some(failure) => {
                tracing::warn!(
                    instance_id = %instance.id,
                    step_id = %step.id,
                    kind = ?failure.kind,
                    error = %failure,
                    "step failed"
                );
                let mut events = vec![EngineEvent::StepFailed {
                    instance_id: instance.id,
                    step_id: step.id.clone(),
                    task_id,
                    kind: failure.kind,
                    error: failure.message.clone(),
                }];
                if let Some(fallback) = step.next_on_failure().cloned() {
                    // A failure edge absorbs the failure and reroutes.
                    instance.position = Some(Position::step(fallback));
                    Ok(CycleOutcome::advance(events))
                } else {
                    self.fail_instance(definition, instance, &step.id, failure, &mut events)
                        .await?;
                    Ok(CycleOutcome::advance(events))
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Parallel groups
    // -----------------------------------------------------------------------

    async fn run_parallel(
        &self,
        definition: &WorkflowDefinition,
        instance: &mut WorkflowInstance,
        group: &Step,
        children: &[String],
    ) -> Result<CycleOutcome, EngineError> {
        let mut events = Vec::new();
        let mut dispatchable: Vec<Step> = Vec::new();

        for child_id in children {
            let child = definition
                .step(child_id)
                .ok_or_else(|| EngineError::UnknownStep(child_id.clone()))?;
            if let Some(predicate) = &child.when
                && !predicate.matches(&instance.context)
            {
                let mut task = Task::new(&child.id, task_kind_of(child), 1);
                task.skip()?;
                instance.tasks.push(task);
                continue;
            }
            dispatchable.push(child.clone());
        }

        // Fan out; the join barrier waits for every sibling even after one
        // fails, so no child is ever abandoned mid-flight.
        let mut join_set = tokio::task::JoinSet::new();
        for child in dispatchable {
            let executor = Arc::clone(&self.executor);
            let breakers = Arc::clone(&self.breakers);
            let retry = self.retry.clone();
            let context = instance.context.clone();
            let default_attempts = self.config.default_max_attempts;
            let default_timeout = self.config.default_step_timeout_secs;
            join_set.spawn(async move {
                let task = run_step_once(
                    executor.as_ref(),
                    &breakers,
                    &retry,
                    &child,
                    &context,
                    default_attempts,
                    default_timeout,
                )
                .await?;
                Ok::<Task, InvalidTransition>(task)
            });
        }

        let mut first_failure: Option<(String, StepFailure)> = None;
        while let Some(joined) = join_set.join_next().await {
            let task = joined.map_err(|e| EngineError::Join(e.to_string()))??;
            let step_id = task.step_id.clone();
            let task_id = task.id;
            let duration_ms = task.duration_ms.unwrap_or(0);
            match &task.error {
                None => {
                    if let Some(output) = task.output.clone() {
                        instance.record_output(&step_id, output);
                    }
                    events.push(EngineEvent::StepCompleted {
                        instance_id: instance.id,
                        step_id: step_id.clone(),
                        task_id,
                        duration_ms,
                    });
                }
                Some(failure) => {
                    events.push(EngineEvent::StepFailed {
                        instance_id: instance.id,
                        step_id: step_id.clone(),
                        task_id,
                        kind: failure.kind,
                        error: failure.message.clone(),
                    });
                    if first_failure.is_none() {
                        first_failure = Some((step_id.clone(), failure.clone()));
                    }
                }
            }
            instance.tasks.push(task);
        }

        match first_failure {
            None => {
                let next = group.next_on_success(&instance.context).cloned();
                advance(instance, next);
                Ok(CycleOutcome::advance(events))
            }
            Some((child_id, failure)) => {
                tracing::warn!(
                    instance_id = %instance.id,
                    group = %group.id,
                    child = %child_id,
                    "parallel group failed"
                );
                let group_failure = StepFailure::new(
                    failure.kind,
                    format!("child '{child_id}' failed: {}", failure.message),
                );
                if let Some(fallback) = group.next_on_failure().cloned() {
                    instance.position = Some(Position::step(fallback));
                    Ok(CycleOutcome::advance(events))
                } else {
                    self.fail_instance(definition, instance, &group.id, group_failure, &mut events)
                        .await?;
                    Ok(CycleOutcome::advance(events))
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Decisions and loop evaluation
    // -----------------------------------------------------------------------

    async fn run_decision(
        &self,
        definition: &WorkflowDefinition,
        instance: &mut WorkflowInstance,
        step: &Step,
        branches: &[weft_types::definition::DecisionBranch],
    ) -> Result<CycleOutcome, EngineError> {
        let mut task = Task::new(&step.id, TaskKind::Decision, 1);
        task.start()?;

        let matched = branches
            .iter()
            .enumerate()
            .find(|(_, branch)| branch.when.matches(&instance.context));

        match matched {
            Some((index, branch)) => {
                let to = branch.to.clone();
                task.complete(json!({ "branch": index, "to": to }))?;
                let task_id = task.id;
                let duration_ms = task.duration_ms.unwrap_or(0);
                instance.tasks.push(task);
                advance(instance, to);
                Ok(CycleOutcome::advance(vec![EngineEvent::StepCompleted {
                    instance_id: instance.id,
                    step_id: step.id.clone(),
                    task_id,
                    duration_ms,
                }]))
            }
            None => {
                let failure = StepFailure::business("no branch predicate matched the context");
                task.fail(failure.clone())?;
                let task_id = task.id;
                instance.tasks.push(task);
                let mut events = vec![EngineEvent::StepFailed {
                    instance_id: instance.id,
                    step_id: step.id.clone(),
                    task_id,
                    kind: failure.kind,
                    error: failure.message.clone(),
                }];
                self.fail_instance(definition, instance, &step.id, failure, &mut events)
                    .await?;
                Ok(CycleOutcome::advance(events))
            }
        }
    }

    async fn process_loop_eval(
        &self,
        definition: &WorkflowDefinition,
        instance: &mut WorkflowInstance,
        loop_id: &str,
    ) -> Result<CycleOutcome, EngineError> {
        let step = definition
            .step(loop_id)
            .ok_or_else(|| EngineError::UnknownStep(loop_id.to_string()))?;
        let StepKind::Loop {
            body,
            predicate,
            max_iterations,
        } = &step.kind
        else {
            return Err(EngineError::UnknownStep(loop_id.to_string()));
        };

        let iteration = instance.loop_iterations.get(loop_id).copied().unwrap_or(1);
        let mut task = Task::new(loop_id, TaskKind::LoopEval, 1);
        task.start()?;

        if predicate.matches(&instance.context) {
            if iteration >= *max_iterations {
                // Predicate still demands another pass at the bound.
                let failure = StepFailure::business(format!(
                    "loop bound exceeded after {iteration} iterations"
                ));
                task.fail(failure.clone())?;
                let task_id = task.id;
                instance.tasks.push(task);
                let mut events = vec![EngineEvent::StepFailed {
                    instance_id: instance.id,
                    step_id: step.id.clone(),
                    task_id,
                    kind: failure.kind,
                    error: failure.message.clone(),
                }];
                self.fail_instance(definition, instance, loop_id, failure, &mut events)
                    .await?;
                return Ok(CycleOutcome::advance(events));
            }

            tracing::debug!(instance_id = %instance.id, loop_id, iteration, "loop continues");
            task.complete(json!({ "verdict": "continue", "iteration": iteration }))?;
            let task_id = task.id;
            let duration_ms = task.duration_ms.unwrap_or(0);
            instance.tasks.push(task);
            instance
                .loop_iterations
                .insert(loop_id.to_string(), iteration + 1);
            instance.position = Some(Position::step(body.clone()));
            return Ok(CycleOutcome::advance(vec![EngineEvent::StepCompleted {
                instance_id: instance.id,
                step_id: step.id.clone(),
                task_id,
                duration_ms,
            }]));
        }

        tracing::debug!(instance_id = %instance.id, loop_id, iteration, "loop exits");
        task.complete(json!({ "verdict": "exit", "iterations": iteration }))?;
        let task_id = task.id;
        let duration_ms = task.duration_ms.unwrap_or(0);
        instance.tasks.push(task);
        instance.loop_stack.pop();
        let next = step.next_on_success(&instance.context).cloned();
        advance(instance, next);
        Ok(CycleOutcome::advance(vec![EngineEvent::StepCompleted {
            instance_id: instance.id,
            step_id: step.id.clone(),
            task_id,
            duration_ms,
        }]))
    }

    // -----------------------------------------------------------------------
    // Terminal paths
    // -----------------------------------------------------------------------

    /// Unwind the saga and move the instance to `Failed`.
    async fn fail_instance(
        &self,
        definition: &WorkflowDefinition,
        instance: &mut WorkflowInstance,
        step_id: &str,
        failure: StepFailure,
        events: &mut Vec<EngineEvent>,
    ) -> Result<(), EngineError> {
        let before = instance.compensations.len();
        let unresolved = SagaCompensator::unwind(
            self.executor.as_ref(),
            &self.retry,
            self.config.default_max_attempts,
            Duration::from_secs(self.config.compensation_timeout_secs),
            definition,
            instance,
        )
        .await?;
        let triggered = (instance.compensations.len() - before) as u32;
        if triggered > 0 {
            events.push(EngineEvent::CompensationTriggered {
                instance_id: instance.id,
                records: triggered,
            });
        }

        instance.failure = Some(FailureDetail {
            step_id: step_id.to_string(),
            kind: failure.kind,
            message: failure.message.clone(),
            unresolved_compensations: unresolved.clone(),
        });
        instance.position = None;
        instance.transition(InstanceState::Failed)?;
        tracing::error!(
            instance_id = %instance.id,
            step_id,
            kind = ?failure.kind,
            unresolved = unresolved.len(),
            "instance failed"
        );
        events.push(EngineEvent::InstanceFailed {
            instance_id: instance.id,
            step_id: step_id.to_string(),
            error: failure.message,
            unresolved_compensations: unresolved.len() as u32,
        });
        Ok(())
    }

    /// Unwind the saga and move the instance to `Cancelled`.
    async fn finalize_cancelled(
        &self,
        definition: &WorkflowDefinition,
        instance: &mut WorkflowInstance,
    ) -> Result<CycleOutcome, EngineError> {
        let mut events = Vec::new();
        let before = instance.compensations.len();
        let unresolved = SagaCompensator::unwind(
            self.executor.as_ref(),
            &self.retry,
            self.config.default_max_attempts,
            Duration::from_secs(self.config.compensation_timeout_secs),
            definition,
            instance,
        )
        .await?;
        let triggered = (instance.compensations.len() - before) as u32;
        if triggered > 0 {
            events.push(EngineEvent::CompensationTriggered {
                instance_id: instance.id,
                records: triggered,
            });
        }
        if !unresolved.is_empty() {
            tracing::warn!(
                instance_id = %instance.id,
                unresolved = unresolved.len(),
                "cancellation left unresolved compensations"
            );
        }

        instance.position = None;
        instance.awaiting_approval = None;
        instance.transition(InstanceState::Cancelled)?;
        tracing::info!(instance_id = %instance.id, "instance cancelled");
        events.push(EngineEvent::InstanceCancelled {
            instance_id: instance.id,
        });
        Ok(CycleOutcome::advance(events))
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Move the cursor to `next`, or fall back to the innermost active loop's
/// evaluation point; a bare `None` with no loop active ends the instance.
fn advance(instance: &mut WorkflowInstance, next: Option<String>) {
    instance.position = match next {
        Some(id) => Some(Position::step(id)),
        None => instance
            .loop_stack
            .last()
            .map(|loop_id| Position::LoopEval {
                id: loop_id.clone(),
            }),
    };
}

fn task_kind_of(step: &Step) -> TaskKind {
    match step.kind {
        StepKind::Validation => TaskKind::Validation,
        StepKind::Decision { .. } => TaskKind::Decision,
        StepKind::Loop { .. } => TaskKind::LoopEval,
        StepKind::HumanApproval { .. } => TaskKind::Approval,
        _ => TaskKind::Agent,
    }
}

/// Execute one task step to resolution: breaker gate, retry budget with
/// per-attempt timeout, classified failure handling. The returned task is
/// completed, or failed with its final error.
async fn run_step_once<E: StepExecutor>(
    executor: &E,
    breakers: &BreakerRegistry,
    retry_policy: &RetryPolicy,
    step: &Step,
    context: &Context,
    default_max_attempts: u32,
    default_timeout_secs: u64,
) -> Result<Task, InvalidTransition> {
    let max_attempts = step.max_attempts.unwrap_or(default_max_attempts);
    let timeout = Duration::from_secs(step.timeout_secs.unwrap_or(default_timeout_secs));
    let target = step.target.clone().unwrap_or_else(|| step.id.clone());

    let mut task = Task::new(&step.id, task_kind_of(step), max_attempts);
    let input = serde_json::to_value(context).unwrap_or(Value::Null);
    task.input = Some(input.clone());
    task.start()?;

    if !breakers.allow(&target) {
        task.fail(StepFailure::unavailable(format!(
            "circuit open for target '{target}'"
        )))?;
        return Ok(task);
    }

    let (result, attempts) = retry::run_with_retry(retry_policy, max_attempts, || async {
        let outcome = match tokio::time::timeout(timeout, executor.execute(step, &input, context))
            .await
        {
            Ok(outcome) => outcome,
            Err(_) => Err(StepFailure::timeout(format!(
                "no response within {}s",
                timeout.as_secs()
            ))),
        };
        match &outcome {
            Ok(_) => breakers.record_success(&target),
            Err(failure) if failure.kind.is_transient() => breakers.record_failure(&target),
            Err(_) => {}
        }
        outcome
    })
    .await;

    task.attempt_count = attempts;
    match result {
        Ok(output) => task.complete(output)?,
        Err(failure) => task.fail(failure)?,
    }
    Ok(task)
}
