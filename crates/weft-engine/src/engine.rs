//! The engine facade: control API plus a worker pool.
//!
//! Control operations (pause, resume, cancel) go through the same
//! optimistic-concurrency write path as the scheduler, so an operator
//! action racing a worker resolves by versioning, never by locking.

use std::sync::Arc;

use serde_json::{Value, json};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use weft_types::error::StoreError;
use weft_types::event::EngineEvent;
use weft_types::instance::{InstanceState, Position, TaskKind, TaskStatus, WorkflowInstance};

use crate::config::EngineConfig;
use crate::definitions::DefinitionStore;
use crate::events::EventPublisher;
use crate::executor::StepExecutor;
use crate::scheduler::{EngineError, Scheduler};
use crate::store::InstanceStore;

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct Engine<S, D, E> {
    store: Arc<S>,
    definitions: Arc<D>,
    scheduler: Arc<Scheduler<S, D, E>>,
    publisher: Arc<dyn EventPublisher>,
    queue_tx: mpsc::UnboundedSender<Uuid>,
    queue_rx: Arc<Mutex<mpsc::UnboundedReceiver<Uuid>>>,
    config: EngineConfig,
}

impl<S, D, E> Engine<S, D, E>
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
        let scheduler = Arc::new(Scheduler::new(
            Arc::clone(&store),
            Arc::clone(&definitions),
            executor,
            Arc::clone(&publisher),
            config.clone(),
        ));
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        Self {
            store,
            definitions,
            scheduler,
            publisher,
            queue_tx,
            queue_rx: Arc::new(Mutex::new(queue_rx)),
            config,
        }
    }

    // -----------------------------------------------------------------------
    // Control API
    // -----------------------------------------------------------------------

    /// Create a pending instance against the latest active definition
    /// version. The instance does not run until started or submitted.
    pub async fn create_instance(
        &self,
        definition_id: Uuid,
        input: Value,
    ) -> Result<WorkflowInstance, EngineError> {
        let definition = self
            .definitions
            .latest_active(definition_id)
            .await
            .ok_or(EngineError::NoActiveDefinition(definition_id))?;
        let instance = WorkflowInstance::new(&definition, input);
        tracing::info!(
            instance_id = %instance.id,
            definition_id = %definition_id,
            definition_version = definition.version,
            "instance created"
        );
        self.store.insert(instance.clone()).await?;
        Ok(instance)
    }

    /// Drive an instance inline until it terminates or parks.
    pub async fn run(&self, instance_id: Uuid) -> Result<WorkflowInstance, EngineError> {
        self.scheduler.dispatch(instance_id).await
    }

    /// Queue an instance for the worker pool.
    pub fn submit(&self, instance_id: Uuid) -> Result<(), EngineError> {
        self.queue_tx
            .send(instance_id)
            .map_err(|_| EngineError::Join("dispatch queue closed".into()))
    }

    /// Current snapshot of an instance.
    pub async fn status(&self, instance_id: Uuid) -> Result<WorkflowInstance, EngineError> {
        match self.store.load(instance_id).await {
            Ok(instance) => Ok(instance),
            Err(StoreError::NotFound) => Err(EngineError::InstanceNotFound(instance_id)),
            Err(other) => Err(other.into()),
        }
    }

    /// Pause a running instance. The active worker observes the pause on
    /// its next write and releases the instance.
    pub async fn pause(&self, instance_id: Uuid) -> Result<WorkflowInstance, EngineError> {
        let paused = self
            .mutate(instance_id, |instance| {
                instance.transition(InstanceState::Paused)?;
                Ok(vec![EngineEvent::InstancePaused {
                    instance_id: instance.id,
                    step_id: None,
                }])
            })
            .await?;
        tracing::info!(instance_id = %instance_id, "instance paused");
        Ok(paused)
    }

    /// Resume a paused instance. For an approval gate, `decision` completes
    /// the parked task and lands in the context under the gate's step id,
    /// so downstream `When` guards can route on it.
    pub async fn resume(
        &self,
        instance_id: Uuid,
        decision: Option<Value>,
    ) -> Result<WorkflowInstance, EngineError> {
        let current = self.status(instance_id).await?;
        let definition = self
            .definitions
            .get(current.definition_id, current.definition_version)
            .await
            .ok_or(EngineError::DefinitionNotFound {
                id: current.definition_id,
                version: current.definition_version,
            })?;

        self.mutate(instance_id, |instance| {
            if instance.state != InstanceState::Paused {
                return Err(EngineError::InvalidTransition(
                    weft_types::error::InvalidTransition::new(
                        instance.state,
                        InstanceState::Running,
                    ),
                ));
            }
            match instance.awaiting_approval.take() {
                Some(gate_id) => {
                    let verdict = decision.clone().unwrap_or(Value::Null);
                    let parked = instance
                        .tasks
                        .iter_mut()
                        .rev()
                        .find(|t| {
                            t.step_id == gate_id
                                && t.kind == TaskKind::Approval
                                && t.status == TaskStatus::Running
                        })
                        .ok_or(EngineError::NotAwaitingApproval)?;
                    parked.complete(json!({ "decision": verdict }))?;
                    instance.record_output(&gate_id, json!({ "decision": verdict }));

                    // route from the gate now that the decision is in context
                    let next = definition
                        .step(&gate_id)
                        .ok_or_else(|| EngineError::UnknownStep(gate_id.clone()))?
                        .next_on_success(&instance.context)
                        .cloned();
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
                None if decision.is_some() => {
                    return Err(EngineError::NotAwaitingApproval);
                }
                None => {}
            }
            instance.transition(InstanceState::Running)?;
            Ok(vec![EngineEvent::InstanceResumed {
                instance_id: instance.id,
            }])
        })
        .await?;
        tracing::info!(instance_id = %instance_id, "instance resumed");
        self.scheduler.dispatch(instance_id).await
    }

    /// Request cancellation. A running instance's worker observes the flag
    /// at its next decision point; otherwise the unwind runs here.
    pub async fn cancel(&self, instance_id: Uuid) -> Result<WorkflowInstance, EngineError> {
        let flagged = self
            .mutate(instance_id, |instance| {
                if instance.state.is_terminal() {
                    return Err(EngineError::InvalidTransition(
                        weft_types::error::InvalidTransition::new(
                            instance.state,
                            InstanceState::Cancelled,
                        ),
                    ));
                }
                instance.cancel_requested = true;
                Ok(Vec::new())
            })
            .await?;
        tracing::info!(instance_id = %instance_id, state = ?flagged.state, "cancellation requested");

        // No worker holds a pending or paused instance, so finish the
        // cancellation inline.
        match flagged.state {
            InstanceState::Pending | InstanceState::Paused => {
                self.scheduler.dispatch(instance_id).await
            }
            _ => Ok(flagged),
        }
    }

    /// Optimistic read-mutate-write loop shared by the control operations.
    /// The closure returns the events to publish once the write lands.
    async fn mutate<F>(
        &self,
        instance_id: Uuid,
        mut apply: F,
    ) -> Result<WorkflowInstance, EngineError>
    where
        F: FnMut(&mut WorkflowInstance) -> Result<Vec<EngineEvent>, EngineError>,
    {
        loop {
            let mut instance = match self.store.load(instance_id).await {
                Ok(instance) => instance,
                Err(StoreError::NotFound) => {
                    return Err(EngineError::InstanceNotFound(instance_id));
                }
                Err(other) => return Err(other.into()),
            };
            let expected = instance.version;
            let events = apply(&mut instance)?;

            let mut snapshot = instance.clone();
            match self.store.save(instance, expected).await {
                Ok(new_version) => {
                    snapshot.version = new_version;
                    for event in events {
                        self.publisher.publish(event);
                    }
                    return Ok(snapshot);
                }
                Err(StoreError::VersionConflict { .. }) => continue,
                Err(other) => return Err(other.into()),
            }
        }
    }

    // -----------------------------------------------------------------------
    // Worker pool
    // -----------------------------------------------------------------------

    /// Spawn the configured number of workers draining the dispatch queue.
    /// Workers stop when the token is cancelled or the queue closes.
    pub fn spawn_workers(&self, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::with_capacity(self.config.workers);
        for worker_id in 0..self.config.workers {
            let scheduler = Arc::clone(&self.scheduler);
            let queue_rx = Arc::clone(&self.queue_rx);
            let shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move {
                tracing::debug!(worker_id, "worker started");
                loop {
                    let next = {
                        let mut rx = queue_rx.lock().await;
                        tokio::select! {
                            _ = shutdown.cancelled() => None,
                            received = rx.recv() => received,
                        }
                    };
                    let Some(instance_id) = next else {
                        break;
                    };
                    if let Err(error) = scheduler.dispatch(instance_id).await {
                        tracing::error!(worker_id, %instance_id, %error, "dispatch failed");
                    }
                }
                tracing::debug!(worker_id, "worker stopped");
            }));
        }
        handles
    }
}
