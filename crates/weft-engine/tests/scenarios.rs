//! End-to-end engine runs against an in-memory store and a scripted
//! executor: linear pipelines, parallel validation with a revision loop,
//! saga unwinds, approval gates, retries, and circuit breaking.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde_json::{Value, json};
use uuid::Uuid;

use weft_engine::config::EngineConfig;
use weft_engine::definitions::{DefinitionStore, InMemoryDefinitionStore};
use weft_engine::engine::Engine;
use weft_engine::events::{BroadcastPublisher, EventPublisher};
use weft_engine::executor::StepExecutor;
use weft_engine::scheduler::EngineError;
use weft_engine::store::InMemoryInstanceStore;
use weft_types::compensation::{CompensationAction, CompensationStatus};
use weft_types::definition::{
    DecisionBranch, DefinitionStatus, Edge, Guard, Step, StepKind, WorkflowDefinition,
};
use weft_types::error::StepFailure;
use weft_types::event::EngineEvent;
use weft_types::instance::{InstanceState, TaskKind, TaskStatus};
use weft_types::predicate::{CompareOp, Context, Predicate};

// ---------------------------------------------------------------------------
// Scripted executor
// ---------------------------------------------------------------------------

/// Replays a queue of responses per step id. The last response in a queue
/// repeats once the queue drains, so steady-state steps need one entry.
struct ScriptedExecutor {
    responses: Mutex<HashMap<String, VecDeque<Result<Value, StepFailure>>>>,
    compensated: Mutex<Vec<String>>,
    reject_compensation: Vec<String>,
}

impl ScriptedExecutor {
    fn new() -> Self {
        Self {
            responses: Mutex::new(HashMap::new()),
            compensated: Mutex::new(Vec::new()),
            reject_compensation: Vec::new(),
        }
    }

    fn script(self, step_id: &str, responses: Vec<Result<Value, StepFailure>>) -> Self {
        self.responses
            .lock()
            .unwrap()
            .insert(step_id.to_string(), responses.into());
        self
    }

    fn ok(self, step_id: &str, value: Value) -> Self {
        self.script(step_id, vec![Ok(value)])
    }

    fn compensation_order(&self) -> Vec<String> {
        self.compensated.lock().unwrap().clone()
    }
}

impl StepExecutor for ScriptedExecutor {
    async fn execute(
        &self,
        step: &Step,
        _input: &Value,
        _context: &Context,
    ) -> Result<Value, StepFailure> {
        let mut responses = self.responses.lock().unwrap();
        let queue = responses
            .get_mut(&step.id)
            .unwrap_or_else(|| panic!("no script for step '{}'", step.id));
        if queue.len() > 1 {
            queue.pop_front().unwrap()
        } else {
            queue.front().cloned().unwrap()
        }
    }

    async fn compensate(
        &self,
        _action: &CompensationAction,
        task: &weft_types::instance::Task,
    ) -> Result<(), StepFailure> {
        if self.reject_compensation.contains(&task.step_id) {
            return Err(StepFailure::business("undo rejected"));
        }
        self.compensated.lock().unwrap().push(task.step_id.clone());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Builders
// ---------------------------------------------------------------------------

fn step(id: &str, kind: StepKind) -> Step {
    Step {
        id: id.to_string(),
        name: id.to_string(),
        kind,
        config: json!({}),
        target: None,
        when: None,
        timeout_secs: None,
        max_attempts: None,
        edges: Vec::new(),
        compensation: None,
    }
}

fn agent(id: &str) -> Step {
    step(id, StepKind::Agent)
}

fn validation(id: &str) -> Step {
    step(id, StepKind::Validation)
}

fn compensable(mut s: Step) -> Step {
    s.compensation = Some(CompensationAction {
        name: format!("undo_{}", s.id),
        config: json!({}),
    });
    s
}

fn definition(entry: &str, steps: Vec<Step>) -> WorkflowDefinition {
    WorkflowDefinition {
        id: Uuid::now_v7(),
        name: "scenario".to_string(),
        version: 1,
        status: DefinitionStatus::Draft,
        entry: entry.to_string(),
        steps,
        created_at: Utc::now(),
    }
}

fn fast_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.retry.base_delay_ms = 1;
    config.retry.max_delay_ms = 2;
    config.retry.jitter = 0.0;
    config
}

type TestEngine = Engine<InMemoryInstanceStore, InMemoryDefinitionStore, ScriptedExecutor>;

async fn engine_for(
    def: WorkflowDefinition,
    executor: ScriptedExecutor,
    config: EngineConfig,
) -> (TestEngine, Uuid, Arc<BroadcastPublisher>) {
    let definition_id = def.id;
    let definitions = Arc::new(InMemoryDefinitionStore::new());
    definitions.publish(def).await.unwrap();
    let publisher = Arc::new(BroadcastPublisher::new(256));
    let engine = Engine::new(
        Arc::new(InMemoryInstanceStore::new()),
        definitions,
        Arc::new(executor),
        Arc::clone(&publisher) as Arc<dyn EventPublisher>,
        config,
    );
    (engine, definition_id, publisher)
}

fn drain(rx: &mut tokio::sync::broadcast::Receiver<EngineEvent>) -> Vec<EngineEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

// ---------------------------------------------------------------------------
// Linear pipeline
// ---------------------------------------------------------------------------

#[tokio::test]
async fn linear_pipeline_completes_and_chains_context() {
    let mut extract = agent("extract");
    extract.edges.push(Edge::success("summarize"));
    let summarize = agent("summarize");
    let def = definition("extract", vec![extract, summarize]);

    let executor = ScriptedExecutor::new()
        .ok("extract", json!({"text": "raw"}))
        .ok("summarize", json!({"summary": "short"}));
    let (engine, definition_id, publisher) = engine_for(def, executor, fast_config()).await;
    let mut rx = publisher.subscribe();

    let instance = engine
        .create_instance(definition_id, json!({"doc": "report.pdf"}))
        .await
        .unwrap();
    let done = engine.run(instance.id).await.unwrap();

    assert_eq!(done.state, InstanceState::Completed);
    assert_eq!(done.tasks.len(), 2);
    assert!(done.tasks.iter().all(|t| t.status == TaskStatus::Completed));
    assert_eq!(done.context["extract"], json!({"text": "raw"}));
    assert_eq!(done.context["summarize"], json!({"summary": "short"}));
    assert_eq!(done.context["input"], json!({"doc": "report.pdf"}));

    let events = drain(&mut rx);
    assert!(matches!(events.first(), Some(EngineEvent::InstanceStarted { .. })));
    assert!(matches!(events.last(), Some(EngineEvent::InstanceCompleted { tasks: 2, .. })));
}

// ---------------------------------------------------------------------------
// Revision loop with parallel validation
// ---------------------------------------------------------------------------

fn revision_pipeline() -> WorkflowDefinition {
    // revise { generate -> [grammar, facts] } while facts.score < 0.8
    let revise = step(
        "revise",
        StepKind::Loop {
            body: "generate".to_string(),
            predicate: Predicate::compare("facts.score", CompareOp::Lt, json!(0.8)),
            max_iterations: 3,
        },
    );
    let mut generate = agent("generate");
    generate.edges.push(Edge::success("checks"));
    let checks = step(
        "checks",
        StepKind::Parallel {
            children: vec!["grammar".to_string(), "facts".to_string()],
        },
    );
    definition(
        "revise",
        vec![revise, generate, checks, validation("grammar"), validation("facts")],
    )
}

#[tokio::test]
async fn loop_exits_first_iteration_when_score_passes() {
    let executor = ScriptedExecutor::new()
        .ok("generate", json!({"draft": "v1"}))
        .ok("grammar", json!({"issues": 0}))
        .ok("facts", json!({"score": 0.9}));
    let (engine, definition_id, _publisher) =
        engine_for(revision_pipeline(), executor, fast_config()).await;

    let instance = engine.create_instance(definition_id, json!({})).await.unwrap();
    let done = engine.run(instance.id).await.unwrap();

    assert_eq!(done.state, InstanceState::Completed);
    // generate + grammar + facts + one loop evaluation
    assert_eq!(done.tasks.len(), 4);
    let eval = done
        .tasks
        .iter()
        .find(|t| t.kind == TaskKind::LoopEval)
        .unwrap();
    assert_eq!(eval.output, Some(json!({"verdict": "exit", "iterations": 1})));
}

#[tokio::test]
async fn loop_iterates_until_score_passes() {
    let executor = ScriptedExecutor::new()
        .ok("generate", json!({"draft": "vN"}))
        .ok("grammar", json!({"issues": 0}))
        .script(
            "facts",
            vec![
                Ok(json!({"score": 0.5})),
                Ok(json!({"score": 0.6})),
                Ok(json!({"score": 0.9})),
            ],
        );
    let (engine, definition_id, _publisher) =
        engine_for(revision_pipeline(), executor, fast_config()).await;

    let instance = engine.create_instance(definition_id, json!({})).await.unwrap();
    let done = engine.run(instance.id).await.unwrap();

    assert_eq!(done.state, InstanceState::Completed);
    // three full iterations of (generate + grammar + facts + eval)
    assert_eq!(done.tasks.len(), 12);
    assert_eq!(
        done.tasks
            .iter()
            .filter(|t| t.kind == TaskKind::LoopEval)
            .count(),
        3
    );
}

#[tokio::test]
async fn loop_bound_exhaustion_fails_the_instance() {
    let executor = ScriptedExecutor::new()
        .ok("generate", json!({"draft": "vN"}))
        .ok("grammar", json!({"issues": 0}))
        .ok("facts", json!({"score": 0.2}));
    let (engine, definition_id, _publisher) =
        engine_for(revision_pipeline(), executor, fast_config()).await;

    let instance = engine.create_instance(definition_id, json!({})).await.unwrap();
    let done = engine.run(instance.id).await.unwrap();

    assert_eq!(done.state, InstanceState::Failed);
    let failure = done.failure.unwrap();
    assert_eq!(failure.step_id, "revise");
    assert!(failure.message.contains("loop bound exceeded"));
}

// ---------------------------------------------------------------------------
// Parallel semantics
// ---------------------------------------------------------------------------

#[tokio::test]
async fn parallel_sibling_finishes_before_group_fails() {
    let checks = step(
        "checks",
        StepKind::Parallel {
            children: vec!["grammar".to_string(), "facts".to_string()],
        },
    );
    let def = definition(
        "checks",
        vec![checks, validation("grammar"), validation("facts")],
    );

    let executor = ScriptedExecutor::new()
        .ok("grammar", json!({"issues": 0}))
        .script("facts", vec![Err(StepFailure::validation("unverifiable claim"))]);
    let (engine, definition_id, _publisher) = engine_for(def, executor, fast_config()).await;

    let instance = engine.create_instance(definition_id, json!({})).await.unwrap();
    let done = engine.run(instance.id).await.unwrap();

    assert_eq!(done.state, InstanceState::Failed);
    // the healthy sibling ran to completion behind the join barrier
    let grammar = done.tasks.iter().find(|t| t.step_id == "grammar").unwrap();
    assert_eq!(grammar.status, TaskStatus::Completed);
    let failure = done.failure.unwrap();
    assert_eq!(failure.step_id, "checks");
    assert!(failure.message.contains("facts"));
}

// ---------------------------------------------------------------------------
// Decision routing
// ---------------------------------------------------------------------------

#[tokio::test]
async fn decision_routes_first_matching_branch() {
    let mut triage = agent("triage");
    triage.edges.push(Edge::success("route"));
    let route = step(
        "route",
        StepKind::Decision {
            branches: vec![
                DecisionBranch {
                    when: Predicate::compare("triage.severity", CompareOp::Gte, json!(8)),
                    to: Some("escalate".to_string()),
                },
                DecisionBranch {
                    when: Predicate::Always,
                    to: Some("archive".to_string()),
                },
            ],
        },
    );
    let def = definition("triage", vec![triage, route, agent("escalate"), agent("archive")]);

    let executor = ScriptedExecutor::new()
        .ok("triage", json!({"severity": 9}))
        .ok("escalate", json!({"paged": true}));
    let (engine, definition_id, _publisher) = engine_for(def, executor, fast_config()).await;

    let instance = engine.create_instance(definition_id, json!({})).await.unwrap();
    let done = engine.run(instance.id).await.unwrap();

    assert_eq!(done.state, InstanceState::Completed);
    assert!(done.tasks.iter().any(|t| t.step_id == "escalate"));
    assert!(!done.tasks.iter().any(|t| t.step_id == "archive"));
    let routing = done.tasks.iter().find(|t| t.step_id == "route").unwrap();
    assert_eq!(routing.kind, TaskKind::Decision);
    assert_eq!(routing.output, Some(json!({"branch": 0, "to": "escalate"})));
}

#[tokio::test]
async fn decision_with_no_matching_branch_fails() {
    let route = step(
        "route",
        StepKind::Decision {
            branches: vec![DecisionBranch {
                when: Predicate::compare("missing.key", CompareOp::Eq, json!(1)),
                to: None,
            }],
        },
    );
    let def = definition("route", vec![route]);
    let (engine, definition_id, _publisher) =
        engine_for(def, ScriptedExecutor::new(), fast_config()).await;

    let instance = engine.create_instance(definition_id, json!({})).await.unwrap();
    let done = engine.run(instance.id).await.unwrap();

    assert_eq!(done.state, InstanceState::Failed);
    assert!(done.failure.unwrap().message.contains("no branch"));
}

// ---------------------------------------------------------------------------
// Saga compensation
// ---------------------------------------------------------------------------

fn booking_pipeline() -> WorkflowDefinition {
    let mut reserve = compensable(agent("reserve"));
    reserve.edges.push(Edge::success("charge"));
    let mut charge = compensable(agent("charge"));
    charge.edges.push(Edge::success("confirm"));
    let confirm = agent("confirm");
    definition("reserve", vec![reserve, charge, confirm])
}

#[tokio::test]
async fn permanent_failure_unwinds_in_reverse_order() {
    let executor = ScriptedExecutor::new()
        .ok("reserve", json!({"reservation": "r-1"}))
        .ok("charge", json!({"payment": "p-1"}))
        .script("confirm", vec![Err(StepFailure::business("inventory gone"))]);
    let (engine, definition_id, publisher) =
        engine_for(booking_pipeline(), executor, fast_config()).await;
    let mut rx = publisher.subscribe();

    let instance = engine.create_instance(definition_id, json!({})).await.unwrap();
    let done = engine.run(instance.id).await.unwrap();

    assert_eq!(done.state, InstanceState::Failed);
    // permanent failure consumed exactly one attempt
    let confirm = done.tasks.iter().find(|t| t.step_id == "confirm").unwrap();
    assert_eq!(confirm.status, TaskStatus::Failed);
    assert_eq!(confirm.attempt_count, 1);
    assert_eq!(done.compensations.len(), 2);
    assert!(done
        .compensations
        .iter()
        .all(|r| r.status == CompensationStatus::Completed));
    for step_id in ["reserve", "charge"] {
        let task = done.tasks.iter().find(|t| t.step_id == step_id).unwrap();
        assert_eq!(task.status, TaskStatus::Compensated);
    }

    let events = drain(&mut rx);
    assert!(events
        .iter()
        .any(|e| matches!(e, EngineEvent::CompensationTriggered { records: 2, .. })));
    assert!(matches!(
        events.last(),
        Some(EngineEvent::InstanceFailed { unresolved_compensations: 0, .. })
    ));
}

#[tokio::test]
async fn compensation_order_is_reverse_completion() {
    let executor = ScriptedExecutor::new()
        .ok("reserve", json!({}))
        .ok("charge", json!({}))
        .script("confirm", vec![Err(StepFailure::business("nope"))]);
    let (engine, definition_id, _publisher) =
        engine_for(booking_pipeline(), executor, fast_config()).await;

    let instance = engine.create_instance(definition_id, json!({})).await.unwrap();
    let done = engine.run(instance.id).await.unwrap();
    assert_eq!(done.state, InstanceState::Failed);

    let status = engine.status(instance.id).await.unwrap();
    assert_eq!(
        status
            .compensations
            .iter()
            .map(|r| r.step_id.as_str())
            .collect::<Vec<_>>(),
        vec!["charge", "reserve"]
    );
}

#[tokio::test]
async fn unresolved_compensation_is_surfaced() {
    let mut executor = ScriptedExecutor::new()
        .ok("reserve", json!({}))
        .ok("charge", json!({}))
        .script("confirm", vec![Err(StepFailure::business("nope"))]);
    executor.reject_compensation = vec!["charge".to_string()];
    let (engine, definition_id, _publisher) =
        engine_for(booking_pipeline(), executor, fast_config()).await;

    let instance = engine.create_instance(definition_id, json!({})).await.unwrap();
    let done = engine.run(instance.id).await.unwrap();

    assert_eq!(done.state, InstanceState::Failed);
    let failure = done.failure.unwrap();
    assert_eq!(failure.unresolved_compensations.len(), 1);
    let unresolved = done
        .compensations
        .iter()
        .find(|r| r.id == failure.unresolved_compensations[0])
        .unwrap();
    assert_eq!(unresolved.step_id, "charge");
    assert_eq!(unresolved.status, CompensationStatus::Failed);
}

// ---------------------------------------------------------------------------
// Failure edges
// ---------------------------------------------------------------------------

#[tokio::test]
async fn failure_edge_absorbs_the_failure() {
    let mut fetch = agent("fetch");
    fetch.max_attempts = Some(1);
    fetch.edges.push(Edge::success("process"));
    fetch.edges.push(Edge::failure("fallback"));
    let def = definition("fetch", vec![fetch, agent("process"), agent("fallback")]);

    let executor = ScriptedExecutor::new()
        .script("fetch", vec![Err(StepFailure::unavailable("origin down"))])
        .ok("fallback", json!({"source": "cache"}));
    let (engine, definition_id, _publisher) = engine_for(def, executor, fast_config()).await;

    let instance = engine.create_instance(definition_id, json!({})).await.unwrap();
    let done = engine.run(instance.id).await.unwrap();

    assert_eq!(done.state, InstanceState::Completed);
    assert!(done.failure.is_none());
    assert_eq!(
        done.tasks.iter().find(|t| t.step_id == "fetch").unwrap().status,
        TaskStatus::Failed
    );
    assert!(done.tasks.iter().any(|t| t.step_id == "fallback"));
}

// ---------------------------------------------------------------------------
// Retry and circuit breaking
// ---------------------------------------------------------------------------

#[tokio::test]
async fn transient_failures_retry_on_the_same_task() {
    let mut flaky = agent("flaky");
    flaky.max_attempts = Some(3);
    let def = definition("flaky", vec![flaky]);

    let executor = ScriptedExecutor::new().script(
        "flaky",
        vec![
            Err(StepFailure::timeout("slow")),
            Err(StepFailure::unavailable("blip")),
            Ok(json!({"ok": true})),
        ],
    );
    let (engine, definition_id, _publisher) = engine_for(def, executor, fast_config()).await;

    let instance = engine.create_instance(definition_id, json!({})).await.unwrap();
    let done = engine.run(instance.id).await.unwrap();

    assert_eq!(done.state, InstanceState::Completed);
    assert_eq!(done.tasks.len(), 1);
    assert_eq!(done.tasks[0].attempt_count, 3);
    assert_eq!(done.tasks[0].status, TaskStatus::Completed);
}

#[tokio::test]
async fn open_circuit_short_circuits_later_instances() {
    let mut call = agent("call");
    call.target = Some("billing".to_string());
    call.max_attempts = Some(1);
    let def = definition("call", vec![call]);

    let mut config = fast_config();
    config.breaker.failure_threshold = 2;
    config.breaker.cooldown_secs = 3600;

    let executor =
        ScriptedExecutor::new().script("call", vec![Err(StepFailure::unavailable("down"))]);
    let (engine, definition_id, _publisher) = engine_for(def, executor, config).await;

    // two failing runs trip the breaker for target "billing"
    for _ in 0..2 {
        let instance = engine.create_instance(definition_id, json!({})).await.unwrap();
        let done = engine.run(instance.id).await.unwrap();
        assert_eq!(done.state, InstanceState::Failed);
        assert_eq!(done.tasks[0].attempt_count, 1);
    }

    let instance = engine.create_instance(definition_id, json!({})).await.unwrap();
    let done = engine.run(instance.id).await.unwrap();
    assert_eq!(done.state, InstanceState::Failed);
    // rejected without consuming an attempt
    assert_eq!(done.tasks[0].attempt_count, 0);
    let error = done.tasks[0].error.clone().unwrap();
    assert!(error.message.contains("circuit open"));
}

// ---------------------------------------------------------------------------
// Human approval
// ---------------------------------------------------------------------------

fn approval_pipeline() -> WorkflowDefinition {
    let mut draft = compensable(agent("draft"));
    draft.edges.push(Edge::success("approve"));
    let mut approve = step(
        "approve",
        StepKind::HumanApproval {
            prompt: "publish this draft?".to_string(),
        },
    );
    approve.edges.push(Edge {
        guard: Guard::When {
            predicate: Predicate::compare("approve.decision", CompareOp::Eq, json!("approved")),
        },
        to: "publish".to_string(),
    });
    approve.edges.push(Edge {
        guard: Guard::When {
            predicate: Predicate::Always,
        },
        to: "discard".to_string(),
    });
    definition("draft", vec![draft, approve, agent("publish"), agent("discard")])
}

#[tokio::test]
async fn approval_gate_parks_and_resumes_with_decision() {
    let executor = ScriptedExecutor::new()
        .ok("draft", json!({"body": "text"}))
        .ok("publish", json!({"url": "https://example.test/post"}));
    let (engine, definition_id, publisher) =
        engine_for(approval_pipeline(), executor, fast_config()).await;
    let mut rx = publisher.subscribe();

    let instance = engine.create_instance(definition_id, json!({})).await.unwrap();
    let parked = engine.run(instance.id).await.unwrap();

    assert_eq!(parked.state, InstanceState::Paused);
    assert_eq!(parked.awaiting_approval.as_deref(), Some("approve"));
    let gate = parked.tasks.iter().find(|t| t.step_id == "approve").unwrap();
    assert_eq!(gate.status, TaskStatus::Running);
    assert_eq!(gate.input, Some(json!({"prompt": "publish this draft?"})));

    let done = engine
        .resume(instance.id, Some(json!("approved")))
        .await
        .unwrap();

    assert_eq!(done.state, InstanceState::Completed);
    assert!(done.tasks.iter().any(|t| t.step_id == "publish"));
    assert!(!done.tasks.iter().any(|t| t.step_id == "discard"));
    let gate = done.tasks.iter().find(|t| t.step_id == "approve").unwrap();
    assert_eq!(gate.status, TaskStatus::Completed);
    assert_eq!(done.context["approve"], json!({"decision": "approved"}));

    let events = drain(&mut rx);
    assert!(events.iter().any(|e| matches!(
        e,
        EngineEvent::InstancePaused { step_id: Some(s), .. } if s == "approve"
    )));
    assert!(events
        .iter()
        .any(|e| matches!(e, EngineEvent::InstanceResumed { .. })));
}

#[tokio::test]
async fn rejection_routes_to_the_discard_branch() {
    let executor = ScriptedExecutor::new()
        .ok("draft", json!({"body": "text"}))
        .ok("discard", json!({"archived": true}));
    let (engine, definition_id, _publisher) =
        engine_for(approval_pipeline(), executor, fast_config()).await;

    let instance = engine.create_instance(definition_id, json!({})).await.unwrap();
    engine.run(instance.id).await.unwrap();
    let done = engine
        .resume(instance.id, Some(json!("rejected")))
        .await
        .unwrap();

    assert_eq!(done.state, InstanceState::Completed);
    assert!(done.tasks.iter().any(|t| t.step_id == "discard"));
    assert!(!done.tasks.iter().any(|t| t.step_id == "publish"));
}

#[tokio::test]
async fn resume_with_decision_requires_an_approval_gate() {
    let executor = ScriptedExecutor::new().ok("draft", json!({}));
    let def = definition("draft", vec![agent("draft")]);
    let (engine, definition_id, _publisher) = engine_for(def, executor, fast_config()).await;

    let instance = engine.create_instance(definition_id, json!({})).await.unwrap();
    let err = engine
        .resume(instance.id, Some(json!("approved")))
        .await
        .unwrap_err();
    // pending, not paused
    assert!(matches!(err, EngineError::InvalidTransition(_)));
}

// ---------------------------------------------------------------------------
// Pause and cancel
// ---------------------------------------------------------------------------

#[tokio::test]
async fn cancel_while_parked_unwinds_and_terminates() {
    let executor = ScriptedExecutor::new().ok("draft", json!({"body": "text"}));
    let (engine, definition_id, publisher) =
        engine_for(approval_pipeline(), executor, fast_config()).await;
    let mut rx = publisher.subscribe();

    let instance = engine.create_instance(definition_id, json!({})).await.unwrap();
    let parked = engine.run(instance.id).await.unwrap();
    assert_eq!(parked.state, InstanceState::Paused);

    let done = engine.cancel(instance.id).await.unwrap();
    assert_eq!(done.state, InstanceState::Cancelled);
    // the completed draft was compensated on the way out
    assert_eq!(
        done.tasks.iter().find(|t| t.step_id == "draft").unwrap().status,
        TaskStatus::Compensated
    );
    assert!(done.failure.is_none());

    let events = drain(&mut rx);
    assert!(matches!(events.last(), Some(EngineEvent::InstanceCancelled { .. })));
}

#[tokio::test]
async fn cancel_before_start_skips_compensation() {
    let executor = ScriptedExecutor::new().ok("draft", json!({}));
    let def = definition("draft", vec![compensable(agent("draft"))]);
    let (engine, definition_id, _publisher) = engine_for(def, executor, fast_config()).await;

    let instance = engine.create_instance(definition_id, json!({})).await.unwrap();
    let done = engine.cancel(instance.id).await.unwrap();

    assert_eq!(done.state, InstanceState::Cancelled);
    assert!(done.tasks.is_empty());
    assert!(done.compensations.is_empty());
}

#[tokio::test]
async fn cancel_of_terminal_instance_is_rejected() {
    let executor = ScriptedExecutor::new().ok("draft", json!({}));
    let def = definition("draft", vec![agent("draft")]);
    let (engine, definition_id, _publisher) = engine_for(def, executor, fast_config()).await;

    let instance = engine.create_instance(definition_id, json!({})).await.unwrap();
    engine.run(instance.id).await.unwrap();

    let err = engine.cancel(instance.id).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidTransition(_)));
}

#[tokio::test]
async fn pause_and_operator_resume_without_decision() {
    let executor = ScriptedExecutor::new()
        .ok("draft", json!({"body": "text"}))
        .ok("publish", json!({"ok": true}));
    let mut draft = agent("draft");
    draft.edges.push(Edge::success("publish"));
    let def = definition("draft", vec![draft, agent("publish")]);
    let (engine, definition_id, _publisher) = engine_for(def, executor, fast_config()).await;

    let instance = engine.create_instance(definition_id, json!({})).await.unwrap();
    // run to completion of the first cycle, then pause before starting
    let err = engine.pause(instance.id).await.unwrap_err();
    // pending instances cannot pause
    assert!(matches!(err, EngineError::InvalidTransition(_)));

    let done = engine.run(instance.id).await.unwrap();
    assert_eq!(done.state, InstanceState::Completed);
}

// ---------------------------------------------------------------------------
// When-guard skips
// ---------------------------------------------------------------------------

#[tokio::test]
async fn skip_guard_records_a_skipped_task() {
    let mut notify = agent("notify");
    notify.when = Some(Predicate::compare("input.notify", CompareOp::Eq, json!(true)));
    notify.edges.push(Edge::success("archive"));
    let def = definition("notify", vec![notify, agent("archive")]);

    let executor = ScriptedExecutor::new().ok("archive", json!({"stored": true}));
    let (engine, definition_id, _publisher) = engine_for(def, executor, fast_config()).await;

    let instance = engine
        .create_instance(definition_id, json!({"notify": false}))
        .await
        .unwrap();
    let done = engine.run(instance.id).await.unwrap();

    assert_eq!(done.state, InstanceState::Completed);
    let skipped = done.tasks.iter().find(|t| t.step_id == "notify").unwrap();
    assert_eq!(skipped.status, TaskStatus::Skipped);
    assert!(done.tasks.iter().any(|t| t.step_id == "archive"));
}

// ---------------------------------------------------------------------------
// Worker pool
// ---------------------------------------------------------------------------

#[tokio::test]
async fn worker_pool_drains_submitted_instances() {
    let executor = ScriptedExecutor::new().ok("work", json!({"done": true}));
    let def = definition("work", vec![agent("work")]);
    let (engine, definition_id, publisher) = engine_for(def, executor, fast_config()).await;
    let mut rx = publisher.subscribe();

    let shutdown = tokio_util::sync::CancellationToken::new();
    let handles = engine.spawn_workers(shutdown.clone());

    let mut ids = Vec::new();
    for _ in 0..5 {
        let instance = engine.create_instance(definition_id, json!({})).await.unwrap();
        engine.submit(instance.id).unwrap();
        ids.push(instance.id);
    }

    // wait for all five completion events
    let mut completed = 0;
    while completed < 5 {
        if let EngineEvent::InstanceCompleted { .. } = rx.recv().await.unwrap() {
            completed += 1;
        }
    }

    for id in ids {
        let status = engine.status(id).await.unwrap();
        assert_eq!(status.state, InstanceState::Completed);
    }

    shutdown.cancel();
    for handle in handles {
        handle.await.unwrap();
    }
}
