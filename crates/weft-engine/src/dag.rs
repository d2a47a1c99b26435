//! Publish-time validation of workflow definitions.
//!
//! A definition is frozen forever once published, so every structural
//! guarantee the scheduler relies on is checked here: step ids resolve,
//! the entry exists, loop bounds are sane, and the forward graph is
//! acyclic. Loops re-enter their body implicitly, so no back edge ever
//! appears in the graph itself.

use std::collections::HashMap;

use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use thiserror::Error;
use weft_types::definition::{Step, StepKind, WorkflowDefinition};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum DefinitionError {
    #[error("invalid definition: {0}")]
    Invalid(String),

    #[error("duplicate step id '{0}'")]
    DuplicateStep(String),

    #[error("step '{from}' references unknown step '{to}'")]
    UnknownReference { from: String, to: String },

    #[error("cycle detected involving step '{0}'")]
    CycleDetected(String),

    #[error("definition '{name}' version {version} is already published")]
    AlreadyPublished { name: String, version: u32 },

    #[error("definition '{name}' version {version} is not newer than published version {latest}")]
    StaleVersion {
        name: String,
        version: u32,
        latest: u32,
    },
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate a definition's structure. Called once at publish; the
/// scheduler assumes everything checked here holds.
pub fn validate(definition: &WorkflowDefinition) -> Result<(), DefinitionError> {
    if definition.name.trim().is_empty() {
        return Err(DefinitionError::Invalid("name must not be empty".into()));
    }
    if definition.version == 0 {
        return Err(DefinitionError::Invalid("version must be at least 1".into()));
    }
    if definition.steps.is_empty() {
        return Err(DefinitionError::Invalid(
            "definition must contain at least one step".into(),
        ));
    }

    let mut seen: HashMap<&str, &Step> = HashMap::new();
    for step in &definition.steps {
        if step.id.trim().is_empty() {
            return Err(DefinitionError::Invalid("step id must not be empty".into()));
        }
        if seen.insert(step.id.as_str(), step).is_some() {
            return Err(DefinitionError::DuplicateStep(step.id.clone()));
        }
    }

    if !seen.contains_key(definition.entry.as_str()) {
        return Err(DefinitionError::UnknownReference {
            from: "<entry>".into(),
            to: definition.entry.clone(),
        });
    }

    for step in &definition.steps {
        if let Some(max) = step.max_attempts
            && max == 0
        {
            return Err(DefinitionError::Invalid(format!(
                "step '{}': max_attempts must be at least 1",
                step.id
            )));
        }
        if let Some(timeout) = step.timeout_secs
            && timeout == 0
        {
            return Err(DefinitionError::Invalid(format!(
                "step '{}': timeout must be at least 1 second",
                step.id
            )));
        }

        for edge in &step.edges {
            check_reference(&seen, &step.id, &edge.to)?;
        }

        match &step.kind {
            StepKind::Agent | StepKind::Validation | StepKind::HumanApproval { .. } => {}
            StepKind::Parallel { children } => {
                if children.is_empty() {
                    return Err(DefinitionError::Invalid(format!(
                        "parallel step '{}' has no children",
                        step.id
                    )));
                }
                for child_id in children {
                    let child = check_reference(&seen, &step.id, child_id)?;
                    if !child.is_task_step() {
                        return Err(DefinitionError::Invalid(format!(
                            "parallel step '{}': child '{}' must be an agent or validation step",
                            step.id, child_id
                        )));
                    }
                    if !child.edges.is_empty() {
                        return Err(DefinitionError::Invalid(format!(
                            "parallel step '{}': child '{}' must not declare edges",
                            step.id, child_id
                        )));
                    }
                }
            }
            StepKind::Decision { branches } => {
                if branches.is_empty() {
                    return Err(DefinitionError::Invalid(format!(
                        "decision step '{}' has no branches",
                        step.id
                    )));
                }
                for branch in branches {
                    if let Some(to) = &branch.to {
                        check_reference(&seen, &step.id, to)?;
                    }
                }
            }
            StepKind::Loop {
                body,
                max_iterations,
                ..
            } => {
                check_reference(&seen, &step.id, body)?;
                if *max_iterations == 0 {
                    return Err(DefinitionError::Invalid(format!(
                        "loop step '{}': max_iterations must be at least 1",
                        step.id
                    )));
                }
            }
        }
    }

    check_acyclic(definition)
}

fn check_reference<'a>(
    steps: &HashMap<&str, &'a Step>,
    from: &str,
    to: &str,
) -> Result<&'a Step, DefinitionError> {
    steps.get(to).copied().ok_or_else(|| DefinitionError::UnknownReference {
        from: from.to_string(),
        to: to.to_string(),
    })
}

/// Build the forward graph (edges, decision branches, parallel fan-out,
/// loop entry into its body) and topologically sort it.
fn check_acyclic(definition: &WorkflowDefinition) -> Result<(), DefinitionError> {
    let mut graph: DiGraph<&str, ()> = DiGraph::new();
    let mut nodes: HashMap<&str, NodeIndex> = HashMap::new();

    for step in &definition.steps {
        let idx = graph.add_node(step.id.as_str());
        nodes.insert(step.id.as_str(), idx);
    }

    for step in &definition.steps {
        let from = nodes[step.id.as_str()];
        for edge in &step.edges {
            graph.add_edge(from, nodes[edge.to.as_str()], ());
        }
        match &step.kind {
            StepKind::Parallel { children } => {
                for child in children {
                    graph.add_edge(from, nodes[child.as_str()], ());
                }
            }
            StepKind::Decision { branches } => {
                for branch in branches {
                    if let Some(to) = &branch.to {
                        graph.add_edge(from, nodes[to.as_str()], ());
                    }
                }
            }
            StepKind::Loop { body, .. } => {
                graph.add_edge(from, nodes[body.as_str()], ());
            }
            _ => {}
        }
    }

    toposort(&graph, None)
        .map(|_| ())
        .map_err(|cycle| DefinitionError::CycleDetected(graph[cycle.node_id()].to_string()))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
