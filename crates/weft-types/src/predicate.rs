//! Predicate data model for guarded edges, decision branches, and loops.
//!
//! Definitions arrive as already-validated data, so predicates are a closed
//! enum evaluated over the instance context rather than a parsed expression
//! language. Paths are dotted (`"validate.score"`) and resolve through the
//! context map into nested JSON objects.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Mutable key/value state shared across the steps of one instance.
pub type Context = HashMap<String, Value>;

// ---------------------------------------------------------------------------
// Predicate
// ---------------------------------------------------------------------------

/// Comparison operator for `Predicate::Compare`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompareOp {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
}

/// A guard condition evaluated against the instance context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Predicate {
    /// Always true.
    Always,
    /// Compare the value at `path` against a literal.
    Compare {
        path: String,
        op: CompareOp,
        value: Value,
    },
    /// True when every inner predicate is true. Empty means true.
    All { predicates: Vec<Predicate> },
    /// True when at least one inner predicate is true. Empty means false.
    Any { predicates: Vec<Predicate> },
    /// Negation.
    Not { predicate: Box<Predicate> },
}

impl Predicate {
    /// Evaluate the predicate against a context map.
    ///
    /// Missing paths never match a comparison (and so match its negation).
    pub fn matches(&self, ctx: &Context) -> bool {
        match self {
            Predicate::Always => true,
            Predicate::Compare { path, op, value } => lookup(ctx, path)
                .map(|found| compare(found, *op, value))
                .unwrap_or(false),
            Predicate::All { predicates } => predicates.iter().all(|p| p.matches(ctx)),
            Predicate::Any { predicates } => predicates.iter().any(|p| p.matches(ctx)),
            Predicate::Not { predicate } => !predicate.matches(ctx),
        }
    }

    /// Shorthand for a single comparison predicate.
    pub fn compare(path: impl Into<String>, op: CompareOp, value: Value) -> Self {
        Predicate::Compare {
            path: path.into(),
            op,
            value,
        }
    }
}

// ---------------------------------------------------------------------------
// Path resolution and comparison
// ---------------------------------------------------------------------------

/// Resolve a dotted path against the context map.
///
/// The first segment selects a top-level context key; the remaining segments
/// descend into JSON objects.
fn lookup<'a>(ctx: &'a Context, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let mut current = ctx.get(segments.next()?)?;
    for segment in segments {
        current = current.get(segment)?;
    }
    Some(current)
}

/// Compare two JSON values under the given operator.
///
/// Numbers compare numerically; everything else supports only equality and
/// inequality. Ordering operators on non-numeric values evaluate to false.
fn compare(found: &Value, op: CompareOp, expected: &Value) -> bool {
    if let (Some(a), Some(b)) = (found.as_f64(), expected.as_f64()) {
        return match op {
            CompareOp::Eq => a == b,
            CompareOp::Ne => a != b,
            CompareOp::Gt => a > b,
            CompareOp::Gte => a >= b,
            CompareOp::Lt => a < b,
            CompareOp::Lte => a <= b,
        };
    }
    match op {
        CompareOp::Eq => found == expected,
        CompareOp::Ne => found != expected,
        _ => false,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
