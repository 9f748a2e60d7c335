//! Expression Evaluator
//!
//! Resolves `${path}` references and evaluates guard/output expressions
//! against an instance's variables. Expressions are parsed by a small
//! grammar ([`parser`]) and evaluated by walking the tree ([`eval`]); there is
//! no dynamic code execution, so evaluation is sandboxed and deterministic.

pub mod eval;
pub mod parser;

use regex::Regex;
use serde_json::Value;
use std::sync::LazyLock;
use tracing::debug;

use crate::events::{EngineEvent, EventBus};
use crate::types::Variables;

pub use eval::{is_truthy, lookup_path};
pub use parser::{parse_expression, BinaryOp, Expr, UnaryOp};

/// `${a.b.c}` and nothing else.
static PURE_REFERENCE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*\$\{\s*([A-Za-z_][A-Za-z0-9_]*(?:\.[A-Za-z0-9_]+)*)\s*\}\s*$").unwrap()
});

/// Any `${...}` block.
static REFERENCE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\$\{([^}]*)\}").unwrap());

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ExpressionError {
    #[error("Failed to parse expression '{expression}': {message}")]
    Parse { expression: String, message: String },

    #[error("Type error: {0}")]
    Type(String),

    #[error("Division by zero")]
    DivisionByZero,
}

/// Evaluates expressions against a variable map.
#[derive(Debug, Clone, Default)]
pub struct ExpressionEvaluator {
    events: Option<EventBus>,
}

impl ExpressionEvaluator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish `expression.evaluate.*` events on the given bus.
    pub fn with_events(events: EventBus) -> Self {
        Self {
            events: Some(events),
        }
    }

    /// Evaluate an expression.
    ///
    /// Returns `Ok(None)` for undefined (a pure reference to a missing path),
    /// `Ok(Some(Value::Null))` for an explicit null.
    pub fn evaluate(
        &self,
        expression: &str,
        variables: &Variables,
    ) -> Result<Option<Value>, ExpressionError> {
        self.publish(EngineEvent::ExpressionEvaluateStart {
            expression: expression.to_string(),
        });

        let result = evaluate_raw(expression, variables);

        match &result {
            Ok(value) => self.publish(EngineEvent::ExpressionEvaluateEnd {
                expression: expression.to_string(),
                result: value.clone(),
            }),
            Err(e) => self.publish(EngineEvent::ExpressionEvaluateError {
                expression: expression.to_string(),
                error: e.to_string(),
            }),
        }
        result
    }

    /// Evaluate and coerce to boolean.
    pub fn evaluate_condition(
        &self,
        expression: &str,
        variables: &Variables,
    ) -> Result<bool, ExpressionError> {
        let value = self.evaluate(expression, variables)?;
        Ok(is_truthy(value.as_ref()))
    }

    /// Resolve a dotted path directly. Never fails.
    pub fn resolve(&self, path: &str, variables: &Variables) -> Option<Value> {
        let segments: Vec<&str> = path.split('.').collect();
        lookup_path(variables, &segments)
    }

    /// Paths referenced by an expression, without evaluating it.
    pub fn parse_variables(&self, expression: &str) -> Vec<String> {
        parse_variables(expression)
    }

    fn publish(&self, event: EngineEvent) {
        if let Some(bus) = &self.events {
            bus.publish(event);
        }
    }
}

fn evaluate_raw(expression: &str, variables: &Variables) -> Result<Option<Value>, ExpressionError> {
    if let Some(caps) = PURE_REFERENCE_RE.captures(expression) {
        let path: Vec<&str> = caps[1].split('.').collect();
        let value = lookup_path(variables, &path);
        debug!(expression, resolved = value.is_some(), "resolved reference");
        return Ok(value);
    }

    let ast = parse_expression(expression).map_err(|message| ExpressionError::Parse {
        expression: expression.to_string(),
        message,
    })?;
    eval::evaluate(&ast, variables)
}

/// Extract referenced variable paths, in order of first appearance.
///
/// `${a} and ${b.c}` yields `["a", "b.c"]`. Blocks holding a whole expression
/// (`${amount > limit}`) contribute every path they mention.
pub fn parse_variables(expression: &str) -> Vec<String> {
    let mut paths = Vec::new();
    for caps in REFERENCE_RE.captures_iter(expression) {
        let body = caps[1].trim();
        if body.is_empty() {
            continue;
        }
        match parse_expression(body) {
            Ok(ast) => ast.collect_paths(&mut paths),
            Err(_) => {
                if !paths.iter().any(|p| p == body) {
                    paths.push(body.to_string());
                }
            }
        }
    }
    paths
}
