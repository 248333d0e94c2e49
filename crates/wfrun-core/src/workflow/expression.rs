//! Condition evaluation for step `if` clauses and output bindings.
//!
//! The scheduler only needs a yes/no answer per condition, so it talks to the
//! [`ConditionEvaluator`] trait. [`JexlEvaluator`] is the default adapter: it
//! wraps `jexl_eval::Evaluator` with a handful of string transforms and also
//! resolves output `valueFrom` expressions to raw JSON values.
//!
//! Run data is always passed as the context object, never spliced into the
//! expression text.

use serde_json::{Value, json};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur during expression evaluation.
#[derive(Debug, thiserror::Error)]
pub enum ExpressionError {
    #[error("expression '{expression}' failed: {reason}")]
    EvalFailed { expression: String, reason: String },

    #[error("invalid context: {0}")]
    InvalidContext(String),
}

// ---------------------------------------------------------------------------
// ConditionEvaluator
// ---------------------------------------------------------------------------

/// Boolean-producing adapter over an expression language.
///
/// `Ok(false)` skips the step; `Err` fails it with a condition evaluation
/// error.
pub trait ConditionEvaluator: Send + Sync {
    fn evaluate(&self, expression: &str, context: &Value) -> Result<bool, ExpressionError>;
}

// ---------------------------------------------------------------------------
// JexlEvaluator
// ---------------------------------------------------------------------------

/// JEXL evaluator with string and collection transforms registered.
///
/// Expressions see the object built by
/// [`RunContext::expression_context`](super::context::RunContext::expression_context),
/// e.g. `steps.build.phase == 'succeeded' && context.env|lower == 'prod'`.
pub struct JexlEvaluator {
    evaluator: jexl_eval::Evaluator<'static>,
}

impl JexlEvaluator {
    pub fn new() -> Self {
        let evaluator = jexl_eval::Evaluator::new()
            .with_transform("lower", |args: &[Value]| {
                Ok(json!(str_arg(args, 0).to_lowercase()))
            })
            .with_transform("upper", |args: &[Value]| {
                Ok(json!(str_arg(args, 0).to_uppercase()))
            })
            .with_transform("trim", |args: &[Value]| Ok(json!(str_arg(args, 0).trim())))
            .with_transform("contains", |args: &[Value]| {
                let found = match args.first() {
                    Some(Value::Array(items)) => {
                        items.contains(args.get(1).unwrap_or(&Value::Null))
                    }
                    _ => str_arg(args, 0).contains(str_arg(args, 1)),
                };
                Ok(json!(found))
            })
            .with_transform("startsWith", |args: &[Value]| {
                Ok(json!(str_arg(args, 0).starts_with(str_arg(args, 1))))
            })
            .with_transform("endsWith", |args: &[Value]| {
                Ok(json!(str_arg(args, 0).ends_with(str_arg(args, 1))))
            })
            .with_transform("not", |args: &[Value]| {
                Ok(json!(!truthy(args.first().unwrap_or(&Value::Null))))
            })
            .with_transform("default", |args: &[Value]| {
                let value = args.first().cloned().unwrap_or(Value::Null);
                if value.is_null() {
                    Ok(args.get(1).cloned().unwrap_or(Value::Null))
                } else {
                    Ok(value)
                }
            })
            .with_transform("length", |args: &[Value]| {
                let len = match args.first() {
                    Some(Value::String(s)) => s.chars().count(),
                    Some(Value::Array(a)) => a.len(),
                    Some(Value::Object(o)) => o.len(),
                    _ => 0,
                };
                Ok(json!(len as f64))
            });

        Self { evaluator }
    }

    /// Evaluate an expression and return the raw JSON value.
    pub fn evaluate_value(&self, expression: &str, context: &Value) -> Result<Value, ExpressionError> {
        if !context.is_object() {
            return Err(ExpressionError::InvalidContext(
                "context must be a JSON object".to_string(),
            ));
        }

        self.evaluator
            .eval_in_context(expression, context)
            .map_err(|e| ExpressionError::EvalFailed {
                expression: expression.to_string(),
                reason: e.to_string(),
            })
    }

    /// Evaluate an expression and coerce the result with JavaScript-like truthiness.
    pub fn evaluate_bool(&self, expression: &str, context: &Value) -> Result<bool, ExpressionError> {
        self.evaluate_value(expression, context).map(|v| truthy(&v))
    }
}

impl Default for JexlEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

impl ConditionEvaluator for JexlEvaluator {
    fn evaluate(&self, expression: &str, context: &Value) -> Result<bool, ExpressionError> {
        self.evaluate_bool(expression, context)
    }
}

fn str_arg(args: &[Value], i: usize) -> &str {
    args.get(i).and_then(|v| v.as_str()).unwrap_or("")
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Null => false,
        Value::Number(n) => n.as_f64().unwrap_or(0.0) != 0.0,
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
