//! Step runner: prepares, invokes and bounds step actions.
//!
//! `StepRunner` resolves a step's action from the registry, applies input
//! bindings to its properties, runs admitted steps concurrently under a
//! semaphore with per-step timeouts, and turns action results into output
//! bindings. It never touches persisted status; the scheduler applies results.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use wfrun_types::workflow::{WorkflowStepBase, reason};

use super::action::{ActionContext, ActionOutcome, ActionRegistry, BoxStepAction};
use super::context::{ContextError, RunContext};
use super::expression::JexlEvaluator;

// ---------------------------------------------------------------------------
// Jobs and results
// ---------------------------------------------------------------------------

/// A step ready to be invoked.
pub struct StepJob {
    pub action: Arc<BoxStepAction>,
    pub context: ActionContext,
    /// Remaining timeout budget, if the step has one.
    pub budget: Option<Duration>,
}

/// Result of one invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum StepResult {
    Completed(ActionOutcome),
    Failed { reason: String, message: String },
    TimedOut { after: Duration },
}

/// Why a step could not be turned into a job.
#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error("no action registered for step type '{0}'")]
    UnknownType(String),

    #[error("input binding failed: {0}")]
    Input(#[from] ContextError),

    #[error("output '{name}' could not be resolved: {reason}")]
    Output { name: String, reason: String },
}

impl StepError {
    /// Status reason recorded for this error.
    pub fn reason(&self) -> &'static str {
        match self {
            StepError::UnknownType(_) => reason::UNKNOWN_TYPE,
            StepError::Input(ContextError::InputNotFound(_)) => reason::INPUT_NOT_FOUND,
            StepError::Input(_) | StepError::Output { .. } => reason::OUTPUT_RESOLUTION,
        }
    }
}

// ---------------------------------------------------------------------------
// StepRunner
// ---------------------------------------------------------------------------

pub struct StepRunner {
    registry: ActionRegistry,
    evaluator: JexlEvaluator,
}

impl StepRunner {
    pub fn new(registry: ActionRegistry) -> Self {
        Self {
            registry,
            evaluator: JexlEvaluator::new(),
        }
    }

    pub fn registry(&self) -> &ActionRegistry {
        &self.registry
    }

    /// Build the job for a leaf step: look up its action and bind inputs.
    pub fn prepare(
        &self,
        run_id: Uuid,
        run_name: &str,
        step: &WorkflowStepBase,
        ctx: &RunContext,
        budget: Option<Duration>,
    ) -> Result<StepJob, StepError> {
        let action = self
            .registry
            .get(&step.step_type)
            .ok_or_else(|| StepError::UnknownType(step.step_type.clone()))?;
        let properties = ctx.apply_inputs(step.properties.as_ref(), &step.inputs)?;

        Ok(StepJob {
            action,
            context: ActionContext {
                run_id,
                run_name: run_name.to_string(),
                step_name: step.name.clone(),
                step_type: step.step_type.clone(),
                properties,
                cancel: CancellationToken::new(),
            },
            budget,
        })
    }

    /// Best-effort cancellation of a step whose timeout expired between ticks.
    pub async fn cancel_expired(&self, run_id: Uuid, run_name: &str, step: &WorkflowStepBase) {
        let Some(action) = self.registry.get(&step.step_type) else {
            return;
        };
        let context = ActionContext {
            run_id,
            run_name: run_name.to_string(),
            step_name: step.name.clone(),
            step_type: step.step_type.clone(),
            properties: step.properties.clone().unwrap_or(Value::Null),
            cancel: CancellationToken::new(),
        };
        context.cancel.cancel();
        action.cancel(&context).await;
    }

    /// Run jobs concurrently, at most `limit` at a time.
    ///
    /// Results are returned in job order. A panicking action is reported as
    /// a failure of its own step only.
    pub async fn run_all(&self, jobs: Vec<StepJob>, limit: usize) -> Vec<StepResult> {
        let count = jobs.len();
        let semaphore = Arc::new(Semaphore::new(limit.max(1)));
        let mut set = JoinSet::new();
        let mut task_keys = HashMap::with_capacity(count);

        for (key, job) in jobs.into_iter().enumerate() {
            let semaphore = semaphore.clone();
            let handle = set.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                (key, execute(job).await)
            });
            task_keys.insert(handle.id(), key);
        }

        let mut results: Vec<Option<StepResult>> = vec![None; count];
        while let Some(joined) = set.join_next_with_id().await {
            match joined {
                Ok((_, (key, result))) => results[key] = Some(result),
                Err(err) => {
                    tracing::error!(error = %err, "step action task failed");
                    if let Some(&key) = task_keys.get(&err.id()) {
                        results[key] = Some(StepResult::Failed {
                            reason: reason::ACTION_FAILURE.to_string(),
                            message: format!("step action aborted: {err}"),
                        });
                    }
                }
            }
        }

        results
            .into_iter()
            .map(|r| {
                r.unwrap_or(StepResult::Failed {
                    reason: reason::ACTION_FAILURE.to_string(),
                    message: "step action produced no result".to_string(),
                })
            })
            .collect()
    }

    /// Evaluate a step's output bindings against its result.
    ///
    /// Each `valueFrom` sees `{ output, properties }`.
    pub fn resolve_outputs(
        &self,
        step: &WorkflowStepBase,
        output: &Value,
        properties: &Value,
    ) -> Result<Vec<(String, Value)>, StepError> {
        if step.outputs.is_empty() {
            return Ok(Vec::new());
        }
        let scope = json!({ "output": output, "properties": properties });
        step.outputs
            .iter()
            .map(|item| {
                self.evaluator
                    .evaluate_value(&item.value_from, &scope)
                    .map(|value| (item.name.clone(), value))
                    .map_err(|e| StepError::Output {
                        name: item.name.clone(),
                        reason: e.to_string(),
                    })
            })
            .collect()
    }
}

/// Invoke one job under its timeout budget.
async fn execute(job: StepJob) -> StepResult {
    let StepJob {
        action,
        context,
        budget,
    } = job;

    tracing::debug!(
        run = %context.run_name,
        step = %context.step_name,
        step_type = %context.step_type,
        budget_ms = budget.map(|b| b.as_millis() as u64),
        "invoking step action"
    );

    let result = match budget {
        Some(limit) => match tokio::time::timeout(limit, action.execute(&context)).await {
            Ok(result) => result,
            Err(_) => {
                context.cancel.cancel();
                action.cancel(&context).await;
                tracing::warn!(
                    run = %context.run_name,
                    step = %context.step_name,
                    "step action timed out"
                );
                return StepResult::TimedOut { after: limit };
            }
        },
        None => action.execute(&context).await,
    };

    match result {
        Ok(outcome) => StepResult::Completed(outcome),
        Err(err) => StepResult::Failed {
            reason: err.reason().to_string(),
            message: err.to_string(),
        },
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
