//! Run context: key/value bindings that carry step outputs to downstream inputs.
//!
//! `RunContext` is loaded from the [`ContextStore`](crate::repository::context_store::ContextStore)
//! named by the run's `contextBackend` at the start of a tick, mutated only by
//! the scheduler while applying step results, and saved before the status is
//! recorded. Values are size-limited to keep the backend bounded.

use std::collections::BTreeMap;

use serde_json::{Map, Value, json};
use uuid::Uuid;
use wfrun_types::workflow::{InputItem, StepStatus, WorkflowRunStatus, WorkflowStepPhase};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Maximum size of a single context value (1 MB).
pub const MAX_VALUE_SIZE: usize = 1_048_576;

/// Maximum total size of all context data (10 MB).
pub const MAX_CONTEXT_SIZE: usize = 10_485_760;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ContextError {
    #[error("context variable '{0}' not found")]
    InputNotFound(String),

    #[error("total context size ({size} bytes) exceeds maximum ({max} bytes)")]
    TooLarge { size: usize, max: usize },

    #[error("failed to serialize context value: {0}")]
    Serialize(String),
}

// ---------------------------------------------------------------------------
// RunContext
// ---------------------------------------------------------------------------

/// Context variables of one run.
#[derive(Debug, Clone, Default)]
pub struct RunContext {
    variables: BTreeMap<String, Value>,
    dirty: bool,
}

impl RunContext {
    pub fn new(variables: BTreeMap<String, Value>) -> Self {
        Self {
            variables,
            dirty: false,
        }
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.variables.get(name)
    }

    pub fn variables(&self) -> &BTreeMap<String, Value> {
        &self.variables
    }

    /// Whether any variable changed since the context was loaded.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Bind a variable.
    ///
    /// Values larger than `MAX_VALUE_SIZE` are replaced by a truncation
    /// marker. Fails when the total context would exceed `MAX_CONTEXT_SIZE`;
    /// the variable is not stored in that case.
    pub fn set(&mut self, name: &str, value: Value) -> Result<(), ContextError> {
        let serialized =
            serde_json::to_string(&value).map_err(|e| ContextError::Serialize(e.to_string()))?;

        let value = if serialized.len() > MAX_VALUE_SIZE {
            tracing::warn!(
                variable = name,
                size = serialized.len(),
                max = MAX_VALUE_SIZE,
                "context value exceeds size limit, truncating"
            );
            json!({
                "_truncated": true,
                "_original_size": serialized.len(),
            })
        } else {
            value
        };

        let previous = self.variables.insert(name.to_string(), value);
        let total = self.total_size();
        if total > MAX_CONTEXT_SIZE {
            match previous {
                Some(old) => self.variables.insert(name.to_string(), old),
                None => self.variables.remove(name),
            };
            return Err(ContextError::TooLarge {
                size: total,
                max: MAX_CONTEXT_SIZE,
            });
        }

        self.dirty = true;
        Ok(())
    }

    /// Drop every binding.
    pub fn clear(&mut self) {
        if !self.variables.is_empty() {
            self.variables.clear();
            self.dirty = true;
        }
    }

    fn total_size(&self) -> usize {
        self.variables
            .iter()
            .map(|(k, v)| k.len() + serde_json::to_string(v).map(|s| s.len()).unwrap_or(0))
            .sum()
    }

    /// Copy each input's context variable into `properties` at its dotted
    /// `parameterKey`.
    pub fn apply_inputs(
        &self,
        properties: Option<&Value>,
        inputs: &[InputItem],
    ) -> Result<Value, ContextError> {
        let mut resolved = match properties {
            Some(Value::Object(map)) => Value::Object(map.clone()),
            Some(Value::Null) | None => Value::Object(Map::new()),
            Some(other) => other.clone(),
        };

        for input in inputs {
            let value = self
                .variables
                .get(&input.from)
                .ok_or_else(|| ContextError::InputNotFound(input.from.clone()))?;
            set_path(&mut resolved, &input.parameter_key, value.clone());
        }

        Ok(resolved)
    }

    /// Build the object that step conditions evaluate against.
    ///
    /// Shape:
    /// ```json
    /// {
    ///   "context": { "<var>": <value>, ... },
    ///   "inputs": { "<var>": <value>, ... },
    ///   "steps": { "<name>": { "phase": "...", "succeeded": bool, ... }, ... },
    ///   "run": { "name": "...", "id": "..." }
    /// }
    /// ```
    ///
    /// `siblings` are the sub-step statuses of the group being evaluated; they
    /// shadow top-level entries of the same name.
    pub fn expression_context(
        &self,
        run_name: &str,
        run_id: Uuid,
        status: &WorkflowRunStatus,
        siblings: Option<&[StepStatus]>,
    ) -> Value {
        let mut steps = Map::new();
        for top in &status.steps {
            let mut entry = step_entry(&top.step);
            if !top.sub_steps.is_empty() {
                let subs: Map<String, Value> = top
                    .sub_steps
                    .iter()
                    .map(|s| (s.name.clone(), step_entry(s)))
                    .collect();
                entry["subSteps"] = Value::Object(subs);
            }
            steps.insert(top.step.name.clone(), entry);
        }
        for sibling in siblings.unwrap_or_default() {
            steps.insert(sibling.name.clone(), step_entry(sibling));
        }

        json!({
            "context": self.variables,
            "inputs": self.variables,
            "steps": steps,
            "run": { "name": run_name, "id": run_id.to_string() },
        })
    }
}

fn step_entry(status: &StepStatus) -> Value {
    json!({
        "phase": status.phase,
        "succeeded": status.phase == WorkflowStepPhase::Succeeded,
        "failed": status.phase == WorkflowStepPhase::Failed,
        "skipped": status.phase == WorkflowStepPhase::Skipped,
        "reason": status.reason,
        "message": status.message,
    })
}

/// Set `value` at a dotted path, creating intermediate objects and replacing
/// non-object intermediates.
fn set_path(target: &mut Value, path: &str, value: Value) {
    if !target.is_object() {
        *target = Value::Object(Map::new());
    }
    let Value::Object(map) = target else {
        return;
    };
    match path.split_once('.') {
        Some((head, rest)) => {
            let child = map
                .entry(head.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            set_path(child, rest, value);
        }
        None => {
            map.insert(path.to_string(), value);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
