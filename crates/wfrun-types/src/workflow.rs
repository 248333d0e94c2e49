//! Workflow run domain types.
//!
//! A `WorkflowRun` carries its step definitions (inline or by reference to a
//! stored `Workflow`), the execution mode, and the persisted status tree that
//! the scheduler advances one tick at a time. Field names serialize in
//! camelCase so stored records read like the resource documents users apply.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::condition::{Condition, ConditionedStatus};

/// Step type reserved for groups whose only job is to run their sub-steps.
pub const STEP_GROUP_TYPE: &str = "step-group";

/// Kind recorded in `contextBackend` for run context stores.
pub const CONTEXT_BACKEND_KIND: &str = "WorkflowContext";

// ---------------------------------------------------------------------------
// Modes
// ---------------------------------------------------------------------------

/// How sibling steps are admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum WorkflowMode {
    /// Steps become eligible as soon as their dependencies are satisfied.
    #[serde(rename = "DAG")]
    Dag,
    /// Steps run strictly in definition order, one at a time.
    #[default]
    #[serde(rename = "StepByStep")]
    StepByStep,
}

impl fmt::Display for WorkflowMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkflowMode::Dag => f.write_str("DAG"),
            WorkflowMode::StepByStep => f.write_str("StepByStep"),
        }
    }
}

/// Execution mode selected independently for top-level steps and sub-steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WorkflowExecuteMode {
    pub steps: WorkflowMode,
    pub sub_steps: WorkflowMode,
}

impl Default for WorkflowExecuteMode {
    fn default() -> Self {
        Self {
            steps: WorkflowMode::StepByStep,
            sub_steps: WorkflowMode::Dag,
        }
    }
}

// ---------------------------------------------------------------------------
// Phases
// ---------------------------------------------------------------------------

/// Lifecycle phase of a whole run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowRunPhase {
    #[default]
    Initializing,
    Executing,
    Suspending,
    Terminated,
    Succeeded,
}

impl WorkflowRunPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowRunPhase::Initializing => "initializing",
            WorkflowRunPhase::Executing => "executing",
            WorkflowRunPhase::Suspending => "suspending",
            WorkflowRunPhase::Terminated => "terminated",
            WorkflowRunPhase::Succeeded => "succeeded",
        }
    }
}

impl fmt::Display for WorkflowRunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle phase of a single step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowStepPhase {
    /// Not yet admitted.
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
    Stopped,
}

impl WorkflowStepPhase {
    /// Terminal phases are never left again except through an explicit restart.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkflowStepPhase::Succeeded
                | WorkflowStepPhase::Failed
                | WorkflowStepPhase::Skipped
                | WorkflowStepPhase::Stopped
        )
    }

    /// Whether a dependent may be admitted once its dependency reaches this phase.
    pub fn satisfies_dependency(&self) -> bool {
        matches!(self, WorkflowStepPhase::Succeeded | WorkflowStepPhase::Skipped)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowStepPhase::Pending => "pending",
            WorkflowStepPhase::Running => "running",
            WorkflowStepPhase::Succeeded => "succeeded",
            WorkflowStepPhase::Failed => "failed",
            WorkflowStepPhase::Skipped => "skipped",
            WorkflowStepPhase::Stopped => "stopped",
        }
    }
}

impl fmt::Display for WorkflowStepPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Well-known values for `StepStatus::reason`.
pub mod reason {
    pub const TIMEOUT: &str = "Timeout";
    pub const CONDITION_EVALUATION_ERROR: &str = "ConditionEvaluationError";
    pub const ACTION_FAILURE: &str = "ActionFailure";
    pub const ACTION: &str = "Action";
    pub const SKIP: &str = "Skip";
    pub const SUSPEND: &str = "Suspend";
    pub const RESUME: &str = "Resume";
    pub const TERMINATE: &str = "Terminate";
    pub const INPUT_NOT_FOUND: &str = "InputNotFound";
    pub const OUTPUT_RESOLUTION: &str = "OutputResolution";
    pub const UNKNOWN_TYPE: &str = "UnknownType";
    pub const INVALID_SPEC: &str = "InvalidSpec";
}

// ---------------------------------------------------------------------------
// Step definitions
// ---------------------------------------------------------------------------

/// Display metadata for a step.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct WorkflowStepMeta {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub alias: String,
}

/// Binds a context variable into the step properties before execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputItem {
    /// Dotted path inside `properties` that receives the value.
    pub parameter_key: String,
    /// Context variable to read.
    pub from: String,
}

/// Publishes a value derived from the step result into the run context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputItem {
    /// Expression evaluated against `{ output, properties }`.
    pub value_from: String,
    /// Context variable written with the result.
    pub name: String,
}

/// Fields shared by top-level steps and sub-steps.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowStepBase {
    pub name: String,
    #[serde(rename = "type", default)]
    pub step_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<WorkflowStepMeta>,
    /// Admission condition; the step is skipped when it evaluates false.
    #[serde(rename = "if", default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    /// Duration string such as `30s`, `5m` or `1h30m`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inputs: Vec<InputItem>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outputs: Vec<OutputItem>,
    /// Opaque parameters handed to the step action.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub properties: Option<Value>,
}

impl WorkflowStepBase {
    /// Name shown to humans: the alias when set, otherwise the step name.
    pub fn display_name(&self) -> &str {
        match &self.meta {
            Some(meta) if !meta.alias.is_empty() => &meta.alias,
            _ => &self.name,
        }
    }
}

/// A top-level step, optionally a group of sub-steps.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowStep {
    #[serde(flatten)]
    pub base: WorkflowStepBase,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sub_steps: Vec<WorkflowStepBase>,
}

impl WorkflowStep {
    pub fn is_group(&self) -> bool {
        !self.sub_steps.is_empty() || self.base.step_type == STEP_GROUP_TYPE
    }
}

/// Inline step list of a run.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct WorkflowSpec {
    #[serde(default)]
    pub steps: Vec<WorkflowStep>,
}

/// Reusable, separately stored step list referenced by `workflowRef`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Workflow {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<WorkflowExecuteMode>,
    #[serde(default)]
    pub steps: Vec<WorkflowStep>,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Run
// ---------------------------------------------------------------------------

/// Desired state of a run.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowRunSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<WorkflowExecuteMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_spec: Option<WorkflowSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_ref: Option<String>,
}

/// Reference to the externally stored key/value context of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextBackendRef {
    pub kind: String,
    pub name: String,
}

impl ContextBackendRef {
    /// Backend reference derived from the run name.
    pub fn for_run(run_name: &str) -> Self {
        Self {
            kind: CONTEXT_BACKEND_KIND.to_string(),
            name: format!("workflow-{run_name}-context"),
        }
    }
}

/// Execution record of one step or sub-step.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepStatus {
    pub id: String,
    pub name: String,
    #[serde(rename = "type", default, skip_serializing_if = "String::is_empty")]
    pub step_type: String,
    #[serde(default)]
    pub phase: WorkflowStepPhase,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_execute_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_execute_time: Option<DateTime<Utc>>,
}

impl StepStatus {
    /// Fresh pending record for a step definition.
    pub fn pending(step: &WorkflowStepBase) -> Self {
        Self {
            id: Uuid::now_v7().to_string(),
            name: step.name.clone(),
            step_type: step.step_type.clone(),
            ..Self::default()
        }
    }

    /// Move to a terminal or running phase with the given reason and message.
    pub fn set_phase(&mut self, phase: WorkflowStepPhase, reason: &str, message: impl Into<String>) {
        self.phase = phase;
        self.reason = reason.to_string();
        self.message = message.into();
    }
}

/// Execution record of a top-level step including its sub-steps.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowStepStatus {
    #[serde(flatten)]
    pub step: StepStatus,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sub_steps: Vec<StepStatus>,
}

/// Observed state of a run.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowRunStatus {
    #[serde(flatten)]
    pub conditioned: ConditionedStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<WorkflowExecuteMode>,
    #[serde(rename = "status", default)]
    pub phase: WorkflowRunPhase,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[serde(default)]
    pub suspend: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub suspend_state: String,
    #[serde(default)]
    pub terminated: bool,
    #[serde(default)]
    pub finished: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_backend: Option<ContextBackendRef>,
    /// Step definitions resolved from `workflowRef` on the first tick.
    /// Later ticks run from this copy, so edits to the stored workflow only
    /// take effect after a restart.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_workflow: Option<WorkflowSpec>,
    #[serde(default)]
    pub steps: Vec<WorkflowStepStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
}

impl WorkflowRunStatus {
    /// Whether the status tree has been initialized by a first tick.
    pub fn is_initialized(&self) -> bool {
        self.phase != WorkflowRunPhase::Initializing
    }

    /// Top-level step status by name.
    pub fn step(&self, name: &str) -> Option<&WorkflowStepStatus> {
        self.steps.iter().find(|s| s.step.name == name)
    }

    pub fn step_mut(&mut self, name: &str) -> Option<&mut WorkflowStepStatus> {
        self.steps.iter_mut().find(|s| s.step.name == name)
    }
}

/// One execution instance of a workflow's step list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowRun {
    pub id: Uuid,
    pub name: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub spec: WorkflowRunSpec,
    #[serde(default)]
    pub status: WorkflowRunStatus,
}

impl WorkflowRun {
    /// New run with an empty status.
    pub fn new(name: impl Into<String>, spec: WorkflowRunSpec) -> Self {
        Self {
            id: Uuid::now_v7(),
            name: name.into(),
            created_at: Utc::now(),
            spec,
            status: WorkflowRunStatus::default(),
        }
    }

    /// Effective execution mode: status overrides spec, spec overrides defaults.
    pub fn execute_mode(&self) -> WorkflowExecuteMode {
        self.status.mode.or(self.spec.mode).unwrap_or_default()
    }

    pub fn set_conditions(&mut self, conditions: impl IntoIterator<Item = Condition>) {
        self.status.conditioned.set_conditions(conditions);
    }

    pub fn get_condition(&self, condition_type: &str) -> Condition {
        self.status.conditioned.get_condition(condition_type)
    }
}
