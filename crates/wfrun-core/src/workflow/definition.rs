//! Workflow manifest parsing and validation.
//!
//! Converts YAML documents into `WorkflowRun` and `Workflow` values and
//! validates structural constraints (exactly one step source, non-empty
//! unique names, resolvable acyclic dependencies, parseable timeouts)
//! before anything is persisted.

use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use wfrun_types::workflow::{
    Workflow, WorkflowExecuteMode, WorkflowRun, WorkflowRunSpec, WorkflowStep, WorkflowStepBase,
};

use super::graph::{GraphError, validate_workflow};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur while loading workflow manifests.
#[derive(Debug, Error)]
pub enum WorkflowError {
    /// YAML/JSON parse failure.
    #[error("parse error: {0}")]
    ParseError(String),

    /// Structural validation failure.
    #[error("validation error: {0}")]
    ValidationError(String),

    /// Dependency graph problem.
    #[error(transparent)]
    Graph(#[from] GraphError),

    /// Unparseable duration string.
    #[error("invalid duration '{0}'")]
    InvalidDuration(String),
}

// ---------------------------------------------------------------------------
// Manifests
// ---------------------------------------------------------------------------

/// A parsed manifest document.
#[derive(Debug, Clone, PartialEq)]
pub enum Manifest {
    Run(WorkflowRun),
    Workflow(Workflow),
}

impl Manifest {
    pub fn name(&self) -> &str {
        match self {
            Manifest::Run(run) => &run.name,
            Manifest::Workflow(workflow) => &workflow.name,
        }
    }
}

#[derive(Debug, Deserialize)]
struct Metadata {
    name: String,
}

#[derive(Debug, Deserialize)]
struct RunDocument {
    metadata: Metadata,
    #[serde(default)]
    spec: WorkflowRunSpec,
}

#[derive(Debug, Deserialize)]
struct WorkflowDocument {
    metadata: Metadata,
    #[serde(default)]
    mode: Option<WorkflowExecuteMode>,
    #[serde(default)]
    steps: Vec<WorkflowStep>,
}

/// Parse and validate a manifest.
///
/// ```yaml
/// kind: WorkflowRun
/// metadata:
///   name: nightly
/// spec:
///   mode: { steps: DAG }
///   workflowSpec:
///     steps:
///       - name: build
///         type: noop
/// ```
///
/// `kind: Workflow` documents carry `mode` and `steps` at the top level and
/// can be referenced from runs through `spec.workflowRef`.
pub fn parse_manifest(yaml: &str) -> Result<Manifest, WorkflowError> {
    let doc: Value =
        serde_yaml_ng::from_str(yaml).map_err(|e| WorkflowError::ParseError(e.to_string()))?;
    let kind = doc
        .get("kind")
        .and_then(Value::as_str)
        .unwrap_or("WorkflowRun")
        .to_string();

    match kind.as_str() {
        "WorkflowRun" => {
            let doc: RunDocument = serde_json::from_value(doc)
                .map_err(|e| WorkflowError::ParseError(e.to_string()))?;
            validate_name(&doc.metadata.name)?;
            validate_run_spec(&doc.spec)?;
            Ok(Manifest::Run(WorkflowRun::new(doc.metadata.name, doc.spec)))
        }
        "Workflow" => {
            let doc: WorkflowDocument = serde_json::from_value(doc)
                .map_err(|e| WorkflowError::ParseError(e.to_string()))?;
            validate_name(&doc.metadata.name)?;
            validate_steps(&doc.steps)?;
            Ok(Manifest::Workflow(Workflow {
                name: doc.metadata.name,
                mode: doc.mode,
                steps: doc.steps,
                created_at: chrono::Utc::now(),
            }))
        }
        other => Err(WorkflowError::ParseError(format!(
            "unsupported manifest kind '{other}'"
        ))),
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

fn validate_name(name: &str) -> Result<(), WorkflowError> {
    if name.is_empty() {
        return Err(WorkflowError::ValidationError(
            "metadata.name must not be empty".to_string(),
        ));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
    {
        return Err(WorkflowError::ValidationError(format!(
            "name '{name}' contains invalid characters"
        )));
    }
    Ok(())
}

/// Check a run spec names exactly one step source and, when inline, that
/// its steps are valid.
pub fn validate_run_spec(spec: &WorkflowRunSpec) -> Result<(), WorkflowError> {
    match (&spec.workflow_spec, &spec.workflow_ref) {
        (Some(_), Some(_)) => Err(WorkflowError::ValidationError(
            "workflowSpec and workflowRef are mutually exclusive".to_string(),
        )),
        (None, None) => Err(WorkflowError::ValidationError(
            "one of workflowSpec or workflowRef is required".to_string(),
        )),
        (Some(inline), None) => validate_steps(&inline.steps),
        (None, Some(reference)) if reference.is_empty() => Err(WorkflowError::ValidationError(
            "workflowRef must not be empty".to_string(),
        )),
        (None, Some(_)) => Ok(()),
    }
}

/// Validate a step list: names, dependency graphs and timeouts.
pub fn validate_steps(steps: &[WorkflowStep]) -> Result<(), WorkflowError> {
    for step in steps {
        check_step(&step.base)?;
        for sub in &step.sub_steps {
            check_step(sub)?;
        }
    }
    validate_workflow(steps)?;
    Ok(())
}

fn check_step(step: &WorkflowStepBase) -> Result<(), WorkflowError> {
    if step.name.is_empty() {
        return Err(WorkflowError::ValidationError(
            "step name must not be empty".to_string(),
        ));
    }
    if let Some(timeout) = &step.timeout {
        parse_duration(timeout)?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Durations
// ---------------------------------------------------------------------------

/// Parse a duration such as `500ms`, `30s`, `5m`, `1h30m` or `1d`.
///
/// A bare number is read as seconds. Zero is rejected.
pub fn parse_duration(input: &str) -> Result<Duration, WorkflowError> {
    let invalid = || WorkflowError::InvalidDuration(input.to_string());
    let s = input.trim();
    if s.is_empty() {
        return Err(invalid());
    }
    if let Ok(secs) = s.parse::<u64>() {
        return match secs {
            0 => Err(invalid()),
            n => Ok(Duration::from_secs(n)),
        };
    }

    let mut total = Duration::ZERO;
    let mut rest = s;
    while !rest.is_empty() {
        let digits = rest
            .find(|c: char| !c.is_ascii_digit())
            .ok_or_else(invalid)?;
        if digits == 0 {
            return Err(invalid());
        }
        let value: u64 = rest[..digits].parse().map_err(|_| invalid())?;
        rest = &rest[digits..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit())
            .unwrap_or(rest.len());
        let unit = &rest[..unit_len];
        rest = &rest[unit_len..];

        let part = match unit {
            "ms" => Duration::from_millis(value),
            "s" => Duration::from_secs(value),
            "m" => Duration::from_secs(value.checked_mul(60).ok_or_else(invalid)?),
            "h" => Duration::from_secs(value.checked_mul(3_600).ok_or_else(invalid)?),
            "d" => Duration::from_secs(value.checked_mul(86_400).ok_or_else(invalid)?),
            _ => return Err(invalid()),
        };
        total = total.checked_add(part).ok_or_else(invalid)?;
    }

    if total.is_zero() {
        return Err(invalid());
    }
    Ok(total)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
