//! Pure admission and aggregation rules.
//!
//! Everything here is a function of step definitions (via their
//! [`StepGraph`]) and persisted phases only: no clock, no I/O, no
//! concurrency. The scheduler calls these on a snapshot taken at the start
//! of a tick, so admission order can never violate dependency order.

use wfrun_types::config::FailurePolicy;
use wfrun_types::workflow::{WorkflowExecuteMode, WorkflowMode, WorkflowRunStatus, WorkflowStepPhase};

use super::graph::StepGraph;

/// Admission decision for the top level of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TickPlan {
    /// Definition indices of admitted top-level steps, ascending.
    pub admitted: Vec<usize>,
    /// Whether any top-level step can still reach a terminal phase.
    pub can_progress: bool,
}

/// Run-level verdict derived from the step tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunVerdict {
    Executing,
    Suspending,
    Succeeded,
    /// Terminated because of the named step.
    Terminated { step: String, phase: WorkflowStepPhase },
}

/// Steps admissible this tick.
///
/// - DAG: every non-terminal step whose dependencies are all succeeded or
///   skipped.
/// - StepByStep: only the first non-terminal step in definition order,
///   ignoring `dependsOn`, and none if an earlier step failed or stopped.
pub fn admissible(graph: &StepGraph, phases: &[WorkflowStepPhase], mode: WorkflowMode) -> Vec<usize> {
    match mode {
        WorkflowMode::Dag => (0..phases.len())
            .filter(|&i| !phases[i].is_terminal())
            .filter(|&i| {
                graph
                    .dependencies(i)
                    .iter()
                    .all(|&d| phases[d].satisfies_dependency())
            })
            .collect(),
        WorkflowMode::StepByStep => {
            let Some(first) = phases.iter().position(|p| !p.is_terminal()) else {
                return Vec::new();
            };
            if phases[..first].iter().any(|p| blocks(*p)) {
                return Vec::new();
            }
            vec![first]
        }
    }
}

/// Whether some non-terminal step can still be admitted now or later.
pub fn can_progress(graph: &StepGraph, phases: &[WorkflowStepPhase], mode: WorkflowMode) -> bool {
    match mode {
        WorkflowMode::Dag => (0..phases.len())
            .any(|i| !phases[i].is_terminal() && !blocked_by_ancestor(graph, phases, i)),
        WorkflowMode::StepByStep => !admissible(graph, phases, mode).is_empty(),
    }
}

fn blocks(phase: WorkflowStepPhase) -> bool {
    matches!(phase, WorkflowStepPhase::Failed | WorkflowStepPhase::Stopped)
}

/// Whether a transitive dependency of step `i` failed or stopped.
fn blocked_by_ancestor(graph: &StepGraph, phases: &[WorkflowStepPhase], i: usize) -> bool {
    let mut seen = vec![false; phases.len()];
    let mut stack = graph.dependencies(i);
    while let Some(d) = stack.pop() {
        if std::mem::replace(&mut seen[d], true) {
            continue;
        }
        if blocks(phases[d]) {
            return true;
        }
        stack.extend(graph.dependencies(d));
    }
    false
}

/// Plan the top level of a run from its persisted status.
pub fn plan_tick(graph: &StepGraph, status: &WorkflowRunStatus, mode: WorkflowExecuteMode) -> TickPlan {
    let phases: Vec<WorkflowStepPhase> = status.steps.iter().map(|s| s.step.phase).collect();
    TickPlan {
        admitted: admissible(graph, &phases, mode.steps),
        can_progress: can_progress(graph, &phases, mode.steps),
    }
}

/// Phase of a group derived from its sub-steps.
///
/// Any stopped sub-step stops the group. A failed sub-step fails it when the
/// policy halts on failure or nothing else can progress. Otherwise the group
/// runs while any sub-step is non-terminal and succeeds once all are done.
pub fn aggregate_phase(
    sub_phases: &[WorkflowStepPhase],
    can_progress: bool,
    policy: FailurePolicy,
) -> WorkflowStepPhase {
    if sub_phases.contains(&WorkflowStepPhase::Stopped) {
        return WorkflowStepPhase::Stopped;
    }
    if sub_phases.contains(&WorkflowStepPhase::Failed)
        && (policy == FailurePolicy::Terminate || !can_progress)
    {
        return WorkflowStepPhase::Failed;
    }
    if sub_phases.iter().any(|p| !p.is_terminal()) {
        return WorkflowStepPhase::Running;
    }
    WorkflowStepPhase::Succeeded
}

/// Run verdict from the top-level phases.
pub fn derive_run_phase(
    names: &[&str],
    phases: &[WorkflowStepPhase],
    can_progress: bool,
    policy: FailurePolicy,
    suspend: bool,
) -> RunVerdict {
    let culprit = |phase: WorkflowStepPhase| {
        phases
            .iter()
            .position(|p| *p == phase)
            .map(|i| RunVerdict::Terminated {
                step: names[i].to_string(),
                phase,
            })
    };

    if let Some(verdict) = culprit(WorkflowStepPhase::Stopped) {
        return verdict;
    }
    if policy == FailurePolicy::Terminate || !can_progress {
        if let Some(verdict) = culprit(WorkflowStepPhase::Failed) {
            return verdict;
        }
    }
    if phases.iter().all(|p| p.satisfies_dependency()) {
        return RunVerdict::Succeeded;
    }
    if suspend {
        RunVerdict::Suspending
    } else {
        RunVerdict::Executing
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
