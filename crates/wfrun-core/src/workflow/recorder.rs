//! Durable status recorder for workflow runs.
//!
//! Wraps a [`RunRepository`] to persist the status tree after every tick.
//! Writes are idempotent upserts: the incoming status is merged over the
//! stored one so a terminal step phase is never downgraded and a step's
//! `firstExecuteTime` never moves, and nothing is written when the merged
//! record equals what is already stored. Only an explicit restart may reset
//! terminal phases, through [`StatusRecorder::reset`].

use std::sync::Arc;

use uuid::Uuid;
use wfrun_types::workflow::{StepStatus, WorkflowRun, WorkflowRunStatus};

use crate::repository::run::RunRepository;

// ---------------------------------------------------------------------------
// StatusRecorder
// ---------------------------------------------------------------------------

/// Whether a record call changed the stored status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    Written,
    Unchanged,
}

pub struct StatusRecorder<R: RunRepository> {
    repo: Arc<R>,
}

impl<R: RunRepository> StatusRecorder<R> {
    pub fn new(repo: Arc<R>) -> Self {
        Self { repo }
    }

    pub fn repo(&self) -> &R {
        &self.repo
    }

    /// Merge `run.status` over the stored status and persist the result.
    ///
    /// On return `run.status` holds exactly what is stored.
    pub async fn record(&self, run: &mut WorkflowRun) -> Result<RecordOutcome, RecorderError> {
        let stored = self
            .repo
            .get_run(&run.id)
            .await
            .map_err(|e| RecorderError::Repository(e.to_string()))?
            .ok_or(RecorderError::RunNotFound(run.id))?;

        let merged = merge_status(&stored.status, std::mem::take(&mut run.status));
        if merged == stored.status {
            run.status = merged;
            tracing::trace!(run = %run.name, "status unchanged, skipping write");
            return Ok(RecordOutcome::Unchanged);
        }

        self.repo
            .update_status(&run.id, &merged)
            .await
            .map_err(|e| RecorderError::Repository(e.to_string()))?;
        run.status = merged;

        tracing::debug!(
            run = %run.name,
            phase = %run.status.phase,
            finished = run.status.finished,
            "recorded run status"
        );
        Ok(RecordOutcome::Written)
    }

    /// Overwrite the stored status without merging (restart only).
    pub async fn reset(&self, run: &WorkflowRun) -> Result<(), RecorderError> {
        self.repo
            .update_status(&run.id, &run.status)
            .await
            .map_err(|e| RecorderError::Repository(e.to_string()))?;
        tracing::debug!(run = %run.name, "reset run status");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Merge rules
// ---------------------------------------------------------------------------

/// Merge an incoming status over the stored one.
///
/// - A finished stored run is kept as is.
/// - `terminated` and the pinned workflow definition are sticky.
/// - A step whose stored phase is terminal keeps its stored record, and is
///   carried over when the incoming status no longer lists it.
/// - A stored `firstExecuteTime` always wins.
pub fn merge_status(stored: &WorkflowRunStatus, mut incoming: WorkflowRunStatus) -> WorkflowRunStatus {
    if stored.finished {
        return stored.clone();
    }
    incoming.terminated |= stored.terminated;
    if incoming.resolved_workflow.is_none() {
        incoming.resolved_workflow = stored.resolved_workflow.clone();
    }

    for step in &mut incoming.steps {
        let Some(prev) = stored.steps.iter().find(|s| s.step.name == step.step.name) else {
            continue;
        };
        merge_step(&prev.step, &mut step.step);
        for sub in &mut step.sub_steps {
            if let Some(prev_sub) = prev.sub_steps.iter().find(|s| s.name == sub.name) {
                merge_step(prev_sub, sub);
            }
        }
        for prev_sub in &prev.sub_steps {
            if prev_sub.phase.is_terminal() && !step.sub_steps.iter().any(|s| s.name == prev_sub.name) {
                step.sub_steps.push(prev_sub.clone());
            }
        }
    }

    for prev in &stored.steps {
        if prev.step.phase.is_terminal() && incoming.step(&prev.step.name).is_none() {
            tracing::warn!(step = %prev.step.name, "keeping terminal step missing from incoming status");
            incoming.steps.push(prev.clone());
        }
    }
    incoming
}

fn merge_step(stored: &StepStatus, incoming: &mut StepStatus) {
    if stored.phase.is_terminal() && incoming.phase != stored.phase {
        tracing::warn!(
            step = %stored.name,
            stored = %stored.phase,
            incoming = %incoming.phase,
            "refusing to downgrade terminal step phase"
        );
        *incoming = stored.clone();
        return;
    }
    if stored.first_execute_time.is_some() {
        incoming.first_execute_time = stored.first_execute_time;
    }
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur while recording status.
#[derive(Debug, thiserror::Error)]
pub enum RecorderError {
    #[error("status repository error: {0}")]
    Repository(String),

    #[error("workflow run not found: {0}")]
    RunNotFound(Uuid),
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use chrono::{Duration, Utc};
    use wfrun_types::error::RepositoryError;
    use wfrun_types::workflow::{
        Workflow, WorkflowRunPhase, WorkflowRunSpec, WorkflowSpec, WorkflowStepPhase,
        WorkflowStepStatus,
    };

    use super::*;
    use crate::repository::memory::InMemoryRunRepository;

    /// Counts status writes on top of the in-memory repository.
    #[derive(Default)]
    struct CountingRepo {
        inner: InMemoryRunRepository,
        writes: AtomicUsize,
    }

    impl RunRepository for CountingRepo {
        async fn save_workflow(&self, workflow: &Workflow) -> Result<(), RepositoryError> {
            self.inner.save_workflow(workflow).await
        }
        async fn get_workflow(&self, name: &str) -> Result<Option<Workflow>, RepositoryError> {
            self.inner.get_workflow(name).await
        }
        async fn list_workflows(&self) -> Result<Vec<Workflow>, RepositoryError> {
            self.inner.list_workflows().await
        }
        async fn delete_workflow(&self, name: &str) -> Result<bool, RepositoryError> {
            self.inner.delete_workflow(name).await
        }
        async fn create_run(&self, run: &WorkflowRun) -> Result<(), RepositoryError> {
            self.inner.create_run(run).await
        }
        async fn get_run(&self, run_id: &Uuid) -> Result<Option<WorkflowRun>, RepositoryError> {
            self.inner.get_run(run_id).await
        }
        async fn get_run_by_name(&self, name: &str) -> Result<Option<WorkflowRun>, RepositoryError> {
            self.inner.get_run_by_name(name).await
        }
        async fn list_runs(&self) -> Result<Vec<WorkflowRun>, RepositoryError> {
            self.inner.list_runs().await
        }
        async fn update_status(
            &self,
            run_id: &Uuid,
            status: &WorkflowRunStatus,
        ) -> Result<(), RepositoryError> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            self.inner.update_status(run_id, status).await
        }
        async fn delete_run(&self, run_id: &Uuid) -> Result<bool, RepositoryError> {
            self.inner.delete_run(run_id).await
        }
    }

    fn step_status(name: &str, phase: WorkflowStepPhase) -> WorkflowStepStatus {
        WorkflowStepStatus {
            step: StepStatus {
                id: format!("id-{name}"),
                name: name.to_string(),
                phase,
                ..StepStatus::default()
            },
            sub_steps: vec![],
        }
    }

    async fn recorder_with_run() -> (StatusRecorder<CountingRepo>, Arc<CountingRepo>, WorkflowRun) {
        let repo = Arc::new(CountingRepo::default());
        let run = WorkflowRun::new("nightly", WorkflowRunSpec::default());
        repo.create_run(&run).await.unwrap();
        (StatusRecorder::new(repo.clone()), repo, run)
    }

    #[tokio::test]
    async fn test_record_twice_is_idempotent() {
        let (recorder, repo, mut run) = recorder_with_run().await;
        run.status.phase = WorkflowRunPhase::Executing;
        run.status.steps.push(step_status("a", WorkflowStepPhase::Succeeded));

        assert_eq!(recorder.record(&mut run).await.unwrap(), RecordOutcome::Written);
        let after_first = repo.get_run(&run.id).await.unwrap().unwrap();

        assert_eq!(recorder.record(&mut run).await.unwrap(), RecordOutcome::Unchanged);
        let after_second = repo.get_run(&run.id).await.unwrap().unwrap();

        assert_eq!(after_first, after_second);
        assert_eq!(repo.writes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_terminal_phase_is_not_downgraded() {
        let (recorder, repo, mut run) = recorder_with_run().await;
        run.status.steps.push(step_status("a", WorkflowStepPhase::Succeeded));
        recorder.record(&mut run).await.unwrap();

        run.status.steps[0].step.phase = WorkflowStepPhase::Running;
        recorder.record(&mut run).await.unwrap();

        let stored = repo.get_run(&run.id).await.unwrap().unwrap();
        assert_eq!(stored.status.steps[0].step.phase, WorkflowStepPhase::Succeeded);
        assert_eq!(run.status.steps[0].step.phase, WorkflowStepPhase::Succeeded);
    }

    #[tokio::test]
    async fn test_first_execute_time_is_immutable() {
        let (recorder, repo, mut run) = recorder_with_run().await;
        let first = Utc::now() - Duration::minutes(5);
        let mut a = step_status("a", WorkflowStepPhase::Running);
        a.step.first_execute_time = Some(first);
        run.status.steps.push(a);
        recorder.record(&mut run).await.unwrap();

        run.status.steps[0].step.first_execute_time = Some(Utc::now());
        run.status.steps[0].step.last_execute_time = Some(Utc::now());
        recorder.record(&mut run).await.unwrap();

        let stored = repo.get_run(&run.id).await.unwrap().unwrap();
        assert_eq!(stored.status.steps[0].step.first_execute_time, Some(first));
        assert!(stored.status.steps[0].step.last_execute_time.is_some());
    }

    #[tokio::test]
    async fn test_finished_run_is_frozen_until_reset() {
        let (recorder, repo, mut run) = recorder_with_run().await;
        run.status.phase = WorkflowRunPhase::Succeeded;
        run.status.finished = true;
        recorder.record(&mut run).await.unwrap();

        run.status = WorkflowRunStatus::default();
        assert_eq!(recorder.record(&mut run).await.unwrap(), RecordOutcome::Unchanged);
        assert!(run.status.finished);

        run.status = WorkflowRunStatus::default();
        recorder.reset(&run).await.unwrap();
        let stored = repo.get_run(&run.id).await.unwrap().unwrap();
        assert!(!stored.status.finished);
        assert_eq!(stored.status.phase, WorkflowRunPhase::Initializing);
    }

    #[tokio::test]
    async fn test_terminal_step_missing_from_incoming_is_kept() {
        let (recorder, repo, mut run) = recorder_with_run().await;
        let mut group = step_status("group", WorkflowStepPhase::Running);
        group.sub_steps.push(step_status("one", WorkflowStepPhase::Succeeded).step);
        run.status.steps.push(step_status("a", WorkflowStepPhase::Succeeded));
        run.status.steps.push(step_status("b", WorkflowStepPhase::Running));
        run.status.steps.push(group);
        recorder.record(&mut run).await.unwrap();

        run.status.steps = vec![
            step_status("group", WorkflowStepPhase::Running),
            step_status("x", WorkflowStepPhase::Pending),
        ];
        recorder.record(&mut run).await.unwrap();

        let stored = repo.get_run(&run.id).await.unwrap().unwrap();
        let names: Vec<&str> = stored.status.steps.iter().map(|s| s.step.name.as_str()).collect();
        assert_eq!(names, vec!["group", "x", "a"]);
        assert_eq!(stored.status.step("a").unwrap().step.phase, WorkflowStepPhase::Succeeded);
        assert_eq!(stored.status.step("group").unwrap().sub_steps[0].name, "one");
        assert!(stored.status.step("b").is_none());
    }

    #[tokio::test]
    async fn test_resolved_workflow_is_sticky() {
        let (recorder, repo, mut run) = recorder_with_run().await;
        run.status.phase = WorkflowRunPhase::Executing;
        run.status.resolved_workflow = Some(WorkflowSpec {
            steps: serde_json::from_value(serde_json::json!([{ "name": "a", "type": "noop" }]))
                .unwrap(),
        });
        recorder.record(&mut run).await.unwrap();

        run.status.resolved_workflow = None;
        recorder.record(&mut run).await.unwrap();

        let stored = repo.get_run(&run.id).await.unwrap().unwrap();
        let pinned = stored.status.resolved_workflow.unwrap();
        assert_eq!(pinned.steps[0].base.name, "a");
    }

    #[tokio::test]
    async fn test_record_missing_run() {
        let repo = Arc::new(CountingRepo::default());
        let recorder = StatusRecorder::new(repo);
        let mut run = WorkflowRun::new("ghost", WorkflowRunSpec::default());
        let err = recorder.record(&mut run).await.unwrap_err();
        assert!(matches!(err, RecorderError::RunNotFound(_)));
    }
}
