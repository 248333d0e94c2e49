//! Execution scheduler: advances a workflow run one tick at a time.
//!
//! A tick loads the persisted run, resolves its step definitions, admits
//! steps with the pure planner in [`super::plan`], gates each admitted step
//! on its condition and timeout, invokes the admitted actions through the
//! [`StepRunner`], folds the results back into the status tree and records
//! it. The scheduler keeps no state between ticks apart from per-run locks,
//! so any tick may run in a fresh process.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::Mutex;
use uuid::Uuid;
use wfrun_types::condition::{Condition, ConditionStatus, WORKFLOW_RUN_CONDITION};
use wfrun_types::config::EngineConfig;
use wfrun_types::error::RepositoryError;
use wfrun_types::workflow::{
    ContextBackendRef, StepStatus, WorkflowExecuteMode, WorkflowRun, WorkflowRunPhase,
    WorkflowRunStatus, WorkflowSpec, WorkflowStep, WorkflowStepBase, WorkflowStepPhase,
    WorkflowStepStatus, reason,
};

use super::action::{ActionOutcome, ActionRegistry};
use super::context::RunContext;
use super::definition::parse_duration;
use super::expression::{ConditionEvaluator, JexlEvaluator};
use super::graph::{StepGraph, build_step_graph};
use super::plan::{self, RunVerdict};
use super::recorder::{RecordOutcome, RecorderError, StatusRecorder};
use super::step_runner::{StepJob, StepResult, StepRunner};
use crate::repository::context_store::ContextStore;
use crate::repository::run::RunRepository;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that escape a tick. Step failures never do; they are recorded on
/// the step status instead.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("workflow run not found: {0}")]
    RunNotFound(String),

    #[error("workflow not found: {0}")]
    WorkflowNotFound(String),

    /// The tick did not persist and must be retried.
    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("invalid run spec: {0}")]
    InvalidSpec(String),
}

impl From<RecorderError> for SchedulerError {
    fn from(err: RecorderError) -> Self {
        match err {
            RecorderError::RunNotFound(id) => SchedulerError::RunNotFound(id.to_string()),
            RecorderError::Repository(message) => SchedulerError::Persistence(message),
        }
    }
}

impl From<RepositoryError> for SchedulerError {
    fn from(err: RepositoryError) -> Self {
        SchedulerError::Persistence(err.to_string())
    }
}

// ---------------------------------------------------------------------------
// Tick report
// ---------------------------------------------------------------------------

/// Summary of one tick.
#[derive(Debug, Clone, PartialEq)]
pub struct TickReport {
    pub phase: WorkflowRunPhase,
    /// Top-level steps admitted this tick, in definition order.
    pub admitted: Vec<String>,
    pub finished: bool,
    pub suspended: bool,
    /// Some step reported it is still in flight.
    pub waiting: bool,
    pub record: RecordOutcome,
}

impl TickReport {
    fn of(run: &WorkflowRun, admitted: Vec<String>, record: RecordOutcome) -> Self {
        Self {
            phase: run.status.phase,
            admitted,
            finished: run.status.finished,
            suspended: run.status.suspend || run.status.phase == WorkflowRunPhase::Suspending,
            waiting: has_waiting_steps(&run.status),
            record,
        }
    }
}

// ---------------------------------------------------------------------------
// Internal planning types
// ---------------------------------------------------------------------------

/// Step definitions of a run with their validated graphs.
struct Compiled {
    steps: Vec<WorkflowStep>,
    mode: WorkflowExecuteMode,
    graph: StepGraph,
    /// Sub-step graph per top-level step; `None` for leaf steps.
    groups: Vec<Option<StepGraph>>,
}

/// Position of a step or sub-step in the status tree.
#[derive(Debug, Clone, Copy)]
struct Target {
    top: usize,
    sub: Option<usize>,
}

impl Target {
    fn status_mut<'a>(&self, status: &'a mut WorkflowRunStatus) -> &'a mut StepStatus {
        let top = &mut status.steps[self.top];
        match self.sub {
            Some(j) => &mut top.sub_steps[j],
            None => &mut top.step,
        }
    }

    fn definition<'a>(&self, steps: &'a [WorkflowStep]) -> &'a WorkflowStepBase {
        let top = &steps[self.top];
        match self.sub {
            Some(j) => &top.sub_steps[j],
            None => &top.base,
        }
    }
}

/// Result of gating an admitted step on its condition and timeout.
enum Gate {
    /// Skipped or failed before invocation.
    Closed,
    /// The timeout elapsed since the step first started.
    Expired,
    /// Invoke with the remaining timeout budget.
    Open(Option<Duration>),
}

/// Jobs collected during admission, with where their results go.
#[derive(Default)]
struct Batch {
    jobs: Vec<StepJob>,
    targets: Vec<(Target, Value)>,
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

/// Tick-driven executor for workflow runs.
///
/// Generic over the run repository and context store so the same engine runs
/// against SQLite in the CLI and against in-memory stores in tests.
pub struct Scheduler<R: RunRepository, C: ContextStore> {
    repo: Arc<R>,
    contexts: Arc<C>,
    recorder: StatusRecorder<R>,
    runner: StepRunner,
    evaluator: Arc<dyn ConditionEvaluator>,
    config: EngineConfig,
    /// Serializes ticks and control operations per run within this process.
    run_locks: DashMap<Uuid, Arc<Mutex<()>>>,
}

impl<R: RunRepository, C: ContextStore> Scheduler<R, C> {
    pub fn new(repo: Arc<R>, contexts: Arc<C>, registry: ActionRegistry, config: EngineConfig) -> Self {
        Self {
            recorder: StatusRecorder::new(repo.clone()),
            repo,
            contexts,
            runner: StepRunner::new(registry),
            evaluator: Arc::new(JexlEvaluator::new()),
            config,
            run_locks: DashMap::new(),
        }
    }

    /// Replace the condition evaluator.
    pub fn with_condition_evaluator(mut self, evaluator: Arc<dyn ConditionEvaluator>) -> Self {
        self.evaluator = evaluator;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &ActionRegistry {
        self.runner.registry()
    }

    fn run_lock(&self, run_id: &Uuid) -> Arc<Mutex<()>> {
        self.run_locks.entry(*run_id).or_default().clone()
    }

    /// Drop the per-run lock of a finished or deleted run.
    ///
    /// The entry is kept while another caller still holds or waits on it.
    pub fn forget(&self, run_id: &Uuid) {
        self.run_locks.remove_if(run_id, |_, lock| Arc::strong_count(lock) == 1);
    }

    async fn load(&self, run_id: &Uuid) -> Result<WorkflowRun, SchedulerError> {
        self.repo
            .get_run(run_id)
            .await?
            .ok_or_else(|| SchedulerError::RunNotFound(run_id.to_string()))
    }

    // -----------------------------------------------------------------------
    // Tick
    // -----------------------------------------------------------------------

    /// Advance a run by one tick.
    pub async fn tick(&self, run_id: &Uuid) -> Result<TickReport, SchedulerError> {
        let report = {
            let lock = self.run_lock(run_id);
            let _guard = lock.lock().await;
            self.tick_locked(run_id).await
        };
        if report.as_ref().is_ok_and(|r| r.finished) {
            self.forget(run_id);
        }
        report
    }

    async fn tick_locked(&self, run_id: &Uuid) -> Result<TickReport, SchedulerError> {
        let mut run = self.load(run_id).await?;
        if run.status.finished {
            return Ok(TickReport::of(&run, Vec::new(), RecordOutcome::Unchanged));
        }

        let compiled = match self.compile(&run).await {
            Ok(compiled) => compiled,
            Err(SchedulerError::InvalidSpec(message)) => {
                tracing::warn!(run = %run.name, error = %message, "run definition invalid, terminating");
                let now = Utc::now();
                run.status.start_time.get_or_insert(now);
                finish_terminated(&mut run.status, message, now);
                let record = self.persist(&mut run, None).await?;
                return Ok(TickReport::of(&run, Vec::new(), record));
            }
            Err(err) => return Err(err),
        };

        let now = Utc::now();
        if !run.status.is_initialized() {
            run.status.phase = WorkflowRunPhase::Executing;
            run.status.start_time = Some(now);
            run.status.mode = Some(compiled.mode);
            run.status.context_backend = Some(ContextBackendRef::for_run(&run.name));
            if run.spec.workflow_spec.is_none() {
                run.status.resolved_workflow = Some(WorkflowSpec {
                    steps: compiled.steps.clone(),
                });
            }
            tracing::info!(
                run = %run.name,
                steps = %compiled.mode.steps,
                sub_steps = %compiled.mode.sub_steps,
                "workflow run started"
            );
        }
        sync_steps(&mut run.status, &compiled.steps);

        if run.status.terminated {
            finish_terminated(&mut run.status, "run terminated".to_string(), now);
            let record = self.persist(&mut run, None).await?;
            return Ok(TickReport::of(&run, Vec::new(), record));
        }
        if run.status.suspend {
            mark_suspended(&mut run.status);
            let record = self.persist(&mut run, None).await?;
            return Ok(TickReport::of(&run, Vec::new(), record));
        }

        let backend = backend_of(&run);
        let mut ctx = RunContext::new(self.contexts.load(&backend).await?);

        // Admission is decided on this snapshot only.
        let tick_plan = plan::plan_tick(&compiled.graph, &run.status, compiled.mode);
        let admitted: Vec<String> = tick_plan
            .admitted
            .iter()
            .map(|&i| compiled.steps[i].base.name.clone())
            .collect();

        let mut batch = Batch::default();
        for &i in &tick_plan.admitted {
            self.admit(&mut run, &compiled, i, &ctx, now, &mut batch).await;
        }

        let Batch { jobs, targets } = batch;
        if !jobs.is_empty() {
            let results = self.runner.run_all(jobs, self.config.max_concurrent_steps).await;
            for ((target, properties), result) in targets.into_iter().zip(results) {
                self.apply_result(&mut run, &compiled.steps, target, &properties, result, &mut ctx);
            }
        }

        for &i in &tick_plan.admitted {
            self.aggregate_group(&mut run.status, &compiled, i);
        }

        let names: Vec<&str> = compiled.steps.iter().map(|s| s.base.name.as_str()).collect();
        let phases: Vec<WorkflowStepPhase> = run.status.steps.iter().map(|s| s.step.phase).collect();
        let can_progress = plan::can_progress(&compiled.graph, &phases, compiled.mode.steps);
        let verdict = plan::derive_run_phase(
            &names,
            &phases,
            can_progress,
            self.config.failure_policy,
            run.status.suspend,
        );
        apply_verdict(&mut run, verdict, Utc::now());

        let record = self.persist(&mut run, Some(&ctx)).await?;
        tracing::debug!(
            run = %run.name,
            phase = %run.status.phase,
            admitted = admitted.len(),
            "tick complete"
        );
        Ok(TickReport::of(&run, admitted, record))
    }

    /// Resolve step definitions and build their graphs.
    ///
    /// A referenced workflow is read only until the first tick pins it into
    /// the status. Structural problems come back as `InvalidSpec` and
    /// terminate the run; a missing referenced workflow is an error the
    /// caller may retry.
    async fn compile(&self, run: &WorkflowRun) -> Result<Compiled, SchedulerError> {
        let pinned = run.status.resolved_workflow.as_ref();
        let (steps, workflow_mode) = match (&run.spec.workflow_spec, pinned, &run.spec.workflow_ref) {
            (Some(inline), _, _) => (inline.steps.clone(), None),
            (None, Some(resolved), _) => (resolved.steps.clone(), None),
            (None, None, Some(reference)) => {
                let workflow = self
                    .repo
                    .get_workflow(reference)
                    .await?
                    .ok_or_else(|| SchedulerError::WorkflowNotFound(reference.clone()))?;
                (workflow.steps, workflow.mode)
            }
            (None, None, None) => {
                return Err(SchedulerError::InvalidSpec(
                    "one of workflowSpec or workflowRef is required".to_string(),
                ));
            }
        };

        let mode = run
            .status
            .mode
            .or(run.spec.mode)
            .or(workflow_mode)
            .unwrap_or_default();

        let graph =
            build_step_graph(&steps).map_err(|e| SchedulerError::InvalidSpec(e.to_string()))?;
        let groups = steps
            .iter()
            .map(|step| {
                if !step.is_group() {
                    return Ok(None);
                }
                build_step_graph(&step.sub_steps).map(Some).map_err(|e| {
                    SchedulerError::InvalidSpec(format!("step '{}': {e}", step.base.name))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Compiled {
            steps,
            mode,
            graph,
            groups,
        })
    }

    /// Gate an admitted top-level step and queue its work.
    async fn admit(
        &self,
        run: &mut WorkflowRun,
        compiled: &Compiled,
        i: usize,
        ctx: &RunContext,
        now: DateTime<Utc>,
        batch: &mut Batch,
    ) {
        let step = &compiled.steps[i];
        let scope = ctx.expression_context(&run.name, run.id, &run.status, None);
        let gate = self.gate(&step.base, &scope, &mut run.status.steps[i].step, now);

        let budget = match gate {
            Gate::Closed => {
                if run.status.steps[i].step.phase == WorkflowStepPhase::Skipped {
                    for sub in &mut run.status.steps[i].sub_steps {
                        if !sub.phase.is_terminal() {
                            sub.set_phase(WorkflowStepPhase::Skipped, reason::SKIP, "group skipped");
                        }
                    }
                }
                return;
            }
            Gate::Expired => {
                if step.is_group() {
                    for (j, sub) in run.status.steps[i].sub_steps.iter_mut().enumerate() {
                        if sub.phase == WorkflowStepPhase::Running {
                            sub.set_phase(WorkflowStepPhase::Failed, reason::TIMEOUT, "group timed out");
                            self.runner.cancel_expired(run.id, &run.name, &step.sub_steps[j]).await;
                        }
                    }
                } else {
                    self.runner.cancel_expired(run.id, &run.name, &step.base).await;
                }
                return;
            }
            Gate::Open(budget) => budget,
        };

        let Some(sub_graph) = compiled.groups[i].as_ref() else {
            self.enqueue(run, &step.base, Target { top: i, sub: None }, ctx, budget, batch);
            return;
        };

        let sub_phases: Vec<WorkflowStepPhase> =
            run.status.steps[i].sub_steps.iter().map(|s| s.phase).collect();
        for j in plan::admissible(sub_graph, &sub_phases, compiled.mode.sub_steps) {
            let sub = &step.sub_steps[j];
            let scope = ctx.expression_context(
                &run.name,
                run.id,
                &run.status,
                Some(run.status.steps[i].sub_steps.as_slice()),
            );
            match self.gate(sub, &scope, &mut run.status.steps[i].sub_steps[j], now) {
                Gate::Closed => {}
                Gate::Expired => self.runner.cancel_expired(run.id, &run.name, sub).await,
                Gate::Open(sub_budget) => {
                    let target = Target { top: i, sub: Some(j) };
                    self.enqueue(run, sub, target, ctx, tighter(budget, sub_budget), batch);
                }
            }
        }
    }

    /// Evaluate the condition, parse the timeout and mark the step running.
    fn gate(
        &self,
        step: &WorkflowStepBase,
        scope: &Value,
        status: &mut StepStatus,
        now: DateTime<Utc>,
    ) -> Gate {
        if let Some(expression) = step.condition.as_deref() {
            match self.evaluator.evaluate(expression, scope) {
                Ok(true) => {}
                Ok(false) => {
                    status.set_phase(
                        WorkflowStepPhase::Skipped,
                        reason::SKIP,
                        format!("condition '{expression}' is false"),
                    );
                    status.last_execute_time = Some(now);
                    tracing::debug!(step = %step.name, "step skipped");
                    return Gate::Closed;
                }
                Err(err) => {
                    status.set_phase(
                        WorkflowStepPhase::Failed,
                        reason::CONDITION_EVALUATION_ERROR,
                        err.to_string(),
                    );
                    status.last_execute_time = Some(now);
                    tracing::warn!(step = %step.name, error = %err, "step condition failed to evaluate");
                    return Gate::Closed;
                }
            }
        }

        let timeout = match step
            .timeout
            .as_deref()
            .or(self.config.default_step_timeout.as_deref())
            .map(parse_duration)
            .transpose()
        {
            Ok(timeout) => timeout,
            Err(err) => {
                status.set_phase(WorkflowStepPhase::Failed, reason::INVALID_SPEC, err.to_string());
                return Gate::Closed;
            }
        };

        status.phase = WorkflowStepPhase::Running;
        let first = *status.first_execute_time.get_or_insert(now);
        status.last_execute_time = Some(now);

        let Some(limit) = timeout else {
            return Gate::Open(None);
        };
        let elapsed = (now - first).to_std().unwrap_or_default();
        if elapsed >= limit {
            status.set_phase(
                WorkflowStepPhase::Failed,
                reason::TIMEOUT,
                format!("step exceeded its timeout of {limit:?}"),
            );
            tracing::warn!(step = %step.name, "step timeout elapsed between ticks");
            return Gate::Expired;
        }
        Gate::Open(Some(limit - elapsed))
    }

    fn enqueue(
        &self,
        run: &mut WorkflowRun,
        step: &WorkflowStepBase,
        target: Target,
        ctx: &RunContext,
        budget: Option<Duration>,
        batch: &mut Batch,
    ) {
        match self.runner.prepare(run.id, &run.name, step, ctx, budget) {
            Ok(job) => {
                batch.targets.push((target, job.context.properties.clone()));
                batch.jobs.push(job);
            }
            Err(err) => {
                tracing::warn!(run = %run.name, step = %step.name, error = %err, "step could not start");
                target
                    .status_mut(&mut run.status)
                    .set_phase(WorkflowStepPhase::Failed, err.reason(), err.to_string());
            }
        }
    }

    /// Fold one action result into the status tree and the context.
    fn apply_result(
        &self,
        run: &mut WorkflowRun,
        steps: &[WorkflowStep],
        target: Target,
        properties: &Value,
        result: StepResult,
        ctx: &mut RunContext,
    ) {
        let step = target.definition(steps);
        let (phase, why, message) = match result {
            StepResult::Completed(ActionOutcome::Succeeded { output }) => {
                match self.publish_outputs(step, &output, properties, ctx) {
                    Ok(()) => (WorkflowStepPhase::Succeeded, "", String::new()),
                    Err(message) => (WorkflowStepPhase::Failed, reason::OUTPUT_RESOLUTION, message),
                }
            }
            StepResult::Completed(ActionOutcome::Wait { message }) => {
                (WorkflowStepPhase::Running, reason::ACTION, message)
            }
            StepResult::Completed(ActionOutcome::Suspend { message }) => {
                run.status.suspend = true;
                run.status.suspend_state = step.name.clone();
                (WorkflowStepPhase::Running, reason::SUSPEND, message)
            }
            StepResult::Completed(ActionOutcome::Stop { message }) => {
                (WorkflowStepPhase::Stopped, reason::TERMINATE, message)
            }
            StepResult::Failed { reason: why, message } => {
                let status = target.status_mut(&mut run.status);
                status.set_phase(WorkflowStepPhase::Failed, &why, message);
                tracing::debug!(run = %run.name, step = %step.name, reason = %why, "step failed");
                return;
            }
            StepResult::TimedOut { after } => (
                WorkflowStepPhase::Failed,
                reason::TIMEOUT,
                format!("step exceeded its timeout of {after:?}"),
            ),
        };

        tracing::debug!(run = %run.name, step = %step.name, phase = %phase, "step result applied");
        target.status_mut(&mut run.status).set_phase(phase, why, message);
    }

    fn publish_outputs(
        &self,
        step: &WorkflowStepBase,
        output: &Value,
        properties: &Value,
        ctx: &mut RunContext,
    ) -> Result<(), String> {
        let values = self
            .runner
            .resolve_outputs(step, output, properties)
            .map_err(|e| e.to_string())?;
        for (name, value) in values {
            ctx.set(&name, value).map_err(|e| e.to_string())?;
        }
        Ok(())
    }

    /// Derive a running group's phase from its sub-steps.
    fn aggregate_group(&self, status: &mut WorkflowRunStatus, compiled: &Compiled, i: usize) {
        let Some(sub_graph) = compiled.groups[i].as_ref() else {
            return;
        };
        let group = &mut status.steps[i];
        if group.step.phase != WorkflowStepPhase::Running {
            return;
        }

        let phases: Vec<WorkflowStepPhase> = group.sub_steps.iter().map(|s| s.phase).collect();
        let can_progress = plan::can_progress(sub_graph, &phases, compiled.mode.sub_steps);
        let phase = plan::aggregate_phase(&phases, can_progress, self.config.failure_policy);
        match phase {
            WorkflowStepPhase::Succeeded => group.step.set_phase(phase, "", ""),
            WorkflowStepPhase::Failed | WorkflowStepPhase::Stopped => {
                let (why, message) = group
                    .sub_steps
                    .iter()
                    .find(|s| s.phase == phase)
                    .map(|s| (s.reason.clone(), format!("sub-step '{}' {phase}: {}", s.name, s.message)))
                    .unwrap_or_default();
                group.step.set_phase(phase, &why, message);
            }
            _ => {}
        }
    }

    /// Save a dirty context, then record the status.
    ///
    /// The status write commits the tick. If it fails after the context was
    /// saved, the retried tick runs the same steps again and overwrites their
    /// outputs, so step actions are invoked at least once.
    async fn persist(
        &self,
        run: &mut WorkflowRun,
        ctx: Option<&RunContext>,
    ) -> Result<RecordOutcome, SchedulerError> {
        if let Some(ctx) = ctx.filter(|c| c.is_dirty()) {
            self.contexts.save(&backend_of(run), ctx.variables()).await?;
        }
        Ok(self.recorder.record(run).await?)
    }

    // -----------------------------------------------------------------------
    // Driving and control
    // -----------------------------------------------------------------------

    /// Tick until the run finishes, suspends or stops making progress.
    ///
    /// Sleeps `tick_interval_ms` between ticks while a step is in flight.
    pub async fn run_until_settled(
        &self,
        run_id: &Uuid,
        max_ticks: Option<u32>,
    ) -> Result<TickReport, SchedulerError> {
        let limit = max_ticks.unwrap_or(self.config.max_ticks).max(1);
        let interval = Duration::from_millis(self.config.tick_interval_ms);

        let mut report = self.tick(run_id).await?;
        for _ in 1..limit {
            if report.finished || report.suspended {
                break;
            }
            if report.waiting {
                tokio::time::sleep(interval).await;
            } else if report.admitted.is_empty() {
                break;
            }
            report = self.tick(run_id).await?;
        }
        Ok(report)
    }

    /// Stop admitting steps until the run is resumed.
    pub async fn suspend_run(&self, run_id: &Uuid) -> Result<WorkflowRun, SchedulerError> {
        let lock = self.run_lock(run_id);
        let _guard = lock.lock().await;

        let mut run = self.load(run_id).await?;
        if run.status.finished {
            return Ok(run);
        }
        run.status.suspend = true;
        if run.status.is_initialized() {
            mark_suspended(&mut run.status);
        }
        self.recorder.record(&mut run).await?;
        tracing::info!(run = %run.name, "workflow run suspended");
        Ok(run)
    }

    /// Clear suspension. Steps parked by a suspend action succeed.
    pub async fn resume_run(&self, run_id: &Uuid) -> Result<WorkflowRun, SchedulerError> {
        let lock = self.run_lock(run_id);
        let _guard = lock.lock().await;

        let mut run = self.load(run_id).await?;
        if run.status.finished {
            return Ok(run);
        }
        run.status.suspend = false;
        run.status.suspend_state.clear();
        for step in &mut run.status.steps {
            for status in std::iter::once(&mut step.step).chain(step.sub_steps.iter_mut()) {
                if status.phase == WorkflowStepPhase::Running && status.reason == reason::SUSPEND {
                    status.set_phase(WorkflowStepPhase::Succeeded, reason::RESUME, "resumed");
                }
            }
        }
        if run.status.is_initialized() {
            run.status.phase = WorkflowRunPhase::Executing;
            run.status.message.clear();
            set_run_condition(&mut run.status, ConditionStatus::False, "Executing", "");
        }
        self.recorder.record(&mut run).await?;
        tracing::info!(run = %run.name, "workflow run resumed");
        Ok(run)
    }

    /// Terminate a run. In-flight actions are not cancelled; unfinished steps
    /// are marked stopped.
    pub async fn terminate_run(&self, run_id: &Uuid) -> Result<WorkflowRun, SchedulerError> {
        let run = {
            let lock = self.run_lock(run_id);
            let _guard = lock.lock().await;
            self.terminate_locked(run_id).await?
        };
        self.forget(run_id);
        Ok(run)
    }

    async fn terminate_locked(&self, run_id: &Uuid) -> Result<WorkflowRun, SchedulerError> {
        let mut run = self.load(run_id).await?;
        if run.status.finished {
            return Ok(run);
        }
        finish_terminated(&mut run.status, "terminated by user".to_string(), Utc::now());
        self.recorder.record(&mut run).await?;
        tracing::info!(run = %run.name, "workflow run terminated");
        Ok(run)
    }

    /// Reset a run to a fresh status tree and clear its context.
    pub async fn restart_run(&self, run_id: &Uuid) -> Result<WorkflowRun, SchedulerError> {
        let lock = self.run_lock(run_id);
        let _guard = lock.lock().await;

        let mut run = self.load(run_id).await?;
        self.contexts.clear(&backend_of(&run)).await?;
        run.status = WorkflowRunStatus::default();
        self.recorder.reset(&run).await?;
        tracing::info!(run = %run.name, "workflow run restarted");
        Ok(run)
    }
}

// ---------------------------------------------------------------------------
// Status helpers
// ---------------------------------------------------------------------------

fn backend_of(run: &WorkflowRun) -> ContextBackendRef {
    run.status
        .context_backend
        .clone()
        .unwrap_or_else(|| ContextBackendRef::for_run(&run.name))
}

fn tighter(a: Option<Duration>, b: Option<Duration>) -> Option<Duration> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

/// Align the status tree with the definitions: one entry per step in
/// definition order, matched by name, new steps pending.
fn sync_steps(status: &mut WorkflowRunStatus, steps: &[WorkflowStep]) {
    let mut previous = std::mem::take(&mut status.steps);
    status.steps = steps
        .iter()
        .map(|step| {
            let mut entry = previous
                .iter()
                .position(|s| s.step.name == step.base.name)
                .map(|p| previous.swap_remove(p))
                .unwrap_or_else(|| WorkflowStepStatus {
                    step: StepStatus::pending(&step.base),
                    sub_steps: Vec::new(),
                });
            let mut previous_subs = std::mem::take(&mut entry.sub_steps);
            entry.sub_steps = step
                .sub_steps
                .iter()
                .map(|sub| {
                    previous_subs
                        .iter()
                        .position(|s| s.name == sub.name)
                        .map(|p| previous_subs.swap_remove(p))
                        .unwrap_or_else(|| StepStatus::pending(sub))
                })
                .collect();
            entry
        })
        .collect();
}

fn has_waiting_steps(status: &WorkflowRunStatus) -> bool {
    status.steps.iter().any(|step| {
        std::iter::once(&step.step)
            .chain(step.sub_steps.iter())
            .any(|s| s.phase == WorkflowStepPhase::Running && s.reason == reason::ACTION)
    })
}

fn set_run_condition(status: &mut WorkflowRunStatus, truth: ConditionStatus, why: &str, message: &str) {
    status
        .conditioned
        .set_conditions([Condition::new(WORKFLOW_RUN_CONDITION, truth, why, message)]);
}

fn mark_suspended(status: &mut WorkflowRunStatus) {
    status.phase = WorkflowRunPhase::Suspending;
    status.message = if status.suspend_state.is_empty() {
        "suspended".to_string()
    } else {
        format!("suspended at step '{}'", status.suspend_state)
    };
    let message = status.message.clone();
    set_run_condition(status, ConditionStatus::False, "Suspended", &message);
}

/// Finish a run as terminated; unfinished steps become stopped.
fn finish_terminated(status: &mut WorkflowRunStatus, message: String, now: DateTime<Utc>) {
    for step in &mut status.steps {
        for s in std::iter::once(&mut step.step).chain(step.sub_steps.iter_mut()) {
            if !s.phase.is_terminal() {
                s.set_phase(WorkflowStepPhase::Stopped, reason::TERMINATE, "run terminated");
            }
        }
    }
    status.terminated = true;
    status.finished = true;
    status.phase = WorkflowRunPhase::Terminated;
    status.end_time = Some(now);
    set_run_condition(status, ConditionStatus::False, "Terminated", &message);
    status.message = message;
}

fn apply_verdict(run: &mut WorkflowRun, verdict: RunVerdict, now: DateTime<Utc>) {
    match verdict {
        RunVerdict::Terminated { step, phase } => {
            let detail = run
                .status
                .step(&step)
                .map(|s| s.step.message.clone())
                .unwrap_or_default();
            let message = if detail.is_empty() {
                format!("step '{step}' {phase}")
            } else {
                format!("step '{step}' {phase}: {detail}")
            };
            tracing::info!(run = %run.name, step = %step, %phase, "workflow run terminated");
            finish_terminated(&mut run.status, message, now);
        }
        RunVerdict::Succeeded => {
            run.status.phase = WorkflowRunPhase::Succeeded;
            run.status.finished = true;
            run.status.end_time = Some(now);
            run.status.message.clear();
            set_run_condition(&mut run.status, ConditionStatus::True, "Succeeded", "");
            tracing::info!(run = %run.name, "workflow run succeeded");
        }
        RunVerdict::Suspending => mark_suspended(&mut run.status),
        RunVerdict::Executing => {
            run.status.phase = WorkflowRunPhase::Executing;
            run.status.message.clear();
            set_run_condition(&mut run.status, ConditionStatus::False, "Executing", "");
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use serde_json::json;
    use wfrun_types::config::FailurePolicy;
    use wfrun_types::workflow::{Workflow, WorkflowRunSpec};

    use super::*;
    use crate::repository::memory::{InMemoryContextStore, InMemoryRunRepository};
    use crate::workflow::action::{ActionContext, ActionError, StepAction};

    // -- scripted actions ---------------------------------------------------

    #[derive(Clone, Default)]
    struct Tracker {
        calls: Arc<StdMutex<Vec<String>>>,
        cancels: Arc<AtomicUsize>,
    }

    impl Tracker {
        fn hit(&self, ctx: &ActionContext) {
            self.calls.lock().unwrap().push(ctx.step_name.clone());
        }
    }

    struct RecordAction(Tracker);
    impl StepAction for RecordAction {
        async fn execute(&self, ctx: &ActionContext) -> Result<ActionOutcome, ActionError> {
            self.0.hit(ctx);
            Ok(ActionOutcome::Succeeded {
                output: ctx.properties.clone(),
            })
        }
    }

    struct HangAction(Tracker);
    impl StepAction for HangAction {
        async fn execute(&self, ctx: &ActionContext) -> Result<ActionOutcome, ActionError> {
            self.0.hit(ctx);
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(ActionOutcome::Succeeded { output: Value::Null })
        }

        async fn cancel(&self, _ctx: &ActionContext) {
            self.0.cancels.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct WaitAction(Tracker);
    impl StepAction for WaitAction {
        async fn execute(&self, ctx: &ActionContext) -> Result<ActionOutcome, ActionError> {
            self.0.hit(ctx);
            Ok(ActionOutcome::Wait {
                message: "still deploying".into(),
            })
        }

        async fn cancel(&self, _ctx: &ActionContext) {
            self.0.cancels.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct FailAction(Tracker);
    impl StepAction for FailAction {
        async fn execute(&self, ctx: &ActionContext) -> Result<ActionOutcome, ActionError> {
            self.0.hit(ctx);
            Err(ActionError::Failed("boom".into()))
        }
    }

    struct StopAction(Tracker);
    impl StepAction for StopAction {
        async fn execute(&self, ctx: &ActionContext) -> Result<ActionOutcome, ActionError> {
            self.0.hit(ctx);
            Ok(ActionOutcome::Stop {
                message: "halted by operator".into(),
            })
        }
    }

    fn registry(tracker: &Tracker) -> ActionRegistry {
        let mut registry = ActionRegistry::with_builtins();
        registry.register("record", RecordAction(tracker.clone()));
        registry.register("hang", HangAction(tracker.clone()));
        registry.register("wait", WaitAction(tracker.clone()));
        registry.register("fail", FailAction(tracker.clone()));
        registry.register("stop", StopAction(tracker.clone()));
        registry
    }

    // -- harness -----------------------------------------------------------

    struct Harness<R: RunRepository> {
        scheduler: Scheduler<R, InMemoryContextStore>,
        repo: Arc<R>,
        contexts: Arc<InMemoryContextStore>,
        tracker: Tracker,
    }

    fn config() -> EngineConfig {
        EngineConfig {
            tick_interval_ms: 5,
            ..EngineConfig::default()
        }
    }

    fn harness_with<R: RunRepository>(repo: R, config: EngineConfig) -> Harness<R> {
        let repo = Arc::new(repo);
        let contexts = Arc::new(InMemoryContextStore::new());
        let tracker = Tracker::default();
        let scheduler = Scheduler::new(repo.clone(), contexts.clone(), registry(&tracker), config);
        Harness {
            scheduler,
            repo,
            contexts,
            tracker,
        }
    }

    fn harness(config: EngineConfig) -> Harness<InMemoryRunRepository> {
        harness_with(InMemoryRunRepository::new(), config)
    }

    impl<R: RunRepository> Harness<R> {
        async fn create(&self, spec_yaml: &str) -> Uuid {
            self.create_named("test-run", spec_yaml).await
        }

        async fn create_named(&self, name: &str, spec_yaml: &str) -> Uuid {
            let spec: WorkflowRunSpec = serde_yaml_ng::from_str(spec_yaml).unwrap();
            let run = WorkflowRun::new(name, spec);
            self.repo.create_run(&run).await.unwrap();
            run.id
        }

        async fn run(&self, id: &Uuid) -> WorkflowRun {
            self.repo.get_run(id).await.unwrap().unwrap()
        }

        async fn settle(&self, id: &Uuid) -> TickReport {
            self.scheduler.run_until_settled(id, Some(50)).await.unwrap()
        }

        fn calls(&self) -> Vec<String> {
            self.tracker.calls.lock().unwrap().clone()
        }
    }

    fn step<'a>(run: &'a WorkflowRun, name: &str) -> &'a StepStatus {
        &run.status.step(name).unwrap().step
    }

    // -- scenarios -----------------------------------------------------------

    #[tokio::test]
    async fn test_dag_skipped_dependency_still_admits_dependent() {
        let h = harness(config());
        let id = h
            .create(
                r#"
mode: { steps: DAG }
workflowSpec:
  steps:
    - { name: a, type: record }
    - { name: b, type: record, dependsOn: [a], if: "1 == 2" }
    - { name: c, type: record, dependsOn: [b] }
"#,
            )
            .await;

        let report = h.settle(&id).await;
        assert!(report.finished);

        let run = h.run(&id).await;
        assert_eq!(run.status.phase, WorkflowRunPhase::Succeeded);
        assert_eq!(step(&run, "a").phase, WorkflowStepPhase::Succeeded);
        assert_eq!(step(&run, "b").phase, WorkflowStepPhase::Skipped);
        assert_eq!(step(&run, "b").reason, reason::SKIP);
        assert_eq!(step(&run, "c").phase, WorkflowStepPhase::Succeeded);
        assert_eq!(h.calls(), vec!["a", "c"]);
        assert_eq!(
            run.get_condition(WORKFLOW_RUN_CONDITION).status,
            ConditionStatus::True
        );
    }

    #[tokio::test]
    async fn test_timeout_fails_step_and_terminates_run() {
        let h = harness(config());
        let id = h
            .create(
                r#"
workflowSpec:
  steps:
    - { name: a, type: record }
    - { name: b, type: hang, timeout: 50ms }
    - { name: c, type: record }
"#,
            )
            .await;

        h.settle(&id).await;

        let run = h.run(&id).await;
        assert_eq!(step(&run, "b").phase, WorkflowStepPhase::Failed);
        assert_eq!(step(&run, "b").reason, reason::TIMEOUT);
        assert_eq!(h.tracker.cancels.load(Ordering::SeqCst), 1);
        assert!(run.status.terminated);
        assert!(run.status.finished);
        assert_eq!(run.status.phase, WorkflowRunPhase::Terminated);
        assert_ne!(step(&run, "c").phase, WorkflowStepPhase::Succeeded);
        assert_eq!(h.calls(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_external_suspend_blocks_admission() {
        let h = harness(config());
        let id = h
            .create("workflowSpec:\n  steps:\n    - { name: a, type: record }\n")
            .await;

        h.scheduler.suspend_run(&id).await.unwrap();
        let report = h.scheduler.tick(&id).await.unwrap();
        assert!(report.suspended);
        assert!(report.admitted.is_empty());
        assert_eq!(report.phase, WorkflowRunPhase::Suspending);
        assert!(h.calls().is_empty());

        h.scheduler.resume_run(&id).await.unwrap();
        let report = h.settle(&id).await;
        assert_eq!(report.phase, WorkflowRunPhase::Succeeded);
        assert_eq!(h.calls(), vec!["a"]);
    }

    #[tokio::test]
    async fn test_resume_does_not_reinvoke_succeeded_steps() {
        let h = harness(config());
        let id = h
            .create(
                r#"
workflowSpec:
  steps:
    - { name: a, type: record }
    - { name: approve, type: suspend, properties: { message: "needs approval" } }
    - { name: b, type: record }
"#,
            )
            .await;

        let report = h.settle(&id).await;
        assert!(report.suspended);
        let run = h.run(&id).await;
        assert_eq!(run.status.suspend_state, "approve");
        assert_eq!(step(&run, "approve").phase, WorkflowStepPhase::Running);
        assert_eq!(step(&run, "approve").reason, reason::SUSPEND);
        assert_eq!(h.calls(), vec!["a"]);

        h.scheduler.resume_run(&id).await.unwrap();
        let report = h.settle(&id).await;
        assert_eq!(report.phase, WorkflowRunPhase::Succeeded);

        let run = h.run(&id).await;
        assert_eq!(step(&run, "approve").phase, WorkflowStepPhase::Succeeded);
        assert_eq!(step(&run, "approve").reason, reason::RESUME);
        assert_eq!(h.calls(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_step_by_step_admits_one_step_per_tick() {
        let h = harness(config());
        let id = h
            .create(
                r#"
workflowSpec:
  steps:
    - { name: a, type: record }
    - { name: b, type: record }
    - { name: c, type: record }
"#,
            )
            .await;

        for expected in ["a", "b", "c"] {
            let report = h.scheduler.tick(&id).await.unwrap();
            assert_eq!(report.admitted, vec![expected]);
        }
        let run = h.run(&id).await;
        assert_eq!(run.status.phase, WorkflowRunPhase::Succeeded);
    }

    #[tokio::test]
    async fn test_dag_roots_admitted_together_and_ordered_by_dependency() {
        let h = harness(config());
        let id = h
            .create(
                r#"
mode: { steps: DAG }
workflowSpec:
  steps:
    - { name: a, type: record }
    - { name: b, type: record }
    - { name: c, type: record, dependsOn: [a, b] }
"#,
            )
            .await;

        let report = h.scheduler.tick(&id).await.unwrap();
        assert_eq!(report.admitted, vec!["a", "b"]);
        h.settle(&id).await;

        let run = h.run(&id).await;
        let c_first = step(&run, "c").first_execute_time.unwrap();
        assert!(c_first >= step(&run, "a").first_execute_time.unwrap());
        assert!(c_first >= step(&run, "b").first_execute_time.unwrap());
        assert_eq!(run.status.phase, WorkflowRunPhase::Succeeded);
    }

    #[tokio::test]
    async fn test_cycle_terminates_run_without_invocations() {
        let h = harness(config());
        let id = h
            .create(
                r#"
mode: { steps: DAG }
workflowSpec:
  steps:
    - { name: a, type: record, dependsOn: [c] }
    - { name: b, type: record, dependsOn: [a] }
    - { name: c, type: record, dependsOn: [b] }
"#,
            )
            .await;

        let report = h.scheduler.tick(&id).await.unwrap();
        assert!(report.finished);
        let run = h.run(&id).await;
        assert!(run.status.terminated);
        assert_eq!(run.status.phase, WorkflowRunPhase::Terminated);
        assert!(run.status.message.contains("cyclic dependency"));
        assert!(h.calls().is_empty());
    }

    #[tokio::test]
    async fn test_failure_terminates_run_under_default_policy() {
        let h = harness(config());
        let id = h
            .create(
                r#"
workflowSpec:
  steps:
    - { name: a, type: fail }
    - { name: b, type: record }
"#,
            )
            .await;

        let report = h.settle(&id).await;
        assert_eq!(report.phase, WorkflowRunPhase::Terminated);

        let run = h.run(&id).await;
        assert_eq!(step(&run, "a").phase, WorkflowStepPhase::Failed);
        assert_eq!(step(&run, "a").reason, reason::ACTION_FAILURE);
        assert_eq!(step(&run, "a").message, "boom");
        assert_eq!(step(&run, "b").phase, WorkflowStepPhase::Stopped);
        assert_eq!(run.status.message, "step 'a' failed: boom");
        assert_eq!(h.calls(), vec!["a"]);
    }

    #[tokio::test]
    async fn test_block_dependents_policy_lets_independent_steps_finish() {
        let h = harness(EngineConfig {
            failure_policy: FailurePolicy::BlockDependents,
            ..config()
        });
        let id = h
            .create(
                r#"
mode: { steps: DAG }
workflowSpec:
  steps:
    - { name: a, type: fail }
    - { name: b, type: record, dependsOn: [a] }
    - { name: d, type: record }
    - { name: c, type: record, dependsOn: [d] }
"#,
            )
            .await;

        let report = h.scheduler.tick(&id).await.unwrap();
        assert_eq!(report.phase, WorkflowRunPhase::Executing);

        let report = h.settle(&id).await;
        assert_eq!(report.phase, WorkflowRunPhase::Terminated);

        let run = h.run(&id).await;
        assert_eq!(step(&run, "c").phase, WorkflowStepPhase::Succeeded);
        assert_eq!(step(&run, "b").phase, WorkflowStepPhase::Stopped);
        assert!(!h.calls().contains(&"b".to_string()));
    }

    #[tokio::test]
    async fn test_sub_steps_run_inside_group() {
        let h = harness(config());
        let id = h
            .create(
                r#"
workflowSpec:
  steps:
    - name: group
      type: step-group
      subSteps:
        - { name: one, type: record }
        - { name: two, type: record, dependsOn: [one] }
        - { name: off, type: record, if: "false" }
    - { name: after, type: record }
"#,
            )
            .await;

        let report = h.settle(&id).await;
        assert_eq!(report.phase, WorkflowRunPhase::Succeeded);

        let run = h.run(&id).await;
        let group = run.status.step("group").unwrap();
        assert_eq!(group.step.phase, WorkflowStepPhase::Succeeded);
        assert_eq!(group.sub_steps[1].phase, WorkflowStepPhase::Succeeded);
        assert_eq!(group.sub_steps[2].phase, WorkflowStepPhase::Skipped);
        assert_eq!(h.calls(), vec!["one", "two", "after"]);
    }

    #[tokio::test]
    async fn test_failed_sub_step_fails_group() {
        let h = harness(config());
        let id = h
            .create(
                r#"
workflowSpec:
  steps:
    - name: group
      subSteps:
        - { name: one, type: fail }
        - { name: two, type: record, dependsOn: [one] }
"#,
            )
            .await;

        h.settle(&id).await;
        let run = h.run(&id).await;
        let group = run.status.step("group").unwrap();
        assert_eq!(group.step.phase, WorkflowStepPhase::Failed);
        assert!(group.step.message.contains("sub-step 'one' failed"));
        assert_eq!(run.status.phase, WorkflowRunPhase::Terminated);
    }

    #[tokio::test]
    async fn test_inputs_and_outputs_flow_through_context() {
        let h = harness(config());
        let id = h
            .create(
                r#"
workflowSpec:
  steps:
    - name: build
      type: record
      properties: { tag: v1 }
      outputs:
        - { valueFrom: output.tag, name: tag }
    - name: deploy
      type: record
      if: "context.tag == 'v1'"
      inputs:
        - { from: tag, parameterKey: image.tag }
      outputs:
        - { valueFrom: properties.image.tag, name: deployed }
"#,
            )
            .await;

        let report = h.settle(&id).await;
        assert_eq!(report.phase, WorkflowRunPhase::Succeeded);

        let backend = ContextBackendRef::for_run("test-run");
        let vars = h.contexts.load(&backend).await.unwrap();
        assert_eq!(vars.get("tag"), Some(&json!("v1")));
        assert_eq!(vars.get("deployed"), Some(&json!("v1")));
    }

    #[tokio::test]
    async fn test_missing_input_fails_step() {
        let h = harness(config());
        let id = h
            .create(
                r#"
workflowSpec:
  steps:
    - name: deploy
      type: record
      inputs:
        - { from: absent, parameterKey: image }
"#,
            )
            .await;

        h.settle(&id).await;
        let run = h.run(&id).await;
        assert_eq!(step(&run, "deploy").phase, WorkflowStepPhase::Failed);
        assert_eq!(step(&run, "deploy").reason, reason::INPUT_NOT_FOUND);
        assert!(h.calls().is_empty());
    }

    #[tokio::test]
    async fn test_condition_error_fails_step() {
        let h = harness(config());
        let id = h
            .create("workflowSpec:\n  steps:\n    - { name: a, type: record, if: \"1 ==\" }\n")
            .await;

        h.settle(&id).await;
        let run = h.run(&id).await;
        assert_eq!(step(&run, "a").phase, WorkflowStepPhase::Failed);
        assert_eq!(step(&run, "a").reason, reason::CONDITION_EVALUATION_ERROR);
        assert!(h.calls().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_type_fails_step() {
        let h = harness(config());
        let id = h
            .create("workflowSpec:\n  steps:\n    - { name: a, type: teleport }\n")
            .await;

        h.settle(&id).await;
        let run = h.run(&id).await;
        assert_eq!(step(&run, "a").reason, reason::UNKNOWN_TYPE);
        assert_eq!(run.status.phase, WorkflowRunPhase::Terminated);
    }

    #[tokio::test]
    async fn test_stop_outcome_terminates_run() {
        let h = harness(config());
        let id = h
            .create(
                "workflowSpec:\n  steps:\n    - { name: a, type: stop }\n    - { name: b, type: record }\n",
            )
            .await;

        let report = h.settle(&id).await;
        assert_eq!(report.phase, WorkflowRunPhase::Terminated);
        let run = h.run(&id).await;
        assert_eq!(step(&run, "a").phase, WorkflowStepPhase::Stopped);
        assert_eq!(run.status.message, "step 'a' stopped: halted by operator");
    }

    #[tokio::test]
    async fn test_workflow_ref_resolution() {
        let h = harness(config());
        h.repo
            .save_workflow(&Workflow {
                name: "release".into(),
                mode: None,
                steps: serde_yaml_ng::from_str("- { name: a, type: record }").unwrap(),
                created_at: Utc::now(),
            })
            .await
            .unwrap();

        let id = h.create("workflowRef: release\n").await;
        let report = h.settle(&id).await;
        assert_eq!(report.phase, WorkflowRunPhase::Succeeded);
        assert_eq!(h.calls(), vec!["a"]);

        let spec: WorkflowRunSpec = serde_yaml_ng::from_str("workflowRef: missing\n").unwrap();
        let orphan = WorkflowRun::new("orphan", spec);
        h.repo.create_run(&orphan).await.unwrap();
        let err = h.scheduler.tick(&orphan.id).await.unwrap_err();
        assert!(matches!(err, SchedulerError::WorkflowNotFound(name) if name == "missing"));
    }

    fn stored_workflow(name: &str, steps_yaml: &str) -> Workflow {
        Workflow {
            name: name.into(),
            mode: None,
            steps: serde_yaml_ng::from_str(steps_yaml).unwrap(),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_workflow_ref_is_pinned_on_first_tick() {
        let h = harness(config());
        h.repo
            .save_workflow(&stored_workflow(
                "wf",
                "- { name: a, type: record }\n- { name: b, type: record }",
            ))
            .await
            .unwrap();
        let id = h.create("workflowRef: wf\n").await;

        let report = h.scheduler.tick(&id).await.unwrap();
        assert_eq!(report.admitted, vec!["a"]);

        h.repo
            .save_workflow(&stored_workflow(
                "wf",
                "- { name: x, type: record }\n- { name: y, type: record }",
            ))
            .await
            .unwrap();
        let report = h.scheduler.tick(&id).await.unwrap();
        assert_eq!(report.admitted, vec!["b"]);

        let run = h.run(&id).await;
        let names: Vec<&str> = run.status.steps.iter().map(|s| s.step.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert_eq!(step(&run, "a").phase, WorkflowStepPhase::Succeeded);
        assert_eq!(run.status.phase, WorkflowRunPhase::Succeeded);
        assert_eq!(h.calls(), vec!["a", "b"]);

        // A restart picks up the current definition.
        h.scheduler.restart_run(&id).await.unwrap();
        h.settle(&id).await;
        let run = h.run(&id).await;
        assert_eq!(run.status.phase, WorkflowRunPhase::Succeeded);
        assert_eq!(h.calls(), vec!["a", "b", "x", "y"]);
    }

    #[tokio::test]
    async fn test_started_run_survives_workflow_delete() {
        let h = harness(config());
        h.repo
            .save_workflow(&stored_workflow(
                "wf",
                "- { name: a, type: record }\n- { name: b, type: record }",
            ))
            .await
            .unwrap();
        let id = h.create("workflowRef: wf\n").await;

        h.scheduler.tick(&id).await.unwrap();
        assert!(h.repo.delete_workflow("wf").await.unwrap());

        let report = h.settle(&id).await;
        assert_eq!(report.phase, WorkflowRunPhase::Succeeded);
        assert_eq!(h.calls(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_run_lock_released_when_run_finishes() {
        let h = harness(config());
        let id = h
            .create("workflowSpec:\n  steps:\n    - { name: a, type: record }\n    - { name: b, type: record }\n")
            .await;

        h.scheduler.tick(&id).await.unwrap();
        assert_eq!(h.scheduler.run_locks.len(), 1);
        let report = h.scheduler.tick(&id).await.unwrap();
        assert!(report.finished);
        assert!(h.scheduler.run_locks.is_empty());

        let other = h
            .create_named("other-run", "workflowSpec:\n  steps:\n    - { name: rollout, type: wait }\n")
            .await;
        h.scheduler.tick(&other).await.unwrap();
        h.scheduler.terminate_run(&other).await.unwrap();
        assert!(h.scheduler.run_locks.is_empty());

        h.scheduler.suspend_run(&other).await.unwrap();
        assert_eq!(h.scheduler.run_locks.len(), 1);
        h.scheduler.forget(&other);
        assert!(h.scheduler.run_locks.is_empty());
    }

    #[tokio::test]
    async fn test_wait_keeps_step_running_until_timeout_elapses() {
        let h = harness(config());
        let id = h
            .create("workflowSpec:\n  steps:\n    - { name: rollout, type: wait, timeout: 1h }\n")
            .await;

        let report = h.scheduler.tick(&id).await.unwrap();
        assert!(report.waiting);
        let run = h.run(&id).await;
        assert_eq!(step(&run, "rollout").phase, WorkflowStepPhase::Running);
        assert_eq!(step(&run, "rollout").reason, reason::ACTION);
        let first = step(&run, "rollout").first_execute_time;

        h.scheduler.tick(&id).await.unwrap();
        let run = h.run(&id).await;
        assert_eq!(step(&run, "rollout").first_execute_time, first);

        // Pretend the step started two hours ago.
        let mut status = run.status.clone();
        status.steps[0].step.first_execute_time = Some(Utc::now() - chrono::Duration::hours(2));
        h.repo.update_status(&id, &status).await.unwrap();

        h.scheduler.tick(&id).await.unwrap();
        let run = h.run(&id).await;
        assert_eq!(step(&run, "rollout").phase, WorkflowStepPhase::Failed);
        assert_eq!(step(&run, "rollout").reason, reason::TIMEOUT);
        assert_eq!(h.tracker.cancels.load(Ordering::SeqCst), 1);
        assert_eq!(h.calls().len(), 2);
        assert!(run.status.finished);
    }

    #[tokio::test]
    async fn test_terminate_then_restart() {
        let h = harness(config());
        let id = h
            .create("workflowSpec:\n  steps:\n    - { name: rollout, type: wait }\n")
            .await;

        h.scheduler.tick(&id).await.unwrap();
        let run = h.scheduler.terminate_run(&id).await.unwrap();
        assert!(run.status.finished);
        assert_eq!(run.status.phase, WorkflowRunPhase::Terminated);
        assert_eq!(step(&run, "rollout").phase, WorkflowStepPhase::Stopped);
        assert_eq!(step(&run, "rollout").reason, reason::TERMINATE);

        let report = h.scheduler.tick(&id).await.unwrap();
        assert!(report.admitted.is_empty());
        assert_eq!(h.calls().len(), 1);

        let run = h.scheduler.restart_run(&id).await.unwrap();
        assert_eq!(run.status.phase, WorkflowRunPhase::Initializing);
        let report = h.scheduler.tick(&id).await.unwrap();
        assert_eq!(report.admitted, vec!["rollout"]);
        assert_eq!(h.calls().len(), 2);
    }

    // -- persistence failure --------------------------------------------------

    #[derive(Default)]
    struct FlakyRepo {
        inner: InMemoryRunRepository,
        fail_writes: AtomicBool,
    }

    impl RunRepository for FlakyRepo {
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
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(RepositoryError::Query("disk full".into()));
            }
            self.inner.update_status(run_id, status).await
        }
        async fn delete_run(&self, run_id: &Uuid) -> Result<bool, RepositoryError> {
            self.inner.delete_run(run_id).await
        }
    }

    #[tokio::test]
    async fn test_persistence_failure_is_reported_and_retryable() {
        let h = harness_with(FlakyRepo::default(), config());
        let id = h
            .create("workflowSpec:\n  steps:\n    - { name: a, type: record }\n")
            .await;

        h.repo.fail_writes.store(true, Ordering::SeqCst);
        let err = h.scheduler.tick(&id).await.unwrap_err();
        assert!(matches!(err, SchedulerError::Persistence(_)));
        assert_eq!(h.run(&id).await.status.phase, WorkflowRunPhase::Initializing);

        h.repo.fail_writes.store(false, Ordering::SeqCst);
        let report = h.scheduler.tick(&id).await.unwrap();
        assert_eq!(report.phase, WorkflowRunPhase::Succeeded);
        // The unrecorded tick is replayed in full.
        assert_eq!(h.calls(), vec!["a", "a"]);
    }
}
