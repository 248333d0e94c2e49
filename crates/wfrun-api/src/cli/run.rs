//! Run lifecycle subcommands: apply, list, show, tick, run, the control
//! operations and delete.

use std::path::Path;

use anyhow::{Context, Result};
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;

use wfrun_core::repository::context_store::ContextStore;
use wfrun_core::repository::run::RunRepository;
use wfrun_core::workflow::definition::{Manifest, WorkflowError, parse_manifest};
use wfrun_core::workflow::scheduler::{SchedulerError, TickReport};
use wfrun_types::error::RepositoryError;
use wfrun_types::workflow::{ContextBackendRef, WorkflowRun};

use super::render::{
    format_time, phase_text, print_run_detail, report_json, run_phase_cell, run_summary_json,
    short_id,
};
use crate::state::AppState;

// ---------------------------------------------------------------------------
// Apply
// ---------------------------------------------------------------------------

pub async fn apply(state: &AppState, file: &Path, json: bool) -> Result<()> {
    let yaml = tokio::fs::read_to_string(file)
        .await
        .with_context(|| format!("Failed to read {}", file.display()))?;

    let manifest = parse_manifest(&yaml).map_err(|e| match e {
        WorkflowError::ParseError(msg) => anyhow::anyhow!("Failed to parse manifest: {msg}"),
        other => anyhow::anyhow!("Manifest validation failed: {other}"),
    })?;

    match manifest {
        Manifest::Run(run) => apply_run(state, run, json).await,
        Manifest::Workflow(workflow) => {
            state
                .runs
                .save_workflow(&workflow)
                .await
                .map_err(|e| anyhow::anyhow!("Failed to save workflow: {e}"))?;
            tracing::info!(workflow = %workflow.name, steps = workflow.steps.len(), "workflow stored");

            if json {
                let out = serde_json::json!({
                    "kind": "Workflow",
                    "name": workflow.name,
                    "steps": workflow.steps.len(),
                });
                println!("{}", serde_json::to_string_pretty(&out)?);
            } else {
                println!();
                println!(
                    "  {} Stored workflow '{}' ({} steps)",
                    style("*").green().bold(),
                    style(&workflow.name).cyan(),
                    workflow.steps.len()
                );
                println!();
            }
            Ok(())
        }
    }
}

async fn apply_run(state: &AppState, run: WorkflowRun, json: bool) -> Result<()> {
    if let Some(reference) = &run.spec.workflow_ref {
        let stored = state
            .runs
            .get_workflow(reference)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to look up workflow: {e}"))?;
        if stored.is_none() {
            tracing::warn!(run = %run.name, workflow = %reference, "referenced workflow is not stored yet");
        }
    }

    state.runs.create_run(&run).await.map_err(|e| match e {
        RepositoryError::Conflict(_) => anyhow::anyhow!(
            "A run named '{}' already exists. Use `wfrun restart {}` to run it again.",
            run.name,
            run.name
        ),
        other => anyhow::anyhow!("Failed to create run: {other}"),
    })?;
    tracing::info!(run = %run.name, id = %run.id, "workflow run created");

    if json {
        println!("{}", serde_json::to_string_pretty(&run_summary_json(&run))?);
    } else {
        println!();
        println!(
            "  {} Created run '{}'",
            style("*").green().bold(),
            style(&run.name).cyan()
        );
        println!("  ID: {}", run.id);
        println!("  Start it with: {}", style(format!("wfrun run {}", run.name)).dim());
        println!();
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// List / show
// ---------------------------------------------------------------------------

pub async fn list(state: &AppState, json: bool) -> Result<()> {
    let runs = state
        .runs
        .list_runs()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to list runs: {e}"))?;

    if json {
        let out: Vec<_> = runs.iter().map(run_summary_json).collect();
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    if runs.is_empty() {
        println!();
        println!("  No workflow runs.");
        println!("  Create one with: {}", style("wfrun apply <run.yaml>").dim());
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Name").fg(Color::Cyan),
            Cell::new("ID"),
            Cell::new("Phase"),
            Cell::new("Steps"),
            Cell::new("Started"),
            Cell::new("Ended"),
        ]);

    for run in &runs {
        let summary = run_summary_json(run);
        table.add_row(vec![
            Cell::new(&run.name),
            Cell::new(short_id(run)),
            run_phase_cell(run.status.phase),
            Cell::new(format!("{}/{}", summary["succeeded"], summary["steps"])),
            Cell::new(format_time(run.status.start_time)),
            Cell::new(format_time(run.status.end_time)),
        ]);
    }

    println!();
    println!("{table}");
    println!();
    Ok(())
}

pub async fn show(state: &AppState, target: &str, json: bool) -> Result<()> {
    let run = state.resolve_run(target).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&run)?);
    } else {
        print_run_detail(&run);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tick / run
// ---------------------------------------------------------------------------

pub async fn tick(state: &AppState, target: &str, json: bool) -> Result<()> {
    let run = state.resolve_run(target).await?;
    let report = state
        .scheduler
        .tick(&run.id)
        .await
        .map_err(scheduler_error)?;
    print_report(state, &run, &report, json).await
}

pub async fn run_until_settled(
    state: &AppState,
    target: &str,
    max_ticks: Option<u32>,
    json: bool,
) -> Result<()> {
    let run = state.resolve_run(target).await?;
    let report = state
        .scheduler
        .run_until_settled(&run.id, max_ticks)
        .await
        .map_err(scheduler_error)?;
    print_report(state, &run, &report, json).await
}

async fn print_report(
    state: &AppState,
    run: &WorkflowRun,
    report: &TickReport,
    json: bool,
) -> Result<()> {
    let current = state.resolve_run(&run.id.to_string()).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&report_json(&current, report))?);
        return Ok(());
    }

    print_run_detail(&current);
    if !report.admitted.is_empty() {
        println!("  Admitted this tick: {}", report.admitted.join(", "));
    }
    if report.waiting {
        println!("  {}", style("Steps still in flight; tick again to continue.").dim());
    } else if !report.finished && !report.suspended && report.admitted.is_empty() {
        println!("  {}", style("No step could be admitted.").yellow());
    }
    println!();
    Ok(())
}

fn scheduler_error(err: SchedulerError) -> anyhow::Error {
    match err {
        SchedulerError::WorkflowNotFound(name) => anyhow::anyhow!(
            "Workflow '{name}' is not stored. Apply it with `wfrun apply <workflow.yaml>` and retry."
        ),
        SchedulerError::Persistence(msg) => {
            anyhow::anyhow!("Failed to persist run status (tick not applied, retry): {msg}")
        }
        other => anyhow::Error::new(other),
    }
}

// ---------------------------------------------------------------------------
// Control
// ---------------------------------------------------------------------------

/// Control operations that move a run between lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    Suspend,
    Resume,
    Terminate,
    Restart,
}

impl Control {
    fn verb(self) -> &'static str {
        match self {
            Control::Suspend => "Suspended",
            Control::Resume => "Resumed",
            Control::Terminate => "Terminated",
            Control::Restart => "Restarted",
        }
    }
}

pub async fn control(state: &AppState, target: &str, op: Control, json: bool) -> Result<()> {
    let run = state.resolve_run(target).await?;
    let scheduler = &state.scheduler;
    let updated = match op {
        Control::Suspend => scheduler.suspend_run(&run.id).await,
        Control::Resume => scheduler.resume_run(&run.id).await,
        Control::Terminate => scheduler.terminate_run(&run.id).await,
        Control::Restart => scheduler.restart_run(&run.id).await,
    }
    .map_err(scheduler_error)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&run_summary_json(&updated))?);
        return Ok(());
    }

    println!();
    if run.status.finished && op != Control::Restart {
        println!(
            "  Run '{}' is already finished ({}); nothing to do.",
            style(&updated.name).cyan(),
            phase_text(updated.status.phase)
        );
    } else {
        println!(
            "  {} {} run '{}' ({})",
            style("*").green().bold(),
            op.verb(),
            style(&updated.name).cyan(),
            phase_text(updated.status.phase)
        );
    }
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// Delete
// ---------------------------------------------------------------------------

pub async fn delete(state: &AppState, target: &str, json: bool) -> Result<()> {
    let run = state.resolve_run(target).await?;
    let backend = run
        .status
        .context_backend
        .clone()
        .unwrap_or_else(|| ContextBackendRef::for_run(&run.name));

    state
        .contexts
        .clear(&backend)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to clear run context: {e}"))?;
    let deleted = state
        .runs
        .delete_run(&run.id)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to delete run: {e}"))?;
    state.scheduler.forget(&run.id);
    tracing::info!(run = %run.name, deleted, "workflow run deleted");

    if json {
        let out = serde_json::json!({ "id": run.id.to_string(), "name": run.name, "deleted": deleted });
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        println!();
        println!("  {} Deleted run '{}'", style("*").green().bold(), style(&run.name).cyan());
        println!();
    }
    Ok(())
}
