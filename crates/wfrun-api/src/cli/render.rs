//! Shared table and text rendering for run output.

use chrono::{DateTime, Utc};
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use wfrun_core::workflow::scheduler::TickReport;
use wfrun_types::condition::WORKFLOW_RUN_CONDITION;
use wfrun_types::workflow::{StepStatus, WorkflowRun, WorkflowRunPhase, WorkflowStepPhase};

pub fn run_phase_cell(phase: WorkflowRunPhase) -> Cell {
    let cell = Cell::new(phase.as_str());
    match phase {
        WorkflowRunPhase::Initializing => cell.fg(Color::Yellow),
        WorkflowRunPhase::Executing => cell.fg(Color::Blue),
        WorkflowRunPhase::Suspending => cell.fg(Color::Magenta),
        WorkflowRunPhase::Terminated => cell.fg(Color::Red),
        WorkflowRunPhase::Succeeded => cell.fg(Color::Green),
    }
}

fn step_phase_cell(phase: WorkflowStepPhase) -> Cell {
    let cell = Cell::new(phase.as_str());
    match phase {
        WorkflowStepPhase::Pending => cell.fg(Color::DarkGrey),
        WorkflowStepPhase::Running => cell.fg(Color::Blue),
        WorkflowStepPhase::Succeeded => cell.fg(Color::Green),
        WorkflowStepPhase::Failed => cell.fg(Color::Red),
        WorkflowStepPhase::Skipped => cell.fg(Color::DarkYellow),
        WorkflowStepPhase::Stopped => cell.fg(Color::Magenta),
    }
}

pub fn format_time(t: Option<DateTime<Utc>>) -> String {
    t.map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "-".to_string())
}

pub fn short_id(run: &WorkflowRun) -> String {
    run.id.to_string().chars().take(8).collect()
}

/// Compact JSON summary used by `list` and the control commands.
pub fn run_summary_json(run: &WorkflowRun) -> serde_json::Value {
    let steps = &run.status.steps;
    serde_json::json!({
        "id": run.id.to_string(),
        "name": run.name,
        "phase": run.status.phase.as_str(),
        "finished": run.status.finished,
        "terminated": run.status.terminated,
        "suspend": run.status.suspend,
        "message": run.status.message,
        "steps": steps.len(),
        "succeeded": steps.iter().filter(|s| s.step.phase == WorkflowStepPhase::Succeeded).count(),
        "created_at": run.created_at.to_rfc3339(),
        "start_time": run.status.start_time.map(|t| t.to_rfc3339()),
        "end_time": run.status.end_time.map(|t| t.to_rfc3339()),
    })
}

pub fn report_json(run: &WorkflowRun, report: &TickReport) -> serde_json::Value {
    serde_json::json!({
        "run": run_summary_json(run),
        "admitted": report.admitted,
        "waiting": report.waiting,
        "suspended": report.suspended,
        "recorded": format!("{:?}", report.record),
    })
}

fn add_step_row(table: &mut Table, status: &StepStatus, label: String) {
    table.add_row(vec![
        Cell::new(label),
        Cell::new(&status.step_type),
        step_phase_cell(status.phase),
        Cell::new(&status.reason),
        Cell::new(format_time(status.first_execute_time)),
        Cell::new(format_time(status.last_execute_time)),
        Cell::new(&status.message),
    ]);
}

/// Print a run header followed by its step tree.
pub fn print_run_detail(run: &WorkflowRun) {
    let status = &run.status;
    let mode = run.execute_mode();

    println!();
    println!(
        "  {} {} ({})",
        style("Run:").bold(),
        style(&run.name).cyan(),
        style(run.id).dim()
    );
    println!("  Phase: {}", phase_text(status.phase));
    println!("  Mode: steps={} subSteps={}", mode.steps, mode.sub_steps);
    if let Some(reference) = &run.spec.workflow_ref {
        println!("  Workflow: {}", style(reference).cyan());
    }
    println!("  Created: {}", run.created_at.format("%Y-%m-%d %H:%M:%S"));
    println!("  Started: {}", format_time(status.start_time));
    if status.finished {
        println!("  Ended: {}", format_time(status.end_time));
    }
    if status.suspend {
        println!("  {}", style("Suspended").magenta());
    }
    if !status.message.is_empty() {
        println!("  Message: {}", style(&status.message).red());
    }
    let condition = run.get_condition(WORKFLOW_RUN_CONDITION);
    if !condition.reason.is_empty() {
        println!("  Condition: {:?} ({})", condition.status, condition.reason);
    }

    if status.steps.is_empty() {
        println!();
        println!("  No steps initialized yet. Advance with: {}", style("wfrun tick <RUN>").dim());
        println!();
        return;
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Step").fg(Color::Cyan),
            Cell::new("Type"),
            Cell::new("Phase"),
            Cell::new("Reason"),
            Cell::new("First run"),
            Cell::new("Last run"),
            Cell::new("Message"),
        ]);
    for step in &status.steps {
        add_step_row(&mut table, &step.step, step.step.name.clone());
        for sub in &step.sub_steps {
            add_step_row(&mut table, sub, format!("  └ {}", sub.name));
        }
    }

    println!();
    println!("{table}");
    println!();
}

pub fn phase_text(phase: WorkflowRunPhase) -> String {
    let s = style(phase.as_str());
    match phase {
        WorkflowRunPhase::Initializing => s.yellow(),
        WorkflowRunPhase::Executing => s.blue(),
        WorkflowRunPhase::Suspending => s.magenta(),
        WorkflowRunPhase::Terminated => s.red(),
        WorkflowRunPhase::Succeeded => s.green(),
    }
    .to_string()
}
