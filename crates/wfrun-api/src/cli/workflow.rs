//! Stored workflow subcommands (`wfrun workflows ...`).

use anyhow::Result;
use clap::Subcommand;
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;

use wfrun_core::repository::run::RunRepository;

use crate::state::AppState;

#[derive(Subcommand)]
pub enum WorkflowCommand {
    /// List stored workflows (the default).
    List,

    /// Print a stored workflow as YAML-compatible JSON.
    Show {
        /// Workflow name.
        name: String,
    },

    /// Delete a stored workflow.
    Delete {
        /// Workflow name.
        name: String,
    },
}

pub async fn handle_workflow_command(
    cmd: Option<WorkflowCommand>,
    state: &AppState,
    json: bool,
) -> Result<()> {
    match cmd.unwrap_or(WorkflowCommand::List) {
        WorkflowCommand::List => handle_list(state, json).await,
        WorkflowCommand::Show { name } => handle_show(state, &name).await,
        WorkflowCommand::Delete { name } => handle_delete(state, &name, json).await,
    }
}

async fn handle_list(state: &AppState, json: bool) -> Result<()> {
    let workflows = state
        .runs
        .list_workflows()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to list workflows: {e}"))?;

    if json {
        let out: Vec<_> = workflows
            .iter()
            .map(|w| {
                serde_json::json!({
                    "name": w.name,
                    "steps": w.steps.len(),
                    "mode": w.mode,
                    "created_at": w.created_at.to_rfc3339(),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    if workflows.is_empty() {
        println!();
        println!("  No workflows stored.");
        println!("  Store one with: {}", style("wfrun apply <workflow.yaml>").dim());
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Name").fg(Color::Cyan),
            Cell::new("Steps"),
            Cell::new("Mode"),
            Cell::new("Created"),
        ]);
    for w in &workflows {
        let mode = w
            .mode
            .map(|m| format!("{}/{}", m.steps, m.sub_steps))
            .unwrap_or_else(|| "-".to_string());
        table.add_row(vec![
            Cell::new(&w.name),
            Cell::new(w.steps.len()),
            Cell::new(mode),
            Cell::new(w.created_at.format("%Y-%m-%d %H:%M").to_string()),
        ]);
    }

    println!();
    println!("{table}");
    println!();
    Ok(())
}

async fn handle_show(state: &AppState, name: &str) -> Result<()> {
    let workflow = state
        .runs
        .get_workflow(name)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to get workflow: {e}"))?
        .ok_or_else(|| anyhow::anyhow!("Workflow '{name}' not found"))?;
    println!("{}", serde_json::to_string_pretty(&workflow)?);
    Ok(())
}

async fn handle_delete(state: &AppState, name: &str, json: bool) -> Result<()> {
    let deleted = state
        .runs
        .delete_workflow(name)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to delete workflow: {e}"))?;
    if !deleted {
        anyhow::bail!("Workflow '{name}' not found");
    }

    if json {
        println!("{}", serde_json::json!({ "name": name, "deleted": true }));
    } else {
        println!();
        println!("  {} Deleted workflow '{}'", style("*").green().bold(), style(name).cyan());
        println!();
    }
    Ok(())
}
