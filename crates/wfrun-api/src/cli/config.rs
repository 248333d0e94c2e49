//! `wfrun config`: data directory and effective engine configuration.

use anyhow::Result;
use console::style;

use wfrun_infra::sqlite::pool::database_url;

use crate::state::AppState;

pub fn show_config(state: &AppState, json: bool) -> Result<()> {
    let config = state.scheduler.config();
    let registry = state.scheduler.registry();

    if json {
        let out = serde_json::json!({
            "data_dir": state.data_dir.display().to_string(),
            "database": database_url(&state.data_dir),
            "engine": config,
            "step_types": registry.types(),
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!();
    println!("  {} {}", style("Data dir:").bold(), state.data_dir.display());
    println!("  {} {}", style("Database:").bold(), database_url(&state.data_dir));
    println!();
    println!("  max_concurrent_steps = {}", config.max_concurrent_steps);
    println!("  failure_policy       = {:?}", config.failure_policy);
    println!(
        "  default_step_timeout = {}",
        config.default_step_timeout.as_deref().unwrap_or("-")
    );
    println!("  max_ticks            = {}", config.max_ticks);
    println!("  tick_interval_ms     = {}", config.tick_interval_ms);
    println!();
    println!("  Step types: {}", registry.types().join(", "));
    println!();
    Ok(())
}
