//! wfrun CLI entry point.
//!
//! Binary name: `wfrun`
//!
//! Parses CLI arguments, initializes tracing and the SQLite-backed engine,
//! then dispatches to the command handler.

mod cli;
mod state;

use clap::Parser;
use clap_complete::generate;
use wfrun_observe::tracing_setup::{
    TracingOptions, init_tracing, shutdown_tracing, verbosity_directive,
};

use cli::run::Control;
use cli::{Cli, Commands};
use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_tracing(&TracingOptions {
        directive: verbosity_directive(cli.verbose, cli.quiet).to_string(),
        json: false,
        otel: cli.otel,
    })
    .map_err(|e| anyhow::anyhow!("Failed to initialize tracing: {e}"))?;

    let result = dispatch(cli).await;
    shutdown_tracing();
    result
}

async fn dispatch(cli: Cli) -> anyhow::Result<()> {
    // Shell completions don't need app state
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = <Cli as clap::CommandFactory>::command();
        generate(*shell, &mut cmd, "wfrun", &mut std::io::stdout());
        return Ok(());
    }

    let state = AppState::init().await?;
    let json = cli.json;

    match cli.command {
        Commands::Apply { file } => cli::run::apply(&state, &file, json).await?,
        Commands::List => cli::run::list(&state, json).await?,
        Commands::Show { run } => cli::run::show(&state, &run, json).await?,
        Commands::Tick { run } => cli::run::tick(&state, &run, json).await?,
        Commands::Run { run, max_ticks } => {
            cli::run::run_until_settled(&state, &run, max_ticks, json).await?
        }
        Commands::Suspend { run } => cli::run::control(&state, &run, Control::Suspend, json).await?,
        Commands::Resume { run } => cli::run::control(&state, &run, Control::Resume, json).await?,
        Commands::Terminate { run } => {
            cli::run::control(&state, &run, Control::Terminate, json).await?
        }
        Commands::Restart { run } => cli::run::control(&state, &run, Control::Restart, json).await?,
        Commands::Delete { run } => cli::run::delete(&state, &run, json).await?,
        Commands::Workflows { action } => {
            cli::workflow::handle_workflow_command(action, &state, json).await?
        }
        Commands::Config => cli::config::show_config(&state, json)?,
        Commands::Completions { .. } => unreachable!("handled above"),
    }

    Ok(())
}
