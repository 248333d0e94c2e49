//! Application state wiring the engine to its SQLite stores.
//!
//! The scheduler is generic over its repository and context store; AppState
//! pins it to the concrete infra implementations.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use uuid::Uuid;
use wfrun_core::repository::run::RunRepository;
use wfrun_core::workflow::action::ActionRegistry;
use wfrun_core::workflow::scheduler::Scheduler;
use wfrun_infra::config::{data_dir, load_engine_config};
use wfrun_infra::sqlite::context::SqliteContextStore;
use wfrun_infra::sqlite::pool::DatabasePool;
use wfrun_infra::sqlite::run::SqliteRunRepository;
use wfrun_types::workflow::WorkflowRun;

pub type ConcreteScheduler = Scheduler<SqliteRunRepository, SqliteContextStore>;

/// Shared state for CLI commands.
pub struct AppState {
    pub scheduler: ConcreteScheduler,
    pub runs: Arc<SqliteRunRepository>,
    pub contexts: Arc<SqliteContextStore>,
    pub data_dir: PathBuf,
}

impl AppState {
    /// Open the database under the data directory and wire the scheduler.
    pub async fn init() -> Result<Self> {
        let data_dir = data_dir();
        let db_pool = DatabasePool::open(&data_dir)
            .await
            .with_context(|| format!("Failed to open database in {}", data_dir.display()))?;
        let config = load_engine_config(&data_dir).await;

        let runs = Arc::new(SqliteRunRepository::new(db_pool.clone()));
        let contexts = Arc::new(SqliteContextStore::new(db_pool));
        let scheduler = Scheduler::new(
            runs.clone(),
            contexts.clone(),
            ActionRegistry::with_builtins(),
            config,
        );

        tracing::debug!(data_dir = %data_dir.display(), "application state initialized");
        Ok(Self {
            scheduler,
            runs,
            contexts,
            data_dir,
        })
    }

    /// Resolve a run by UUID or by name.
    pub async fn resolve_run(&self, target: &str) -> Result<WorkflowRun> {
        if let Ok(id) = target.parse::<Uuid>() {
            if let Some(run) = self
                .runs
                .get_run(&id)
                .await
                .map_err(|e| anyhow::anyhow!("Failed to get run: {e}"))?
            {
                return Ok(run);
            }
        }
        self.runs
            .get_run_by_name(target)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to get run: {e}"))?
            .ok_or_else(|| anyhow::anyhow!("No workflow run found for '{target}'"))
    }
}
