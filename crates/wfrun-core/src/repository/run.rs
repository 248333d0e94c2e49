//! Run repository trait definition.
//!
//! Defines the storage interface for stored workflows (the targets of
//! `workflowRef`) and workflow runs with their status trees. The
//! infrastructure layer (wfrun-infra) implements this trait with SQLite
//! persistence; [`super::memory`] provides an in-process implementation.

use wfrun_types::error::RepositoryError;
use wfrun_types::workflow::{Workflow, WorkflowRun, WorkflowRunStatus};
use uuid::Uuid;

/// Repository trait for workflow and run persistence.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait RunRepository: Send + Sync {
    // -----------------------------------------------------------------------
    // Workflows
    // -----------------------------------------------------------------------

    /// Upsert a workflow by name.
    fn save_workflow(
        &self,
        workflow: &Workflow,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn get_workflow(
        &self,
        name: &str,
    ) -> impl std::future::Future<Output = Result<Option<Workflow>, RepositoryError>> + Send;

    /// List workflows ordered by name.
    fn list_workflows(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<Workflow>, RepositoryError>> + Send;

    /// Delete a workflow by name. Returns `true` if it existed.
    fn delete_workflow(
        &self,
        name: &str,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Runs
    // -----------------------------------------------------------------------

    /// Create a new run. Fails with `Conflict` if the name is taken.
    fn create_run(
        &self,
        run: &WorkflowRun,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn get_run(
        &self,
        run_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowRun>, RepositoryError>> + Send;

    fn get_run_by_name(
        &self,
        name: &str,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowRun>, RepositoryError>> + Send;

    /// List runs, newest first.
    fn list_runs(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<WorkflowRun>, RepositoryError>> + Send;

    /// Replace a run's status. Fails with `NotFound` if the run is missing.
    fn update_status(
        &self,
        run_id: &Uuid,
        status: &WorkflowRunStatus,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Delete a run. Returns `true` if it existed.
    fn delete_run(
        &self,
        run_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;
}
