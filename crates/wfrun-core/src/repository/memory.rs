//! In-process implementations of the repository ports.
//!
//! Backed by `DashMap`, so they can be shared across tasks without an outer
//! lock. Used by tests and by embedders that do not need durability.

use std::collections::BTreeMap;

use dashmap::DashMap;
use serde_json::Value;
use uuid::Uuid;
use wfrun_types::error::RepositoryError;
use wfrun_types::workflow::{ContextBackendRef, Workflow, WorkflowRun, WorkflowRunStatus};

use super::context_store::ContextStore;
use super::run::RunRepository;

/// In-memory `RunRepository`.
#[derive(Default)]
pub struct InMemoryRunRepository {
    workflows: DashMap<String, Workflow>,
    runs: DashMap<Uuid, WorkflowRun>,
}

impl InMemoryRunRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RunRepository for InMemoryRunRepository {
    async fn save_workflow(&self, workflow: &Workflow) -> Result<(), RepositoryError> {
        self.workflows
            .insert(workflow.name.clone(), workflow.clone());
        Ok(())
    }

    async fn get_workflow(&self, name: &str) -> Result<Option<Workflow>, RepositoryError> {
        Ok(self.workflows.get(name).map(|w| w.clone()))
    }

    async fn list_workflows(&self) -> Result<Vec<Workflow>, RepositoryError> {
        let mut all: Vec<Workflow> = self.workflows.iter().map(|w| w.clone()).collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(all)
    }

    async fn delete_workflow(&self, name: &str) -> Result<bool, RepositoryError> {
        Ok(self.workflows.remove(name).is_some())
    }

    async fn create_run(&self, run: &WorkflowRun) -> Result<(), RepositoryError> {
        if self.runs.iter().any(|r| r.name == run.name) {
            return Err(RepositoryError::Conflict(format!(
                "run '{}' already exists",
                run.name
            )));
        }
        self.runs.insert(run.id, run.clone());
        Ok(())
    }

    async fn get_run(&self, run_id: &Uuid) -> Result<Option<WorkflowRun>, RepositoryError> {
        Ok(self.runs.get(run_id).map(|r| r.clone()))
    }

    async fn get_run_by_name(&self, name: &str) -> Result<Option<WorkflowRun>, RepositoryError> {
        Ok(self
            .runs
            .iter()
            .find(|r| r.name == name)
            .map(|r| r.clone()))
    }

    async fn list_runs(&self) -> Result<Vec<WorkflowRun>, RepositoryError> {
        let mut all: Vec<WorkflowRun> = self.runs.iter().map(|r| r.clone()).collect();
        all.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(all)
    }

    async fn update_status(
        &self,
        run_id: &Uuid,
        status: &WorkflowRunStatus,
    ) -> Result<(), RepositoryError> {
        let mut run = self.runs.get_mut(run_id).ok_or(RepositoryError::NotFound)?;
        run.status = status.clone();
        Ok(())
    }

    async fn delete_run(&self, run_id: &Uuid) -> Result<bool, RepositoryError> {
        Ok(self.runs.remove(run_id).is_some())
    }
}

/// In-memory `ContextStore`.
#[derive(Default)]
pub struct InMemoryContextStore {
    backends: DashMap<String, BTreeMap<String, Value>>,
}

impl InMemoryContextStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ContextStore for InMemoryContextStore {
    async fn load(
        &self,
        backend: &ContextBackendRef,
    ) -> Result<BTreeMap<String, Value>, RepositoryError> {
        Ok(self
            .backends
            .get(&backend.name)
            .map(|vars| vars.clone())
            .unwrap_or_default())
    }

    async fn save(
        &self,
        backend: &ContextBackendRef,
        variables: &BTreeMap<String, Value>,
    ) -> Result<(), RepositoryError> {
        self.backends
            .insert(backend.name.clone(), variables.clone());
        Ok(())
    }

    async fn clear(&self, backend: &ContextBackendRef) -> Result<(), RepositoryError> {
        self.backends.remove(&backend.name);
        Ok(())
    }
}
