//! SQLite run repository implementation.
//!
//! Implements `RunRepository` from `wfrun-core` using sqlx with split
//! read/write pools. Run specs, status trees and workflow step lists are
//! stored as JSON documents; the run phase and finished flag are copied into
//! their own columns for listing.

use chrono::{DateTime, Utc};
use sqlx::Row;
use uuid::Uuid;
use wfrun_core::repository::run::RunRepository;
use wfrun_types::error::RepositoryError;
use wfrun_types::workflow::{Workflow, WorkflowRun, WorkflowRunStatus};

use super::pool::DatabasePool;

/// SQLite-backed implementation of `RunRepository`.
pub struct SqliteRunRepository {
    pool: DatabasePool,
}

impl SqliteRunRepository {
    /// Create a new repository backed by the given database pool.
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

// ---------------------------------------------------------------------------
// Internal row types
// ---------------------------------------------------------------------------

struct WorkflowRow {
    name: String,
    mode: Option<String>,
    steps: String,
    created_at: String,
}

impl WorkflowRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            name: row.try_get("name")?,
            mode: row.try_get("mode")?,
            steps: row.try_get("steps")?,
            created_at: row.try_get("created_at")?,
        })
    }

    fn into_workflow(self) -> Result<Workflow, RepositoryError> {
        let mode = self
            .mode
            .as_deref()
            .map(|s| {
                serde_json::from_str(s)
                    .map_err(|e| RepositoryError::Query(format!("invalid workflow mode JSON: {e}")))
            })
            .transpose()?;
        let steps = serde_json::from_str(&self.steps)
            .map_err(|e| RepositoryError::Query(format!("invalid workflow steps JSON: {e}")))?;

        Ok(Workflow {
            name: self.name,
            mode,
            steps,
            created_at: parse_datetime(&self.created_at)?,
        })
    }
}

struct RunRow {
    id: String,
    name: String,
    spec: String,
    status: String,
    created_at: String,
}

impl RunRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            spec: row.try_get("spec")?,
            status: row.try_get("status")?,
            created_at: row.try_get("created_at")?,
        })
    }

    fn into_run(self) -> Result<WorkflowRun, RepositoryError> {
        let spec = serde_json::from_str(&self.spec)
            .map_err(|e| RepositoryError::Query(format!("invalid run spec JSON: {e}")))?;
        let status = serde_json::from_str(&self.status)
            .map_err(|e| RepositoryError::Query(format!("invalid run status JSON: {e}")))?;

        Ok(WorkflowRun {
            id: parse_uuid(&self.id)?,
            name: self.name,
            created_at: parse_datetime(&self.created_at)?,
            spec,
            status,
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn parse_uuid(s: &str) -> Result<Uuid, RepositoryError> {
    s.parse::<Uuid>()
        .map_err(|e| RepositoryError::Query(format!("invalid UUID: {e}")))
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Query(format!("invalid datetime: {e}")))
}

fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

fn to_json<T: serde::Serialize>(value: &T, what: &str) -> Result<String, RepositoryError> {
    serde_json::to_string(value).map_err(|e| RepositoryError::Query(format!("serialize {what}: {e}")))
}

fn collect_runs(rows: &[sqlx::sqlite::SqliteRow]) -> Result<Vec<WorkflowRun>, RepositoryError> {
    let mut runs = Vec::with_capacity(rows.len());
    for row in rows {
        let r = RunRow::from_row(row).map_err(|e| RepositoryError::Query(e.to_string()))?;
        runs.push(r.into_run()?);
    }
    Ok(runs)
}

// ---------------------------------------------------------------------------
// RunRepository impl
// ---------------------------------------------------------------------------

impl RunRepository for SqliteRunRepository {
    async fn save_workflow(&self, workflow: &Workflow) -> Result<(), RepositoryError> {
        let mode = workflow
            .mode
            .as_ref()
            .map(|m| to_json(m, "workflow mode"))
            .transpose()?;
        let steps = to_json(&workflow.steps, "workflow steps")?;
        let now = format_datetime(&Utc::now());

        sqlx::query(
            r#"INSERT INTO workflows (name, mode, steps, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?)
               ON CONFLICT(name) DO UPDATE SET
                 mode = excluded.mode,
                 steps = excluded.steps,
                 updated_at = excluded.updated_at"#,
        )
        .bind(&workflow.name)
        .bind(&mode)
        .bind(&steps)
        .bind(format_datetime(&workflow.created_at))
        .bind(&now)
        .execute(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        Ok(())
    }

    async fn get_workflow(&self, name: &str) -> Result<Option<Workflow>, RepositoryError> {
        let row = sqlx::query("SELECT name, mode, steps, created_at FROM workflows WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        match row {
            Some(row) => {
                let r = WorkflowRow::from_row(&row)
                    .map_err(|e| RepositoryError::Query(e.to_string()))?;
                Ok(Some(r.into_workflow()?))
            }
            None => Ok(None),
        }
    }

    async fn list_workflows(&self) -> Result<Vec<Workflow>, RepositoryError> {
        let rows = sqlx::query("SELECT name, mode, steps, created_at FROM workflows ORDER BY name ASC")
            .fetch_all(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        let mut workflows = Vec::with_capacity(rows.len());
        for row in &rows {
            let r = WorkflowRow::from_row(row).map_err(|e| RepositoryError::Query(e.to_string()))?;
            workflows.push(r.into_workflow()?);
        }
        Ok(workflows)
    }

    async fn delete_workflow(&self, name: &str) -> Result<bool, RepositoryError> {
        let result = sqlx::query("DELETE FROM workflows WHERE name = ?")
            .bind(name)
            .execute(&self.pool.writer)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        Ok(result.rows_affected() > 0)
    }

    async fn create_run(&self, run: &WorkflowRun) -> Result<(), RepositoryError> {
        let spec = to_json(&run.spec, "run spec")?;
        let status = to_json(&run.status, "run status")?;
        let now = format_datetime(&Utc::now());

        let result = sqlx::query(
            r#"INSERT INTO workflow_runs (id, name, spec, status, phase, finished, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(run.id.to_string())
        .bind(&run.name)
        .bind(&spec)
        .bind(&status)
        .bind(run.status.phase.as_str())
        .bind(run.status.finished)
        .bind(format_datetime(&run.created_at))
        .bind(&now)
        .execute(&self.pool.writer)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db_err)) if db_err.message().contains("UNIQUE") => Err(
                RepositoryError::Conflict(format!("run '{}' already exists", run.name)),
            ),
            Err(e) => Err(RepositoryError::Query(e.to_string())),
        }
    }

    async fn get_run(&self, run_id: &Uuid) -> Result<Option<WorkflowRun>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM workflow_runs WHERE id = ?")
            .bind(run_id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        match row {
            Some(row) => {
                let r = RunRow::from_row(&row).map_err(|e| RepositoryError::Query(e.to_string()))?;
                Ok(Some(r.into_run()?))
            }
            None => Ok(None),
        }
    }

    async fn get_run_by_name(&self, name: &str) -> Result<Option<WorkflowRun>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM workflow_runs WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        match row {
            Some(row) => {
                let r = RunRow::from_row(&row).map_err(|e| RepositoryError::Query(e.to_string()))?;
                Ok(Some(r.into_run()?))
            }
            None => Ok(None),
        }
    }

    async fn list_runs(&self) -> Result<Vec<WorkflowRun>, RepositoryError> {
        let rows = sqlx::query("SELECT * FROM workflow_runs ORDER BY created_at DESC, id DESC")
            .fetch_all(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        collect_runs(&rows)
    }

    async fn update_status(
        &self,
        run_id: &Uuid,
        status: &WorkflowRunStatus,
    ) -> Result<(), RepositoryError> {
        let status_json = to_json(status, "run status")?;

        let result = sqlx::query(
            "UPDATE workflow_runs SET status = ?, phase = ?, finished = ?, updated_at = ? WHERE id = ?",
        )
        .bind(&status_json)
        .bind(status.phase.as_str())
        .bind(status.finished)
        .bind(format_datetime(&Utc::now()))
        .bind(run_id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn delete_run(&self, run_id: &Uuid) -> Result<bool, RepositoryError> {
        let result = sqlx::query("DELETE FROM workflow_runs WHERE id = ?")
            .bind(run_id.to_string())
            .execute(&self.pool.writer)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sqlite::pool::DatabasePool;
    use wfrun_types::workflow::{
        StepStatus, WorkflowExecuteMode, WorkflowMode, WorkflowRunPhase, WorkflowRunSpec,
        WorkflowSpec, WorkflowStep, WorkflowStepBase, WorkflowStepPhase, WorkflowStepStatus,
    };

    async fn test_pool() -> DatabasePool {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("test.db");
        let url = format!("sqlite://{}?mode=rwc", db_path.display());
        // Leak tempdir so it lives for the test
        std::mem::forget(dir);
        DatabasePool::new(&url).await.unwrap()
    }

    fn leaf(name: &str) -> WorkflowStep {
        WorkflowStep {
            base: WorkflowStepBase {
                name: name.to_string(),
                step_type: "noop".to_string(),
                ..WorkflowStepBase::default()
            },
            sub_steps: vec![],
        }
    }

    fn make_run(name: &str) -> WorkflowRun {
        WorkflowRun::new(
            name,
            WorkflowRunSpec {
                mode: Some(WorkflowExecuteMode {
                    steps: WorkflowMode::Dag,
                    sub_steps: WorkflowMode::Dag,
                }),
                workflow_spec: Some(WorkflowSpec {
                    steps: vec![leaf("a"), leaf("b")],
                }),
                workflow_ref: None,
            },
        )
    }

    #[tokio::test]
    async fn test_create_and_get_run() {
        let repo = SqliteRunRepository::new(test_pool().await);
        let run = make_run("nightly");
        repo.create_run(&run).await.unwrap();

        let found = repo.get_run(&run.id).await.unwrap().unwrap();
        assert_eq!(found.name, "nightly");
        assert_eq!(found.spec, run.spec);
        assert_eq!(found.status.phase, WorkflowRunPhase::Initializing);

        let by_name = repo.get_run_by_name("nightly").await.unwrap().unwrap();
        assert_eq!(by_name.id, run.id);
        assert!(repo.get_run_by_name("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_run_name_conflict() {
        let repo = SqliteRunRepository::new(test_pool().await);
        repo.create_run(&make_run("dup")).await.unwrap();
        let err = repo.create_run(&make_run("dup")).await.unwrap_err();
        assert!(matches!(err, RepositoryError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_update_status_round_trip() {
        let repo = SqliteRunRepository::new(test_pool().await);
        let run = make_run("nightly");
        repo.create_run(&run).await.unwrap();

        let mut status = WorkflowRunStatus::default();
        status.phase = WorkflowRunPhase::Executing;
        status.start_time = Some(Utc::now());
        status.steps.push(WorkflowStepStatus {
            step: StepStatus {
                id: "s-a".into(),
                name: "a".into(),
                phase: WorkflowStepPhase::Succeeded,
                first_execute_time: Some(Utc::now()),
                ..StepStatus::default()
            },
            sub_steps: vec![],
        });
        repo.update_status(&run.id, &status).await.unwrap();

        let found = repo.get_run(&run.id).await.unwrap().unwrap();
        assert_eq!(found.status, status);

        let (phase, finished): (String, bool) =
            sqlx::query_as("SELECT phase, finished FROM workflow_runs WHERE id = ?")
                .bind(run.id.to_string())
                .fetch_one(&repo.pool.reader)
                .await
                .unwrap();
        assert_eq!(phase, "executing");
        assert!(!finished);
    }

    #[tokio::test]
    async fn test_update_status_missing_run() {
        let repo = SqliteRunRepository::new(test_pool().await);
        let err = repo
            .update_status(&Uuid::now_v7(), &WorkflowRunStatus::default())
            .await
            .unwrap_err();
        assert!(matches!(err, RepositoryError::NotFound));
    }

    #[tokio::test]
    async fn test_list_and_delete_runs() {
        let repo = SqliteRunRepository::new(test_pool().await);
        let first = make_run("first");
        repo.create_run(&first).await.unwrap();
        let mut second = make_run("second");
        second.created_at = first.created_at + chrono::Duration::seconds(1);
        repo.create_run(&second).await.unwrap();

        let runs = repo.list_runs().await.unwrap();
        let names: Vec<&str> = runs.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["second", "first"]);

        assert!(repo.delete_run(&first.id).await.unwrap());
        assert!(!repo.delete_run(&first.id).await.unwrap());
        assert_eq!(repo.list_runs().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_workflow_upsert() {
        let repo = SqliteRunRepository::new(test_pool().await);
        let mut workflow = Workflow {
            name: "release".into(),
            mode: None,
            steps: vec![leaf("a")],
            created_at: Utc::now(),
        };
        repo.save_workflow(&workflow).await.unwrap();

        workflow.steps.push(leaf("b"));
        workflow.mode = Some(WorkflowExecuteMode::default());
        repo.save_workflow(&workflow).await.unwrap();

        let found = repo.get_workflow("release").await.unwrap().unwrap();
        assert_eq!(found.steps.len(), 2);
        assert_eq!(found.mode, Some(WorkflowExecuteMode::default()));
        assert_eq!(repo.list_workflows().await.unwrap().len(), 1);

        assert!(repo.delete_workflow("release").await.unwrap());
        assert!(repo.get_workflow("release").await.unwrap().is_none());
    }
}
