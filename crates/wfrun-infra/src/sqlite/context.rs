//! SQLite context store implementation.
//!
//! Implements `ContextStore` from `wfrun-core`. Each variable of a backend is
//! one row keyed by `(backend, key)` with its value stored as JSON text.

use std::collections::BTreeMap;

use chrono::Utc;
use serde_json::Value;
use sqlx::Row;
use wfrun_core::repository::context_store::ContextStore;
use wfrun_types::error::RepositoryError;
use wfrun_types::workflow::ContextBackendRef;

use super::pool::DatabasePool;

/// SQLite-backed implementation of `ContextStore`.
pub struct SqliteContextStore {
    pool: DatabasePool,
}

impl SqliteContextStore {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

impl ContextStore for SqliteContextStore {
    async fn load(
        &self,
        backend: &ContextBackendRef,
    ) -> Result<BTreeMap<String, Value>, RepositoryError> {
        let rows = sqlx::query("SELECT key, value FROM workflow_contexts WHERE backend = ?")
            .bind(&backend.name)
            .fetch_all(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        let mut variables = BTreeMap::new();
        for row in &rows {
            let key: String = row
                .try_get("key")
                .map_err(|e| RepositoryError::Query(e.to_string()))?;
            let raw: String = row
                .try_get("value")
                .map_err(|e| RepositoryError::Query(e.to_string()))?;
            let value: Value = serde_json::from_str(&raw)
                .map_err(|e| RepositoryError::Query(format!("invalid JSON value for '{key}': {e}")))?;
            variables.insert(key, value);
        }
        Ok(variables)
    }

    async fn save(
        &self,
        backend: &ContextBackendRef,
        variables: &BTreeMap<String, Value>,
    ) -> Result<(), RepositoryError> {
        let now = Utc::now().to_rfc3339();
        let mut tx = self
            .pool
            .writer
            .begin()
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        sqlx::query("DELETE FROM workflow_contexts WHERE backend = ?")
            .bind(&backend.name)
            .execute(&mut *tx)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        for (key, value) in variables {
            let raw = serde_json::to_string(value)
                .map_err(|e| RepositoryError::Query(format!("failed to serialize '{key}': {e}")))?;
            sqlx::query(
                "INSERT INTO workflow_contexts (backend, key, value, updated_at) VALUES (?, ?, ?, ?)",
            )
            .bind(&backend.name)
            .bind(key)
            .bind(&raw)
            .bind(&now)
            .execute(&mut *tx)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;
        }

        tx.commit()
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        tracing::debug!(backend = %backend.name, count = variables.len(), "saved run context");
        Ok(())
    }

    async fn clear(&self, backend: &ContextBackendRef) -> Result<(), RepositoryError> {
        sqlx::query("DELETE FROM workflow_contexts WHERE backend = ?")
            .bind(&backend.name)
            .execute(&self.pool.writer)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn test_pool() -> DatabasePool {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("test.db");
        let url = format!("sqlite://{}?mode=rwc", db_path.display());
        std::mem::forget(dir);
        DatabasePool::new(&url).await.unwrap()
    }

    #[tokio::test]
    async fn test_missing_backend_loads_empty() {
        let store = SqliteContextStore::new(test_pool().await);
        let vars = store.load(&ContextBackendRef::for_run("none")).await.unwrap();
        assert!(vars.is_empty());
    }

    #[tokio::test]
    async fn test_save_replaces_all_variables() {
        let store = SqliteContextStore::new(test_pool().await);
        let backend = ContextBackendRef::for_run("nightly");

        let first = BTreeMap::from([
            ("image".to_string(), json!("app:v1")),
            ("replicas".to_string(), json!(3)),
        ]);
        store.save(&backend, &first).await.unwrap();
        assert_eq!(store.load(&backend).await.unwrap(), first);

        let second = BTreeMap::from([("image".to_string(), json!({"tag": "v2", "pinned": true}))]);
        store.save(&backend, &second).await.unwrap();
        assert_eq!(store.load(&backend).await.unwrap(), second);
    }

    #[tokio::test]
    async fn test_backends_are_isolated_and_clearable() {
        let store = SqliteContextStore::new(test_pool().await);
        let a = ContextBackendRef::for_run("a");
        let b = ContextBackendRef::for_run("b");
        store
            .save(&a, &BTreeMap::from([("k".to_string(), json!(1))]))
            .await
            .unwrap();
        store
            .save(&b, &BTreeMap::from([("k".to_string(), json!(2))]))
            .await
            .unwrap();

        store.clear(&a).await.unwrap();
        assert!(store.load(&a).await.unwrap().is_empty());
        assert_eq!(store.load(&b).await.unwrap()["k"], json!(2));

        // Clearing a missing backend is a no-op.
        store.clear(&a).await.unwrap();
    }
}
