//! Context store trait.
//!
//! Defines the interface for the key/value backend that carries step outputs
//! to downstream inputs. A run's backend is named by its status
//! `contextBackend` reference. Implementations live in wfrun-infra.

use std::collections::BTreeMap;

use serde_json::Value;
use wfrun_types::error::RepositoryError;
use wfrun_types::workflow::ContextBackendRef;

/// Trait for run context persistence.
///
/// Uses RPITIT (native async fn in traits, Rust 2024 edition).
pub trait ContextStore: Send + Sync {
    /// Load all variables of a backend. Missing backends load as empty.
    fn load(
        &self,
        backend: &ContextBackendRef,
    ) -> impl std::future::Future<Output = Result<BTreeMap<String, Value>, RepositoryError>> + Send;

    /// Replace all variables of a backend.
    fn save(
        &self,
        backend: &ContextBackendRef,
        variables: &BTreeMap<String, Value>,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Remove a backend and all its variables. No-op if it does not exist.
    fn clear(
        &self,
        backend: &ContextBackendRef,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;
}
