//! Orchestration API seam
//!
//! Controllers need six verbs from the orchestration system: create, list
//! (by label selector) and delete workers, and read, create or update the
//! shared configuration. Everything else about the external system stays behind
//! [`OrchestrationApi`].
//!
//! Two implementations ship with the crate:
//! - [`KubeApi`]: the Kubernetes REST surface (pods and config maps), reached
//!   through an already-authenticated endpoint such as `kubectl proxy`
//! - [`InMemoryApi`]: an in-process store used by `--local` mode and tests

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::resources::LabelSelector;
use crate::topology::{SharedConfig, Worker};

pub mod kube;
pub mod memory;

pub use kube::KubeApi;
pub use memory::InMemoryApi;

/// Errors reported by the orchestration system
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ApiError {
    #[error("Resource '{0}' already exists")]
    AlreadyExists(String),

    #[error("Resource '{0}' not found")]
    NotFound(String),

    #[error("{0} timed out after {1:?}")]
    Timeout(String, Duration),

    #[error("Request failed: {0}")]
    Transport(String),

    #[error("Request rejected with status {status}: {message}")]
    Rejected { status: u16, message: String },

    #[error("Failed to decode response: {0}")]
    Decode(String),
}

impl ApiError {
    /// Whether the error is a name collision
    pub fn is_conflict(&self) -> bool {
        matches!(self, ApiError::AlreadyExists(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ApiError::NotFound(_))
    }
}

/// The verbs a controller consumes from the orchestration system
///
/// All calls are namespace-scoped; the namespace travels on the worker or
/// config object itself for create/update calls.
#[async_trait]
pub trait OrchestrationApi: Send + Sync {
    /// Submit a worker and return it as stored (with creation time and phase)
    async fn create_worker(&self, worker: &Worker) -> Result<Worker, ApiError>;

    /// List workers in a namespace whose labels match the selector
    async fn list_workers(
        &self,
        namespace: &str,
        selector: &LabelSelector,
    ) -> Result<Vec<Worker>, ApiError>;

    /// Request deletion of a worker
    async fn delete_worker(&self, namespace: &str, name: &str) -> Result<(), ApiError>;

    /// Fetch a shared config, `None` when it does not exist
    async fn get_shared_config(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<SharedConfig>, ApiError>;

    async fn create_shared_config(&self, config: &SharedConfig) -> Result<SharedConfig, ApiError>;

    async fn update_shared_config(&self, config: &SharedConfig) -> Result<SharedConfig, ApiError>;
}

pub type SharedApi = Arc<dyn OrchestrationApi>;

/// Run an API call with an upper bound on its duration
pub async fn bounded<T, F>(limit: Duration, operation: &str, call: F) -> Result<T, ApiError>
where
    F: Future<Output = Result<T, ApiError>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(ApiError::Timeout(operation.to_string(), limit)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bounded_passes_result_through() {
        let result = bounded(Duration::from_secs(1), "noop", async { Ok::<_, ApiError>(7) }).await;
        assert_eq!(result, Ok(7));
    }

    #[tokio::test]
    async fn test_bounded_times_out() {
        let result: Result<(), ApiError> = bounded(Duration::from_millis(10), "list", async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;

        assert!(matches!(result, Err(ApiError::Timeout(op, _)) if op == "list"));
    }

    #[test]
    fn test_error_classification() {
        assert!(ApiError::AlreadyExists("demo-1".into()).is_conflict());
        assert!(ApiError::NotFound("demo-1".into()).is_not_found());
        assert!(!ApiError::Transport("reset".into()).is_conflict());
    }
}
