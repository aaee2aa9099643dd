//! Operator - hosts one controller per NatsCluster
//!
//! Clusters are keyed by qualified name (namespace/name). Applying a spec for
//! a running cluster hands the new desired state to its controller; applying
//! one for an unknown or stopped cluster starts a fresh controller.

use std::sync::Arc;

use dashmap::DashMap;
use futures::future::join_all;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::controller::{ClusterStatus, ControllerConfig, ControllerError, NatsClusterController};
use crate::logging::SharedLogger;
use crate::orchestration::SharedApi;
use crate::spec::{qualified_name, NatsCluster, SpecError};

#[derive(Error, Debug)]
pub enum OperatorError {
    #[error("Invalid cluster spec: {0}")]
    InvalidSpec(#[from] SpecError),

    #[error(transparent)]
    Controller(#[from] ControllerError),

    #[error("Cluster '{0}' is not managed by this operator")]
    NotFound(String),

    #[error("Operator is shutting down")]
    ShuttingDown,
}

/// Result of applying a spec
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ApplyOutcome {
    /// A controller was started for a new cluster
    Created,
    /// The running controller picked up the new spec
    Updated,
    /// The previous controller had stopped and was replaced
    Restarted,
}

struct ManagedCluster {
    controller: Arc<NatsClusterController>,
    task: JoinHandle<()>,
}

/// Hosts the controllers of every managed cluster
pub struct Operator {
    api: SharedApi,
    config: ControllerConfig,
    logger: SharedLogger,

    /// Controllers indexed by qualified name
    clusters: DashMap<String, ManagedCluster>,

    /// Serializes apply/remove so a cluster never gets two controllers
    apply_lock: Mutex<()>,

    shutdown: CancellationToken,
}

impl Operator {
    pub fn new(api: SharedApi, config: ControllerConfig, logger: SharedLogger) -> Self {
        Self {
            api,
            config,
            logger,
            clusters: DashMap::new(),
            apply_lock: Mutex::new(()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Start or update the controller for a cluster
    pub async fn apply(&self, spec: NatsCluster) -> Result<ApplyOutcome, OperatorError> {
        if self.shutdown.is_cancelled() {
            return Err(OperatorError::ShuttingDown);
        }
        spec.validate()?;

        let _guard = self.apply_lock.lock().await;
        let key = spec.qualified_name();

        let existing = self.clusters.get(&key).map(|m| m.controller.clone());
        let outcome = match existing {
            Some(controller) if !controller.is_stopped() => {
                controller.update_spec(spec).await?;
                return Ok(ApplyOutcome::Updated);
            }
            Some(_) => ApplyOutcome::Restarted,
            None => ApplyOutcome::Created,
        };

        let controller = Arc::new(
            NatsClusterController::new(
                spec,
                self.api.clone(),
                self.config.clone(),
                self.logger.clone(),
            )?
            .with_shutdown(self.shutdown.child_token()),
        );
        let task = spawn_controller(key.clone(), controller.clone());

        if let Some(previous) = self
            .clusters
            .insert(key.clone(), ManagedCluster { controller, task })
        {
            previous.task.abort();
        }

        info!(cluster = %key, outcome = ?outcome, "Applied cluster spec");
        Ok(outcome)
    }

    /// Stop managing a cluster. Its workers are left running.
    pub async fn remove(&self, namespace: &str, name: &str) -> Result<(), OperatorError> {
        let key = qualified_name(namespace, name);
        let removed = {
            let _guard = self.apply_lock.lock().await;
            self.clusters.remove(&key)
        };

        let (_, managed) = removed.ok_or_else(|| OperatorError::NotFound(key.clone()))?;
        managed.controller.stop();
        if let Err(e) = managed.task.await {
            warn!(cluster = %key, error = %e, "Controller task did not finish cleanly");
        }
        info!(cluster = %key, "Removed cluster");
        Ok(())
    }

    pub fn controller(&self, namespace: &str, name: &str) -> Option<Arc<NatsClusterController>> {
        self.clusters
            .get(&qualified_name(namespace, name))
            .map(|m| m.controller.clone())
    }

    pub fn len(&self) -> usize {
        self.clusters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clusters.is_empty()
    }

    /// Status of one cluster
    pub async fn status(&self, namespace: &str, name: &str) -> Option<ClusterStatus> {
        let controller = self.controller(namespace, name)?;
        Some(controller.status().await)
    }

    /// Status of every cluster, ordered by qualified name
    pub async fn statuses(&self) -> Vec<ClusterStatus> {
        let controllers: Vec<_> = self
            .clusters
            .iter()
            .map(|entry| entry.controller.clone())
            .collect();

        let mut statuses = join_all(controllers.iter().map(|c| c.status())).await;
        statuses.sort_by(|a, b| {
            (a.namespace.as_str(), a.name.as_str()).cmp(&(b.namespace.as_str(), b.name.as_str()))
        });
        statuses
    }

    /// Cancel every controller and wait for all of them to stop
    pub async fn shutdown(&self) {
        self.shutdown.cancel();

        let keys: Vec<String> = self.clusters.iter().map(|e| e.key().clone()).collect();
        let tasks: Vec<_> = keys
            .iter()
            .filter_map(|key| self.clusters.remove(key))
            .map(|(_, managed)| managed.task)
            .collect();

        info!(clusters = tasks.len(), "Stopping controllers");
        for result in join_all(tasks).await {
            if let Err(e) = result {
                warn!(error = %e, "Controller task did not finish cleanly");
            }
        }
    }
}

fn spawn_controller(key: String, controller: Arc<NatsClusterController>) -> JoinHandle<()> {
    tokio::spawn(async move {
        match controller.run().await {
            Ok(reason) => info!(cluster = %key, reason = ?reason, "Controller stopped"),
            Err(e) => error!(cluster = %key, error = %e, "Controller exited"),
        }
    })
}
