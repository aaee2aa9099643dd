//! Topology materializer
//!
//! Turns a cluster spec into worker descriptors plus the shared configuration
//! and submits them to the orchestration API. All calls are best-effort: one
//! failing worker is logged and skipped, and the next reconciliation pass
//! retries whatever is still missing.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::config::{config_digest, render_shared_config, SharedConfig};
use super::worker::{build_worker, Worker};
use crate::controller::registry::WorkerRegistry;
use crate::logging::ControllerLog;
use crate::naming::generate_worker_name;
use crate::orchestration::{bounded, ApiError, SharedApi};
use crate::spec::NatsCluster;

/// What to do when the shared configuration cannot be created during bootstrap
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConfigFailurePolicy {
    /// Log, create the workers anyway, and retry the config on the next pass
    #[default]
    Degrade,
    /// Abort bootstrap
    FailFast,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MaterializeError {
    #[error("Shared configuration could not be applied: {0}")]
    SharedConfig(ApiError),

    #[error("None of the {attempted} workers could be created, last error: {last}")]
    NothingCreated { attempted: usize, last: ApiError },
}

/// Outcome of a batch of worker creations
#[derive(Debug, Clone, Default)]
pub struct CreateReport {
    pub created: Vec<Worker>,
    pub failures: Vec<(String, ApiError)>,
}

impl CreateReport {
    pub fn attempted(&self) -> usize {
        self.created.len() + self.failures.len()
    }

    /// Every attempt failed because the name was already taken
    pub fn all_collisions(&self) -> bool {
        self.created.is_empty()
            && !self.failures.is_empty()
            && self.failures.iter().all(|(_, e)| e.is_conflict())
    }
}

/// Outcome of a batch of worker deletions
#[derive(Debug, Clone, Default)]
pub struct DeleteReport {
    pub deleted: Vec<String>,
    pub failures: Vec<(String, ApiError)>,
}

/// Builds and submits a cluster's topology
#[derive(Clone)]
pub struct Materializer {
    api: SharedApi,
    registry: Arc<WorkerRegistry>,
    log: ControllerLog,
    api_timeout: Duration,
    config_policy: ConfigFailurePolicy,
}

impl Materializer {
    pub fn new(
        api: SharedApi,
        registry: Arc<WorkerRegistry>,
        log: ControllerLog,
        api_timeout: Duration,
        config_policy: ConfigFailurePolicy,
    ) -> Self {
        Self {
            api,
            registry,
            log,
            api_timeout,
            config_policy,
        }
    }

    /// Descriptors for `count` new workers with freshly generated names
    pub fn plan_workers(&self, cluster: &NatsCluster, count: usize) -> Vec<Worker> {
        (0..count)
            .map(|_| build_worker(cluster, &generate_worker_name(cluster.name())))
            .collect()
    }

    /// Bring up a cluster from nothing
    ///
    /// Renders the shared configuration for the planned member set, then
    /// creates every worker in turn. Returns the workers that were created;
    /// fails only if none could be.
    pub async fn create_initial(
        &self,
        cluster: &NatsCluster,
    ) -> Result<Vec<Worker>, MaterializeError> {
        self.log.debug("Creating workers for NATS cluster");

        let mut planned = self.plan_workers(cluster, cluster.spec.size as usize);
        planned.sort_by(|a, b| a.name.cmp(&b.name));

        if let Err(e) = self.ensure_shared_config(cluster, &planned).await {
            self.log
                .error(format!("Could not create shared config: {}", e));
            if self.config_policy == ConfigFailurePolicy::FailFast {
                return Err(MaterializeError::SharedConfig(e));
            }
        }

        let report = self.create_workers(planned).await;
        if report.created.is_empty() {
            if let Some((_, last)) = report.failures.last() {
                return Err(MaterializeError::NothingCreated {
                    attempted: report.attempted(),
                    last: last.clone(),
                });
            }
        }

        Ok(report.created)
    }

    /// Create workers one after another, registering each success
    pub async fn create_workers(&self, workers: Vec<Worker>) -> CreateReport {
        let mut report = CreateReport::default();

        for worker in workers {
            self.log.trace(format!("POST worker {}", worker.name));
            let result = bounded(
                self.api_timeout,
                "create worker",
                self.api.create_worker(&worker),
            )
            .await;

            match result {
                Ok(created) => {
                    self.registry
                        .mutate(|s| s.insert_worker(created.clone()))
                        .await;
                    self.log.notice(format!("Created worker {}", created.name));
                    report.created.push(created);
                }
                Err(e) => {
                    self.log
                        .error(format!("Could not create worker {}: {}", worker.name, e));
                    report.failures.push((worker.name, e));
                }
            }
        }

        report
    }

    /// Delete workers one after another
    ///
    /// A worker leaves the registry only once the API acknowledged the
    /// deletion (a worker that is already gone counts as acknowledged).
    pub async fn delete_workers(&self, workers: &[Worker]) -> DeleteReport {
        let mut report = DeleteReport::default();

        for worker in workers {
            self.log.trace(format!("DELETE worker {}", worker.name));
            let result = bounded(
                self.api_timeout,
                "delete worker",
                self.api.delete_worker(&worker.namespace, &worker.name),
            )
            .await;

            match result {
                Ok(()) | Err(ApiError::NotFound(_)) => {
                    self.registry
                        .mutate(|s| s.remove_deleted(&worker.name))
                        .await;
                    self.log.notice(format!("Deleted worker {}", worker.name));
                    report.deleted.push(worker.name.clone());
                }
                Err(e) => {
                    self.log
                        .error(format!("Could not delete worker {}: {}", worker.name, e));
                    report.failures.push((worker.name.clone(), e));
                }
            }
        }

        report
    }

    /// Make the shared configuration reflect `members`
    ///
    /// Returns `true` when an API call changed the stored configuration and
    /// `false` when the stored object already matches the render.
    ///
    /// A render identical to the last applied one is still checked against
    /// the stored object, so a config map deleted or edited out of band is
    /// put back.
    pub async fn ensure_shared_config(
        &self,
        cluster: &NatsCluster,
        members: &[Worker],
    ) -> Result<bool, ApiError> {
        let rendered = render_shared_config(members, &cluster.spec.server_config);
        let digest = config_digest(&rendered);

        let snapshot = self.registry.snapshot().await;
        let mut exists = snapshot.shared_config().is_some();
        if snapshot.config_digest().as_deref() == Some(digest.as_str()) {
            self.log.trace(format!("GET shared config {}", cluster.name()));
            let stored = bounded(
                self.api_timeout,
                "get shared config",
                self.api.get_shared_config(cluster.namespace(), cluster.name()),
            )
            .await?;

            match stored {
                Some(stored) if stored.digest() == digest => return Ok(false),
                Some(_) => self.log.notice(format!(
                    "Shared config {} was changed externally, restoring it",
                    cluster.name()
                )),
                None => {
                    self.log.notice(format!(
                        "Shared config {} is missing, recreating it",
                        cluster.name()
                    ));
                    self.registry.mutate(|s| s.clear_shared_config()).await;
                    exists = false;
                }
            }
        }

        let desired = SharedConfig::new(cluster.name(), cluster.namespace(), rendered);
        let applied = if exists {
            self.log.trace(format!("PUT shared config {}", desired.name));
            match bounded(
                self.api_timeout,
                "update shared config",
                self.api.update_shared_config(&desired),
            )
            .await
            {
                Err(ApiError::NotFound(_)) => self.create_config(&desired).await?,
                other => other?,
            }
        } else {
            match self.create_config(&desired).await {
                Err(ApiError::AlreadyExists(_)) => {
                    bounded(
                        self.api_timeout,
                        "update shared config",
                        self.api.update_shared_config(&desired),
                    )
                    .await?
                }
                other => other?,
            }
        };

        self.log.debug(format!(
            "Applied shared config {} with {} routes",
            applied.name,
            applied.routes().len()
        ));
        self.registry.mutate(|s| s.set_shared_config(applied)).await;
        Ok(true)
    }

    async fn create_config(&self, config: &SharedConfig) -> Result<SharedConfig, ApiError> {
        self.log.trace(format!("POST shared config {}", config.name));
        bounded(
            self.api_timeout,
            "create shared config",
            self.api.create_shared_config(config),
        )
        .await
    }
}
