//! Reconciliation pass
//!
//! A pass lists the cluster's workers, merges the listing with what the
//! registry knows, and then converges in a fixed order:
//!
//! 1. delete workers that exited
//! 2. create missing workers
//! 3. delete excess workers, oldest first
//! 4. retire workers of a previous version once the current set is healthy
//! 5. re-render the shared configuration when the member set changed

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::registry::RegistryState;
use super::{ActualStateSource, ControllerError, NatsClusterController};
use crate::naming::{cluster_selector, version_selector};
use crate::orchestration::bounded;
use crate::resources::LabelSelector;
use crate::topology::{DeleteReport, Worker, WorkerPhase};

/// Actual state of a cluster as seen by one pass
#[derive(Debug, Clone, Default)]
pub struct Observation {
    /// Live workers of the desired version, oldest first
    pub current: Vec<Worker>,
    /// Live workers of any other version, oldest first
    pub stale: Vec<Worker>,
    /// Workers that exited and must be replaced
    pub terminal: Vec<Worker>,
    /// Registered workers that disappeared without being deleted by us
    pub vanished: Vec<String>,
    /// Acknowledged deletions that are no longer listed
    pub deletions_settled: Vec<String>,
}

impl Observation {
    pub fn live(&self) -> usize {
        self.current.len() + self.stale.len()
    }
}

/// Merge a listing with the registry
///
/// Workers whose deletion we already requested, or that are terminating, never
/// count. A registered worker missing from the listing still counts while it
/// is younger than `grace`; after that it is reported as vanished. Workers
/// matching `desired` are current, the rest are stale.
pub fn observe(
    listed: Vec<Worker>,
    registry: &RegistryState,
    desired: &LabelSelector,
    now: DateTime<Utc>,
    grace: chrono::Duration,
) -> Observation {
    let listed_names: BTreeSet<String> = listed.iter().map(|w| w.name.clone()).collect();
    let mut observation = Observation::default();
    let mut live = Vec::new();

    for worker in listed {
        if registry.is_pending_deletion(&worker.name) || worker.phase == WorkerPhase::Terminating {
            continue;
        }
        if worker.phase.is_terminal() {
            observation.terminal.push(worker);
        } else {
            live.push(worker);
        }
    }

    for worker in registry.workers() {
        if listed_names.contains(&worker.name) {
            continue;
        }
        let recent = worker
            .created_at
            .map(|created| now.signed_duration_since(created) < grace)
            .unwrap_or(false);
        if recent {
            live.push(worker.clone());
        } else {
            observation.vanished.push(worker.name.clone());
        }
    }

    observation.deletions_settled = registry
        .pending_deletions()
        .filter(|name| !listed_names.contains(*name))
        .cloned()
        .collect();

    let (mut current, mut stale): (Vec<_>, Vec<_>) = live
        .into_iter()
        .partition(|w| desired.matches(&w.labels));
    current.sort_by(|a, b| a.age_key().cmp(&b.age_key()));
    stale.sort_by(|a, b| a.age_key().cmp(&b.age_key()));
    observation.current = current;
    observation.stale = stale;

    observation
}

/// What one pass changed
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconcileOutcome {
    pub created: Vec<String>,
    pub deleted: Vec<String>,
    pub config_updated: bool,
    pub failures: usize,
    /// Cluster members after the pass
    pub members: usize,
}

impl ReconcileOutcome {
    /// Nothing had to change
    pub fn is_steady(&self) -> bool {
        self.created.is_empty() && self.deleted.is_empty() && !self.config_updated
    }

    fn record_deletions(&mut self, report: &DeleteReport) {
        self.deleted.extend(report.deleted.iter().cloned());
        self.failures += report.failures.len();
    }
}

impl NatsClusterController {
    /// Run one reconciliation pass and record its result
    pub async fn reconcile(&self) -> Result<ReconcileOutcome, ControllerError> {
        let result = self.reconcile_pass().await;

        let mut activity = self.activity.write().await;
        activity.passes += 1;
        activity.last_reconcile = Some(Utc::now());
        match &result {
            Ok(outcome) if outcome.failures == 0 => activity.last_error = None,
            Ok(outcome) => {
                activity.last_error = Some(format!("{} operations failed", outcome.failures))
            }
            Err(e) => activity.last_error = Some(e.to_string()),
        }

        result
    }

    async fn reconcile_pass(&self) -> Result<ReconcileOutcome, ControllerError> {
        let spec = self.spec().await;
        let desired = spec.spec.size as usize;

        let listed = match self.config.actual_state {
            ActualStateSource::Live => bounded(
                self.config.api_timeout,
                "list workers",
                self.api
                    .list_workers(&self.namespace, &cluster_selector(&self.name)),
            )
            .await
            .map_err(ControllerError::Observe)?,
            ActualStateSource::Registry => {
                self.registry.snapshot().await.workers().cloned().collect()
            }
        };

        let snapshot = self.registry.snapshot().await;
        let grace = chrono::Duration::from_std(self.config.visibility_grace)
            .unwrap_or_else(|_| chrono::Duration::zero());
        let desired_version = version_selector(&self.name, &spec.spec.version);
        let observation = observe(listed, &snapshot, &desired_version, Utc::now(), grace);

        for name in &observation.vanished {
            self.log
                .notice(format!("Worker {} disappeared, replacing it", name));
        }
        self.registry
            .mutate(|s| {
                for name in &observation.vanished {
                    s.forget(name);
                }
                for name in &observation.deletions_settled {
                    s.clear_pending(name);
                }
                for worker in observation
                    .current
                    .iter()
                    .chain(&observation.stale)
                    .chain(&observation.terminal)
                {
                    s.insert_worker(worker.clone());
                }
            })
            .await;

        self.log.debug(format!(
            "Observed {} current, {} stale and {} exited workers (desired {})",
            observation.current.len(),
            observation.stale.len(),
            observation.terminal.len(),
            desired
        ));

        let mut outcome = ReconcileOutcome::default();
        let Observation {
            mut current,
            mut stale,
            terminal,
            ..
        } = observation;

        if !terminal.is_empty() {
            self.log
                .notice(format!("Removing {} exited workers", terminal.len()));
            let report = self.materializer.delete_workers(&terminal).await;
            outcome.record_deletions(&report);
        }

        let mut collided = None;
        let missing = desired.saturating_sub(current.len());
        if missing > 0 {
            self.log.notice(format!(
                "Cluster has {} of {} workers, creating {}",
                current.len(),
                desired,
                missing
            ));
            let planned = self.materializer.plan_workers(&spec, missing);
            let report = self.materializer.create_workers(planned).await;
            if report.all_collisions() {
                collided = Some(report.attempted());
            }
            outcome.failures += report.failures.len();
            outcome
                .created
                .extend(report.created.iter().map(|w| w.name.clone()));
            current.extend(report.created);
        }

        let excess = current.len().saturating_sub(desired);
        if excess > 0 {
            self.log.notice(format!(
                "Cluster has {} of {} workers, deleting {}",
                current.len(),
                desired,
                excess
            ));
            let victims: Vec<Worker> = current.iter().take(excess).cloned().collect();
            let report = self.materializer.delete_workers(&victims).await;
            current.retain(|w| !report.deleted.contains(&w.name));
            outcome.record_deletions(&report);
        }

        let healthy = current.len() >= desired
            && current.iter().all(|w| w.phase == WorkerPhase::Running);
        if !stale.is_empty() && healthy {
            self.log.notice(format!(
                "Retiring {} workers not running version {}",
                stale.len(),
                spec.spec.version
            ));
            let report = self.materializer.delete_workers(&stale).await;
            stale.retain(|w| !report.deleted.contains(&w.name));
            outcome.record_deletions(&report);
        }

        let mut members: Vec<Worker> = current.into_iter().chain(stale).collect();
        members.sort_by(|a, b| a.name.cmp(&b.name));
        outcome.members = members.len();

        match self.materializer.ensure_shared_config(&spec, &members).await {
            Ok(changed) => outcome.config_updated = changed,
            Err(e) => {
                self.log
                    .error(format!("Could not update shared config: {}", e));
                outcome.failures += 1;
            }
        }

        if let Some(attempts) = collided {
            return Err(ControllerError::NameCollision {
                cluster: self.name.clone(),
                attempts,
            });
        }

        if outcome.is_steady() {
            self.log.trace("Cluster is converged");
        }
        Ok(outcome)
    }
}
