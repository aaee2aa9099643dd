//! NATS cluster controller
//!
//! One controller drives one NatsCluster. It owns:
//! - the current spec (replaceable between passes)
//! - the worker registry and the shared-config handle
//! - the stop/done tokens that frame its run loop
//!
//! Lifecycle: `Created → Bootstrapping → Reconciling ⟲ → Cancelling → Stopped`.
//! A failed bootstrap goes straight to `Stopped`.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{watch, RwLock};
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::logging::{ControllerLog, LogOptions, SharedLogger};
use crate::naming::cluster_selector;
use crate::orchestration::{bounded, ApiError, SharedApi};
use crate::spec::{NatsCluster, SpecError};
use crate::topology::{ConfigFailurePolicy, MaterializeError, Materializer, WorkerPhase};

pub mod reconcile;
pub mod registry;

pub use reconcile::{observe, Observation, ReconcileOutcome};
pub use registry::{RegistryState, WorkerRegistry};

/// Default interval between reconciliation passes
pub const DEFAULT_RECONCILE_INTERVAL: Duration = Duration::from_secs(5);

/// Default upper bound on a single orchestration API call
pub const DEFAULT_API_TIMEOUT: Duration = Duration::from_secs(30);

/// How long a freshly created worker may be missing from listings before it
/// is considered gone
pub const DEFAULT_VISIBILITY_GRACE: Duration = Duration::from_secs(30);

/// Errors that can occur in a cluster controller
#[derive(Error, Debug)]
pub enum ControllerError {
    #[error("Invalid cluster spec: {0}")]
    InvalidSpec(#[from] SpecError),

    #[error("Controller for '{0}' was already started")]
    AlreadyStarted(String),

    #[error("Bootstrap failed: {0}")]
    Bootstrap(#[from] MaterializeError),

    #[error("Could not list existing workers: {0}")]
    Observe(ApiError),

    #[error("Every worker name generated for cluster '{cluster}' collided ({attempts} attempts)")]
    NameCollision { cluster: String, attempts: usize },
}

/// Where a pass reads the actual worker set from
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ActualStateSource {
    /// List workers from the orchestration API by label selector
    #[default]
    Live,
    /// Trust the in-memory registry
    Registry,
}

/// Controller configuration
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Time between reconciliation passes
    pub reconcile_interval: Duration,

    /// Upper bound on each orchestration API call
    pub api_timeout: Duration,

    /// Window during which a created worker counts even if listings miss it
    pub visibility_grace: Duration,

    pub actual_state: ActualStateSource,

    pub config_failure_policy: ConfigFailurePolicy,

    pub log: LogOptions,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            reconcile_interval: DEFAULT_RECONCILE_INTERVAL,
            api_timeout: DEFAULT_API_TIMEOUT,
            visibility_grace: DEFAULT_VISIBILITY_GRACE,
            actual_state: ActualStateSource::Live,
            config_failure_policy: ConfigFailurePolicy::Degrade,
            log: LogOptions::default(),
        }
    }
}

impl ControllerConfig {
    pub fn with_reconcile_interval(mut self, interval: Duration) -> Self {
        self.reconcile_interval = interval;
        self
    }

    pub fn with_api_timeout(mut self, timeout: Duration) -> Self {
        self.api_timeout = timeout;
        self
    }

    pub fn with_visibility_grace(mut self, grace: Duration) -> Self {
        self.visibility_grace = grace;
        self
    }

    pub fn with_actual_state(mut self, source: ActualStateSource) -> Self {
        self.actual_state = source;
        self
    }

    pub fn with_config_failure_policy(mut self, policy: ConfigFailurePolicy) -> Self {
        self.config_failure_policy = policy;
        self
    }

    pub fn with_log_options(mut self, log: LogOptions) -> Self {
        self.log = log;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControllerPhase {
    Created,
    Bootstrapping,
    Reconciling,
    Cancelling,
    Stopped,
}

/// Why a run loop ended without error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShutdownReason {
    /// `stop()` was called on this controller
    Stopped,
    /// The hosting operator is shutting down
    OperatorShutdown,
}

#[derive(Debug, Clone, Default)]
struct Activity {
    passes: u64,
    last_reconcile: Option<DateTime<Utc>>,
    last_error: Option<String>,
}

/// Worker line in a status report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSummary {
    pub name: String,
    pub version: Option<String>,
    pub phase: WorkerPhase,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

/// Point-in-time view of a controller, for status reporting
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterStatus {
    pub name: String,
    pub namespace: String,
    pub version: String,
    pub phase: ControllerPhase,
    pub desired_size: u32,
    pub current_size: usize,
    pub workers: Vec<WorkerSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config_digest: Option<String>,
    pub routes: Vec<String>,
    pub passes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_reconcile: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Controller for one NATS cluster
pub struct NatsClusterController {
    name: String,
    namespace: String,
    spec: RwLock<NatsCluster>,
    api: SharedApi,
    registry: Arc<WorkerRegistry>,
    materializer: Materializer,
    config: ControllerConfig,
    log: ControllerLog,

    /// Cancelled by `stop()`
    stop: CancellationToken,
    /// Cancelled by the hosting operator
    shutdown: CancellationToken,
    /// Cancelled exactly once when the run loop has ended
    done: CancellationToken,

    phase: watch::Sender<ControllerPhase>,
    activity: RwLock<Activity>,
}

impl NatsClusterController {
    /// Create a controller for a validated spec
    pub fn new(
        spec: NatsCluster,
        api: SharedApi,
        config: ControllerConfig,
        logger: SharedLogger,
    ) -> Result<Self, ControllerError> {
        spec.validate()?;

        let log = ControllerLog::new(logger, config.log, spec.namespace(), spec.name());
        let registry = Arc::new(WorkerRegistry::new());
        let materializer = Materializer::new(
            api.clone(),
            registry.clone(),
            log.clone(),
            config.api_timeout,
            config.config_failure_policy,
        );
        let (phase, _) = watch::channel(ControllerPhase::Created);

        Ok(Self {
            name: spec.name().to_string(),
            namespace: spec.namespace().to_string(),
            spec: RwLock::new(spec),
            api,
            registry,
            materializer,
            config,
            log,
            stop: CancellationToken::new(),
            shutdown: CancellationToken::new(),
            done: CancellationToken::new(),
            phase,
            activity: RwLock::new(Activity::default()),
        })
    }

    /// Also end the run loop when `token` is cancelled
    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn registry(&self) -> &Arc<WorkerRegistry> {
        &self.registry
    }

    pub fn phase(&self) -> ControllerPhase {
        *self.phase.borrow()
    }

    /// Watch phase transitions
    pub fn subscribe_phase(&self) -> watch::Receiver<ControllerPhase> {
        self.phase.subscribe()
    }

    /// Copy of the spec the next pass will use
    pub async fn spec(&self) -> NatsCluster {
        self.spec.read().await.clone()
    }

    /// Replace the desired state; picked up by the next pass
    pub async fn update_spec(&self, spec: NatsCluster) -> Result<(), ControllerError> {
        spec.validate()?;
        if spec.name() != self.name || spec.namespace() != self.namespace {
            return Err(SpecError::IdentityMismatch(
                spec.namespace().to_string(),
                spec.name().to_string(),
                self.namespace.clone(),
                self.name.clone(),
            )
            .into());
        }

        let mut current = self.spec.write().await;
        if *current != spec {
            self.log.notice(format!(
                "Spec updated: size {} -> {}, version {} -> {}",
                current.spec.size, spec.spec.size, current.spec.version, spec.spec.version
            ));
            *current = spec;
        }
        Ok(())
    }

    /// Run the controller until it is stopped
    ///
    /// Bootstraps the cluster, then reconciles on every tick. Returns the
    /// shutdown reason on cancellation, or the error that ended it early.
    pub async fn run(&self) -> Result<ShutdownReason, ControllerError> {
        let started = self.phase.send_if_modified(|phase| {
            if *phase == ControllerPhase::Created {
                *phase = ControllerPhase::Bootstrapping;
                true
            } else {
                false
            }
        });
        if !started {
            return Err(ControllerError::AlreadyStarted(self.name.clone()));
        }

        self.log.debug("Starting controller");

        if let Some(reason) = self.cancelled_reason() {
            self.finish();
            return Ok(reason);
        }

        if let Err(e) = self.bootstrap().await {
            self.log.error(format!("Bootstrap failed: {}", e));
            self.record_error(e.to_string()).await;
            self.finish();
            return Err(e);
        }

        self.phase.send_replace(ControllerPhase::Reconciling);

        let period = self.config.reconcile_interval.max(Duration::from_millis(1));
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let reason = loop {
            tokio::select! {
                biased;
                _ = self.stop.cancelled() => break ShutdownReason::Stopped,
                _ = self.shutdown.cancelled() => break ShutdownReason::OperatorShutdown,
                _ = ticker.tick() => {
                    match self.reconcile().await {
                        Ok(_) => {}
                        Err(e @ ControllerError::NameCollision { .. }) => {
                            self.log.fatal(format!("Stopping reconciliation: {}", e));
                            self.finish();
                            return Err(e);
                        }
                        Err(e) => self.log.error(format!("Reconciliation failed: {}", e)),
                    }
                }
            }
        };

        self.phase.send_replace(ControllerPhase::Cancelling);
        self.log.debug("Controller loop cancelled");
        self.finish();
        Ok(reason)
    }

    /// Detach the controller loop
    ///
    /// Workers already created keep running. Calling this more than once is
    /// a no-op.
    pub fn stop(&self) {
        if self.stop.is_cancelled() {
            return;
        }
        self.log.debug("Stopping controller");
        self.stop.cancel();
    }

    /// Whether the run loop has ended
    pub fn is_stopped(&self) -> bool {
        self.done.is_cancelled()
    }

    /// Wait until the run loop has ended
    pub async fn wait_stopped(&self) {
        self.done.cancelled().await;
    }

    fn cancelled_reason(&self) -> Option<ShutdownReason> {
        if self.stop.is_cancelled() {
            Some(ShutdownReason::Stopped)
        } else if self.shutdown.is_cancelled() {
            Some(ShutdownReason::OperatorShutdown)
        } else {
            None
        }
    }

    fn finish(&self) {
        self.phase.send_replace(ControllerPhase::Stopped);
        self.done.cancel();
    }

    /// Adopt the workers a previous controller left behind, or create the
    /// initial set when there are none
    async fn bootstrap(&self) -> Result<(), ControllerError> {
        let spec = self.spec().await;

        if self.config.actual_state == ActualStateSource::Live {
            let existing = bounded(
                self.config.api_timeout,
                "list workers",
                self.api
                    .list_workers(&self.namespace, &cluster_selector(&self.name)),
            )
            .await
            .map_err(ControllerError::Observe)?;

            let live: Vec<_> = existing
                .into_iter()
                .filter(|w| w.phase.is_live())
                .collect();
            if !live.is_empty() {
                self.log.notice(format!(
                    "Adopting {} existing workers",
                    live.len()
                ));
                self.registry
                    .mutate(|s| {
                        for worker in live {
                            s.insert_worker(worker);
                        }
                    })
                    .await;
                return Ok(());
            }
        }

        let created = self.materializer.create_initial(&spec).await?;
        self.log.notice(format!(
            "Bootstrapped {} of {} workers",
            created.len(),
            spec.spec.size
        ));
        Ok(())
    }

    async fn record_error(&self, error: String) {
        let mut activity = self.activity.write().await;
        activity.last_error = Some(error);
    }

    /// Status snapshot for reporting
    pub async fn status(&self) -> ClusterStatus {
        let spec = self.spec().await;
        let snapshot = self.registry.snapshot().await;
        let activity = self.activity.read().await.clone();

        let mut workers: Vec<_> = snapshot.workers().collect();
        workers.sort_by(|a, b| a.age_key().cmp(&b.age_key()));

        ClusterStatus {
            name: self.name.clone(),
            namespace: self.namespace.clone(),
            version: spec.spec.version.clone(),
            phase: self.phase(),
            desired_size: spec.spec.size,
            current_size: snapshot.len(),
            workers: workers
                .into_iter()
                .map(|w| WorkerSummary {
                    name: w.name.clone(),
                    version: w.version().map(str::to_string),
                    phase: w.phase,
                    created_at: w.created_at,
                })
                .collect(),
            config_digest: snapshot.config_digest(),
            routes: snapshot
                .shared_config()
                .map(|c| c.routes())
                .unwrap_or_default(),
            passes: activity.passes,
            last_reconcile: activity.last_reconcile,
            last_error: activity.last_error,
        }
    }
}

impl std::fmt::Debug for NatsClusterController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NatsClusterController")
            .field("name", &self.name)
            .field("namespace", &self.namespace)
            .field("phase", &self.phase())
            .finish()
    }
}
