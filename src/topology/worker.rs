//! Worker descriptors
//!
//! A Worker is one NATS server process managed by a controller. Its hostname
//! and subdomain give it a stable DNS name once a headless service with the
//! cluster's name exists, and its config volume points at the cluster's
//! shared configuration.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::naming::{build_label_set, LABEL_CLUSTER_VERSION_KEY};
use crate::spec::NatsCluster;

pub const CONTAINER_NAME: &str = "nats";
pub const IMAGE_REPOSITORY: &str = "nats";
pub const CLIENT_PORT: u16 = 4222;
pub const CLUSTER_PORT: u16 = 6222;
pub const CONFIG_VOLUME_NAME: &str = "config";
pub const CONFIG_MOUNT_PATH: &str = "/etc/nats-config";
pub const CONFIG_FILE_NAME: &str = "nats.conf";

/// Lifecycle phase reported by the orchestration system
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WorkerPhase {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
    /// Deletion requested, object still visible
    Terminating,
    Unknown,
}

impl WorkerPhase {
    /// The process exited and will not come back (restart policy is Never)
    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkerPhase::Succeeded | WorkerPhase::Failed)
    }

    /// Counts as a cluster member
    pub fn is_live(&self) -> bool {
        !self.is_terminal() && *self != WorkerPhase::Terminating
    }

    /// Parse a Kubernetes pod phase
    pub fn from_pod_phase(phase: Option<&str>) -> Self {
        match phase {
            Some("Pending") | None => WorkerPhase::Pending,
            Some("Running") => WorkerPhase::Running,
            Some("Succeeded") => WorkerPhase::Succeeded,
            Some("Failed") => WorkerPhase::Failed,
            Some(_) => WorkerPhase::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RestartPolicy {
    Always,
    OnFailure,
    /// Failed workers are replaced by reconciliation rather than restarted
    #[default]
    Never,
}

impl RestartPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            RestartPolicy::Always => "Always",
            RestartPolicy::OnFailure => "OnFailure",
            RestartPolicy::Never => "Never",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "Always" => RestartPolicy::Always,
            "OnFailure" => RestartPolicy::OnFailure,
            _ => RestartPolicy::Never,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerPort {
    pub name: String,
    pub container_port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeMount {
    pub name: String,
    pub mount_path: String,
}

/// A volume backed by a shared configuration object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigVolume {
    pub name: String,
    pub config_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Container {
    pub name: String,
    pub image: String,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub ports: Vec<ContainerPort>,
    #[serde(default)]
    pub volume_mounts: Vec<VolumeMount>,
}

/// One managed NATS server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Worker {
    pub name: String,
    pub namespace: String,
    pub labels: BTreeMap<String, String>,
    pub hostname: String,
    pub subdomain: String,
    pub containers: Vec<Container>,
    pub restart_policy: RestartPolicy,
    pub volumes: Vec<ConfigVolume>,

    /// Set by the orchestration system on creation
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub phase: WorkerPhase,
}

impl Worker {
    /// Version label carried by the worker
    pub fn version(&self) -> Option<&str> {
        self.labels
            .get(LABEL_CLUSTER_VERSION_KEY)
            .map(String::as_str)
    }

    /// DNS name peers use to reach this worker
    pub fn dns_name(&self) -> String {
        format!("{}.{}.{}.svc", self.hostname, self.subdomain, self.namespace)
    }

    /// Cluster route URI of this worker
    pub fn route_url(&self) -> String {
        format!("nats://{}:{}", self.dns_name(), CLUSTER_PORT)
    }

    /// Ordering key for oldest-first selection. Workers with an unknown
    /// creation time sort first.
    pub fn age_key(&self) -> (DateTime<Utc>, &str) {
        (
            self.created_at.unwrap_or(DateTime::<Utc>::MIN_UTC),
            self.name.as_str(),
        )
    }

    /// Image of the NATS container
    pub fn image(&self) -> Option<&str> {
        self.containers.first().map(|c| c.image.as_str())
    }
}

/// Container running a NATS server pinned to `version`, reading the shared
/// configuration from its mount
pub fn default_nats_container(version: &str) -> Container {
    Container {
        name: CONTAINER_NAME.to_string(),
        image: format!("{}:{}", IMAGE_REPOSITORY, version),
        command: vec![
            "nats-server".to_string(),
            "--config".to_string(),
            format!("{}/{}", CONFIG_MOUNT_PATH, CONFIG_FILE_NAME),
        ],
        ports: vec![
            ContainerPort {
                name: "client".to_string(),
                container_port: CLIENT_PORT,
            },
            ContainerPort {
                name: "cluster".to_string(),
                container_port: CLUSTER_PORT,
            },
        ],
        volume_mounts: vec![VolumeMount {
            name: CONFIG_VOLUME_NAME.to_string(),
            mount_path: CONFIG_MOUNT_PATH.to_string(),
        }],
    }
}

/// Build the descriptor of a worker called `name` for `cluster`
pub fn build_worker(cluster: &NatsCluster, name: &str) -> Worker {
    let mut container = default_nats_container(&cluster.spec.version);
    container.ports.push(ContainerPort {
        name: "monitor".to_string(),
        container_port: cluster.spec.server_config.http_port,
    });

    Worker {
        name: name.to_string(),
        namespace: cluster.namespace().to_string(),
        labels: build_label_set(cluster.name(), &cluster.spec.version),
        hostname: name.to_string(),
        subdomain: cluster.name().to_string(),
        containers: vec![container],
        restart_policy: RestartPolicy::Never,
        volumes: vec![ConfigVolume {
            name: CONFIG_VOLUME_NAME.to_string(),
            config_name: cluster.name().to_string(),
        }],
        created_at: None,
        phase: WorkerPhase::Pending,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn cluster() -> NatsCluster {
        NatsCluster::new("demo", 3, "2.10.4").with_namespace("messaging")
    }

    #[test]
    fn test_build_worker() {
        let worker = build_worker(&cluster(), "demo-abc");

        assert_eq!(worker.hostname, "demo-abc");
        assert_eq!(worker.subdomain, "demo");
        assert_eq!(worker.namespace, "messaging");
        assert_eq!(worker.image(), Some("nats:2.10.4"));
        assert_eq!(worker.version(), Some("2.10.4"));
        assert_eq!(worker.restart_policy, RestartPolicy::Never);
        assert_eq!(worker.volumes[0].config_name, "demo");
        assert_eq!(
            worker.containers[0].volume_mounts[0].mount_path,
            CONFIG_MOUNT_PATH
        );
    }

    #[test]
    fn test_route_url() {
        let worker = build_worker(&cluster(), "demo-abc");
        assert_eq!(
            worker.route_url(),
            "nats://demo-abc.demo.messaging.svc:6222"
        );
    }

    #[test]
    fn test_age_key_orders_unknown_first() {
        let mut old = build_worker(&cluster(), "demo-b");
        old.created_at = Some(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
        let unknown = build_worker(&cluster(), "demo-z");

        assert!(unknown.age_key() < old.age_key());
    }

    #[test]
    fn test_phase_classification() {
        assert!(WorkerPhase::Failed.is_terminal());
        assert!(!WorkerPhase::Failed.is_live());
        assert!(!WorkerPhase::Terminating.is_live());
        assert!(WorkerPhase::Pending.is_live());
        assert_eq!(
            WorkerPhase::from_pod_phase(Some("Running")),
            WorkerPhase::Running
        );
        assert_eq!(
            WorkerPhase::from_pod_phase(Some("Weird")),
            WorkerPhase::Unknown
        );
    }

    #[test]
    fn test_restart_policy_parse() {
        assert_eq!(RestartPolicy::parse("Always"), RestartPolicy::Always);
        assert_eq!(RestartPolicy::parse("bogus"), RestartPolicy::Never);
        assert_eq!(RestartPolicy::Never.as_str(), "Never");
    }
}
