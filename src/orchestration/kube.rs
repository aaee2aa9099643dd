//! Kubernetes REST backend
//!
//! Workers are pods and the shared configuration is a config map. The client
//! expects an endpoint that already handles authentication (for example
//! `kubectl proxy` on `http://127.0.0.1:8001`).

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::{ApiError, OrchestrationApi};
use crate::resources::LabelSelector;
use crate::topology::{
    ConfigVolume, Container, ContainerPort, RestartPolicy, SharedConfig, VolumeMount, Worker,
    WorkerPhase,
};

/// Default address of `kubectl proxy`
pub const DEFAULT_API_URL: &str = "http://127.0.0.1:8001";

// ============================================================================
// Wire types (the subset of the pod and config map schema the operator uses)
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    pub name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub creation_timestamp: Option<DateTime<Utc>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub deletion_timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pod {
    #[serde(default = "pod_api_version")]
    pub api_version: String,
    #[serde(default = "pod_kind")]
    pub kind: String,
    pub metadata: ObjectMeta,
    pub spec: PodSpec,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<PodStatus>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodSpec {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subdomain: Option<String>,
    #[serde(default)]
    pub containers: Vec<PodContainer>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub restart_policy: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<PodVolume>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodContainer {
    pub name: String,
    #[serde(default)]
    pub image: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<PodContainerPort>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volume_mounts: Vec<PodVolumeMount>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodContainerPort {
    #[serde(default)]
    pub name: String,
    pub container_port: u16,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodVolumeMount {
    pub name: String,
    pub mount_path: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodVolume {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config_map: Option<LocalObjectReference>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LocalObjectReference {
    pub name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PodStatus {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ObjectList<T> {
    #[serde(default = "Vec::new")]
    pub items: Vec<T>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigMap {
    #[serde(default = "pod_api_version")]
    pub api_version: String,
    #[serde(default = "config_map_kind")]
    pub kind: String,
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub data: BTreeMap<String, String>,
}

fn pod_api_version() -> String {
    "v1".to_string()
}

fn pod_kind() -> String {
    "Pod".to_string()
}

fn config_map_kind() -> String {
    "ConfigMap".to_string()
}

// ============================================================================
// Conversions
// ============================================================================

impl From<&Worker> for Pod {
    fn from(worker: &Worker) -> Self {
        Pod {
            api_version: pod_api_version(),
            kind: pod_kind(),
            metadata: ObjectMeta {
                name: worker.name.clone(),
                namespace: Some(worker.namespace.clone()),
                labels: worker.labels.clone(),
                ..Default::default()
            },
            spec: PodSpec {
                hostname: Some(worker.hostname.clone()),
                subdomain: Some(worker.subdomain.clone()),
                containers: worker
                    .containers
                    .iter()
                    .map(|c| PodContainer {
                        name: c.name.clone(),
                        image: c.image.clone(),
                        command: c.command.clone(),
                        ports: c
                            .ports
                            .iter()
                            .map(|p| PodContainerPort {
                                name: p.name.clone(),
                                container_port: p.container_port,
                            })
                            .collect(),
                        volume_mounts: c
                            .volume_mounts
                            .iter()
                            .map(|m| PodVolumeMount {
                                name: m.name.clone(),
                                mount_path: m.mount_path.clone(),
                            })
                            .collect(),
                    })
                    .collect(),
                restart_policy: Some(worker.restart_policy.as_str().to_string()),
                volumes: worker
                    .volumes
                    .iter()
                    .map(|v| PodVolume {
                        name: v.name.clone(),
                        config_map: Some(LocalObjectReference {
                            name: v.config_name.clone(),
                        }),
                    })
                    .collect(),
            },
            status: None,
        }
    }
}

impl Pod {
    /// Convert a pod read from the API back into a worker
    pub fn into_worker(self, default_namespace: &str) -> Worker {
        let phase = if self.metadata.deletion_timestamp.is_some() {
            WorkerPhase::Terminating
        } else {
            WorkerPhase::from_pod_phase(self.status.as_ref().and_then(|s| s.phase.as_deref()))
        };

        let name = self.metadata.name;
        Worker {
            hostname: self.spec.hostname.unwrap_or_else(|| name.clone()),
            subdomain: self.spec.subdomain.unwrap_or_default(),
            namespace: self
                .metadata
                .namespace
                .unwrap_or_else(|| default_namespace.to_string()),
            labels: self.metadata.labels,
            containers: self
                .spec
                .containers
                .into_iter()
                .map(|c| Container {
                    name: c.name,
                    image: c.image,
                    command: c.command,
                    ports: c
                        .ports
                        .into_iter()
                        .map(|p| ContainerPort {
                            name: p.name,
                            container_port: p.container_port,
                        })
                        .collect(),
                    volume_mounts: c
                        .volume_mounts
                        .into_iter()
                        .map(|m| VolumeMount {
                            name: m.name,
                            mount_path: m.mount_path,
                        })
                        .collect(),
                })
                .collect(),
            restart_policy: self
                .spec
                .restart_policy
                .as_deref()
                .map(RestartPolicy::parse)
                .unwrap_or_default(),
            volumes: self
                .spec
                .volumes
                .into_iter()
                .filter_map(|v| {
                    v.config_map.map(|cm| ConfigVolume {
                        name: v.name,
                        config_name: cm.name,
                    })
                })
                .collect(),
            created_at: self.metadata.creation_timestamp,
            phase,
            name,
        }
    }
}

impl From<&SharedConfig> for ConfigMap {
    fn from(config: &SharedConfig) -> Self {
        ConfigMap {
            api_version: pod_api_version(),
            kind: config_map_kind(),
            metadata: ObjectMeta {
                name: config.name.clone(),
                namespace: Some(config.namespace.clone()),
                ..Default::default()
            },
            data: config.data.clone(),
        }
    }
}

impl ConfigMap {
    pub fn into_shared_config(self, default_namespace: &str) -> SharedConfig {
        SharedConfig {
            name: self.metadata.name,
            namespace: self
                .metadata
                .namespace
                .unwrap_or_else(|| default_namespace.to_string()),
            data: self.data,
        }
    }
}

// ============================================================================
// Client
// ============================================================================

/// Orchestration backend talking to the Kubernetes API server
#[derive(Debug, Clone)]
pub struct KubeApi {
    base_url: String,
    client: Client,
}

impl KubeApi {
    /// Create a client for `base_url` with a per-request timeout
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, ApiError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ApiError::Transport(e.to_string()))?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn pods_url(&self, namespace: &str) -> String {
        format!("{}/api/v1/namespaces/{}/pods", self.base_url, namespace)
    }

    fn config_maps_url(&self, namespace: &str) -> String {
        format!("{}/api/v1/namespaces/{}/configmaps", self.base_url, namespace)
    }

    /// Send a request and decode a JSON body, mapping API status codes
    async fn send<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
        resource: &str,
    ) -> Result<T, ApiError> {
        let response = request.send().await.map_err(map_transport)?;
        let status = response.status();

        if status.is_success() {
            return response
                .json::<T>()
                .await
                .map_err(|e| ApiError::Decode(e.to_string()));
        }

        let body = response.text().await.unwrap_or_default();
        Err(map_status(status, resource, body))
    }
}

fn map_transport(e: reqwest::Error) -> ApiError {
    if e.is_timeout() {
        ApiError::Timeout("request".to_string(), Duration::default())
    } else {
        ApiError::Transport(e.to_string())
    }
}

fn map_status(status: StatusCode, resource: &str, body: String) -> ApiError {
    match status {
        StatusCode::CONFLICT => ApiError::AlreadyExists(resource.to_string()),
        StatusCode::NOT_FOUND => ApiError::NotFound(resource.to_string()),
        _ => ApiError::Rejected {
            status: status.as_u16(),
            message: body,
        },
    }
}

#[async_trait]
impl OrchestrationApi for KubeApi {
    async fn create_worker(&self, worker: &Worker) -> Result<Worker, ApiError> {
        let pod = Pod::from(worker);
        let request = self.client.post(self.pods_url(&worker.namespace)).json(&pod);
        let created: Pod = self.send(request, &worker.name).await?;
        Ok(created.into_worker(&worker.namespace))
    }

    async fn list_workers(
        &self,
        namespace: &str,
        selector: &LabelSelector,
    ) -> Result<Vec<Worker>, ApiError> {
        let request = self
            .client
            .get(self.pods_url(namespace))
            .query(&[("labelSelector", selector.to_query())]);
        let list: ObjectList<Pod> = self.send(request, "pods").await?;
        Ok(list
            .items
            .into_iter()
            .map(|pod| pod.into_worker(namespace))
            .collect())
    }

    async fn delete_worker(&self, namespace: &str, name: &str) -> Result<(), ApiError> {
        let request = self
            .client
            .delete(format!("{}/{}", self.pods_url(namespace), name));
        let _: serde_json::Value = self.send(request, name).await?;
        Ok(())
    }

    async fn get_shared_config(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<SharedConfig>, ApiError> {
        let request = self
            .client
            .get(format!("{}/{}", self.config_maps_url(namespace), name));
        match self.send::<ConfigMap>(request, name).await {
            Ok(config_map) => Ok(Some(config_map.into_shared_config(namespace))),
            Err(ApiError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn create_shared_config(&self, config: &SharedConfig) -> Result<SharedConfig, ApiError> {
        let body = ConfigMap::from(config);
        let request = self
            .client
            .post(self.config_maps_url(&config.namespace))
            .json(&body);
        let created: ConfigMap = self.send(request, &config.name).await?;
        Ok(created.into_shared_config(&config.namespace))
    }

    async fn update_shared_config(&self, config: &SharedConfig) -> Result<SharedConfig, ApiError> {
        let body = ConfigMap::from(config);
        let request = self
            .client
            .put(format!(
                "{}/{}",
                self.config_maps_url(&config.namespace),
                config.name
            ))
            .json(&body);
        let updated: ConfigMap = self.send(request, &config.name).await?;
        Ok(updated.into_shared_config(&config.namespace))
    }
}
