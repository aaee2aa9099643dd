//! NatsCluster resource - the desired state of one managed cluster
//!
//! A NatsCluster declares how many NATS servers should run, which server
//! version they run, and a few server options rendered into the shared
//! configuration. Manifests are accepted as YAML or JSON.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::naming::{is_dns_label, is_label_value, validate_cluster_name, NameError};

pub const API_VERSION: &str = "nats.io/v1alpha2";
pub const KIND: &str = "NatsCluster";

/// Default NATS monitoring port
pub const DEFAULT_HTTP_PORT: u16 = 8222;

#[derive(Error, Debug)]
pub enum SpecError {
    #[error("Failed to read file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse manifest: {0}")]
    ParseError(String),

    #[error("Unsupported kind '{0}', expected '{KIND}'")]
    WrongKind(String),

    #[error("Invalid cluster name: {0}")]
    InvalidName(#[from] NameError),

    #[error("Cluster size must be at least 1")]
    ZeroSize,

    #[error("Cluster version must not be empty")]
    MissingVersion,

    #[error("Cluster version '{0}' is not a valid label value")]
    InvalidVersion(String),

    #[error("Namespace '{0}' is not a valid DNS-1123 label")]
    InvalidNamespace(String),

    #[error("Spec targets {0}/{1} but the controller manages {2}/{3}")]
    IdentityMismatch(String, String, String, String),
}

/// Declarative description of a NATS cluster
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NatsCluster {
    /// API version (e.g., "nats.io/v1alpha2")
    #[serde(rename = "apiVersion")]
    #[serde(default = "default_api_version")]
    pub api_version: String,

    /// Kind is always "NatsCluster"
    #[serde(default = "default_kind")]
    pub kind: String,

    pub metadata: ClusterMetadata,

    pub spec: ClusterSpec,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterMetadata {
    /// Cluster name, also the DNS subdomain of its workers
    pub name: String,

    /// Namespace (defaults to "default")
    #[serde(default = "default_namespace")]
    pub namespace: String,
}

/// Specification of desired cluster state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterSpec {
    /// Number of desired servers (default: 1)
    #[serde(default = "default_size")]
    pub size: u32,

    /// NATS server version, used as the container image tag
    pub version: String,

    /// Options rendered into the shared configuration
    #[serde(rename = "serverConfig")]
    #[serde(default)]
    pub server_config: ServerConfig,
}

/// Server options carried into the shared configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub debug: bool,

    #[serde(default)]
    pub trace: bool,

    /// Monitoring port
    #[serde(rename = "httpPort")]
    #[serde(default = "default_http_port")]
    pub http_port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            debug: false,
            trace: false,
            http_port: DEFAULT_HTTP_PORT,
        }
    }
}

fn default_api_version() -> String {
    API_VERSION.to_string()
}

fn default_kind() -> String {
    KIND.to_string()
}

fn default_namespace() -> String {
    "default".to_string()
}

fn default_size() -> u32 {
    1
}

fn default_http_port() -> u16 {
    DEFAULT_HTTP_PORT
}

impl NatsCluster {
    /// Create a cluster spec in the default namespace
    pub fn new(name: impl Into<String>, size: u32, version: impl Into<String>) -> Self {
        Self {
            api_version: default_api_version(),
            kind: default_kind(),
            metadata: ClusterMetadata {
                name: name.into(),
                namespace: default_namespace(),
            },
            spec: ClusterSpec {
                size,
                version: version.into(),
                server_config: ServerConfig::default(),
            },
        }
    }

    /// Set the namespace
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.metadata.namespace = namespace.into();
        self
    }

    /// Set the desired size
    pub fn with_size(mut self, size: u32) -> Self {
        self.spec.size = size;
        self
    }

    /// Set the server version
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.spec.version = version.into();
        self
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    pub fn namespace(&self) -> &str {
        &self.metadata.namespace
    }

    /// Qualified name (namespace/name)
    pub fn qualified_name(&self) -> String {
        qualified_name(&self.metadata.namespace, &self.metadata.name)
    }

    /// Check the invariants every controller relies on
    pub fn validate(&self) -> Result<(), SpecError> {
        if self.kind != KIND {
            return Err(SpecError::WrongKind(self.kind.clone()));
        }
        validate_cluster_name(&self.metadata.name)?;
        if !is_dns_label(&self.metadata.namespace) {
            return Err(SpecError::InvalidNamespace(self.metadata.namespace.clone()));
        }
        if self.spec.size == 0 {
            return Err(SpecError::ZeroSize);
        }
        if self.spec.version.trim().is_empty() {
            return Err(SpecError::MissingVersion);
        }
        if !is_label_value(&self.spec.version) {
            return Err(SpecError::InvalidVersion(self.spec.version.clone()));
        }
        Ok(())
    }

    /// Parse a manifest (YAML, which also accepts JSON) and validate it
    pub fn from_str(content: &str) -> Result<Self, SpecError> {
        let cluster: NatsCluster =
            serde_yaml::from_str(content).map_err(|e| SpecError::ParseError(e.to_string()))?;
        cluster.validate()?;
        Ok(cluster)
    }
}

/// Qualified name used to key clusters across namespaces
pub fn qualified_name(namespace: &str, name: &str) -> String {
    format!("{}/{}", namespace, name)
}

/// Load and validate a NatsCluster manifest from disk
pub fn load_cluster_file(path: &Path) -> Result<NatsCluster, SpecError> {
    let content = std::fs::read_to_string(path)?;
    NatsCluster::from_str(&content)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const YAML: &str = r#"
apiVersion: nats.io/v1alpha2
kind: NatsCluster
metadata:
  name: demo
  namespace: messaging
spec:
  size: 3
  version: "2.10.4"
  serverConfig:
    debug: true
"#;

    #[test]
    fn test_parse_yaml() {
        let cluster = NatsCluster::from_str(YAML).unwrap();
        assert_eq!(cluster.name(), "demo");
        assert_eq!(cluster.namespace(), "messaging");
        assert_eq!(cluster.spec.size, 3);
        assert!(cluster.spec.server_config.debug);
        assert_eq!(cluster.spec.server_config.http_port, DEFAULT_HTTP_PORT);
    }

    #[test]
    fn test_parse_json_with_defaults() {
        let json = r#"{"metadata": {"name": "demo"}, "spec": {"version": "2.10.4"}}"#;
        let cluster = NatsCluster::from_str(json).unwrap();
        assert_eq!(cluster.namespace(), "default");
        assert_eq!(cluster.spec.size, 1);
        assert_eq!(cluster.kind, KIND);
        assert_eq!(cluster.qualified_name(), "default/demo");
    }

    #[test]
    fn test_zero_size_rejected() {
        let cluster = NatsCluster::new("demo", 0, "2.10.4");
        assert!(matches!(cluster.validate(), Err(SpecError::ZeroSize)));
    }

    #[test]
    fn test_missing_version_rejected() {
        let cluster = NatsCluster::new("demo", 1, " ");
        assert!(matches!(cluster.validate(), Err(SpecError::MissingVersion)));
    }

    #[test]
    fn test_unusable_version_rejected() {
        for version in ["2.10 beta", "2.10/rc", "2.10,app=x"] {
            let cluster = NatsCluster::new("demo", 1, version);
            assert!(matches!(
                cluster.validate(),
                Err(SpecError::InvalidVersion(_))
            ));
        }
    }

    #[test]
    fn test_bad_namespace_rejected() {
        let cluster = NatsCluster::new("demo", 1, "2.10.4").with_namespace("team/a");
        assert!(matches!(
            cluster.validate(),
            Err(SpecError::InvalidNamespace(_))
        ));
    }

    #[test]
    fn test_bad_name_rejected() {
        let cluster = NatsCluster::new("Demo_Cluster", 1, "2.10.4");
        assert!(matches!(cluster.validate(), Err(SpecError::InvalidName(_))));
    }

    #[test]
    fn test_wrong_kind_rejected() {
        let mut cluster = NatsCluster::new("demo", 1, "2.10.4");
        cluster.kind = "Deployment".to_string();
        assert!(matches!(cluster.validate(), Err(SpecError::WrongKind(_))));
    }

    #[test]
    fn test_load_cluster_file() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(YAML.as_bytes()).unwrap();

        let cluster = load_cluster_file(file.path()).unwrap();
        assert_eq!(cluster.spec.version, "2.10.4");
    }

    #[test]
    fn test_load_nonexistent_file() {
        let result = load_cluster_file(Path::new("/nonexistent/cluster.yaml"));
        assert!(matches!(result, Err(SpecError::IoError(_))));
    }
}
