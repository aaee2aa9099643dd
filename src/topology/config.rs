//! Shared configuration rendered for every worker of a cluster

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::worker::{Worker, CLUSTER_PORT, CONFIG_FILE_NAME};
use crate::spec::ServerConfig;

/// The configuration object mounted by every worker of a cluster
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharedConfig {
    /// Always the cluster name
    pub name: String,
    pub namespace: String,
    pub data: BTreeMap<String, String>,
}

impl SharedConfig {
    pub fn new(
        name: impl Into<String>,
        namespace: impl Into<String>,
        rendered: impl Into<String>,
    ) -> Self {
        let mut data = BTreeMap::new();
        data.insert(CONFIG_FILE_NAME.to_string(), rendered.into());
        Self {
            name: name.into(),
            namespace: namespace.into(),
            data,
        }
    }

    /// The rendered server configuration
    pub fn rendered(&self) -> &str {
        self.data
            .get(CONFIG_FILE_NAME)
            .map(String::as_str)
            .unwrap_or_default()
    }

    pub fn digest(&self) -> String {
        config_digest(self.rendered())
    }

    /// Route URIs listed in the rendered configuration
    pub fn routes(&self) -> Vec<String> {
        parse_routes(self.rendered())
    }
}

/// Render the server configuration for a member set
///
/// Routes appear in the order of `members`; callers sort the set first so
/// that unrelated passes produce byte-identical output.
pub fn render_shared_config(members: &[Worker], options: &ServerConfig) -> String {
    let routes: String = members
        .iter()
        .map(|member| format!("    {}\n", member.route_url()))
        .collect();

    format!(
        "http_port: {}\n\
         debug: {}\n\
         trace: {}\n\
         \n\
         cluster {{\n  \
         port: {}\n  \
         routes [\n{}  ]\n\
         }}\n",
        options.http_port, options.debug, options.trace, CLUSTER_PORT, routes
    )
}

/// Hex SHA-256 of a rendered configuration
pub fn config_digest(rendered: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(rendered.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Extract route URIs from a rendered configuration
pub fn parse_routes(rendered: &str) -> Vec<String> {
    rendered
        .lines()
        .map(str::trim)
        .filter(|line| line.starts_with("nats://"))
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::NatsCluster;
    use crate::topology::worker::build_worker;

    fn members(names: &[&str]) -> Vec<Worker> {
        let cluster = NatsCluster::new("demo", names.len() as u32, "2.10.4");
        names.iter().map(|n| build_worker(&cluster, n)).collect()
    }

    #[test]
    fn test_render_contains_options_and_routes() {
        let options = ServerConfig {
            debug: true,
            trace: false,
            http_port: 8223,
        };
        let rendered = render_shared_config(&members(&["demo-a", "demo-b"]), &options);

        assert!(rendered.contains("http_port: 8223"));
        assert!(rendered.contains("debug: true"));
        assert!(rendered.contains("cluster {"));
        assert_eq!(
            parse_routes(&rendered),
            vec![
                "nats://demo-a.demo.default.svc:6222".to_string(),
                "nats://demo-b.demo.default.svc:6222".to_string(),
            ]
        );
    }

    #[test]
    fn test_render_is_deterministic() {
        let set = members(&["demo-a", "demo-b", "demo-c"]);
        let options = ServerConfig::default();

        let first = render_shared_config(&set, &options);
        let second = render_shared_config(&set, &options);
        assert_eq!(first, second);
        assert_eq!(config_digest(&first), config_digest(&second));
    }

    #[test]
    fn test_render_never_uses_loopback() {
        let rendered = render_shared_config(&members(&["demo-a"]), &ServerConfig::default());
        assert!(!rendered.contains("127.0.0.1"));
    }

    #[test]
    fn test_digest_changes_with_membership() {
        let options = ServerConfig::default();
        let a = render_shared_config(&members(&["demo-a"]), &options);
        let b = render_shared_config(&members(&["demo-a", "demo-b"]), &options);
        assert_ne!(config_digest(&a), config_digest(&b));
    }

    #[test]
    fn test_shared_config_accessors() {
        let rendered = render_shared_config(&members(&["demo-a"]), &ServerConfig::default());
        let config = SharedConfig::new("demo", "default", rendered.clone());

        assert_eq!(config.rendered(), rendered);
        assert_eq!(config.routes().len(), 1);
        assert_eq!(config.digest(), config_digest(&rendered));
    }

    #[test]
    fn test_empty_member_set_renders_empty_routes() {
        let rendered = render_shared_config(&[], &ServerConfig::default());
        assert!(parse_routes(&rendered).is_empty());
        assert!(rendered.contains("routes ["));
    }
}
