//! Display formatting for CLI output
//!
//! Pure functions: they build strings and never perform I/O.

use crate::controller::ClusterStatus;
use crate::naming::generate_worker_name;
use crate::orchestration::kube::{ConfigMap, Pod};
use crate::spec::NatsCluster;
use crate::topology::{build_worker, render_shared_config, SharedConfig, Worker};

/// Format a simple table with headers and rows
pub fn format_table(headers: &[&str], rows: Vec<Vec<String>>) -> String {
    if rows.is_empty() {
        return "No clusters found.\n".to_string();
    }

    let mut widths: Vec<usize> = headers.iter().map(|h| h.len()).collect();
    for row in &rows {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(cell.len());
        }
    }

    let mut output = String::new();
    let header_cells: Vec<String> = headers.iter().map(|h| h.to_uppercase()).collect();
    for row in std::iter::once(header_cells).chain(rows) {
        let line: Vec<String> = row
            .iter()
            .zip(&widths)
            .map(|(cell, width)| format!("{:width$}", cell, width = width))
            .collect();
        output.push_str(line.join("   ").trim_end());
        output.push('\n');
    }

    output
}

/// Table of cluster statuses as served by the status API
pub fn format_cluster_table(statuses: &[ClusterStatus]) -> String {
    let headers = &["namespace", "name", "version", "ready", "phase", "passes"];
    let rows = statuses
        .iter()
        .map(|s| {
            vec![
                s.namespace.clone(),
                s.name.clone(),
                s.version.clone(),
                format!("{}/{}", s.current_size, s.desired_size),
                format!("{:?}", s.phase),
                s.passes.to_string(),
            ]
        })
        .collect();

    format_table(headers, rows)
}

/// Worker descriptors a fresh bootstrap of `cluster` would submit, ordered by name
pub fn plan_topology(cluster: &NatsCluster) -> (Vec<Worker>, SharedConfig) {
    let mut workers: Vec<Worker> = (0..cluster.spec.size)
        .map(|_| build_worker(cluster, &generate_worker_name(cluster.name())))
        .collect();
    workers.sort_by(|a, b| a.name.cmp(&b.name));

    let rendered = render_shared_config(&workers, &cluster.spec.server_config);
    let config = SharedConfig::new(cluster.name(), cluster.namespace(), rendered);
    (workers, config)
}

/// Multi-document YAML with one pod per worker followed by the config map
pub fn format_render(cluster: &NatsCluster) -> Result<String, serde_yaml::Error> {
    let (workers, config) = plan_topology(cluster);

    let mut output = format!(
        "# {} ({} workers, NATS {})\n",
        cluster.qualified_name(),
        workers.len(),
        cluster.spec.version
    );
    for worker in &workers {
        output.push_str("---\n");
        output.push_str(&serde_yaml::to_string(&Pod::from(worker))?);
    }
    output.push_str("---\n");
    output.push_str(&serde_yaml::to_string(&ConfigMap::from(&config))?);

    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::ControllerPhase;

    fn status(namespace: &str, name: &str, current: usize) -> ClusterStatus {
        ClusterStatus {
            name: name.to_string(),
            namespace: namespace.to_string(),
            version: "2.10.4".to_string(),
            phase: ControllerPhase::Reconciling,
            desired_size: 3,
            current_size: current,
            workers: Vec::new(),
            config_digest: None,
            routes: Vec::new(),
            passes: 7,
            last_reconcile: None,
            last_error: None,
        }
    }

    #[test]
    fn test_format_table() {
        let output = format_table(
            &["name", "ready"],
            vec![
                vec!["demo".to_string(), "3/3".to_string()],
                vec!["long-name".to_string(), "1/3".to_string()],
            ],
        );

        let lines: Vec<_> = output.lines().collect();
        assert_eq!(lines[0], "NAME        READY");
        assert_eq!(lines[1], "demo        3/3");
        assert_eq!(lines[2], "long-name   1/3");
    }

    #[test]
    fn test_format_table_empty() {
        assert_eq!(format_table(&["name"], Vec::new()), "No clusters found.\n");
    }

    #[test]
    fn test_format_cluster_table() {
        let output = format_cluster_table(&[status("default", "demo", 2)]);
        assert!(output.contains("NAMESPACE"));
        assert!(output.contains("2/3"));
        assert!(output.contains("Reconciling"));
    }

    #[test]
    fn test_plan_topology_routes_every_worker() {
        let cluster = NatsCluster::new("demo", 3, "2.10.4");
        let (workers, config) = plan_topology(&cluster);

        assert_eq!(workers.len(), 3);
        let expected: Vec<_> = workers.iter().map(Worker::route_url).collect();
        assert_eq!(config.routes(), expected);
    }

    #[test]
    fn test_format_render() {
        let cluster = NatsCluster::new("demo", 2, "2.10.4");
        let output = format_render(&cluster).unwrap();

        assert!(output.starts_with("# default/demo (2 workers, NATS 2.10.4)"));
        assert_eq!(output.matches("kind: Pod").count(), 2);
        assert_eq!(output.matches("kind: ConfigMap").count(), 1);
        assert!(output.contains("nats:2.10.4"));
    }
}
