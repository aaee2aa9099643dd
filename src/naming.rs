//! Worker naming and labeling
//!
//! Pure functions: worker names derived from the cluster name, and the label
//! set that identifies "workers of cluster X at version V".

use std::collections::BTreeMap;

use regex::Regex;
use thiserror::Error;
use uuid::Uuid;

use crate::resources::LabelSelector;

pub const LABEL_APP_KEY: &str = "app";
pub const LABEL_APP_VALUE: &str = "nats";
pub const LABEL_CLUSTER_NAME_KEY: &str = "nats_cluster";
pub const LABEL_CLUSTER_VERSION_KEY: &str = "nats_version";

/// Length of the random suffix appended to worker names
pub const NAME_SUFFIX_LEN: usize = 10;

/// Longest DNS label or label value the API server accepts
pub const MAX_LABEL_LEN: usize = 63;

const DNS_LABEL_PATTERN: &str = r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?$";
const LABEL_VALUE_PATTERN: &str = r"^[A-Za-z0-9]([-A-Za-z0-9_.]*[A-Za-z0-9])?$";

/// Longest cluster name that still leaves room for `-<suffix>` in a
/// 63 character DNS label
pub const MAX_CLUSTER_NAME_LEN: usize = MAX_LABEL_LEN - 1 - NAME_SUFFIX_LEN;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NameError {
    #[error("Cluster name must not be empty")]
    Empty,

    #[error("Cluster name '{0}' is longer than {max} characters", max = MAX_CLUSTER_NAME_LEN)]
    TooLong(String),

    #[error("Cluster name '{0}' is not a valid DNS-1123 label")]
    Invalid(String),
}

/// Check that a cluster name can be used as a DNS subdomain and as a worker
/// name prefix
pub fn validate_cluster_name(name: &str) -> Result<(), NameError> {
    if name.is_empty() {
        return Err(NameError::Empty);
    }
    if name.len() > MAX_CLUSTER_NAME_LEN {
        return Err(NameError::TooLong(name.to_string()));
    }
    if !is_dns_label(name) {
        return Err(NameError::Invalid(name.to_string()));
    }
    Ok(())
}

/// Whether `value` is a DNS-1123 label (namespaces, worker names)
pub fn is_dns_label(value: &str) -> bool {
    value.len() <= MAX_LABEL_LEN && matches_pattern(DNS_LABEL_PATTERN, value)
}

/// Whether `value` is usable both as a label value and as an image tag
pub fn is_label_value(value: &str) -> bool {
    value.len() <= MAX_LABEL_LEN && matches_pattern(LABEL_VALUE_PATTERN, value)
}

fn matches_pattern(pattern: &str, value: &str) -> bool {
    Regex::new(pattern)
        .map(|re| re.is_match(value))
        .unwrap_or(false)
}

/// Generate a new worker name for a cluster
///
/// Only uniqueness per call is promised; names are not stable across
/// controller restarts.
pub fn generate_worker_name(cluster_name: &str) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{}-{}", cluster_name, &suffix[..NAME_SUFFIX_LEN])
}

/// Labels carried by every worker of `cluster_name` at `version`
pub fn build_label_set(cluster_name: &str, version: &str) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert(LABEL_APP_KEY.to_string(), LABEL_APP_VALUE.to_string());
    labels.insert(LABEL_CLUSTER_NAME_KEY.to_string(), cluster_name.to_string());
    labels.insert(LABEL_CLUSTER_VERSION_KEY.to_string(), version.to_string());
    labels
}

/// Selector matching every worker of a cluster, whatever its version
pub fn cluster_selector(cluster_name: &str) -> LabelSelector {
    LabelSelector::matching(LABEL_APP_KEY, LABEL_APP_VALUE)
        .and(LABEL_CLUSTER_NAME_KEY, cluster_name)
}

/// Selector matching the workers of a cluster at one version
pub fn version_selector(cluster_name: &str, version: &str) -> LabelSelector {
    LabelSelector::from_labels(&build_label_set(cluster_name, version))
}
