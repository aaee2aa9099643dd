//! Shared resource types for selecting and listing managed objects

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// API version stamped on list responses served by the operator
pub const API_VERSION: &str = "nats.io/v1alpha2";

/// Response for listing resources
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceList<T> {
    /// API version
    #[serde(rename = "apiVersion")]
    pub api_version: String,

    /// Kind (e.g., "NatsClusterStatusList")
    pub kind: String,

    /// List of items
    pub items: Vec<T>,
}

impl<T> ResourceList<T> {
    /// Create a new resource list
    pub fn new(kind: impl Into<String>, items: Vec<T>) -> Self {
        Self {
            api_version: API_VERSION.to_string(),
            kind: kind.into(),
            items,
        }
    }
}

/// Label selector for filtering resources
///
/// Labels are kept ordered so the rendered query string is stable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelSelector {
    /// Match exact labels
    #[serde(rename = "matchLabels")]
    #[serde(default)]
    pub match_labels: BTreeMap<String, String>,
}

impl LabelSelector {
    /// Create a selector that matches a specific label
    pub fn matching(key: impl Into<String>, value: impl Into<String>) -> Self {
        let mut labels = BTreeMap::new();
        labels.insert(key.into(), value.into());
        Self {
            match_labels: labels,
        }
    }

    /// Create a selector from a full label set
    pub fn from_labels(labels: &BTreeMap<String, String>) -> Self {
        Self {
            match_labels: labels.clone(),
        }
    }

    /// Add another required label
    pub fn and(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.match_labels.insert(key.into(), value.into());
        self
    }

    /// Check if labels match this selector
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.match_labels
            .iter()
            .all(|(k, v)| labels.get(k) == Some(v))
    }

    /// Render as a `labelSelector` query value (`k1=v1,k2=v2`)
    pub fn to_query(&self) -> String {
        self.match_labels
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(",")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_list() {
        let list: ResourceList<String> =
            ResourceList::new("StringList", vec!["a".into(), "b".into()]);
        assert_eq!(list.items.len(), 2);
        assert_eq!(list.kind, "StringList");
        assert_eq!(list.api_version, API_VERSION);
    }

    #[test]
    fn test_label_selector_matches() {
        let selector = LabelSelector::matching("app", "nats");

        let mut labels = BTreeMap::new();
        labels.insert("app".to_string(), "nats".to_string());
        labels.insert("nats_cluster".to_string(), "demo".to_string());

        assert!(selector.matches(&labels));
    }

    #[test]
    fn test_label_selector_no_match() {
        let selector = LabelSelector::matching("app", "nats").and("nats_cluster", "demo");

        let mut labels = BTreeMap::new();
        labels.insert("app".to_string(), "nats".to_string());
        labels.insert("nats_cluster".to_string(), "other".to_string());

        assert!(!selector.matches(&labels));
    }

    #[test]
    fn test_query_is_sorted() {
        let selector = LabelSelector::matching("nats_cluster", "demo").and("app", "nats");
        assert_eq!(selector.to_query(), "app=nats,nats_cluster=demo");
    }
}
