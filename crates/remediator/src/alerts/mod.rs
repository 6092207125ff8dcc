//! Alertmanager webhook types, incident fingerprints and alert context.

mod classifier;

pub use classifier::{classify, RunbookId};

use chrono::{DateTime, Utc};
use remediator_config::ToolsConfig;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;

/// Label or annotation map. Ordered so ledger payloads serialize stably.
pub type Labels = BTreeMap<String, String>;

/// Grouping keys Alertmanager emits when no grouping labels are configured.
const EMPTY_GROUP_KEYS: &[&str] = &["", "{}", "{}/{}"];

/// Alertmanager webhook payload.
///
/// Reference: <https://prometheus.io/docs/alerting/latest/configuration/#webhook_config>
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertmanagerPayload {
    /// Version of the payload format
    #[serde(default)]
    pub version: String,
    /// Unique identifier for this group of alerts
    #[serde(default)]
    pub group_key: String,
    /// Number of truncated alerts (if any)
    #[serde(default)]
    pub truncated_alerts: u32,
    /// Status: "firing" or "resolved"
    pub status: String,
    /// Receiver that matched this alert
    #[serde(default)]
    pub receiver: String,
    /// Labels common to all alerts in this group
    #[serde(default)]
    pub group_labels: Labels,
    /// Labels common to all alerts (may include group labels)
    #[serde(default)]
    pub common_labels: Labels,
    /// Annotations common to all alerts
    #[serde(default)]
    pub common_annotations: Labels,
    /// External URL for Alertmanager
    #[serde(default, rename = "externalURL")]
    pub external_url: String,
    /// List of alerts in this notification
    #[serde(default)]
    pub alerts: Vec<AlertmanagerAlert>,
}

impl AlertmanagerPayload {
    /// Labels for one alert: the batch's common labels overlaid by the
    /// alert's own labels.
    #[must_use]
    pub fn effective_labels(&self, alert: &AlertmanagerAlert) -> Labels {
        let mut labels = self.common_labels.clone();
        labels.extend(alert.labels.iter().map(|(k, v)| (k.clone(), v.clone())));
        labels
    }

    /// Stable identity of the incident line an alert belongs to.
    ///
    /// Alert fingerprint first, then a meaningful grouping key, then a
    /// composite of the identifying labels.
    #[must_use]
    pub fn fingerprint_for(&self, alert: &AlertmanagerAlert, labels: &Labels) -> String {
        if !alert.fingerprint.is_empty() {
            return alert.fingerprint.clone();
        }
        if !EMPTY_GROUP_KEYS.contains(&self.group_key.as_str()) {
            return self.group_key.clone();
        }
        let get = |key: &str| labels.get(key).map_or("", String::as_str);
        format!(
            "{}:{}:{}:{}",
            labels.get("alertname").map_or("unknown", String::as_str),
            get("namespace"),
            get("pod"),
            get("container"),
        )
    }
}

/// Individual alert from Alertmanager.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertmanagerAlert {
    /// Status: "firing" or "resolved"
    pub status: String,
    /// Alert labels
    #[serde(default)]
    pub labels: Labels,
    /// Alert annotations
    #[serde(default)]
    pub annotations: Labels,
    /// When the alert started firing
    #[serde(default)]
    pub starts_at: Option<DateTime<Utc>>,
    /// When the alert was resolved (if resolved)
    #[serde(default)]
    pub ends_at: Option<DateTime<Utc>>,
    /// URL to the alert in the generating Prometheus
    #[serde(default, rename = "generatorURL")]
    pub generator_url: String,
    /// Unique fingerprint for this alert
    #[serde(default)]
    pub fingerprint: String,
}

impl AlertmanagerAlert {
    /// Get the alert name.
    #[must_use]
    pub fn name(&self) -> &str {
        self.labels.get("alertname").map_or("unknown", String::as_str)
    }

    /// Get the summary annotation.
    #[must_use]
    pub fn summary(&self) -> Option<&str> {
        self.annotations.get("summary").map(String::as_str)
    }
}

/// Targets and labels a workflow run operates on.
///
/// Built once per alert; tools receive these values as their default
/// arguments and the decision oracle may not redirect the pinned ones.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlertContext {
    pub labels: Labels,
    pub namespace: String,
    pub pod: String,
    pub container: String,
    pub node: String,
}

impl AlertContext {
    /// Derive the context from effective alert labels, filling gaps with the
    /// configured defaults.
    #[must_use]
    pub fn from_labels(labels: Labels, tools: &ToolsConfig) -> Self {
        let label = |key: &str| {
            labels
                .get(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        Self {
            namespace: label("namespace").unwrap_or_else(|| tools.default_namespace.clone()),
            pod: label("pod").unwrap_or_default(),
            container: label("container").unwrap_or_else(|| tools.default_container.clone()),
            node: label("node").unwrap_or_default(),
            labels,
        }
    }

    /// The value the alert itself supplied for `field`, if any.
    ///
    /// Only these values are pinned; defaults filled in by
    /// [`AlertContext::from_labels`] may be overridden.
    #[must_use]
    pub fn pinned(&self, field: &str) -> Option<&str> {
        self.labels
            .get(field)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }

    /// Context object handed to the decision oracle.
    #[must_use]
    pub fn to_json(&self) -> Value {
        json!({
            "alertname": self.labels.get("alertname"),
            "namespace": self.namespace,
            "pod": self.pod,
            "container": self.container,
            "node": self.node,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alert(labels: &[(&str, &str)]) -> AlertmanagerAlert {
        AlertmanagerAlert {
            status: "firing".to_string(),
            labels: labels
                .iter()
                .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                .collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_payload_deserializes_alertmanager_shape() {
        let raw = r#"{
            "version": "4",
            "groupKey": "{}:{alertname=\"KubePodImagePullBackOff\"}",
            "status": "firing",
            "receiver": "remediator",
            "externalURL": "http://alertmanager:9093",
            "commonLabels": {"cluster": "prod"},
            "alerts": [{
                "status": "firing",
                "labels": {"alertname": "KubePodImagePullBackOff", "namespace": "ns1"},
                "annotations": {"summary": "image pull failing"},
                "startsAt": "2024-05-01T10:00:00Z",
                "generatorURL": "http://prometheus/graph",
                "fingerprint": "abc123"
            }]
        }"#;
        let payload: AlertmanagerPayload = serde_json::from_str(raw).unwrap();
        assert_eq!(payload.external_url, "http://alertmanager:9093");
        assert_eq!(payload.alerts.len(), 1);

        let alert = &payload.alerts[0];
        assert_eq!(alert.status, "firing");
        assert_eq!(alert.name(), "KubePodImagePullBackOff");
        assert_eq!(alert.summary(), Some("image pull failing"));
        assert_eq!(alert.generator_url, "http://prometheus/graph");

        let labels = payload.effective_labels(alert);
        assert_eq!(labels.get("cluster").map(String::as_str), Some("prod"));
        assert_eq!(labels.get("namespace").map(String::as_str), Some("ns1"));
    }

    #[test]
    fn test_alert_labels_override_common_labels() {
        let mut payload = AlertmanagerPayload::default();
        payload
            .common_labels
            .insert("namespace".to_string(), "common".to_string());
        let a = alert(&[("namespace", "own")]);
        let labels = payload.effective_labels(&a);
        assert_eq!(labels["namespace"], "own");
    }

    #[test]
    fn test_fingerprint_prefers_alert_fingerprint() {
        let payload = AlertmanagerPayload {
            group_key: "group-1".to_string(),
            ..Default::default()
        };
        let mut a = alert(&[("alertname", "X")]);
        a.fingerprint = "fp-1".to_string();
        let labels = payload.effective_labels(&a);
        assert_eq!(payload.fingerprint_for(&a, &labels), "fp-1");
    }

    #[test]
    fn test_fingerprint_falls_back_to_group_key() {
        let payload = AlertmanagerPayload {
            group_key: "group-1".to_string(),
            ..Default::default()
        };
        let a = alert(&[("alertname", "X")]);
        let labels = payload.effective_labels(&a);
        assert_eq!(payload.fingerprint_for(&a, &labels), "group-1");
    }

    #[test]
    fn test_fingerprint_ignores_empty_group_keys() {
        for key in ["", "{}", "{}/{}"] {
            let payload = AlertmanagerPayload {
                group_key: key.to_string(),
                ..Default::default()
            };
            let a = alert(&[
                ("alertname", "OOMKilled"),
                ("namespace", "ns1"),
                ("pod", "p1"),
                ("container", "app"),
            ]);
            let labels = payload.effective_labels(&a);
            assert_eq!(payload.fingerprint_for(&a, &labels), "OOMKilled:ns1:p1:app");
        }
    }

    #[test]
    fn test_fingerprint_composite_defaults() {
        let payload = AlertmanagerPayload::default();
        let a = alert(&[]);
        let labels = payload.effective_labels(&a);
        assert_eq!(payload.fingerprint_for(&a, &labels), "unknown:::");
    }

    #[test]
    fn test_alert_context_defaults_and_pins() {
        let tools = ToolsConfig::default();
        let labels = alert(&[("pod", "p1"), ("container", " ")]).labels;
        let ctx = AlertContext::from_labels(labels, &tools);

        assert_eq!(ctx.namespace, "default");
        assert_eq!(ctx.container, "app");
        assert_eq!(ctx.pod, "p1");
        assert_eq!(ctx.pinned("pod"), Some("p1"));
        assert_eq!(ctx.pinned("namespace"), None);
        assert_eq!(ctx.pinned("container"), None);
    }
}
