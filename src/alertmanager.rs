//! Schema for the Alertmanager HTTP POST webhook requests.
//!
//! See <https://prometheus.io/docs/alerting/latest/configuration/#webhook_config>

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Alert status indicating whether an alert is firing or resolved.
///
/// Statuses other than `firing` and `resolved` (or an absent status) fall
/// into [`Status::Unknown`] so that an odd payload skips dispatch instead of
/// failing to parse.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    /// The alert condition is currently true.
    Firing,
    /// The alert condition is no longer true.
    Resolved,
    /// Any other (or missing) status string.
    #[default]
    #[serde(other)]
    Unknown,
}

/// The top-level webhook payload from Alertmanager.
///
/// Alertmanager sends more fields (groupLabels, commonLabels, externalURL...)
/// but only the group status and the alert list drive dispatch.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookPayload {
    /// Overall status of the alert group.
    #[serde(default)]
    pub status: Status,
    /// List of alerts in this notification.
    #[serde(default)]
    pub alerts: Vec<Alert>,
}

/// An individual alert from Alertmanager.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    /// Status of this specific alert.
    #[serde(default)]
    pub status: Status,
    /// Labels identifying the alert. User-defined, no key is guaranteed.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Annotations providing additional information. `summary` and
    /// `description` are conventional but optional.
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    /// Time when the alert started firing, as an RFC3339 string.
    /// Kept as a string: an absent or malformed timestamp means
    /// "no timestamp", never a parse error.
    #[serde(default)]
    pub starts_at: String,
    /// Time when the alert was resolved (zero value if still firing).
    #[serde(default)]
    pub ends_at: String,
    /// URL to the Prometheus graph for this alert's expression.
    #[serde(default, alias = "generatorURL")]
    pub generator_url: String,
}

impl Alert {
    /// Get a label value, if present.
    pub fn label(&self, name: &str) -> Option<&str> {
        self.labels.get(name).map(|s| s.as_str())
    }

    /// Get an annotation value, if present.
    pub fn annotation(&self, name: &str) -> Option<&str> {
        self.annotations.get(name).map(|s| s.as_str())
    }
}
