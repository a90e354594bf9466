//! `PodCleanupPolicy` Custom Resource Definition

use chrono::{DateTime, Utc};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Condition type maintained by the controller on every policy
pub const CONDITION_READY: &str = "Ready";

/// Reason recorded when a cleanup pass finished
pub const REASON_CLEANUP_SUCCEEDED: &str = "CleanupSucceeded";
/// Reason recorded when a cleanup pass could not run to completion
pub const REASON_CLEANUP_FAILED: &str = "CleanupFailed";
/// Reason recorded when `spec.schedule` cannot be parsed
pub const REASON_INVALID_SCHEDULE: &str = "InvalidSchedule";

/// `PodCleanupPolicy` CRD describing which pods to remove and when
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[kube(group = "cleanup.k8s.io", version = "v1", kind = "PodCleanupPolicy")]
#[kube(shortname = "pcp")]
#[kube(status = "PodCleanupPolicyStatus")]
#[kube(printcolumn = r#"{"name":"Schedule","type":"string","jsonPath":".spec.schedule"}"#)]
#[kube(printcolumn = r#"{"name":"DryRun","type":"boolean","jsonPath":".spec.dryRun"}"#)]
#[kube(printcolumn = r#"{"name":"LastRun","type":"string","jsonPath":".status.lastRunTime"}"#)]
#[kube(printcolumn = r#"{"name":"PodsDeleted","type":"integer","jsonPath":".status.podsDeleted"}"#)]
#[serde(rename_all = "camelCase")]
pub struct PodCleanupPolicySpec {
    /// Cron expression for when to run cleanup (e.g. "*/5 * * * *").
    /// Without a schedule, cleanup runs on every reconcile.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<String>,

    /// Selects the namespaces to scan. All namespaces when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace_selector: Option<LabelSelector>,

    /// Selects the pods to consider. All pods in the target namespaces when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_selector: Option<LabelSelector>,

    /// Pod phases eligible for cleanup (e.g. Failed, Succeeded). All phases when empty.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pod_statuses: Vec<String>,

    /// Minimum pod age before it becomes a candidate (e.g. "24h", "1h30m")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_age: Option<String>,

    /// Log what would be deleted without deleting anything
    #[serde(default)]
    pub dry_run: bool,
}

impl PodCleanupPolicySpec {
    /// Returns the configured schedule, treating a blank string as unset.
    #[must_use]
    pub fn schedule(&self) -> Option<&str> {
        self.schedule
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    /// Returns the configured maximum age, treating a blank string as unset.
    #[must_use]
    pub fn max_age(&self) -> Option<&str> {
        self.max_age
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }
}

/// Observed state of a `PodCleanupPolicy`
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PodCleanupPolicyStatus {
    /// Timestamp of the last cleanup run
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run_time: Option<DateTime<Utc>>,

    /// Cumulative number of pods deleted by this policy (dry runs excluded)
    #[serde(default)]
    pub pods_deleted: u64,

    /// Pods deleted (or that would have been deleted) in the last run
    #[serde(default)]
    pub last_run_pods_deleted: u32,

    /// Latest observations of the policy's state
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<PolicyCondition>,
}

impl PodCleanupPolicyStatus {
    /// Looks up a condition by type.
    #[must_use]
    pub fn condition(&self, condition_type: &str) -> Option<&PolicyCondition> {
        self.conditions
            .iter()
            .find(|c| c.condition_type == condition_type)
    }
}

/// Tri-state status of a condition
#[derive(Deserialize, Serialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

impl From<bool> for ConditionStatus {
    fn from(value: bool) -> Self {
        if value {
            ConditionStatus::True
        } else {
            ConditionStatus::False
        }
    }
}

impl fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConditionStatus::True => "True",
            ConditionStatus::False => "False",
            ConditionStatus::Unknown => "Unknown",
        };
        f.write_str(s)
    }
}

/// Condition for the `PodCleanupPolicy`
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PolicyCondition {
    /// Type of condition
    #[serde(rename = "type")]
    pub condition_type: String,

    /// Status of the condition (True, False, or Unknown)
    pub status: ConditionStatus,

    /// Machine-readable reason for the last update
    pub reason: String,

    /// Human-readable message about the condition
    pub message: String,

    /// Last time the status value changed
    pub last_transition_time: DateTime<Utc>,

    /// `metadata.generation` the condition was computed from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::CustomResourceExt;
    use serde_json::json;

    #[test]
    fn spec_deserializes_camel_case_fields() {
        let spec: PodCleanupPolicySpec = serde_json::from_value(json!({
            "schedule": "*/5 * * * *",
            "namespaceSelector": { "matchLabels": { "team": "batch" } },
            "podStatuses": ["Failed", "Succeeded"],
            "maxAge": "1h30m",
            "dryRun": true
        }))
        .unwrap();

        assert_eq!(spec.schedule(), Some("*/5 * * * *"));
        assert!(spec.pod_selector.is_none());
        assert_eq!(spec.pod_statuses, vec!["Failed", "Succeeded"]);
        assert_eq!(spec.max_age(), Some("1h30m"));
        assert!(spec.dry_run);
    }

    #[test]
    fn blank_optional_strings_are_treated_as_unset() {
        let spec = PodCleanupPolicySpec {
            schedule: Some("  ".to_string()),
            max_age: Some(String::new()),
            ..Default::default()
        };
        assert_eq!(spec.schedule(), None);
        assert_eq!(spec.max_age(), None);
    }

    #[test]
    fn status_serializes_conditions_as_ordered_list() {
        let now = Utc::now();
        let status = PodCleanupPolicyStatus {
            last_run_time: Some(now),
            pods_deleted: 7,
            last_run_pods_deleted: 2,
            conditions: vec![PolicyCondition {
                condition_type: CONDITION_READY.to_string(),
                status: ConditionStatus::True,
                reason: REASON_CLEANUP_SUCCEEDED.to_string(),
                message: "ok".to_string(),
                last_transition_time: now,
                observed_generation: Some(3),
            }],
        };

        let value = serde_json::to_value(&status).unwrap();
        assert_eq!(value["podsDeleted"], 7);
        assert_eq!(value["lastRunPodsDeleted"], 2);
        assert_eq!(value["conditions"][0]["type"], "Ready");
        assert_eq!(value["conditions"][0]["status"], "True");
        assert_eq!(value["conditions"][0]["observedGeneration"], 3);
    }

    #[test]
    fn crd_is_cluster_scoped_with_short_name() {
        let crd = PodCleanupPolicy::crd();
        assert_eq!(crd.spec.scope, "Cluster");
        assert_eq!(crd.spec.group, "cleanup.k8s.io");
        assert_eq!(
            crd.spec.names.short_names,
            Some(vec!["pcp".to_string()])
        );
    }
}
