//! Phase and age eligibility of individual pods

use crate::crds::PodCleanupPolicySpec;
use chrono::{DateTime, Duration, Utc};
use k8s_openapi::api::core::v1::Pod;
use std::collections::BTreeSet;

/// Age requirement derived from `spec.maxAge`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgeLimit {
    /// No `maxAge` configured
    Unbounded,
    /// Pods must be at least this old
    AtLeast(Duration),
    /// `maxAge` could not be parsed; no pod is eligible
    Invalid { raw: String, reason: String },
}

/// Per-run pod eligibility check built from a policy spec
#[derive(Debug, Clone)]
pub struct PodFilter {
    phases: BTreeSet<String>,
    age: AgeLimit,
}

impl PodFilter {
    /// Builds the filter, parsing `maxAge` once for the whole run.
    #[must_use]
    pub fn from_spec(spec: &PodCleanupPolicySpec) -> Self {
        let age = match spec.max_age() {
            None => AgeLimit::Unbounded,
            Some(raw) => match parse_max_age(raw) {
                Ok(limit) => AgeLimit::AtLeast(limit),
                Err(reason) => AgeLimit::Invalid {
                    raw: raw.to_string(),
                    reason,
                },
            },
        };

        Self {
            phases: spec.pod_statuses.iter().cloned().collect(),
            age,
        }
    }

    #[must_use]
    pub fn age_limit(&self) -> &AgeLimit {
        &self.age
    }

    /// Checks a pod against the phase allow-list and minimum age.
    #[must_use]
    pub fn eligible(&self, pod: &Pod, now: DateTime<Utc>) -> bool {
        let phase = pod.status.as_ref().and_then(|s| s.phase.as_deref());
        let created = pod.metadata.creation_timestamp.as_ref().map(|t| t.0);
        self.eligible_at(phase, created, now)
    }

    /// Eligibility from the raw pod attributes.
    #[must_use]
    pub fn eligible_at(
        &self,
        phase: Option<&str>,
        created: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> bool {
        self.phase_matches(phase) && self.age_matches(created, now)
    }

    fn phase_matches(&self, phase: Option<&str>) -> bool {
        if self.phases.is_empty() {
            return true;
        }
        phase.is_some_and(|p| self.phases.contains(p))
    }

    fn age_matches(&self, created: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
        match &self.age {
            AgeLimit::Unbounded => true,
            AgeLimit::Invalid { .. } => false,
            AgeLimit::AtLeast(limit) => created.is_some_and(|created| now - created >= *limit),
        }
    }
}

/// Parses a `maxAge` value such as `30m`, `1h30m` or `2days`.
pub fn parse_max_age(raw: &str) -> Result<Duration, String> {
    let parsed = humantime::parse_duration(raw).map_err(|e| e.to_string())?;
    Duration::from_std(parsed).map_err(|_| format!("duration {raw:?} is out of range"))
}

/// Age of a pod rounded to whole seconds, for log output.
#[must_use]
pub fn pod_age(pod: &Pod, now: DateTime<Utc>) -> Option<String> {
    let created = pod.metadata.creation_timestamp.as_ref()?.0;
    let secs = (now - created).num_seconds().max(0).unsigned_abs();
    Some(humantime::format_duration(std::time::Duration::from_secs(secs)).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap()
    }

    fn spec(statuses: &[&str], max_age: Option<&str>) -> PodCleanupPolicySpec {
        PodCleanupPolicySpec {
            pod_statuses: statuses.iter().map(ToString::to_string).collect(),
            max_age: max_age.map(ToString::to_string),
            ..Default::default()
        }
    }

    #[test]
    fn empty_phase_list_never_excludes() {
        let filter = PodFilter::from_spec(&spec(&[], None));
        for phase in [
            Some("Pending"),
            Some("Running"),
            Some("Succeeded"),
            Some("Failed"),
            Some("Unknown"),
            None,
        ] {
            assert!(filter.eligible_at(phase, Some(now()), now()), "{phase:?}");
        }
    }

    #[test]
    fn phase_list_is_an_allow_list() {
        let filter = PodFilter::from_spec(&spec(&["Failed", "Succeeded"], None));
        assert!(filter.eligible_at(Some("Failed"), None, now()));
        assert!(filter.eligible_at(Some("Succeeded"), None, now()));
        assert!(!filter.eligible_at(Some("Running"), None, now()));
        assert!(!filter.eligible_at(None, None, now()));
    }

    #[test]
    fn age_boundary_is_inclusive() {
        let filter = PodFilter::from_spec(&spec(&[], Some("30m")));
        let exactly = now() - Duration::minutes(30);
        let younger = exactly + Duration::seconds(1);
        let older = exactly - Duration::seconds(1);

        assert!(filter.eligible_at(None, Some(exactly), now()));
        assert!(filter.eligible_at(None, Some(older), now()));
        assert!(!filter.eligible_at(None, Some(younger), now()));
    }

    #[test]
    fn compound_durations_parse() {
        assert_eq!(parse_max_age("1h30m").unwrap(), Duration::minutes(90));
        assert_eq!(parse_max_age("1h 30m").unwrap(), Duration::minutes(90));
        assert_eq!(parse_max_age("24h").unwrap(), Duration::hours(24));
        assert_eq!(parse_max_age("2days").unwrap(), Duration::hours(48));
    }

    #[test]
    fn unparseable_max_age_excludes_every_pod() {
        let filter = PodFilter::from_spec(&spec(&[], Some("soon")));
        assert!(matches!(filter.age_limit(), AgeLimit::Invalid { .. }));

        let ancient = now() - Duration::days(365);
        assert!(!filter.eligible_at(Some("Failed"), Some(ancient), now()));
    }

    #[test]
    fn missing_creation_timestamp_fails_age_check_only_when_configured() {
        let with_age = PodFilter::from_spec(&spec(&[], Some("1m")));
        let without_age = PodFilter::from_spec(&spec(&[], None));

        assert!(!with_age.eligible_at(Some("Failed"), None, now()));
        assert!(without_age.eligible_at(Some("Failed"), None, now()));
    }

    #[test]
    fn both_checks_must_pass() {
        let filter = PodFilter::from_spec(&spec(&["Failed"], Some("30m")));
        let old = now() - Duration::minutes(45);
        let young = now() - Duration::minutes(5);

        assert!(filter.eligible_at(Some("Failed"), Some(old), now()));
        assert!(!filter.eligible_at(Some("Failed"), Some(young), now()));
        assert!(!filter.eligible_at(Some("Running"), Some(old), now()));
    }
}
