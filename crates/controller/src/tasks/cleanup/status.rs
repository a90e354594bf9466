//! Status bookkeeping for `PodCleanupPolicy`
//!
//! Every function here mutates an in-memory copy of the status; the driver
//! persists the result with a single write.

use crate::crds::{
    ConditionStatus, PodCleanupPolicyStatus, PolicyCondition, CONDITION_READY,
    REASON_CLEANUP_FAILED, REASON_CLEANUP_SUCCEEDED, REASON_INVALID_SCHEDULE,
};
use crate::tasks::cleanup::schedule::ScheduleError;
use chrono::{DateTime, Utc};
use std::collections::HashMap;

/// Conditions keyed by type, remembering the order in which types first appeared
#[derive(Debug, Clone, Default)]
pub struct ConditionSet {
    order: Vec<String>,
    by_type: HashMap<String, PolicyCondition>,
}

impl ConditionSet {
    /// Builds the set from the persisted list. Later duplicates of a type win.
    #[must_use]
    pub fn from_list(conditions: Vec<PolicyCondition>) -> Self {
        let mut set = Self::default();
        for condition in conditions {
            if !set.by_type.contains_key(&condition.condition_type) {
                set.order.push(condition.condition_type.clone());
            }
            set.by_type
                .insert(condition.condition_type.clone(), condition);
        }
        set
    }

    #[must_use]
    pub fn get(&self, condition_type: &str) -> Option<&PolicyCondition> {
        self.by_type.get(condition_type)
    }

    /// Inserts or updates a condition.
    ///
    /// A changed status replaces the condition wholesale, including its
    /// transition time. An unchanged status only refreshes reason, message
    /// and observed generation.
    pub fn upsert(&mut self, condition: PolicyCondition) {
        match self.by_type.get_mut(&condition.condition_type) {
            Some(existing) if existing.status == condition.status => {
                existing.reason = condition.reason;
                existing.message = condition.message;
                existing.observed_generation = condition.observed_generation;
            }
            Some(existing) => *existing = condition,
            None => {
                self.order.push(condition.condition_type.clone());
                self.by_type
                    .insert(condition.condition_type.clone(), condition);
            }
        }
    }

    /// Serializes back to the ordered list stored on the resource.
    #[must_use]
    pub fn into_list(mut self) -> Vec<PolicyCondition> {
        self.order
            .iter()
            .filter_map(|t| self.by_type.remove(t))
            .collect()
    }
}

/// Applies the condition upsert rule to a persisted condition list.
pub fn upsert_condition(conditions: &mut Vec<PolicyCondition>, condition: PolicyCondition) {
    let mut set = ConditionSet::from_list(std::mem::take(conditions));
    set.upsert(condition);
    *conditions = set.into_list();
}

/// Outcome of a cleanup run as seen by the status
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunResult {
    /// The run completed, possibly with per-unit errors that were logged
    Succeeded { affected: u32 },
    /// The run could not be carried out
    Failed { detail: String },
}

fn ready_condition(
    status: bool,
    reason: &str,
    message: String,
    generation: Option<i64>,
    now: DateTime<Utc>,
) -> PolicyCondition {
    PolicyCondition {
        condition_type: CONDITION_READY.to_string(),
        status: ConditionStatus::from(status),
        reason: reason.to_string(),
        message,
        last_transition_time: now,
        observed_generation: generation,
    }
}

/// Records a cleanup attempt.
///
/// The run counters are updated for failed runs too, so `lastRunTime`
/// always reflects the latest attempt. The cumulative counter only advances
/// for real deletions.
pub fn record_run(
    status: &mut PodCleanupPolicyStatus,
    generation: Option<i64>,
    dry_run: bool,
    result: &RunResult,
    now: DateTime<Utc>,
) {
    let (condition, affected) = match result {
        RunResult::Succeeded { affected } => {
            let message = if dry_run {
                format!("DryRun cleanup completed; {affected} pod(s) would be deleted")
            } else {
                format!("Cleanup completed; {affected} pod(s) deleted")
            };
            (
                ready_condition(true, REASON_CLEANUP_SUCCEEDED, message, generation, now),
                *affected,
            )
        }
        RunResult::Failed { detail } => (
            ready_condition(false, REASON_CLEANUP_FAILED, detail.clone(), generation, now),
            0,
        ),
    };

    upsert_condition(&mut status.conditions, condition);
    status.last_run_time = Some(now);
    status.last_run_pods_deleted = affected;
    if !dry_run {
        status.pods_deleted = status.pods_deleted.saturating_add(u64::from(affected));
    }
}

/// Records an unparseable schedule. Run counters are left untouched.
pub fn record_invalid_schedule(
    status: &mut PodCleanupPolicyStatus,
    generation: Option<i64>,
    schedule: &str,
    error: &ScheduleError,
    now: DateTime<Utc>,
) {
    let message = format!("Cannot parse cron schedule {schedule:?}: {error}");
    upsert_condition(
        &mut status.conditions,
        ready_condition(false, REASON_INVALID_SCHEDULE, message, generation, now),
    );
}

/// Records a schedule that parses but has no upcoming fire time.
pub fn record_unreachable_schedule(
    status: &mut PodCleanupPolicyStatus,
    generation: Option<i64>,
    schedule: &str,
    now: DateTime<Utc>,
) {
    let message = format!("Cron schedule {schedule:?} never fires");
    upsert_condition(
        &mut status.conditions,
        ready_condition(false, REASON_INVALID_SCHEDULE, message, generation, now),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 10, 0, 0).unwrap()
    }

    fn condition(kind: &str, status: ConditionStatus, at: DateTime<Utc>) -> PolicyCondition {
        PolicyCondition {
            condition_type: kind.to_string(),
            status,
            reason: "Initial".to_string(),
            message: "initial".to_string(),
            last_transition_time: at,
            observed_generation: Some(1),
        }
    }

    fn ready(status: &PodCleanupPolicyStatus) -> &PolicyCondition {
        status.condition(CONDITION_READY).unwrap()
    }

    #[test]
    fn upsert_appends_missing_condition_preserving_order() {
        let mut conditions = vec![condition("Degraded", ConditionStatus::False, t0())];
        upsert_condition(
            &mut conditions,
            condition(CONDITION_READY, ConditionStatus::True, t0()),
        );

        let types: Vec<_> = conditions.iter().map(|c| c.condition_type.as_str()).collect();
        assert_eq!(types, vec!["Degraded", "Ready"]);
    }

    #[test]
    fn same_status_keeps_transition_time() {
        let mut conditions = vec![condition(CONDITION_READY, ConditionStatus::True, t0())];
        let later = t0() + Duration::hours(1);

        upsert_condition(
            &mut conditions,
            PolicyCondition {
                reason: "CleanupSucceeded".to_string(),
                message: "3 deleted".to_string(),
                observed_generation: Some(2),
                ..condition(CONDITION_READY, ConditionStatus::True, later)
            },
        );

        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].last_transition_time, t0());
        assert_eq!(conditions[0].reason, "CleanupSucceeded");
        assert_eq!(conditions[0].message, "3 deleted");
        assert_eq!(conditions[0].observed_generation, Some(2));
    }

    #[test]
    fn status_flip_replaces_condition() {
        let mut conditions = vec![condition(CONDITION_READY, ConditionStatus::True, t0())];
        let later = t0() + Duration::hours(1);

        upsert_condition(
            &mut conditions,
            condition(CONDITION_READY, ConditionStatus::False, later),
        );

        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].status, ConditionStatus::False);
        assert_eq!(conditions[0].last_transition_time, later);
    }

    #[test]
    fn successful_run_updates_counters() {
        let mut status = PodCleanupPolicyStatus {
            pods_deleted: 10,
            ..Default::default()
        };

        record_run(&mut status, Some(4), false, &RunResult::Succeeded { affected: 3 }, t0());

        assert_eq!(status.last_run_time, Some(t0()));
        assert_eq!(status.last_run_pods_deleted, 3);
        assert_eq!(status.pods_deleted, 13);
        let ready = ready(&status);
        assert_eq!(ready.status, ConditionStatus::True);
        assert_eq!(ready.reason, REASON_CLEANUP_SUCCEEDED);
        assert_eq!(ready.message, "Cleanup completed; 3 pod(s) deleted");
        assert_eq!(ready.observed_generation, Some(4));
    }

    #[test]
    fn dry_run_leaves_cumulative_counter_alone() {
        let mut status = PodCleanupPolicyStatus {
            pods_deleted: 10,
            last_run_pods_deleted: 1,
            ..Default::default()
        };

        record_run(&mut status, None, true, &RunResult::Succeeded { affected: 5 }, t0());

        assert_eq!(status.pods_deleted, 10);
        assert_eq!(status.last_run_pods_deleted, 5);
        assert_eq!(
            ready(&status).message,
            "DryRun cleanup completed; 5 pod(s) would be deleted"
        );
    }

    #[test]
    fn failed_run_still_records_attempt() {
        let mut status = PodCleanupPolicyStatus {
            pods_deleted: 2,
            last_run_pods_deleted: 2,
            ..Default::default()
        };

        record_run(
            &mut status,
            Some(1),
            false,
            &RunResult::Failed {
                detail: "listing target namespaces: boom".to_string(),
            },
            t0(),
        );

        assert_eq!(status.last_run_time, Some(t0()));
        assert_eq!(status.last_run_pods_deleted, 0);
        assert_eq!(status.pods_deleted, 2);
        let ready = ready(&status);
        assert_eq!(ready.status, ConditionStatus::False);
        assert_eq!(ready.reason, REASON_CLEANUP_FAILED);
        assert_eq!(ready.message, "listing target namespaces: boom");
    }

    #[test]
    fn transition_time_changes_only_on_flip_across_runs() {
        let mut status = PodCleanupPolicyStatus::default();
        let t1 = t0() + Duration::minutes(15);
        let t2 = t0() + Duration::minutes(30);
        let t3 = t0() + Duration::minutes(45);

        record_run(&mut status, None, false, &RunResult::Succeeded { affected: 1 }, t0());
        record_run(&mut status, None, false, &RunResult::Succeeded { affected: 0 }, t1);
        assert_eq!(ready(&status).last_transition_time, t0());

        record_run(
            &mut status,
            None,
            false,
            &RunResult::Failed {
                detail: "x".to_string(),
            },
            t2,
        );
        assert_eq!(ready(&status).last_transition_time, t2);

        record_run(&mut status, None, false, &RunResult::Succeeded { affected: 0 }, t3);
        assert_eq!(ready(&status).last_transition_time, t3);
        assert_eq!(status.conditions.len(), 1);
    }

    #[test]
    fn invalid_schedule_only_touches_condition() {
        let mut status = PodCleanupPolicyStatus {
            last_run_time: Some(t0()),
            pods_deleted: 4,
            last_run_pods_deleted: 1,
            ..Default::default()
        };
        let err = crate::tasks::cleanup::schedule::CronSchedule::parse("99 * * * *").unwrap_err();

        record_invalid_schedule(&mut status, Some(2), "99 * * * *", &err, t0() + Duration::hours(1));

        assert_eq!(status.last_run_time, Some(t0()));
        assert_eq!(status.pods_deleted, 4);
        assert_eq!(status.last_run_pods_deleted, 1);
        let ready = ready(&status);
        assert_eq!(ready.status, ConditionStatus::False);
        assert_eq!(ready.reason, REASON_INVALID_SCHEDULE);
        assert!(ready.message.starts_with("Cannot parse cron schedule \"99 * * * *\""));
    }

    #[test]
    fn unreachable_schedule_is_reported_as_invalid() {
        let mut status = PodCleanupPolicyStatus {
            pods_deleted: 3,
            ..Default::default()
        };

        record_unreachable_schedule(&mut status, Some(5), "0 0 30 2 *", t0());

        assert_eq!(status.pods_deleted, 3);
        assert_eq!(status.last_run_time, None);
        let ready = ready(&status);
        assert_eq!(ready.status, ConditionStatus::False);
        assert_eq!(ready.reason, REASON_INVALID_SCHEDULE);
        assert_eq!(ready.message, "Cron schedule \"0 0 30 2 *\" never fires");
        assert_eq!(ready.observed_generation, Some(5));
    }
}
