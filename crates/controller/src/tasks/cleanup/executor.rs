//! Cleanup executor
//!
//! Resolves the target namespaces, lists candidate pods in each, applies the
//! phase/age filter and deletes (or, in dry-run, reports) the matches.
//! Failures are isolated per namespace and per pod.

use crate::crds::PodCleanupPolicy;
use crate::tasks::cleanup::filter::{pod_age, AgeLimit, PodFilter};
use crate::tasks::cleanup::selector::{Selector, SelectorError};
use crate::tasks::store::{ObjectStore, StoreError};
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

/// Errors that abort a whole cleanup run
#[derive(Debug, Error)]
pub enum CleanupError {
    #[error("invalid namespaceSelector: {0}")]
    InvalidNamespaceSelector(#[source] SelectorError),

    #[error("listing target namespaces: {0}")]
    ListNamespaces(#[source] StoreError),

    #[error("all {count} target namespace(s) failed; first error: {first}")]
    AllNamespacesFailed { count: usize, first: String },
}

/// Errors scoped to a single namespace
#[derive(Debug, Error)]
pub enum NamespaceError {
    #[error("invalid podSelector: {0}")]
    InvalidPodSelector(#[source] SelectorError),

    #[error("listing pods in namespace {namespace}: {source}")]
    ListPods {
        namespace: String,
        #[source]
        source: StoreError,
    },
}

/// Result of a run that was not aborted
#[derive(Debug, Default)]
pub struct CleanupOutcome {
    /// Pods deleted, or that would have been deleted in dry-run
    pub affected: u32,
    /// Number of namespaces that were targeted
    pub namespaces: usize,
    /// Pods whose deletion failed and were skipped
    pub delete_failures: u32,
    /// Namespaces skipped because their pods could not be listed
    pub namespace_errors: Vec<(String, NamespaceError)>,
}

/// Per-namespace tally, merged in namespace order once all branches finish
#[derive(Debug, Default)]
struct NamespacePass {
    affected: u32,
    delete_failures: u32,
}

/// Inputs shared by every namespace branch of one run
struct RunPlan<'a> {
    store: &'a dyn ObjectStore,
    pod_selector: Result<Selector, SelectorError>,
    filter: PodFilter,
    dry_run: bool,
    now: DateTime<Utc>,
}

/// Runs one cleanup pass for a policy.
///
/// Namespaces are processed with at most `concurrency` in flight. Listing
/// failures skip the affected namespace; the run only fails when the
/// namespace selector is invalid, namespaces cannot be listed, or every
/// target namespace failed.
#[instrument(skip_all, fields(policy = %policy.name_any(), dry_run = policy.spec.dry_run))]
pub async fn execute(
    store: &dyn ObjectStore,
    policy: &PodCleanupPolicy,
    now: DateTime<Utc>,
    concurrency: usize,
) -> Result<CleanupOutcome, CleanupError> {
    let spec = &policy.spec;

    let namespaces = target_namespaces(store, policy).await?;
    if namespaces.is_empty() {
        info!("No namespaces match the policy");
        return Ok(CleanupOutcome::default());
    }

    let plan = RunPlan {
        store,
        pod_selector: Selector::from_label_selector(spec.pod_selector.as_ref()),
        filter: PodFilter::from_spec(spec),
        dry_run: spec.dry_run,
        now,
    };

    if let AgeLimit::Invalid { raw, reason } = plan.filter.age_limit() {
        warn!(
            max_age = %raw,
            reason = %reason,
            "Invalid maxAge; no pods are eligible for cleanup"
        );
    }

    let plan = &plan;
    let results: Vec<(String, Result<NamespacePass, NamespaceError>)> = stream::iter(namespaces)
        .map(|namespace| async move {
            let result = cleanup_namespace(plan, &namespace).await;
            (namespace, result)
        })
        .buffered(concurrency.max(1))
        .collect()
        .await;

    let mut outcome = CleanupOutcome {
        namespaces: results.len(),
        ..Default::default()
    };
    for (namespace, result) in results {
        match result {
            Ok(pass) => {
                outcome.affected = outcome.affected.saturating_add(pass.affected);
                outcome.delete_failures =
                    outcome.delete_failures.saturating_add(pass.delete_failures);
            }
            Err(err) => {
                error!(
                    namespace = %namespace,
                    error = %err,
                    "Error cleaning pods in namespace"
                );
                outcome.namespace_errors.push((namespace, err));
            }
        }
    }

    if outcome.namespace_errors.len() == outcome.namespaces {
        let first = outcome
            .namespace_errors
            .first()
            .map(|(_, err)| err.to_string())
            .unwrap_or_default();
        return Err(CleanupError::AllNamespacesFailed {
            count: outcome.namespaces,
            first,
        });
    }

    info!(
        pods_affected = outcome.affected,
        namespaces = outcome.namespaces,
        failed_namespaces = outcome.namespace_errors.len(),
        delete_failures = outcome.delete_failures,
        "Cleanup run finished"
    );
    Ok(outcome)
}

/// Names of the namespaces the policy applies to.
async fn target_namespaces(
    store: &dyn ObjectStore,
    policy: &PodCleanupPolicy,
) -> Result<Vec<String>, CleanupError> {
    let selector = Selector::from_label_selector(policy.spec.namespace_selector.as_ref())
        .map_err(CleanupError::InvalidNamespaceSelector)?;
    let query = selector.to_query();

    let namespaces = store
        .list_namespaces(query.as_deref())
        .await
        .map_err(|err| match err {
            StoreError::InvalidSelector(msg) => {
                CleanupError::InvalidNamespaceSelector(SelectorError::Rejected(msg))
            }
            other => CleanupError::ListNamespaces(other),
        })?;

    let names: Vec<String> = namespaces
        .into_iter()
        .filter(|ns| selector.matches(ns.metadata.labels.as_ref()))
        .map(|ns| ns.name_any())
        .collect();

    debug!(count = names.len(), "Resolved target namespaces");
    Ok(names)
}

async fn cleanup_namespace(
    plan: &RunPlan<'_>,
    namespace: &str,
) -> Result<NamespacePass, NamespaceError> {
    let selector = plan
        .pod_selector
        .as_ref()
        .map_err(|err| NamespaceError::InvalidPodSelector(err.clone()))?;
    let query = selector.to_query();

    let pods = plan
        .store
        .list_pods(namespace, query.as_deref())
        .await
        .map_err(|source| match source {
            StoreError::InvalidSelector(msg) => {
                NamespaceError::InvalidPodSelector(SelectorError::Rejected(msg))
            }
            source => NamespaceError::ListPods {
                namespace: namespace.to_string(),
                source,
            },
        })?;

    let mut pass = NamespacePass::default();
    for pod in pods
        .iter()
        .filter(|pod| selector.matches(pod.metadata.labels.as_ref()))
        .filter(|pod| plan.filter.eligible(pod, plan.now))
    {
        if remove_pod(plan, namespace, pod).await {
            pass.affected = pass.affected.saturating_add(1);
        } else {
            pass.delete_failures = pass.delete_failures.saturating_add(1);
        }
    }

    Ok(pass)
}

/// Deletes (or reports, in dry-run) one eligible pod. Returns whether it counts
/// towards the affected total.
async fn remove_pod(plan: &RunPlan<'_>, namespace: &str, pod: &Pod) -> bool {
    let name = pod.name_any();
    let phase = pod
        .status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .unwrap_or("Unknown");
    let age = pod_age(pod, plan.now).unwrap_or_else(|| "unknown".to_string());

    if plan.dry_run {
        info!(
            namespace = %namespace,
            pod = %name,
            phase = %phase,
            age = %age,
            "DryRun: would delete pod"
        );
        return true;
    }

    info!(
        namespace = %namespace,
        pod = %name,
        phase = %phase,
        age = %age,
        "Deleting pod"
    );
    match plan.store.delete_pod(namespace, &name).await {
        Ok(()) => true,
        Err(err) if err.is_not_found() => {
            debug!(namespace = %namespace, pod = %name, "Pod already gone");
            true
        }
        Err(err) => {
            error!(
                namespace = %namespace,
                pod = %name,
                error = %err,
                "Failed to delete pod"
            );
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crds::PodCleanupPolicySpec;
    use crate::testing::{namespace, pod, policy, MemoryStore};
    use chrono::{Duration, TimeZone};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{
        LabelSelector, LabelSelectorRequirement,
    };

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap()
    }

    fn store_with_namespaces(count: usize) -> MemoryStore {
        (0..count).fold(MemoryStore::new(), |store, i| {
            let ns = format!("ns-{i:02}");
            store
                .with_namespace(namespace(&ns, &[]))
                .with_pod(pod(&ns, "done", "Succeeded", now() - Duration::hours(1)))
        })
    }

    #[tokio::test]
    async fn namespace_fan_out_is_bounded() {
        let store = store_with_namespaces(10);
        let p = policy("p", PodCleanupPolicySpec::default());

        let outcome = execute(&store, &p, now(), 3).await.unwrap();

        assert_eq!(outcome.affected, 10);
        assert_eq!(outcome.namespaces, 10);
        let peak = store.peak_concurrent_listings();
        assert!(peak > 1, "namespaces were listed one at a time");
        assert!(peak <= 3, "{peak} listings in flight with a bound of 3");
    }

    #[tokio::test]
    async fn namespace_errors_are_reported_in_namespace_order() {
        let store = store_with_namespaces(4)
            .fail_pod_listing("ns-03")
            .fail_pod_listing("ns-01");
        let p = policy("p", PodCleanupPolicySpec::default());

        let outcome = execute(&store, &p, now(), 4).await.unwrap();

        let failed: Vec<&str> = outcome
            .namespace_errors
            .iter()
            .map(|(ns, _)| ns.as_str())
            .collect();
        assert_eq!(failed, vec!["ns-01", "ns-03"]);
        assert_eq!(outcome.affected, 2);
    }

    #[tokio::test]
    async fn zero_concurrency_still_makes_progress() {
        let store = store_with_namespaces(2);
        let p = policy("p", PodCleanupPolicySpec::default());

        let outcome = execute(&store, &p, now(), 0).await.unwrap();
        assert_eq!(outcome.affected, 2);
    }

    #[tokio::test]
    async fn invalid_pod_selector_fails_every_namespace() {
        let store = store_with_namespaces(2);
        let p = policy(
            "p",
            PodCleanupPolicySpec {
                pod_selector: Some(LabelSelector {
                    match_expressions: Some(vec![LabelSelectorRequirement {
                        key: "app".to_string(),
                        operator: "Matches".to_string(),
                        values: None,
                    }]),
                    ..Default::default()
                }),
                ..Default::default()
            },
        );

        let err = execute(&store, &p, now(), 4).await.unwrap_err();

        assert!(matches!(err, CleanupError::AllNamespacesFailed { count: 2, .. }));
        assert!(store.pod_queries().is_empty());
        assert!(store.deleted().is_empty());
    }

    #[tokio::test]
    async fn server_rejected_namespace_selector_is_fatal() {
        let store = store_with_namespaces(2).reject_namespace_selector();
        let p = policy(
            "p",
            PodCleanupPolicySpec {
                namespace_selector: Some(LabelSelector {
                    match_labels: Some([("team".to_string(), "batch".to_string())].into()),
                    ..Default::default()
                }),
                ..Default::default()
            },
        );

        let err = execute(&store, &p, now(), 4).await.unwrap_err();

        assert!(matches!(
            err,
            CleanupError::InvalidNamespaceSelector(SelectorError::Rejected(_))
        ));
        assert!(err.to_string().starts_with("invalid namespaceSelector"), "{err}");
        assert!(store.pod_queries().is_empty());
    }

    #[tokio::test]
    async fn server_rejected_pod_selector_is_scoped_to_its_namespace() {
        let store = store_with_namespaces(3).reject_pod_selector("ns-01");
        let p = policy("p", PodCleanupPolicySpec::default());

        let outcome = execute(&store, &p, now(), 4).await.unwrap();

        assert_eq!(outcome.affected, 2);
        assert_eq!(outcome.namespace_errors.len(), 1);
        let (namespace, err) = &outcome.namespace_errors[0];
        assert_eq!(namespace, "ns-01");
        assert!(matches!(
            err,
            NamespaceError::InvalidPodSelector(SelectorError::Rejected(_))
        ));
        let mut deleted = store.deleted();
        deleted.sort();
        assert_eq!(
            deleted,
            vec![
                ("ns-00".to_string(), "done".to_string()),
                ("ns-02".to_string(), "done".to_string())
            ]
        );
    }

    #[tokio::test]
    async fn namespace_listing_failure_is_fatal() {
        let store = store_with_namespaces(1).fail_namespace_listing();
        let p = policy("p", PodCleanupPolicySpec::default());

        let err = execute(&store, &p, now(), 4).await.unwrap_err();
        assert!(matches!(err, CleanupError::ListNamespaces(_)));
    }

    #[tokio::test]
    async fn delete_failures_are_tallied() {
        let store = store_with_namespaces(2).fail_delete("ns-00", "done");
        let p = policy("p", PodCleanupPolicySpec::default());

        let outcome = execute(&store, &p, now(), 4).await.unwrap();

        assert_eq!(outcome.affected, 1);
        assert_eq!(outcome.delete_failures, 1);
        assert!(outcome.namespace_errors.is_empty());
    }
}
