//! In-memory test doubles for the cleanup pipeline
//!
//! `MemoryStore` implements [`ObjectStore`] over plain collections with
//! switches for injecting failures. `FixedClock` is a settable [`Clock`].

use crate::crds::{PodCleanupPolicy, PodCleanupPolicySpec, PodCleanupPolicyStatus};
use crate::tasks::store::{ObjectStore, StoreError};
use crate::tasks::types::Clock;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use k8s_openapi::api::core::v1::{Namespace, Pod, PodStatus};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

#[derive(Default)]
struct State {
    policies: BTreeMap<String, PodCleanupPolicy>,
    namespaces: Vec<Namespace>,
    pods: BTreeMap<(String, String), Pod>,
    deleted: Vec<(String, String)>,
    status_writes: usize,
    namespace_queries: Vec<Option<String>>,
    pod_queries: Vec<(String, Option<String>)>,
}

#[derive(Default)]
struct Faults {
    policy_fetch: bool,
    namespace_listing: bool,
    namespace_selector_rejected: bool,
    pod_listing: BTreeSet<String>,
    pod_selector_rejected: BTreeSet<String>,
    deletes: BTreeSet<(String, String)>,
    vanished: BTreeSet<(String, String)>,
    status_updates: bool,
}

/// Object store kept entirely in memory
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
    faults: Faults,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_policy(self, policy: PodCleanupPolicy) -> Self {
        let name = policy.metadata.name.clone().unwrap_or_default();
        self.lock().policies.insert(name, policy);
        self
    }

    #[must_use]
    pub fn with_namespace(self, namespace: Namespace) -> Self {
        self.lock().namespaces.push(namespace);
        self
    }

    #[must_use]
    pub fn with_pod(self, pod: Pod) -> Self {
        let key = (
            pod.metadata.namespace.clone().unwrap_or_default(),
            pod.metadata.name.clone().unwrap_or_default(),
        );
        self.lock().pods.insert(key, pod);
        self
    }

    /// `get_policy` fails with a transient error.
    #[must_use]
    pub fn fail_policy_fetch(mut self) -> Self {
        self.faults.policy_fetch = true;
        self
    }

    /// `list_namespaces` fails with a transient error.
    #[must_use]
    pub fn fail_namespace_listing(mut self) -> Self {
        self.faults.namespace_listing = true;
        self
    }

    /// `list_namespaces` rejects any selector as malformed.
    #[must_use]
    pub fn reject_namespace_selector(mut self) -> Self {
        self.faults.namespace_selector_rejected = true;
        self
    }

    /// `list_pods` rejects any selector as malformed in the given namespace.
    #[must_use]
    pub fn reject_pod_selector(mut self, namespace: &str) -> Self {
        self.faults.pod_selector_rejected.insert(namespace.to_string());
        self
    }

    /// `list_pods` fails for the given namespace.
    #[must_use]
    pub fn fail_pod_listing(mut self, namespace: &str) -> Self {
        self.faults.pod_listing.insert(namespace.to_string());
        self
    }

    /// `delete_pod` fails for the given pod, which stays in the store.
    #[must_use]
    pub fn fail_delete(mut self, namespace: &str, name: &str) -> Self {
        self.faults
            .deletes
            .insert((namespace.to_string(), name.to_string()));
        self
    }

    /// The pod is listed but reported as not found on delete.
    #[must_use]
    pub fn vanish_on_delete(mut self, namespace: &str, name: &str) -> Self {
        self.faults
            .vanished
            .insert((namespace.to_string(), name.to_string()));
        self
    }

    /// `update_status` fails with a transient error.
    #[must_use]
    pub fn fail_status_updates(mut self) -> Self {
        self.faults.status_updates = true;
        self
    }

    /// Pods successfully deleted, in deletion order.
    pub fn deleted(&self) -> Vec<(String, String)> {
        self.lock().deleted.clone()
    }

    /// Names of the pods still present, as `namespace/name`.
    pub fn remaining_pods(&self) -> Vec<String> {
        self.lock()
            .pods
            .keys()
            .map(|(ns, name)| format!("{ns}/{name}"))
            .collect()
    }

    pub fn status_of(&self, policy: &str) -> Option<PodCleanupPolicyStatus> {
        self.lock()
            .policies
            .get(policy)
            .and_then(|p| p.status.clone())
    }

    pub fn status_writes(&self) -> usize {
        self.lock().status_writes
    }

    /// Selectors passed to `list_namespaces`.
    pub fn namespace_queries(&self) -> Vec<Option<String>> {
        self.lock().namespace_queries.clone()
    }

    /// Namespaces and selectors passed to `list_pods`.
    pub fn pod_queries(&self) -> Vec<(String, Option<String>)> {
        self.lock().pod_queries.clone()
    }

    /// Highest number of `list_pods` calls observed in flight at once.
    pub fn peak_concurrent_listings(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn get_policy(&self, name: &str) -> Result<Option<PodCleanupPolicy>, StoreError> {
        if self.faults.policy_fetch {
            return Err(StoreError::Transient("policy fetch failed".to_string()));
        }
        Ok(self.lock().policies.get(name).cloned())
    }

    async fn list_namespaces(&self, selector: Option<&str>) -> Result<Vec<Namespace>, StoreError> {
        let mut state = self.lock();
        state.namespace_queries.push(selector.map(ToString::to_string));
        if self.faults.namespace_listing {
            return Err(StoreError::Transient("namespace list failed".to_string()));
        }
        if self.faults.namespace_selector_rejected {
            return Err(StoreError::InvalidSelector(format!(
                "unable to parse requirement: {}",
                selector.unwrap_or_default()
            )));
        }
        Ok(state.namespaces.clone())
    }

    async fn list_pods(
        &self,
        namespace: &str,
        selector: Option<&str>,
    ) -> Result<Vec<Pod>, StoreError> {
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(current, Ordering::SeqCst);
        tokio::task::yield_now().await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let mut state = self.lock();
        state
            .pod_queries
            .push((namespace.to_string(), selector.map(ToString::to_string)));
        if self.faults.pod_selector_rejected.contains(namespace) {
            return Err(StoreError::InvalidSelector(format!(
                "unable to parse requirement: {}",
                selector.unwrap_or_default()
            )));
        }
        if self.faults.pod_listing.contains(namespace) {
            return Err(StoreError::Transient(format!(
                "pod list failed in namespace {namespace}"
            )));
        }
        Ok(state
            .pods
            .iter()
            .filter(|((ns, _), _)| ns == namespace)
            .map(|(_, pod)| pod.clone())
            .collect())
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), StoreError> {
        let key = (namespace.to_string(), name.to_string());
        if self.faults.deletes.contains(&key) {
            return Err(StoreError::Transient(format!(
                "delete of {namespace}/{name} failed"
            )));
        }

        let mut state = self.lock();
        if self.faults.vanished.contains(&key) || state.pods.remove(&key).is_none() {
            return Err(StoreError::NotFound {
                kind: "Pod",
                name: format!("{namespace}/{name}"),
            });
        }
        state.deleted.push(key);
        Ok(())
    }

    async fn update_status(
        &self,
        name: &str,
        status: &PodCleanupPolicyStatus,
    ) -> Result<(), StoreError> {
        if self.faults.status_updates {
            return Err(StoreError::Transient("status update conflict".to_string()));
        }

        let mut state = self.lock();
        let policy = state
            .policies
            .get_mut(name)
            .ok_or_else(|| StoreError::NotFound {
                kind: "PodCleanupPolicy",
                name: name.to_string(),
            })?;
        policy.status = Some(status.clone());
        state.status_writes += 1;
        Ok(())
    }
}

/// Clock frozen at a settable instant
pub struct FixedClock {
    now: Mutex<DateTime<Utc>>,
}

impl FixedClock {
    #[must_use]
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        if let Ok(mut guard) = self.now.lock() {
            *guard = now;
        }
    }

    pub fn advance(&self, by: Duration) {
        if let Ok(mut guard) = self.now.lock() {
            *guard += by;
        }
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        match self.now.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}

fn labels_of(labels: &[(&str, &str)]) -> Option<BTreeMap<String, String>> {
    if labels.is_empty() {
        return None;
    }
    Some(
        labels
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect(),
    )
}

/// Namespace with the given labels
#[must_use]
pub fn namespace(name: &str, labels: &[(&str, &str)]) -> Namespace {
    Namespace {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: labels_of(labels),
            ..Default::default()
        },
        ..Default::default()
    }
}

/// Pod in `phase`, created at `created`
#[must_use]
pub fn pod(namespace: &str, name: &str, phase: &str, created: DateTime<Utc>) -> Pod {
    labeled_pod(namespace, name, phase, created, &[])
}

/// Pod in `phase` carrying `labels`
#[must_use]
pub fn labeled_pod(
    namespace: &str,
    name: &str,
    phase: &str,
    created: DateTime<Utc>,
    labels: &[(&str, &str)],
) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: labels_of(labels),
            creation_timestamp: Some(Time(created)),
            ..Default::default()
        },
        status: Some(PodStatus {
            phase: Some(phase.to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Cluster-scoped policy at generation 1
#[must_use]
pub fn policy(name: &str, spec: PodCleanupPolicySpec) -> PodCleanupPolicy {
    let mut policy = PodCleanupPolicy::new(name, spec);
    policy.metadata.generation = Some(1);
    policy
}
