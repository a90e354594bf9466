//! Object store seam between the reconciliation pipeline and the cluster.
//!
//! The pipeline only needs five operations. `KubeStore` implements them on
//! top of the Kubernetes API; tests use the in-memory store from
//! `crate::testing`.

use crate::crds::{PodCleanupPolicy, PodCleanupPolicyStatus};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Namespace, Pod};
use kube::api::{DeleteParams, ListParams, Patch, PatchParams};
use kube::{Api, Client, Error as KubeError};
use serde_json::json;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{kind} {name} not found")]
    NotFound { kind: &'static str, name: String },

    #[error("Invalid label selector: {0}")]
    InvalidSelector(String),

    #[error("Kubernetes API error: {0}")]
    Api(#[source] KubeError),

    #[error("{0}")]
    Transient(String),
}

impl StoreError {
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }
}

/// Operations the cleanup pipeline performs against the cluster
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Fetch a policy by name; `Ok(None)` when it no longer exists.
    async fn get_policy(&self, name: &str) -> Result<Option<PodCleanupPolicy>, StoreError>;

    /// List namespaces, optionally filtered by a rendered label selector.
    async fn list_namespaces(&self, selector: Option<&str>) -> Result<Vec<Namespace>, StoreError>;

    /// List pods in one namespace, optionally filtered by a rendered label selector.
    async fn list_pods(
        &self,
        namespace: &str,
        selector: Option<&str>,
    ) -> Result<Vec<Pod>, StoreError>;

    /// Delete a pod. A missing pod is reported as `StoreError::NotFound`.
    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), StoreError>;

    /// Persist the status subresource of a policy.
    async fn update_status(
        &self,
        name: &str,
        status: &PodCleanupPolicyStatus,
    ) -> Result<(), StoreError>;
}

/// `ObjectStore` backed by the Kubernetes API
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn list_params(selector: Option<&str>) -> ListParams {
        match selector {
            Some(s) => ListParams::default().labels(s),
            None => ListParams::default(),
        }
    }
}

/// Maps list failures: a rejected selector is a spec problem, anything else is transient.
fn map_list_error(err: KubeError) -> StoreError {
    match err {
        KubeError::Api(ref api_err) if api_err.code == 400 || api_err.code == 422 => {
            StoreError::InvalidSelector(api_err.message.clone())
        }
        other => StoreError::Api(other),
    }
}

#[async_trait]
impl ObjectStore for KubeStore {
    async fn get_policy(&self, name: &str) -> Result<Option<PodCleanupPolicy>, StoreError> {
        let api: Api<PodCleanupPolicy> = Api::all(self.client.clone());
        api.get_opt(name).await.map_err(StoreError::Api)
    }

    async fn list_namespaces(&self, selector: Option<&str>) -> Result<Vec<Namespace>, StoreError> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let list = api
            .list(&Self::list_params(selector))
            .await
            .map_err(map_list_error)?;
        Ok(list.items)
    }

    async fn list_pods(
        &self,
        namespace: &str,
        selector: Option<&str>,
    ) -> Result<Vec<Pod>, StoreError> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let list = api
            .list(&Self::list_params(selector))
            .await
            .map_err(map_list_error)?;
        Ok(list.items)
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), StoreError> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(KubeError::Api(api_err)) if api_err.code == 404 => Err(StoreError::NotFound {
                kind: "Pod",
                name: format!("{namespace}/{name}"),
            }),
            Err(e) => Err(StoreError::Api(e)),
        }
    }

    async fn update_status(
        &self,
        name: &str,
        status: &PodCleanupPolicyStatus,
    ) -> Result<(), StoreError> {
        let api: Api<PodCleanupPolicy> = Api::all(self.client.clone());
        let patch = json!({ "status": status });

        debug!(policy = %name, "Patching PodCleanupPolicy status");
        api.patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| match e {
                KubeError::Api(api_err) if api_err.code == 404 => StoreError::NotFound {
                    kind: "PodCleanupPolicy",
                    name: name.to_string(),
                },
                other => StoreError::Api(other),
            })?;
        Ok(())
    }
}
