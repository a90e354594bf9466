//! Shared controller types: the reconcile error, its `Result` alias and the
//! per-reconcile context.

use crate::tasks::cleanup::reconcile::ReconcileSettings;
use crate::tasks::config::ControllerConfig;
use crate::tasks::store::{ObjectStore, StoreError};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use thiserror::Error;

/// Errors surfaced to the controller runtime
#[derive(Debug, Error)]
pub enum Error {
    #[error("Failed to load PodCleanupPolicy {name}: {source}")]
    PolicyFetch {
        name: String,
        #[source]
        source: StoreError,
    },

    #[error("Failed to persist status for PodCleanupPolicy {name}: {source}")]
    StatusPersist {
        name: String,
        #[source]
        source: StoreError,
    },

    #[error("Object has no name")]
    MissingObjectKey,

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Kubernetes error: {0}")]
    KubeError(#[from] kube::Error),
}

impl Error {
    /// Whether the runtime should retry the reconciliation with backoff.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::PolicyFetch { .. } | Error::StatusPersist { .. } | Error::KubeError(_)
        )
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Source of the current time, injected so schedules can be tested
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Context handed to every reconciliation
#[derive(Clone)]
pub struct Context {
    pub store: Arc<dyn ObjectStore>,
    pub clock: Arc<dyn Clock>,
    pub config: Arc<ControllerConfig>,
}

impl Context {
    #[must_use]
    pub fn new(
        store: Arc<dyn ObjectStore>,
        clock: Arc<dyn Clock>,
        config: Arc<ControllerConfig>,
    ) -> Self {
        Self {
            store,
            clock,
            config,
        }
    }

    /// Settings the reconciliation driver reads from the configuration.
    #[must_use]
    pub fn settings(&self) -> ReconcileSettings {
        ReconcileSettings {
            namespace_concurrency: self.config.reconcile.namespace_concurrency,
        }
    }
}
