//! Controller Configuration
//!
//! Loaded once at startup from the mounted `config.yaml`. Every field has a
//! default, so an empty or missing file yields a working controller.

use crate::tasks::cleanup::reconcile::DEFAULT_NAMESPACE_CONCURRENCY;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;

/// Default location of the mounted configuration file
pub const DEFAULT_CONFIG_PATH: &str = "/config/config.yaml";

/// Main controller configuration structure
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct ControllerConfig {
    /// Reconciliation tuning
    #[serde(default)]
    pub reconcile: ReconcileConfig,

    /// Health endpoint server
    #[serde(default)]
    pub server: ServerConfig,

    /// Log output
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileConfig {
    /// Maximum number of namespaces cleaned concurrently within one run
    #[serde(default = "default_namespace_concurrency")]
    pub namespace_concurrency: usize,

    /// Delay before retrying a reconciliation that returned an error
    #[serde(default = "default_error_requeue_seconds")]
    pub error_requeue_seconds: u64,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            namespace_concurrency: default_namespace_concurrency(),
            error_requeue_seconds: default_error_requeue_seconds(),
        }
    }
}

fn default_namespace_concurrency() -> usize {
    DEFAULT_NAMESPACE_CONCURRENCY
}

fn default_error_requeue_seconds() -> u64 {
    30
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
        }
    }
}

fn default_bind_address() -> String {
    "0.0.0.0:8080".to_string()
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub format: LogFormat,
}

/// Log line format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogFormat::Text => write!(f, "text"),
            LogFormat::Json => write!(f, "json"),
        }
    }
}

impl ControllerConfig {
    /// Load configuration from a mounted `ConfigMap` file
    pub fn from_mounted_file(config_path: &str) -> Result<Self, anyhow::Error> {
        let config_str = std::fs::read_to_string(config_path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file {config_path}: {e}"))?;

        Self::from_yaml(&config_str)
    }

    /// Parse configuration from YAML. An empty document yields the defaults.
    pub fn from_yaml(config_str: &str) -> Result<Self, anyhow::Error> {
        if config_str.trim().is_empty() {
            return Ok(Self::default());
        }

        serde_yaml::from_str(config_str)
            .map_err(|e| anyhow::anyhow!("Failed to parse config YAML: {e}"))
    }

    /// Validate that the configuration is usable
    pub fn validate(&self) -> Result<(), anyhow::Error> {
        if self.reconcile.namespace_concurrency == 0 {
            return Err(anyhow::anyhow!(
                "reconcile.namespaceConcurrency must be at least 1"
            ));
        }

        if self.reconcile.error_requeue_seconds == 0 {
            return Err(anyhow::anyhow!(
                "reconcile.errorRequeueSeconds must be at least 1"
            ));
        }

        self.server
            .bind_address
            .parse::<SocketAddr>()
            .map_err(|e| {
                anyhow::anyhow!(
                    "server.bindAddress {:?} is not a socket address: {e}",
                    self.server.bind_address
                )
            })?;

        Ok(())
    }
}
