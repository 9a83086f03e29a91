// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Controller configuration.
//!
//! In manager mode the configuration is read from a YAML file; in standalone mode it
//! is assembled from command line flags on top of [`Config::default`]. Either way it
//! is validated once at startup and treated as immutable afterwards.
//!
//! # Example
//!
//! ```yaml
//! manager:
//!   leaderElection: true
//!   leaderElectionNamespace: gateport-system
//!   leaseDurationSecs: 30
//!   renewDeadlineSecs: 15
//!   retryPeriodSecs: 5
//! kubernetes:
//!   inCluster: true
//! sync:
//!   namespace: istio-system
//!   serviceName: istio-ingressgateway
//!   defaultPorts: [80, 443, 15021]
//!   ignoreKey: gateport.io/ignore
//! metrics:
//!   enabled: true
//!   port: 8080
//! ```

use crate::constants::{
    DEFAULT_EXPOSED_PORTS, DEFAULT_LEASE_NAME, DEFAULT_MAX_RETRIES, DEFAULT_RESYNC_PERIOD_SECS,
    DEFAULT_SERVICE_NAME, DEFAULT_SERVICE_NAMESPACE, DEFAULT_WORKERS,
    MANAGER_LEASE_DURATION_SECS, MANAGER_LEASE_RENEW_DEADLINE_SECS,
    MANAGER_LEASE_RETRY_PERIOD_SECS, METRICS_SERVER_BIND_ADDRESS, METRICS_SERVER_PORT,
    SERVICE_ACCOUNT_NAMESPACE_FILE,
};
use crate::labels::DEFAULT_IGNORE_KEY;
use crate::leader_election::LeaseConfig;
use crate::reconcilers::SyncTarget;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Configuration errors. All of them are fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("invalid configuration: {}", .0.join("; "))]
    Invalid(Vec<String>),
}

/// Top-level configuration.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
    pub manager: ManagerOptions,
    pub kubernetes: KubernetesOptions,
    pub sync: SyncOptions,
    pub metrics: MetricsOptions,
}

/// Leader election settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ManagerOptions {
    pub leader_election: bool,
    /// Namespace of the Lease; detected from the service account when empty
    pub leader_election_namespace: String,
    pub leader_election_id: String,
    pub lease_duration_secs: u64,
    pub renew_deadline_secs: u64,
    pub retry_period_secs: u64,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            leader_election: true,
            leader_election_namespace: String::new(),
            leader_election_id: DEFAULT_LEASE_NAME.to_string(),
            lease_duration_secs: MANAGER_LEASE_DURATION_SECS,
            renew_deadline_secs: MANAGER_LEASE_RENEW_DEADLINE_SECS,
            retry_period_secs: MANAGER_LEASE_RETRY_PERIOD_SECS,
        }
    }
}

impl ManagerOptions {
    /// Election parameters for this replica.
    #[must_use]
    pub fn lease_config(&self, identity: impl Into<String>) -> LeaseConfig {
        LeaseConfig {
            name: self.leader_election_id.clone(),
            namespace: detect_namespace(&self.leader_election_namespace),
            identity: identity.into(),
            lease_duration: Duration::from_secs(self.lease_duration_secs),
            renew_deadline: Duration::from_secs(self.renew_deadline_secs),
            retry_period: Duration::from_secs(self.retry_period_secs),
        }
    }
}

/// How to reach the API server.
///
/// Explicit kubeconfig first, then in-cluster when requested, then the usual
/// inference (`KUBECONFIG`, `~/.kube/config`, in-cluster environment).
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct KubernetesOptions {
    pub kubeconfig: Option<PathBuf>,
    /// Kubeconfig context to use instead of the current one
    pub context: Option<String>,
    pub in_cluster: bool,
}

/// What to synchronize.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SyncOptions {
    /// Namespace of the ingress Service
    pub namespace: String,
    /// Name of the ingress Service
    pub service_name: String,
    /// Ports kept on the Service regardless of Gateways (validated to 1-65535)
    pub default_ports: Vec<u32>,
    pub ignore_key: String,
    pub resync_period_secs: u64,
    pub workers: usize,
    pub max_retries: u32,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_SERVICE_NAMESPACE.to_string(),
            service_name: DEFAULT_SERVICE_NAME.to_string(),
            default_ports: DEFAULT_EXPOSED_PORTS.iter().map(|p| u32::from(*p)).collect(),
            ignore_key: DEFAULT_IGNORE_KEY.to_string(),
            resync_period_secs: DEFAULT_RESYNC_PERIOD_SECS,
            workers: DEFAULT_WORKERS,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

impl SyncOptions {
    /// Engine parameters. Out-of-range default ports are dropped; `validate` reports them.
    #[must_use]
    pub fn sync_target(&self) -> SyncTarget {
        SyncTarget {
            namespace: self.namespace.clone(),
            service_name: self.service_name.clone(),
            default_ports: self
                .default_ports
                .iter()
                .filter_map(|p| u16::try_from(*p).ok().filter(|p| *p != 0))
                .collect(),
            ignore_key: self.ignore_key.clone(),
        }
    }

    #[must_use]
    pub fn resync_period(&self) -> Duration {
        Duration::from_secs(self.resync_period_secs)
    }
}

/// Prometheus endpoint settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MetricsOptions {
    pub enabled: bool,
    pub bind_address: String,
    pub port: u16,
}

impl Default for MetricsOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: METRICS_SERVER_BIND_ADDRESS.to_string(),
            port: METRICS_SERVER_PORT,
        }
    }
}

impl Config {
    /// Read a YAML file. Missing sections and fields take their defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Read`] or [`ConfigError::Parse`].
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Parse YAML text. An empty document yields the defaults.
    ///
    /// # Errors
    ///
    /// Returns the YAML error for malformed input.
    pub fn from_yaml(raw: &str) -> Result<Self, serde_yaml::Error> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(raw)
    }

    /// Check every setting and report all violations at once.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] listing each problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();

        if self.sync.namespace.trim().is_empty() {
            errors.push("sync.namespace must be specified".to_string());
        }
        if self.sync.service_name.trim().is_empty() {
            errors.push("sync.serviceName must be specified".to_string());
        }
        for port in &self.sync.default_ports {
            if !(1..=65535).contains(port) {
                errors.push(format!("sync.defaultPorts: {port} is not a valid TCP port"));
            }
        }
        if self.sync.ignore_key.trim().is_empty() {
            errors.push("sync.ignoreKey must be specified".to_string());
        }
        if self.sync.workers == 0 {
            errors.push("sync.workers must be at least 1".to_string());
        }
        if self.sync.resync_period_secs == 0 {
            errors.push("sync.resyncPeriodSecs must be positive".to_string());
        }

        if self.manager.leader_election {
            if self.manager.leader_election_id.trim().is_empty() {
                errors.push("manager.leaderElectionId must be specified".to_string());
            }
            let m = &self.manager;
            if m.retry_period_secs == 0 {
                errors.push("manager.retryPeriodSecs must be positive".to_string());
            }
            if m.renew_deadline_secs >= m.lease_duration_secs {
                errors.push(format!(
                    "manager.renewDeadlineSecs ({}) must be less than manager.leaseDurationSecs ({})",
                    m.renew_deadline_secs, m.lease_duration_secs
                ));
            }
            if m.retry_period_secs >= m.renew_deadline_secs {
                errors.push(format!(
                    "manager.retryPeriodSecs ({}) must be less than manager.renewDeadlineSecs ({})",
                    m.retry_period_secs, m.renew_deadline_secs
                ));
            }
        }

        if let Some(kubeconfig) = &self.kubernetes.kubeconfig {
            if !kubeconfig.is_file() {
                errors.push(format!(
                    "kubernetes.kubeconfig: {} does not exist",
                    kubeconfig.display()
                ));
            }
        }

        if self.metrics.enabled && self.metrics.port == 0 {
            errors.push("metrics.port must be positive".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(errors))
        }
    }
}

/// Namespace the controller runs in: explicit value, else the service account
/// namespace, else `default`.
#[must_use]
pub fn detect_namespace(explicit: &str) -> String {
    detect_namespace_from(explicit, Path::new(SERVICE_ACCOUNT_NAMESPACE_FILE))
}

pub(crate) fn detect_namespace_from(explicit: &str, service_account_file: &Path) -> String {
    if !explicit.trim().is_empty() {
        return explicit.trim().to_string();
    }
    std::fs::read_to_string(service_account_file)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "default".to_string())
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod config_tests;
