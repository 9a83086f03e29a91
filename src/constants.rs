// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Global constants for the gateport controller.
//!
//! This module contains all numeric and string constants used throughout the codebase.
//! Constants are organized by category for easy maintenance.

// ============================================================================
// API Constants
// ============================================================================

/// API group of the mesh `Gateway` custom resource
pub const GATEWAY_API_GROUP: &str = "networking.istio.io";

/// API version of the mesh `Gateway` custom resource
pub const GATEWAY_API_VERSION: &str = "v1alpha3";

/// Kind name for the `Gateway` resource
pub const KIND_GATEWAY: &str = "Gateway";

/// Field manager recorded on Service and Lease writes
pub const FIELD_MANAGER: &str = "gateport";

// ============================================================================
// Ingress Service Defaults
// ============================================================================

/// Default namespace of the ingress gateway Service
pub const DEFAULT_SERVICE_NAMESPACE: &str = "istio-system";

/// Default name of the ingress gateway Service
pub const DEFAULT_SERVICE_NAME: &str = "istio-ingressgateway";

/// Ports that are always exposed, regardless of Gateway declarations
/// (HTTP, HTTPS and the proxy health-check port).
pub const DEFAULT_EXPOSED_PORTS: [u16; 3] = [80, 443, 15021];

/// Maximum length of a Service port name (IANA service name limit)
pub const MAX_PORT_NAME_LEN: usize = 15;

/// Protocol assumed for a Gateway server that does not declare one
pub const FALLBACK_PORT_PROTOCOL: &str = "tcp";

/// Service port protocol used for every managed port
pub const SERVICE_PORT_PROTOCOL: &str = "TCP";

// ============================================================================
// Controller Error Handling Constants
// ============================================================================

/// Delay before retrying when the ingress Service does not exist yet (5 seconds)
pub const SERVICE_NOT_FOUND_REQUEUE_SECS: u64 = 5;

/// Interval between attempts to fetch the ingress Service at startup (5 seconds)
pub const SERVICE_WAIT_INTERVAL_SECS: u64 = 5;

/// How many times a conflicting Service update restarts the reconcile pass
pub const MAX_CONFLICT_RETRIES: u32 = 5;

/// Per-item attempt cap before a failing reconcile key is dropped
pub const DEFAULT_MAX_RETRIES: u32 = 15;

/// Period of the full resync that heals missed watch events (10 minutes)
pub const DEFAULT_RESYNC_PERIOD_SECS: u64 = 600;

/// Number of reconcile workers draining the change queue
pub const DEFAULT_WORKERS: usize = 1;

// ============================================================================
// Leader Election Constants
// ============================================================================

/// Default name of the leader election lease
pub const DEFAULT_LEASE_NAME: &str = "gateport-controller-leader";

/// Manager mode lease duration (30 seconds)
pub const MANAGER_LEASE_DURATION_SECS: u64 = 30;

/// Manager mode renew deadline (15 seconds)
pub const MANAGER_LEASE_RENEW_DEADLINE_SECS: u64 = 15;

/// Manager mode retry period (5 seconds)
pub const MANAGER_LEASE_RETRY_PERIOD_SECS: u64 = 5;

/// Standalone mode lease duration (15 seconds)
pub const STANDALONE_LEASE_DURATION_SECS: u64 = 15;

/// Standalone mode renew deadline (10 seconds)
pub const STANDALONE_LEASE_RENEW_DEADLINE_SECS: u64 = 10;

/// Standalone mode retry period (5 seconds)
pub const STANDALONE_LEASE_RETRY_PERIOD_SECS: u64 = 5;

/// File holding the namespace of the pod's service account
pub const SERVICE_ACCOUNT_NAMESPACE_FILE: &str =
    "/var/run/secrets/kubernetes.io/serviceaccount/namespace";

// ============================================================================
// Runtime Constants
// ============================================================================

/// Number of worker threads for Tokio runtime
pub const TOKIO_WORKER_THREADS: usize = 4;

/// Default location of the manager configuration file
pub const DEFAULT_CONFIG_PATH: &str = "/etc/gateport/config.yaml";

// ============================================================================
// Metrics Server Constants
// ============================================================================

/// Port for Prometheus metrics HTTP server
pub const METRICS_SERVER_PORT: u16 = 8080;

/// Path for Prometheus metrics endpoint
pub const METRICS_SERVER_PATH: &str = "/metrics";

/// Path for the liveness endpoint
pub const HEALTH_SERVER_PATH: &str = "/healthz";

/// Bind address for metrics HTTP server
pub const METRICS_SERVER_BIND_ADDRESS: &str = "0.0.0.0";
