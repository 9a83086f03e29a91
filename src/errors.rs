// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Error types for reconciliation and Kubernetes API error classification.
//!
//! Reconciliation failures are split into the cases the worker loop treats
//! differently:
//!
//! | Variant | Worker reaction |
//! |---------|-----------------|
//! | [`ReconcileError::ServiceNotFound`] | requeue after a fixed delay, attempts not counted |
//! | [`ReconcileError::Conflict`] | rate-limited requeue (already retried in-pass) |
//! | [`ReconcileError::Kube`] | rate-limited requeue, dropped after the attempt cap |
//!
//! # Example
//!
//! ```rust
//! use gateport::errors::{is_conflict, is_not_found};
//!
//! let err = kube::Error::Api(Box::new(kube::core::Status {
//!     message: "services \"istio-ingressgateway\" not found".to_string(),
//!     reason: "NotFound".to_string(),
//!     code: 404,
//!     ..Default::default()
//! }));
//! assert!(is_not_found(&err));
//! assert!(!is_conflict(&err));
//! ```

use thiserror::Error;

/// Errors produced by a single reconcile pass over the ingress Service.
#[derive(Error, Debug)]
pub enum ReconcileError {
    /// The ingress Service does not exist (yet).
    ///
    /// The Service is provisioned by a separate process and may appear after the
    /// controller starts. Not fatal: the key is retried after a fixed delay.
    #[error("ingress service {namespace}/{name} not found")]
    ServiceNotFound {
        /// Namespace of the ingress Service
        namespace: String,
        /// Name of the ingress Service
        name: String,
    },

    /// Every attempt to write the Service hit a stale `resourceVersion`.
    #[error("update of service {namespace}/{name} conflicted {attempts} times in a row")]
    Conflict {
        /// Namespace of the ingress Service
        namespace: String,
        /// Name of the ingress Service
        name: String,
        /// Number of full passes attempted
        attempts: u32,
    },

    /// Any other Kubernetes API failure.
    #[error("kubernetes API error: {0}")]
    Kube(#[from] kube::Error),
}

impl ReconcileError {
    /// Whether the error means the ingress Service is missing.
    #[must_use]
    pub fn is_service_not_found(&self) -> bool {
        matches!(self, Self::ServiceNotFound { .. })
    }

    /// Whether the error is an exhausted update conflict.
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    /// Short category label used for the error metric.
    #[must_use]
    pub fn category(&self) -> &'static str {
        match self {
            Self::ServiceNotFound { .. } => "service_not_found",
            Self::Conflict { .. } => "conflict",
            Self::Kube(kube::Error::Api(_)) => "api_error",
            Self::Kube(_) => "network_error",
        }
    }
}

/// Whether a Kubernetes error is an HTTP 404.
#[must_use]
pub fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 404)
}

/// Whether a Kubernetes error is an HTTP 409 (stale `resourceVersion` or already exists).
#[must_use]
pub fn is_conflict(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 409)
}

/// Whether a Kubernetes error is an authentication or authorization failure (401/403).
///
/// These never heal by retrying and are treated as fatal wherever they can block
/// the controller forever (leader election).
#[must_use]
pub fn is_forbidden(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 401 || ae.code == 403)
}

#[cfg(test)]
#[path = "errors_tests.rs"]
mod errors_tests;
