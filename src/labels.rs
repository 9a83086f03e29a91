// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Label and annotation keys understood or written by the controller.

// ============================================================================
// Kubernetes Standard Labels
// https://kubernetes.io/docs/concepts/overview/working-with-objects/common-labels/
// ============================================================================

/// Standard label for the tool being used to manage the operation of an application
pub const K8S_MANAGED_BY: &str = "app.kubernetes.io/managed-by";

/// Value for `app.kubernetes.io/managed-by` on objects written by this controller
pub const MANAGED_BY_GATEPORT: &str = "gateport";

// ============================================================================
// Gateport-Specific Labels / Annotations
// ============================================================================

/// Default label/annotation key that opts a Gateway out of port synchronization.
///
/// A Gateway carrying this key with the value `"true"`, either as a label or as an
/// annotation, contributes no ports to the ingress Service.
pub const DEFAULT_IGNORE_KEY: &str = "gateport.io/ignore";

/// The only value of the ignore key that excludes a Gateway
pub const IGNORE_VALUE: &str = "true";
