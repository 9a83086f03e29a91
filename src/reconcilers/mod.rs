// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Reconciliation of the ingress gateway Service against declared Gateway ports.
//!
//! # Reconciliation Architecture
//!
//! The controller follows the level-triggered Kubernetes controller pattern:
//!
//! 1. **Observe** - Gateways are mirrored into a local cache by the watcher
//! 2. **Compute** - The desired port set is derived from *all* cached Gateways
//! 3. **Diff** - The desired set is compared with the live Service port list
//! 4. **Update** - The Service is replaced only when the port list differs
//!
//! # Modules
//!
//! - [`ports`] - Pure port arithmetic (labels, desired set, diff plan)
//! - [`ingress_service`] - The reconciliation engine and its cluster seams
//! - [`retry`] - Retry policies and the retry combinator
//!
//! # Example: Running a Pass
//!
//! ```rust,no_run
//! use gateport::crd::Gateway;
//! use gateport::reconcilers::{KubeServiceApi, PortReconciler, SyncTarget};
//! use kube::runtime::reflector;
//!
//! # async fn example(client: kube::Client) -> anyhow::Result<()> {
//! let (store, _writer) = reflector::store::<Gateway>();
//! let engine = PortReconciler::new(
//!     KubeServiceApi::new(client, "gateport"),
//!     store,
//!     SyncTarget {
//!         namespace: "istio-system".to_string(),
//!         service_name: "istio-ingressgateway".to_string(),
//!         default_ports: vec![80, 443, 15021],
//!         ignore_key: "gateport.io/ignore".to_string(),
//!     },
//! );
//!
//! let outcome = engine.reconcile().await?;
//! println!("{outcome:?}");
//! # Ok(())
//! # }
//! ```

pub mod ingress_service;
pub mod ports;
pub mod retry;

pub use ingress_service::{
    GatewayLister, KubeServiceApi, PortReconciler, ReconcileOutcome, ServiceApi, SyncTarget,
};
pub use ports::{desired_ports, plan_service_ports, ports_equivalent, PortAction, PortPlan};
