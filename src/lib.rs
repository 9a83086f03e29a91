// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! # gateport - Ingress Gateway Port Sync for Kubernetes
//!
//! gateport is a Kubernetes controller that keeps the ports of a mesh ingress gateway
//! `LoadBalancer` Service in sync with the ports declared by Istio `Gateway` resources
//! across the cluster.
//!
//! ## Overview
//!
//! - A cluster-wide watch over `Gateway` resources feeds an in-memory cache
//! - Every change schedules one coalesced reconciliation of the ingress Service
//! - The reconciliation merges all declared ports with a fixed set of default ports
//!   and writes the Service back only when its port list actually differs
//! - Replicas elect a single active leader through a coordination `Lease`
//!
//! ## Modules
//!
//! - [`crd`] - `Gateway` resource types and the declaration view used for reconciling
//! - [`reconcilers`] - Port merge logic and the Service reconciliation engine
//! - [`queue`] - Coalescing, rate-limited change queue
//! - [`watcher`] - Gateway watch source and periodic resync
//! - [`leader_election`] - Lease-based leader election
//! - [`controller`] - Wiring of the above for each leadership term
//! - [`config`] - Configuration file and validation
//!
//! ## Example
//!
//! ```rust
//! use gateport::crd::{GatewayDeclaration, ServerPort};
//! use gateport::reconcilers::desired_ports;
//!
//! let gateway = GatewayDeclaration {
//!     name: "web".to_string(),
//!     namespace: "apps".to_string(),
//!     servers: vec![ServerPort {
//!         port_number: 8443,
//!         protocol: "HTTPS".to_string(),
//!         port_name: "https-web".to_string(),
//!     }],
//!     ..Default::default()
//! };
//!
//! let desired = desired_ports(&[gateway], &[80, 443, 15021], "gateport.io/ignore");
//! assert_eq!(desired.get(&8443).map(String::as_str), Some("https-8443"));
//! ```

pub mod config;
pub mod constants;
pub mod context;
pub mod controller;
pub mod crd;
pub mod errors;
pub mod labels;
pub mod leader_election;
pub mod metrics;
pub mod queue;
pub mod reconcilers;
pub mod version;
pub mod watcher;
