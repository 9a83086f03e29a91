// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Typed binding for the mesh `Gateway` custom resource.
//!
//! The controller only ever *reads* Gateways, so this module binds the subset of the
//! `networking.istio.io/v1alpha3` schema needed to find declared ports. Fields the
//! controller does not care about (TLS settings, default endpoints, ...) are dropped
//! during deserialization.
//!
//! # Example
//!
//! ```rust
//! use gateport::crd::{Gateway, GatewayDeclaration, GatewaySpec, Port, Server};
//!
//! let mut gateway = Gateway::new(
//!     "public",
//!     GatewaySpec {
//!         servers: vec![Server {
//!             port: Some(Port {
//!                 number: 9000,
//!                 protocol: "HTTP".to_string(),
//!                 name: "http-9000".to_string(),
//!                 target_port: None,
//!             }),
//!             hosts: vec!["*".to_string()],
//!             name: None,
//!         }],
//!         selector: Default::default(),
//!     },
//! );
//! gateway.metadata.namespace = Some("apps".to_string());
//!
//! let declaration = GatewayDeclaration::from_gateway(&gateway);
//! assert_eq!(declaration.servers[0].port_number, 9000);
//! ```

use crate::labels::IGNORE_VALUE;
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Specification of a mesh ingress `Gateway`.
///
/// Describes a load balancer operating at the edge of the mesh that receives
/// incoming connections. Each entry of `servers` exposes one port.
#[derive(CustomResource, Clone, Debug, Default, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "networking.istio.io",
    version = "v1alpha3",
    kind = "Gateway",
    namespaced,
    shortname = "gw",
    doc = "Mesh ingress Gateway declaring the ports an ingress proxy accepts"
)]
#[serde(rename_all = "camelCase")]
pub struct GatewaySpec {
    /// Servers exposed by this gateway, one per port/protocol/host set.
    #[serde(default)]
    pub servers: Vec<Server>,

    /// Labels selecting the ingress proxy pods this configuration applies to.
    #[serde(default)]
    pub selector: BTreeMap<String, String>,
}

/// A single server block of a Gateway.
#[derive(Clone, Debug, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Server {
    /// The port on which the proxy should listen for incoming connections.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<Port>,

    /// Hosts exposed by this server.
    #[serde(default)]
    pub hosts: Vec<String>,

    /// Optional server name, used for monitoring.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// Port declaration of a Gateway server.
#[derive(Clone, Debug, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Port {
    /// Port number. Values outside 1-65535 are carried through and rejected later.
    #[serde(default)]
    pub number: u32,

    /// Protocol exposed on the port (`HTTP`, `HTTPS`, `GRPC`, `HTTP2`, `MONGO`, `TCP`, `TLS`).
    #[serde(default)]
    pub protocol: String,

    /// Label assigned to the port.
    #[serde(default)]
    pub name: String,

    /// Port on the workload the traffic is forwarded to (deprecated upstream).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_port: Option<u32>,
}

/// One declared server port, flattened out of a Gateway.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerPort {
    /// Declared port number, not yet range-checked
    pub port_number: u32,
    /// Declared protocol, as written on the Gateway
    pub protocol: String,
    /// Declared port name
    pub port_name: String,
}

/// Read-only view of a Gateway: identity, metadata and declared server ports.
///
/// This is the only shape of Gateway the reconciliation logic consumes. It is decoded
/// once at the watch boundary so downstream code never deals with raw API objects.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GatewayDeclaration {
    pub name: String,
    pub namespace: String,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    pub servers: Vec<ServerPort>,
}

impl GatewayDeclaration {
    /// Build the declaration view of a Gateway. Servers without a port are skipped.
    #[must_use]
    pub fn from_gateway(gateway: &Gateway) -> Self {
        let servers = gateway
            .spec
            .servers
            .iter()
            .filter_map(|server| server.port.as_ref())
            .map(|port| ServerPort {
                port_number: port.number,
                protocol: port.protocol.clone(),
                port_name: port.name.clone(),
            })
            .collect();

        Self {
            name: gateway.name_any(),
            namespace: gateway.namespace().unwrap_or_default(),
            labels: gateway.labels().clone(),
            annotations: gateway.annotations().clone(),
            servers,
        }
    }

    /// `namespace/name` identifier used in logs.
    #[must_use]
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }

    /// Whether the Gateway opted out of port synchronization.
    ///
    /// The Gateway is ignored when `ignore_key` is present as a label *or* an
    /// annotation with the exact value `"true"`.
    #[must_use]
    pub fn is_ignored(&self, ignore_key: &str) -> bool {
        self.labels.get(ignore_key).map(String::as_str) == Some(IGNORE_VALUE)
            || self.annotations.get(ignore_key).map(String::as_str) == Some(IGNORE_VALUE)
    }

    /// Comma-separated list of declared port numbers, for event logging.
    #[must_use]
    pub fn port_summary(&self) -> String {
        self.servers
            .iter()
            .map(|server| server.port_number.to_string())
            .collect::<Vec<_>>()
            .join(",")
    }
}

#[cfg(test)]
#[path = "crd_tests.rs"]
mod crd_tests;
