// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Port arithmetic for the ingress Service: desired set, labels and the diff plan.
//!
//! Everything in this module is pure. The reconciler feeds it the Gateway
//! declarations from the watch cache and the live Service port list, and gets back
//! the complete new port list plus the actions that produced it.
//!
//! # Label rule
//!
//! A port declared by Gateways is labelled with its lower-cased protocol followed by
//! the port number (`http-9000`). When several Gateways declare the same port with
//! different protocols the labels merge: distinct protocols, newest first, share one
//! prefix (`tls-http-9000`). Labels never exceed 15 characters; the protocol prefix
//! is shortened so the `-<port>` suffix survives, which keeps names unique.
//!
//! ```rust
//! use gateport::reconcilers::ports::port_label;
//!
//! assert_eq!(port_label(&["http".to_string()], 9000), "http-9000");
//! assert_eq!(port_label(&["http".to_string(), "tls".to_string()], 9000), "tls-http-9000");
//! assert_eq!(
//!     port_label(&["http".to_string(), "tls".to_string(), "grpc".to_string()], 10443),
//!     "grpc-tls-10443"
//! );
//! ```

use crate::constants::{FALLBACK_PORT_PROTOCOL, MAX_PORT_NAME_LEN, SERVICE_PORT_PROTOCOL};
use crate::crd::GatewayDeclaration;
use k8s_openapi::api::core::v1::ServicePort;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Port number to derived label, recomputed on every pass.
pub type DesiredPortSet = BTreeMap<u16, String>;

/// What happened to one Service port.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PortActionKind {
    Add,
    Update,
    Delete,
}

impl PortActionKind {
    /// Lower-case name used in logs and metrics.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

impl fmt::Display for PortActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One change applied to the Service port list.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PortAction {
    pub kind: PortActionKind,
    pub port: i32,
    /// Name after the change (`None` for deletions of unnamed ports)
    pub name: Option<String>,
    /// Name before an update
    pub previous_name: Option<String>,
}

impl fmt::Display for PortAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}->{}", self.kind, self.port)
    }
}

/// Result of diffing the live port list against the desired set.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PortPlan {
    /// Complete new port list
    pub ports: Vec<ServicePort>,
    /// Changes relative to the live list, in the order they were decided
    pub actions: Vec<PortAction>,
}

impl PortPlan {
    /// Number of actions of a given kind.
    #[must_use]
    pub fn count(&self, kind: PortActionKind) -> usize {
        self.actions.iter().filter(|a| a.kind == kind).count()
    }
}

/// Range-check a declared port and drop default ports.
///
/// Returns `None` for numbers outside 1–65535 and for ports that are statically exposed.
#[must_use]
pub fn effective_port(number: u32, default_ports: &[u16]) -> Option<u16> {
    let port = u16::try_from(number).ok().filter(|p| *p != 0)?;
    (!default_ports.contains(&port)).then_some(port)
}

/// Normalize a declared protocol into a label fragment.
///
/// Lower-cased, restricted to ASCII alphanumerics; empty protocols become `tcp`.
#[must_use]
pub fn normalize_protocol(protocol: &str) -> String {
    let normalized: String = protocol
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .map(|c| c.to_ascii_lowercase())
        .collect();
    if normalized.is_empty() {
        FALLBACK_PORT_PROTOCOL.to_string()
    } else {
        normalized
    }
}

/// Build the label for a port from its protocols, given in first-seen order.
#[must_use]
pub fn port_label(protocols: &[String], port: u16) -> String {
    let suffix = format!("-{port}");
    let mut prefix = protocols
        .iter()
        .rev()
        .map(String::as_str)
        .collect::<Vec<_>>()
        .join("-");
    if prefix.is_empty() {
        prefix = FALLBACK_PORT_PROTOCOL.to_string();
    }

    let budget = MAX_PORT_NAME_LEN - suffix.len();
    if prefix.len() > budget {
        prefix = prefix.chars().take(budget).collect();
        while prefix.ends_with('-') {
            prefix.pop();
        }
    }

    format!("{prefix}{suffix}")
}

/// Compute the desired port set from every non-ignored Gateway.
///
/// Gateways are visited in `(namespace, name)` order so merged labels are
/// deterministic regardless of cache iteration order.
#[must_use]
pub fn desired_ports(
    gateways: &[GatewayDeclaration],
    default_ports: &[u16],
    ignore_key: &str,
) -> DesiredPortSet {
    let mut ordered: Vec<&GatewayDeclaration> = gateways.iter().collect();
    ordered.sort_by(|a, b| (&a.namespace, &a.name).cmp(&(&b.namespace, &b.name)));

    let mut protocols: BTreeMap<u16, Vec<String>> = BTreeMap::new();
    for gateway in ordered {
        if gateway.is_ignored(ignore_key) {
            continue;
        }
        for server in &gateway.servers {
            let Some(port) = effective_port(server.port_number, default_ports) else {
                continue;
            };
            let protocol = normalize_protocol(&server.protocol);
            let seen = protocols.entry(port).or_default();
            if !seen.contains(&protocol) {
                seen.push(protocol);
            }
        }
    }

    protocols
        .into_iter()
        .map(|(port, protos)| (port, port_label(&protos, port)))
        .collect()
}

fn managed_port(port: u16, name: String) -> ServicePort {
    ServicePort {
        name: Some(name),
        port: i32::from(port),
        protocol: Some(SERVICE_PORT_PROTOCOL.to_string()),
        ..Default::default()
    }
}

fn is_tcp(port: &ServicePort) -> bool {
    port.protocol
        .as_deref()
        .is_none_or(|p| p == SERVICE_PORT_PROTOCOL)
}

/// Diff the live port list against the desired set.
///
/// - default ports are retained untouched; missing ones are appended as `tcp-<port>`
/// - desired ports already present are kept, renamed when the label changed
/// - other ports are removed, as are repeated entries for the same port number
/// - newly desired ports are appended in ascending port order
#[must_use]
pub fn plan_service_ports(
    current: &[ServicePort],
    desired: &DesiredPortSet,
    default_ports: &[u16],
) -> PortPlan {
    let is_default = |port: i32| u16::try_from(port).is_ok_and(|p| default_ports.contains(&p));

    let mut remaining = desired.clone();
    let mut seen: BTreeSet<i32> = BTreeSet::new();
    let mut plan = PortPlan::default();

    for existing in current {
        if is_default(existing.port) {
            seen.insert(existing.port);
            plan.ports.push(existing.clone());
            continue;
        }

        if !seen.insert(existing.port) {
            plan.actions.push(PortAction {
                kind: PortActionKind::Delete,
                port: existing.port,
                name: existing.name.clone(),
                previous_name: None,
            });
            continue;
        }

        let wanted = u16::try_from(existing.port)
            .ok()
            .and_then(|p| remaining.remove(&p));

        match wanted {
            Some(name) => {
                let mut kept = existing.clone();
                if kept.name.as_deref() != Some(name.as_str()) || !is_tcp(&kept) {
                    plan.actions.push(PortAction {
                        kind: PortActionKind::Update,
                        port: kept.port,
                        name: Some(name.clone()),
                        previous_name: kept.name.clone(),
                    });
                    kept.name = Some(name);
                    kept.protocol = Some(SERVICE_PORT_PROTOCOL.to_string());
                }
                plan.ports.push(kept);
            }
            None => plan.actions.push(PortAction {
                kind: PortActionKind::Delete,
                port: existing.port,
                name: existing.name.clone(),
                previous_name: None,
            }),
        }
    }

    let defaults: BTreeSet<u16> = default_ports.iter().copied().collect();
    for port in defaults {
        if seen.insert(i32::from(port)) {
            let name = format!("{FALLBACK_PORT_PROTOCOL}-{port}");
            plan.actions.push(PortAction {
                kind: PortActionKind::Add,
                port: i32::from(port),
                name: Some(name.clone()),
                previous_name: None,
            });
            plan.ports.push(managed_port(port, name));
        }
    }

    for (port, name) in remaining {
        if !seen.insert(i32::from(port)) {
            continue;
        }
        plan.actions.push(PortAction {
            kind: PortActionKind::Add,
            port: i32::from(port),
            name: Some(name.clone()),
            previous_name: None,
        });
        plan.ports.push(managed_port(port, name));
    }

    plan
}

/// Order-insensitive comparison on `(port, protocol, name)`.
///
/// An absent protocol compares equal to `TCP`, the API server default.
#[must_use]
pub fn ports_equivalent(a: &[ServicePort], b: &[ServicePort]) -> bool {
    fn key_set(ports: &[ServicePort]) -> BTreeSet<(i32, &str, &str)> {
        ports
            .iter()
            .map(|p| {
                (
                    p.port,
                    p.protocol.as_deref().unwrap_or(SERVICE_PORT_PROTOCOL),
                    p.name.as_deref().unwrap_or_default(),
                )
            })
            .collect()
    }

    a.len() == b.len() && key_set(a) == key_set(b)
}

#[cfg(test)]
#[path = "ports_tests.rs"]
mod ports_tests;
