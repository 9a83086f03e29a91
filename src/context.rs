// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Shared context for the controller and its reflector store.
//!
//! The controller receives an `Arc<Context>` holding the Kubernetes client, the validated
//! configuration and the identity this replica campaigns with. Each leadership term
//! builds a fresh [`Stores`] whose Gateway cache is fed by the watch source and read by
//! the reconciliation engine without API calls.

use crate::config::Config;
use crate::crd::{Gateway, GatewayDeclaration};
use crate::reconcilers::GatewayLister;
use kube::runtime::reflector::store::Writer;
use kube::runtime::reflector::Store;
use kube::Client;
use std::sync::Arc;

/// Shared context passed to the controller.
#[derive(Clone)]
pub struct Context {
    /// Kubernetes client for API operations
    pub client: Client,

    /// Validated configuration
    pub config: Arc<Config>,

    /// Lease holder identity of this replica
    pub identity: String,
}

impl Context {
    #[must_use]
    pub fn new(client: Client, config: Config, identity: impl Into<String>) -> Self {
        Self {
            client,
            config: Arc::new(config),
            identity: identity.into(),
        }
    }
}

/// Reflector stores read by the reconciliation engine.
#[derive(Clone)]
pub struct Stores {
    pub gateways: Store<Gateway>,
}

impl Stores {
    /// Create empty stores and the writer that populates them.
    #[must_use]
    pub fn new() -> (Self, Writer<Gateway>) {
        let writer = Writer::default();
        let stores = Self {
            gateways: writer.as_reader(),
        };
        (stores, writer)
    }

    /// Number of Gateways in the cache.
    #[must_use]
    pub fn gateway_count(&self) -> usize {
        self.gateways.state().len()
    }
}

impl GatewayLister for Stores {
    fn list_gateways(&self) -> Vec<GatewayDeclaration> {
        self.gateways.list_gateways()
    }
}

#[cfg(test)]
#[path = "context_tests.rs"]
mod context_tests;
