// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Gateway watch source.
//!
//! A single cluster-wide watch over `Gateway` resources feeds the reflector cache the
//! reconciliation engine reads from, and turns every change into a reconcile key on
//! the [`ChangeQueue`]. The kube-runtime watcher performs the initial list, keeps the
//! resume cursor (bookmarks included) and re-lists with backoff after stream errors.
//!
//! Raw watcher events are decoded once, here, into [`GatewayEvent`]s. A
//! [`WatchTracker`] remembers what has been seen so it can tell additions from
//! modifications and report objects that vanished while the watch was down.

use crate::crd::{Gateway, GatewayDeclaration};
use crate::metrics;
use crate::queue::{ChangeQueue, ReconcileKey};
use futures::StreamExt;
use kube::runtime::reflector::store::Writer;
use kube::runtime::{watcher, WatchStreamExt};
use kube::Api;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A decoded Gateway change.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GatewayEvent {
    Added(GatewayDeclaration),
    Modified(GatewayDeclaration),
    Deleted(GatewayDeclaration),
    /// A full list completed; `count` Gateways are known.
    Resynced { count: usize },
    /// The watch (re)started a full list.
    Restarted,
}

impl GatewayEvent {
    /// Label used in logs and metrics.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Added(_) => "added",
            Self::Modified(_) => "modified",
            Self::Deleted(_) => "deleted",
            Self::Resynced { .. } => "resynced",
            Self::Restarted => "restarted",
        }
    }

    /// Whether this event should schedule a reconciliation.
    #[must_use]
    pub fn triggers_reconcile(&self) -> bool {
        !matches!(self, Self::Restarted)
    }
}

/// Tracks the Gateways seen on the watch.
#[derive(Debug, Default)]
pub struct WatchTracker {
    known: HashMap<String, GatewayDeclaration>,
    relisting: Option<HashSet<String>>,
}

impl WatchTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of Gateways currently known.
    #[must_use]
    pub fn len(&self) -> usize {
        self.known.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.known.is_empty()
    }

    /// Decode one watcher event.
    pub fn observe(&mut self, event: &watcher::Event<Gateway>) -> Vec<GatewayEvent> {
        match event {
            watcher::Event::Apply(gateway) => {
                let declaration = GatewayDeclaration::from_gateway(gateway);
                match self.known.insert(declaration.key(), declaration.clone()) {
                    None => vec![GatewayEvent::Added(declaration)],
                    Some(_) => vec![GatewayEvent::Modified(declaration)],
                }
            }
            watcher::Event::Delete(gateway) => {
                let declaration = GatewayDeclaration::from_gateway(gateway);
                self.known.remove(&declaration.key());
                vec![GatewayEvent::Deleted(declaration)]
            }
            watcher::Event::Init => {
                self.relisting = Some(HashSet::new());
                vec![GatewayEvent::Restarted]
            }
            watcher::Event::InitApply(gateway) => {
                let declaration = GatewayDeclaration::from_gateway(gateway);
                let key = declaration.key();
                if let Some(seen) = self.relisting.as_mut() {
                    seen.insert(key.clone());
                }
                match self.known.insert(key, declaration.clone()) {
                    None => vec![GatewayEvent::Added(declaration)],
                    Some(previous) if previous != declaration => {
                        vec![GatewayEvent::Modified(declaration)]
                    }
                    Some(_) => Vec::new(),
                }
            }
            watcher::Event::InitDone => {
                let seen = self.relisting.take().unwrap_or_default();
                let vanished: Vec<String> = self
                    .known
                    .keys()
                    .filter(|key| !seen.contains(*key))
                    .cloned()
                    .collect();

                let mut events: Vec<GatewayEvent> = vanished
                    .iter()
                    .filter_map(|key| self.known.remove(key))
                    .map(GatewayEvent::Deleted)
                    .collect();
                events.push(GatewayEvent::Resynced {
                    count: self.known.len(),
                });
                events
            }
        }
    }
}

fn log_event(event: &GatewayEvent) {
    match event {
        GatewayEvent::Added(gw) => {
            info!(gateway = %gw.key(), ports = %gw.port_summary(), "Gateway added");
        }
        GatewayEvent::Modified(gw) => {
            info!(gateway = %gw.key(), ports = %gw.port_summary(), "Gateway modified");
        }
        GatewayEvent::Deleted(gw) => {
            info!(gateway = %gw.key(), ports = %gw.port_summary(), "Gateway deleted");
        }
        GatewayEvent::Resynced { count } => {
            info!(gateways = count, "Gateway list synchronized");
        }
        GatewayEvent::Restarted => debug!("Gateway watch listing from scratch"),
    }
}

/// Pump the Gateway watch into the reflector store and the change queue.
///
/// Runs until `cancel` fires. Stream errors are logged and counted; the watcher
/// re-establishes the stream by itself with backoff.
pub async fn run_gateway_watch(
    api: Api<Gateway>,
    writer: Writer<Gateway>,
    queue: Arc<ChangeQueue<ReconcileKey>>,
    key: ReconcileKey,
    cancel: CancellationToken,
) {
    info!("Starting Gateway watch");

    let stream = watcher(api, watcher::Config::default())
        .default_backoff()
        .reflect(writer);
    futures::pin_mut!(stream);

    let mut tracker = WatchTracker::new();
    loop {
        let next = tokio::select! {
            () = cancel.cancelled() => break,
            next = stream.next() => next,
        };

        match next {
            Some(Ok(event)) => {
                for decoded in tracker.observe(&event) {
                    log_event(&decoded);
                    metrics::record_watch_event(decoded.kind());
                    if decoded.triggers_reconcile() {
                        queue.enqueue(key.clone());
                    }
                }
            }
            Some(Err(e)) => {
                warn!(error = %e, "Gateway watch failed, restarting with backoff");
                metrics::record_watch_error();
            }
            None => {
                warn!("Gateway watch stream ended");
                break;
            }
        }
    }

    info!("Gateway watch stopped");
}

/// Enqueue `key` every `period` until `cancel` fires.
pub async fn run_resync(
    queue: Arc<ChangeQueue<ReconcileKey>>,
    key: ReconcileKey,
    period: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // first tick completes immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {
                debug!(key = %key, "Periodic resync");
                queue.enqueue(key.clone());
            }
        }
    }
}

#[cfg(test)]
#[path = "watcher_tests.rs"]
mod watcher_tests;
