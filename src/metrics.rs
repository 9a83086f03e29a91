// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Prometheus metrics for the gateport controller.
//!
//! All metrics carry the `gateport` prefix and live in [`METRICS_REGISTRY`], which is
//! exposed over HTTP by [`serve`] at `/metrics` next to a `/healthz` probe.
//!
//! # Metrics Categories
//!
//! - **Reconciliation Metrics** - Outcomes, durations and requeues of port syncs
//! - **Service Metrics** - Ports on the ingress Service and the edits applied to it
//! - **Queue Metrics** - Depth of the change queue and keys dropped after retries
//! - **Watch Metrics** - Decoded Gateway events and stream failures
//! - **Leader Election Metrics** - Leadership state changes
//!
//! # Example
//!
//! ```rust,no_run
//! use gateport::metrics::record_reconciliation_success;
//!
//! record_reconciliation_success(std::time::Duration::from_millis(120));
//! ```

use crate::constants::{HEALTH_SERVER_PATH, METRICS_SERVER_PATH};
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, GaugeVec, Histogram, HistogramOpts, Opts, Registry,
    TextEncoder,
};
use std::net::SocketAddr;
use std::sync::LazyLock;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

// ============================================================================
// Metric Name Constants
// ============================================================================

/// Namespace prefix for all gateport metrics
const METRICS_NAMESPACE: &str = "gateport";

// ============================================================================
// Global Metrics Registry
// ============================================================================

/// Global Prometheus metrics registry
///
/// All metrics are registered in this registry and exposed via `/metrics` endpoint.
pub static METRICS_REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

// ============================================================================
// Reconciliation Metrics
// ============================================================================

/// Total number of reconciliations by outcome
///
/// Labels:
/// - `status`: Outcome (`success`, `error`, `requeue`)
pub static RECONCILIATION_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        format!("{METRICS_NAMESPACE}_reconciliations_total"),
        "Total number of port reconciliations by status",
    );
    let counter = CounterVec::new(opts, &["status"]).unwrap();
    METRICS_REGISTRY
        .register(Box::new(counter.clone()))
        .unwrap();
    counter
});

/// Duration of reconciliations in seconds
pub static RECONCILIATION_DURATION_SECONDS: LazyLock<Histogram> = LazyLock::new(|| {
    let opts = HistogramOpts::new(
        format!("{METRICS_NAMESPACE}_reconciliation_duration_seconds"),
        "Duration of port reconciliations in seconds",
    )
    .buckets(vec![0.001, 0.01, 0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0]);
    let histogram = Histogram::with_opts(opts).unwrap();
    METRICS_REGISTRY
        .register(Box::new(histogram.clone()))
        .unwrap();
    histogram
});

/// Total number of requeue operations
///
/// Labels:
/// - `reason`: Reason for requeue (`service_not_found`, `error`)
pub static REQUEUE_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        format!("{METRICS_NAMESPACE}_requeues_total"),
        "Total number of requeue operations by reason",
    );
    let counter = CounterVec::new(opts, &["reason"]).unwrap();
    METRICS_REGISTRY
        .register(Box::new(counter.clone()))
        .unwrap();
    counter
});

/// Total number of reconciliation errors by category
///
/// Labels:
/// - `error_type`: Category of error (`service_not_found`, `conflict`, `api_error`)
pub static ERRORS_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        format!("{METRICS_NAMESPACE}_errors_total"),
        "Total number of reconciliation errors by category",
    );
    let counter = CounterVec::new(opts, &["error_type"]).unwrap();
    METRICS_REGISTRY
        .register(Box::new(counter.clone()))
        .unwrap();
    counter
});

// ============================================================================
// Service Metrics
// ============================================================================

/// Number of ports on the ingress Service after the last reconciliation
pub static SERVICE_PORTS: LazyLock<Gauge> = LazyLock::new(|| {
    let gauge = Gauge::new(
        format!("{METRICS_NAMESPACE}_service_ports"),
        "Number of ports on the ingress Service",
    )
    .unwrap();
    METRICS_REGISTRY.register(Box::new(gauge.clone())).unwrap();
    gauge
});

/// Total number of port edits written to the Service
///
/// Labels:
/// - `action`: `add`, `update` or `delete`
pub static PORT_ACTIONS_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        format!("{METRICS_NAMESPACE}_port_actions_total"),
        "Total number of Service port edits by action",
    );
    let counter = CounterVec::new(opts, &["action"]).unwrap();
    METRICS_REGISTRY
        .register(Box::new(counter.clone()))
        .unwrap();
    counter
});

// ============================================================================
// Queue Metrics
// ============================================================================

/// Keys waiting in the change queue
pub static QUEUE_DEPTH: LazyLock<Gauge> = LazyLock::new(|| {
    let gauge = Gauge::new(
        format!("{METRICS_NAMESPACE}_queue_depth"),
        "Number of keys waiting in the change queue",
    )
    .unwrap();
    METRICS_REGISTRY.register(Box::new(gauge.clone())).unwrap();
    gauge
});

/// Keys dropped after exhausting their retries
pub static QUEUE_DROPS_TOTAL: LazyLock<Counter> = LazyLock::new(|| {
    let counter = Counter::new(
        format!("{METRICS_NAMESPACE}_queue_drops_total"),
        "Total number of keys dropped after exhausting retries",
    )
    .unwrap();
    METRICS_REGISTRY
        .register(Box::new(counter.clone()))
        .unwrap();
    counter
});

// ============================================================================
// Watch Metrics
// ============================================================================

/// Total number of decoded Gateway watch events
///
/// Labels:
/// - `event`: `added`, `modified`, `deleted`, `resynced`, `restarted`
pub static WATCH_EVENTS_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        format!("{METRICS_NAMESPACE}_watch_events_total"),
        "Total number of Gateway watch events by kind",
    );
    let counter = CounterVec::new(opts, &["event"]).unwrap();
    METRICS_REGISTRY
        .register(Box::new(counter.clone()))
        .unwrap();
    counter
});

/// Total number of Gateway watch stream errors
pub static WATCH_ERRORS_TOTAL: LazyLock<Counter> = LazyLock::new(|| {
    let counter = Counter::new(
        format!("{METRICS_NAMESPACE}_watch_errors_total"),
        "Total number of Gateway watch stream errors",
    )
    .unwrap();
    METRICS_REGISTRY
        .register(Box::new(counter.clone()))
        .unwrap();
    counter
});

// ============================================================================
// Leader Election Metrics
// ============================================================================

/// Total number of leader election events
///
/// Labels:
/// - `status`: Event type (`acquired`, `lost`, `renewed`)
pub static LEADER_ELECTIONS_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        format!("{METRICS_NAMESPACE}_leader_elections_total"),
        "Total number of leader election events by status",
    );
    let counter = CounterVec::new(opts, &["status"]).unwrap();
    METRICS_REGISTRY
        .register(Box::new(counter.clone()))
        .unwrap();
    counter
});

/// Current leader election status
///
/// Labels:
/// - `identity`: Holder identity of this replica
///
/// Value: 1 if leader, 0 if follower
pub static LEADER_STATUS: LazyLock<GaugeVec> = LazyLock::new(|| {
    let opts = Opts::new(
        format!("{METRICS_NAMESPACE}_leader_status"),
        "Current leader election status (1 = leader, 0 = follower)",
    );
    let gauge = GaugeVec::new(opts, &["identity"]).unwrap();
    METRICS_REGISTRY.register(Box::new(gauge.clone())).unwrap();
    gauge
});

// ============================================================================
// Helper Functions
// ============================================================================

/// Record a successful reconciliation
pub fn record_reconciliation_success(duration: Duration) {
    RECONCILIATION_TOTAL.with_label_values(&["success"]).inc();
    RECONCILIATION_DURATION_SECONDS.observe(duration.as_secs_f64());
}

/// Record a failed reconciliation
///
/// # Arguments
/// * `error_type` - Category of the failure (see [`crate::errors::ReconcileError::category`])
/// * `duration` - Duration of the reconciliation before failure
pub fn record_reconciliation_error(error_type: &str, duration: Duration) {
    RECONCILIATION_TOTAL.with_label_values(&["error"]).inc();
    ERRORS_TOTAL.with_label_values(&[error_type]).inc();
    RECONCILIATION_DURATION_SECONDS.observe(duration.as_secs_f64());
}

/// Record a reconciliation requeue
pub fn record_reconciliation_requeue(reason: &str) {
    RECONCILIATION_TOTAL.with_label_values(&["requeue"]).inc();
    REQUEUE_TOTAL.with_label_values(&[reason]).inc();
}

#[allow(clippy::cast_precision_loss)]
pub fn set_service_ports(count: usize) {
    SERVICE_PORTS.set(count as f64);
}

/// Record one port edit written to the Service
pub fn record_port_action(action: &str) {
    PORT_ACTIONS_TOTAL.with_label_values(&[action]).inc();
}

#[allow(clippy::cast_precision_loss)]
pub fn set_queue_depth(depth: usize) {
    QUEUE_DEPTH.set(depth as f64);
}

pub fn record_queue_drop() {
    QUEUE_DROPS_TOTAL.inc();
}

pub fn record_watch_event(event: &str) {
    WATCH_EVENTS_TOTAL.with_label_values(&[event]).inc();
}

pub fn record_watch_error() {
    WATCH_ERRORS_TOTAL.inc();
}

/// Record leader election acquired
///
/// # Arguments
/// * `identity` - Identity of the replica that acquired leadership
pub fn record_leader_elected(identity: &str) {
    LEADER_ELECTIONS_TOTAL
        .with_label_values(&["acquired"])
        .inc();
    LEADER_STATUS.with_label_values(&[identity]).set(1.0);
}

/// Record leader election lost
pub fn record_leader_lost(identity: &str) {
    LEADER_ELECTIONS_TOTAL.with_label_values(&["lost"]).inc();
    LEADER_STATUS.with_label_values(&[identity]).set(0.0);
}

/// Record leader election renewed
pub fn record_leader_renewed() {
    LEADER_ELECTIONS_TOTAL.with_label_values(&["renewed"]).inc();
}

/// Gather and encode all metrics in Prometheus text format
///
/// # Returns
/// Prometheus-formatted metrics as a String
///
/// # Errors
/// Returns error if encoding fails
pub fn gather_metrics() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = METRICS_REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(format!("UTF-8 error: {e}")))
}

// ============================================================================
// HTTP Endpoint
// ============================================================================

async fn metrics_handler() -> (StatusCode, String) {
    match gather_metrics() {
        Ok(body) => (StatusCode::OK, body),
        Err(e) => {
            error!(error = %e, "Failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

async fn health_handler() -> &'static str {
    "ok"
}

/// Routes for the metrics endpoint
pub fn metrics_router() -> Router {
    Router::new()
        .route(METRICS_SERVER_PATH, get(metrics_handler))
        .route(HEALTH_SERVER_PATH, get(health_handler))
}

/// Serve `/metrics` and `/healthz` on `addr` until `cancel` fires.
///
/// # Errors
///
/// Returns an error if the address cannot be bound or the server fails.
pub async fn serve(addr: SocketAddr, cancel: CancellationToken) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    serve_on(listener, cancel).await
}

/// Serve the metrics routes on an already bound listener.
///
/// # Errors
///
/// Returns an error if the server fails.
pub async fn serve_on(listener: TcpListener, cancel: CancellationToken) -> std::io::Result<()> {
    info!(address = %listener.local_addr()?, "Metrics server listening");
    axum::serve(listener, metrics_router())
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn http_get(addr: SocketAddr, path: &str) -> String {
        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        let request = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response
    }

    #[test]
    fn test_record_reconciliation_success() {
        let before = RECONCILIATION_DURATION_SECONDS.get_sample_count();

        record_reconciliation_success(Duration::from_millis(500));

        let counter = RECONCILIATION_TOTAL.with_label_values(&["success"]);
        assert!(counter.get() > 0.0);
        assert!(RECONCILIATION_DURATION_SECONDS.get_sample_count() > before);
    }

    #[test]
    fn test_record_reconciliation_error() {
        record_reconciliation_error("conflict", Duration::from_millis(250));

        assert!(RECONCILIATION_TOTAL.with_label_values(&["error"]).get() > 0.0);
        assert!(ERRORS_TOTAL.with_label_values(&["conflict"]).get() > 0.0);
    }

    #[test]
    fn test_record_requeue_and_port_actions() {
        record_reconciliation_requeue("service_not_found");
        record_port_action("add");

        assert!(REQUEUE_TOTAL.with_label_values(&["service_not_found"]).get() > 0.0);
        assert!(PORT_ACTIONS_TOTAL.with_label_values(&["add"]).get() > 0.0);
    }

    #[test]
    fn test_leader_status_follows_election() {
        record_leader_elected("metrics-test-replica");
        assert!(
            (LEADER_STATUS
                .with_label_values(&["metrics-test-replica"])
                .get()
                - 1.0)
                .abs()
                < f64::EPSILON
        );

        record_leader_lost("metrics-test-replica");
        assert!(
            LEADER_STATUS
                .with_label_values(&["metrics-test-replica"])
                .get()
                .abs()
                < f64::EPSILON
        );
    }

    #[test]
    fn test_gather_metrics() {
        record_reconciliation_success(Duration::from_millis(100));
        record_watch_event("added");

        let metrics_text = gather_metrics().unwrap();
        assert!(
            metrics_text.contains("gateport_reconciliations_total"),
            "Metrics should contain reconciliation counter"
        );
        assert!(metrics_text.contains("gateport_watch_events_total"));
    }

    #[tokio::test]
    async fn test_serve_exposes_metrics_and_health() {
        record_watch_error();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let cancel = CancellationToken::new();
        let server = tokio::spawn(serve_on(listener, cancel.clone()));

        let health = http_get(addr, HEALTH_SERVER_PATH).await;
        assert!(health.starts_with("HTTP/1.1 200"));
        assert!(health.ends_with("ok"));

        let metrics = http_get(addr, METRICS_SERVER_PATH).await;
        assert!(metrics.contains("gateport_watch_errors_total"));

        cancel.cancel();
        server.await.unwrap().unwrap();
    }
}
