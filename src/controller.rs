// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Controller orchestration.
//!
//! [`run`] campaigns for the Lease (unless leader election is disabled) and, for each
//! leadership term, runs [`run_active`]:
//!
//! 1. start the Gateway watch feeding a fresh reflector store and the change queue
//! 2. wait for the initial Gateway list
//! 3. wait for the ingress Service to exist
//! 4. enqueue one reconciliation and start the workers and the periodic resync
//! 5. when the term ends, stop the watch, drain in-flight work and join every task
//!
//! Every change funnels into a single [`ReconcileKey`] naming the ingress Service, so
//! bursts of Gateway events coalesce into one pass.

use crate::constants::{FIELD_MANAGER, SERVICE_NOT_FOUND_REQUEUE_SECS};
use crate::context::{Context, Stores};
use crate::crd::Gateway;
use crate::leader_election::{KubeLeaseClient, LeaderElectionError, LeaderElector};
use crate::metrics;
use crate::queue::{ChangeQueue, ReconcileKey};
use crate::reconcilers::retry::RetryPolicy;
use crate::reconcilers::{
    GatewayLister, KubeServiceApi, PortReconciler, ReconcileOutcome, ServiceApi,
};
use crate::watcher::{run_gateway_watch, run_resync};
use kube::Api;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Errors that stop the controller.
#[derive(Debug, Error)]
pub enum ControllerError {
    #[error(transparent)]
    LeaderElection(#[from] LeaderElectionError),

    #[error("controller stopped before shutdown was requested")]
    StoppedUnexpectedly,
}

/// Run the controller until `shutdown` fires.
///
/// # Errors
///
/// Returns an error when leader election fails fatally (for example a forbidden Lease)
/// or the workload stops on its own.
pub async fn run(ctx: Arc<Context>, shutdown: CancellationToken) -> Result<(), ControllerError> {
    if !ctx.config.manager.leader_election {
        info!("Leader election disabled, running as the only replica");
        run_active(Arc::clone(&ctx), shutdown.clone()).await;
        return finish(&shutdown);
    }

    let lease_config = ctx.config.manager.lease_config(ctx.identity.clone());
    info!(
        lease = %lease_config.name,
        namespace = %lease_config.namespace,
        identity = %lease_config.identity,
        "Campaigning for leadership"
    );

    let lease_client =
        KubeLeaseClient::new(ctx.client.clone(), &lease_config.namespace, FIELD_MANAGER);
    let elector = LeaderElector::new(lease_client, lease_config);

    elector
        .run(shutdown.clone(), |leading| run_active(Arc::clone(&ctx), leading))
        .await?;

    finish(&shutdown)
}

fn finish(shutdown: &CancellationToken) -> Result<(), ControllerError> {
    if shutdown.is_cancelled() {
        info!("Controller stopped");
        Ok(())
    } else {
        error!("Controller stopped before shutdown was requested");
        Err(ControllerError::StoppedUnexpectedly)
    }
}

/// Run one active term: watch, reconcile and resync until `cancel` fires.
pub async fn run_active(ctx: Arc<Context>, cancel: CancellationToken) {
    let sync = &ctx.config.sync;
    let target = sync.sync_target();
    let key = ReconcileKey::new(&target.namespace, &target.service_name);

    let (stores, writer) = Stores::new();
    let queue = Arc::new(ChangeQueue::new(RetryPolicy::queue(sync.max_retries)));
    let engine = Arc::new(PortReconciler::new(
        KubeServiceApi::new(ctx.client.clone(), FIELD_MANAGER),
        stores.clone(),
        target,
    ));

    let mut tasks = JoinSet::new();
    tasks.spawn(run_gateway_watch(
        Api::<Gateway>::all(ctx.client.clone()),
        writer,
        Arc::clone(&queue),
        key.clone(),
        cancel.clone(),
    ));

    let ready = tokio::select! {
        () = cancel.cancelled() => false,
        result = stores.gateways.wait_until_ready() => match result {
            Ok(()) => true,
            Err(e) => {
                error!(error = %e, "Gateway cache was closed before the initial list");
                false
            }
        },
    };
    if !ready {
        stop(&queue, tasks).await;
        return;
    }
    info!(gateways = stores.gateway_count(), "Gateway cache synchronized");

    let Some(service) = engine.wait_for_service(&cancel).await else {
        stop(&queue, tasks).await;
        return;
    };
    info!(
        service = %key,
        ports = service.spec.as_ref().and_then(|s| s.ports.as_ref()).map_or(0, Vec::len),
        "Ingress service found"
    );

    queue.enqueue(key.clone());
    for worker in 0..sync.workers.max(1) {
        tasks.spawn(run_worker(worker, Arc::clone(&queue), Arc::clone(&engine)));
    }
    tasks.spawn(run_resync(
        Arc::clone(&queue),
        key,
        sync.resync_period(),
        cancel.clone(),
    ));

    cancel.cancelled().await;
    info!("Stopping controller, draining in-flight work");
    stop(&queue, tasks).await;
}

async fn stop(queue: &ChangeQueue<ReconcileKey>, mut tasks: JoinSet<()>) {
    queue.shut_down_with_drain().await;
    while let Some(result) = tasks.join_next().await {
        if let Err(e) = result {
            error!(error = %e, "Controller task failed");
        }
    }
}

async fn run_worker<S, G>(
    worker: usize,
    queue: Arc<ChangeQueue<ReconcileKey>>,
    engine: Arc<PortReconciler<S, G>>,
) where
    S: ServiceApi,
    G: GatewayLister,
{
    debug!(worker, "Worker started");
    while process_next(&queue, &engine).await {}
    debug!(worker, "Worker stopped");
}

/// Take one key off the queue and reconcile it.
///
/// Returns `false` once the queue has shut down.
pub async fn process_next<S, G>(
    queue: &Arc<ChangeQueue<ReconcileKey>>,
    engine: &PortReconciler<S, G>,
) -> bool
where
    S: ServiceApi,
    G: GatewayLister,
{
    process_next_with(
        queue,
        engine,
        Duration::from_secs(SERVICE_NOT_FOUND_REQUEUE_SECS),
    )
    .await
}

pub(crate) async fn process_next_with<S, G>(
    queue: &Arc<ChangeQueue<ReconcileKey>>,
    engine: &PortReconciler<S, G>,
    not_found_delay: Duration,
) -> bool
where
    S: ServiceApi,
    G: GatewayLister,
{
    let Some(key) = queue.dequeue().await else {
        return false;
    };

    let start = Instant::now();
    match engine.reconcile().await {
        Ok(outcome) => {
            queue.forget(&key);
            metrics::record_reconciliation_success(start.elapsed());
            match outcome {
                ReconcileOutcome::Unchanged => debug!(key = %key, "Service ports up to date"),
                ReconcileOutcome::Updated { actions } => {
                    debug!(key = %key, actions = actions.len(), "Service ports updated");
                }
            }
        }
        Err(e) if e.is_service_not_found() => {
            metrics::record_reconciliation_error(e.category(), start.elapsed());
            metrics::record_reconciliation_requeue("service_not_found");
            warn!(key = %key, retry_after = ?not_found_delay, "{e}, waiting for it to be recreated");
            queue.enqueue_after(key.clone(), not_found_delay);
        }
        Err(e) => {
            metrics::record_reconciliation_error(e.category(), start.elapsed());
            match queue.requeue_rate_limited(key.clone()) {
                Some(delay) => {
                    metrics::record_reconciliation_requeue("error");
                    warn!(key = %key, error = %e, retry_after = ?delay, "Reconciliation failed, requeueing");
                }
                None => {
                    error!(key = %key, error = %e, "Reconciliation failed, giving up until the next change");
                }
            }
        }
    }

    queue.done(&key);
    true
}

#[cfg(test)]
#[path = "controller_tests.rs"]
mod controller_tests;
