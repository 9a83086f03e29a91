// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Reconciliation of the ingress gateway Service port list.
//!
//! A pass recomputes the desired port set from every Gateway in the watch cache,
//! fetches the live Service, plans the new port list and writes it only when it
//! differs from what is stored. Passes never apply deltas, so collapsed or
//! reordered watch events are harmless.
//!
//! Both cluster seams are traits ([`ServiceApi`], [`GatewayLister`]) so the engine can
//! be driven by in-memory fakes in tests.

use crate::constants::{MAX_CONFLICT_RETRIES, SERVICE_WAIT_INTERVAL_SECS};
use crate::crd::{Gateway, GatewayDeclaration};
use crate::errors::{is_conflict, is_not_found, ReconcileError};
use crate::metrics;
use crate::reconcilers::ports::{
    desired_ports, plan_service_ports, ports_equivalent, PortAction, PortActionKind, PortPlan,
};
use crate::reconcilers::retry::{is_retryable_error, retry_api_call, RetryPolicy};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Service, ServicePort};
use kube::api::PostParams;
use kube::runtime::reflector::Store;
use kube::{Api, Client, ResourceExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Read/replace access to Services.
#[async_trait]
pub trait ServiceApi: Send + Sync {
    /// Fetch a Service by namespace and name.
    async fn get_service(&self, namespace: &str, name: &str) -> Result<Service, kube::Error>;

    /// Replace a Service. The object's `resourceVersion` guards against lost updates.
    async fn replace_service(&self, service: &Service) -> Result<Service, kube::Error>;
}

/// [`ServiceApi`] backed by the Kubernetes API server.
#[derive(Clone)]
pub struct KubeServiceApi {
    client: Client,
    field_manager: String,
}

impl KubeServiceApi {
    #[must_use]
    pub fn new(client: Client, field_manager: impl Into<String>) -> Self {
        Self {
            client,
            field_manager: field_manager.into(),
        }
    }
}

#[async_trait]
impl ServiceApi for KubeServiceApi {
    async fn get_service(&self, namespace: &str, name: &str) -> Result<Service, kube::Error> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        retry_api_call(|| api.get(name), "get ingress service").await
    }

    async fn replace_service(&self, service: &Service) -> Result<Service, kube::Error> {
        let namespace = service.namespace().unwrap_or_default();
        let api: Api<Service> = Api::namespaced(self.client.clone(), &namespace);
        let params = PostParams {
            field_manager: Some(self.field_manager.clone()),
            ..Default::default()
        };
        let name = service.name_any();
        retry_api_call(|| api.replace(&name, &params, service), "replace ingress service").await
    }
}

/// Source of the Gateways currently known to the controller.
pub trait GatewayLister: Send + Sync {
    fn list_gateways(&self) -> Vec<GatewayDeclaration>;
}

impl GatewayLister for Store<Gateway> {
    fn list_gateways(&self) -> Vec<GatewayDeclaration> {
        self.state()
            .iter()
            .map(|gateway| GatewayDeclaration::from_gateway(gateway))
            .collect()
    }
}

/// Static parameters of the engine, fixed for its lifetime.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SyncTarget {
    /// Namespace of the ingress Service
    pub namespace: String,
    /// Name of the ingress Service
    pub service_name: String,
    /// Ports kept on the Service regardless of Gateway declarations
    pub default_ports: Vec<u16>,
    /// Label/annotation key that opts a Gateway out
    pub ignore_key: String,
}

/// Outcome of a successful pass.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// The stored port list already matched; nothing was written.
    Unchanged,
    /// The Service was replaced.
    Updated { actions: Vec<PortAction> },
}

/// The reconciliation engine for one ingress Service.
pub struct PortReconciler<S, G> {
    service_api: S,
    gateways: G,
    target: SyncTarget,
    /// Last Service fetched or written, replaced wholesale
    snapshot: Mutex<Option<Arc<Service>>>,
}

impl<S: ServiceApi, G: GatewayLister> PortReconciler<S, G> {
    #[must_use]
    pub fn new(service_api: S, gateways: G, target: SyncTarget) -> Self {
        Self {
            service_api,
            gateways,
            target,
            snapshot: Mutex::new(None),
        }
    }

    /// Last Service fetched or written by this engine.
    pub async fn snapshot(&self) -> Option<Arc<Service>> {
        self.snapshot.lock().await.clone()
    }

    /// Run one reconciliation.
    ///
    /// A write that conflicts on `resourceVersion` restarts the pass from the
    /// Gateway listing, up to [`MAX_CONFLICT_RETRIES`] times.
    ///
    /// # Errors
    ///
    /// - [`ReconcileError::ServiceNotFound`] when the ingress Service does not exist
    /// - [`ReconcileError::Conflict`] when every attempt conflicted
    /// - [`ReconcileError::Kube`] for any other API failure
    pub async fn reconcile(&self) -> Result<ReconcileOutcome, ReconcileError> {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match self.reconcile_once().await {
                Err(ReconcileError::Kube(e)) if is_conflict(&e) => {
                    if attempt >= MAX_CONFLICT_RETRIES {
                        return Err(ReconcileError::Conflict {
                            namespace: self.target.namespace.clone(),
                            name: self.target.service_name.clone(),
                            attempts: attempt,
                        });
                    }
                    debug!(
                        service = %self.service_key(),
                        attempt = attempt,
                        "Service changed underneath us, recomputing"
                    );
                }
                other => return other,
            }
        }
    }

    async fn reconcile_once(&self) -> Result<ReconcileOutcome, ReconcileError> {
        let gateways = self.gateways.list_gateways();
        let desired = desired_ports(&gateways, &self.target.default_ports, &self.target.ignore_key);
        debug!(
            gateways = gateways.len(),
            desired_ports = desired.len(),
            "Computed desired port set"
        );

        let service = self.fetch_service().await?;
        let current: &[ServicePort] = service
            .spec
            .as_ref()
            .and_then(|spec| spec.ports.as_deref())
            .unwrap_or_default();

        let plan = plan_service_ports(current, &desired, &self.target.default_ports);

        if ports_equivalent(current, &plan.ports) {
            debug!(service = %self.service_key(), "Service ports already in sync");
            return Ok(ReconcileOutcome::Unchanged);
        }

        let added = plan.count(PortActionKind::Add);
        let changed = plan.count(PortActionKind::Update);
        let deleted = plan.count(PortActionKind::Delete);
        let PortPlan { ports, actions } = plan;

        let mut updated = (*service).clone();
        updated.spec.get_or_insert_with(Default::default).ports = Some(ports);

        let written = self.service_api.replace_service(&updated).await?;
        self.store_snapshot(Arc::new(written)).await;

        for action in &actions {
            log_action(action);
            metrics::record_port_action(action.kind.as_str());
        }
        info!(
            service = %self.service_key(),
            added = added,
            updated = changed,
            deleted = deleted,
            "Updated ingress service ports"
        );

        Ok(ReconcileOutcome::Updated { actions })
    }

    async fn fetch_service(&self) -> Result<Arc<Service>, ReconcileError> {
        match self
            .service_api
            .get_service(&self.target.namespace, &self.target.service_name)
            .await
        {
            Ok(service) => {
                let service = Arc::new(service);
                self.store_snapshot(Arc::clone(&service)).await;
                Ok(service)
            }
            Err(e) if is_not_found(&e) => Err(ReconcileError::ServiceNotFound {
                namespace: self.target.namespace.clone(),
                name: self.target.service_name.clone(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    /// Keep the last Service seen on the cluster. The port gauge tracks it.
    async fn store_snapshot(&self, service: Arc<Service>) {
        metrics::set_service_ports(service_port_count(&service));
        *self.snapshot.lock().await = Some(service);
    }

    /// Block until the ingress Service can be fetched.
    ///
    /// Retries every five seconds for as long as it takes. Returns `None` if `cancel`
    /// fires first.
    pub async fn wait_for_service(&self, cancel: &CancellationToken) -> Option<Arc<Service>> {
        self.wait_for_service_every(Duration::from_secs(SERVICE_WAIT_INTERVAL_SECS), cancel)
            .await
    }

    pub(crate) async fn wait_for_service_every(
        &self,
        interval: Duration,
        cancel: &CancellationToken,
    ) -> Option<Arc<Service>> {
        let policy = RetryPolicy::fixed(interval);
        let mut backoff = policy.backoff();
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            let result = tokio::select! {
                () = cancel.cancelled() => return None,
                result = self.fetch_service() => result,
            };

            match result {
                Ok(service) => {
                    info!(
                        service = %self.service_key(),
                        attempts = attempt,
                        "Ingress service is available"
                    );
                    return Some(service);
                }
                Err(e) => {
                    let retry_after = backoff.next_backoff().unwrap_or(interval);
                    match &e {
                        ReconcileError::Kube(inner) if !is_retryable_error(inner) => warn!(
                            service = %self.service_key(),
                            error = %e,
                            "Cannot fetch ingress service, will keep trying"
                        ),
                        _ => info!(
                            service = %self.service_key(),
                            retry_after = ?retry_after,
                            error = %e,
                            "Waiting for ingress service"
                        ),
                    }
                    tokio::select! {
                        () = cancel.cancelled() => return None,
                        () = tokio::time::sleep(retry_after) => {}
                    }
                }
            }
        }
    }

    fn service_key(&self) -> String {
        format!("{}/{}", self.target.namespace, self.target.service_name)
    }
}

pub(crate) fn service_port_count(service: &Service) -> usize {
    service
        .spec
        .as_ref()
        .and_then(|spec| spec.ports.as_ref())
        .map_or(0, Vec::len)
}

fn log_action(action: &PortAction) {
    let name = action.name.as_deref().unwrap_or_default();
    match action.kind {
        PortActionKind::Add => info!(port = action.port, name = name, "add->{}", action.port),
        PortActionKind::Update => info!(
            port = action.port,
            name = name,
            previous_name = action.previous_name.as_deref().unwrap_or_default(),
            "update->{}",
            action.port
        ),
        PortActionKind::Delete => {
            info!(port = action.port, name = name, "delete->{}", action.port);
        }
    }
}

#[cfg(test)]
#[path = "ingress_service_tests.rs"]
mod ingress_service_tests;
