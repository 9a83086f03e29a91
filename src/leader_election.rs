// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Lease-based leader election.
//!
//! Only the replica holding the `coordination.k8s.io/v1` Lease runs the watch and the
//! reconcile workers. Every write to the Lease carries the `resourceVersion` that was
//! read, so a concurrent change fails with HTTP 409 instead of producing two leaders.
//!
//! # State Machine
//!
//! ```text
//! Standby -> Acquiring -> Leading -> (lease lost | shutdown) -> Standby
//! ```
//!
//! - **Acquiring**: try to create, renew or take over the Lease every retry period
//! - **Leading**: renew every retry period; leadership is lost when another holder
//!   is observed or no renewal succeeds within the renew deadline
//! - on loss the workload is cancelled, allowed to finish its current step, and the
//!   elector goes back to acquiring
//! - on shutdown the workload is cancelled and the Lease is released so another
//!   replica can take over without waiting for expiry
//!
//! Authorization failures (401/403) can never heal and are returned as
//! [`LeaderElectionError::Forbidden`].

use crate::constants::{
    DEFAULT_LEASE_NAME, MANAGER_LEASE_DURATION_SECS, MANAGER_LEASE_RENEW_DEADLINE_SECS,
    MANAGER_LEASE_RETRY_PERIOD_SECS, STANDALONE_LEASE_DURATION_SECS,
    STANDALONE_LEASE_RENEW_DEADLINE_SECS, STANDALONE_LEASE_RETRY_PERIOD_SECS,
};
use crate::errors::{is_conflict, is_forbidden, is_not_found};
use crate::labels::{K8S_MANAGED_BY, MANAGED_BY_GATEPORT};
use crate::metrics;
use async_trait::async_trait;
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use k8s_openapi::jiff::{SignedDuration, Timestamp};
use kube::api::{Api, PostParams};
use kube::Client;
use std::future::Future;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Leader election errors
#[derive(Debug, Error)]
pub enum LeaderElectionError {
    /// Timing parameters cannot produce a safe election.
    #[error("invalid leader election configuration: {0}")]
    InvalidConfig(String),

    /// The controller is not allowed to read or write the Lease.
    #[error("not permitted to manage lease {namespace}/{name}: {source}")]
    Forbidden {
        namespace: String,
        name: String,
        #[source]
        source: kube::Error,
    },

    /// Kubernetes API error
    #[error("kubernetes API error: {0}")]
    Kube(#[from] kube::Error),
}

/// Identity and timing of the election.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LeaseConfig {
    /// Lease object name
    pub name: String,
    /// Namespace holding the Lease
    pub namespace: String,
    /// Unique identity of this replica
    pub identity: String,
    /// How long a non-renewed lease stays valid
    pub lease_duration: Duration,
    /// How long the leader keeps trying to renew before giving up
    pub renew_deadline: Duration,
    /// Interval between acquire and renew attempts
    pub retry_period: Duration,
}

impl LeaseConfig {
    /// Manager mode timings: 30s lease, 15s renew deadline, 5s retry.
    #[must_use]
    pub fn manager_defaults(namespace: impl Into<String>, identity: impl Into<String>) -> Self {
        Self {
            name: DEFAULT_LEASE_NAME.to_string(),
            namespace: namespace.into(),
            identity: identity.into(),
            lease_duration: Duration::from_secs(MANAGER_LEASE_DURATION_SECS),
            renew_deadline: Duration::from_secs(MANAGER_LEASE_RENEW_DEADLINE_SECS),
            retry_period: Duration::from_secs(MANAGER_LEASE_RETRY_PERIOD_SECS),
        }
    }

    /// Standalone mode timings: 15s lease, 10s renew deadline, 5s retry.
    #[must_use]
    pub fn standalone_defaults(namespace: impl Into<String>, identity: impl Into<String>) -> Self {
        Self {
            name: DEFAULT_LEASE_NAME.to_string(),
            namespace: namespace.into(),
            identity: identity.into(),
            lease_duration: Duration::from_secs(STANDALONE_LEASE_DURATION_SECS),
            renew_deadline: Duration::from_secs(STANDALONE_LEASE_RENEW_DEADLINE_SECS),
            retry_period: Duration::from_secs(STANDALONE_LEASE_RETRY_PERIOD_SECS),
        }
    }

    /// Check that the timings are strictly ordered: `retry < renew deadline < lease`.
    ///
    /// # Errors
    ///
    /// Returns [`LeaderElectionError::InvalidConfig`] describing the first violation.
    pub fn validate(&self) -> Result<(), LeaderElectionError> {
        if self.name.is_empty() || self.namespace.is_empty() {
            return Err(LeaderElectionError::InvalidConfig(
                "lease name and namespace must not be empty".to_string(),
            ));
        }
        if self.identity.is_empty() {
            return Err(LeaderElectionError::InvalidConfig(
                "identity must not be empty".to_string(),
            ));
        }
        if self.retry_period.is_zero() {
            return Err(LeaderElectionError::InvalidConfig(
                "retry period must be positive".to_string(),
            ));
        }
        if self.renew_deadline >= self.lease_duration {
            return Err(LeaderElectionError::InvalidConfig(format!(
                "renew deadline ({:?}) must be less than lease duration ({:?})",
                self.renew_deadline, self.lease_duration
            )));
        }
        if self.retry_period >= self.renew_deadline {
            return Err(LeaderElectionError::InvalidConfig(format!(
                "retry period ({:?}) must be less than renew deadline ({:?})",
                self.retry_period, self.renew_deadline
            )));
        }
        Ok(())
    }

    fn lease_duration_seconds(&self) -> i32 {
        i32::try_from(self.lease_duration.as_secs().max(1)).unwrap_or(i32::MAX)
    }
}

/// Identity of this replica: `POD_NAME`, else the hostname plus a random suffix.
#[must_use]
pub fn default_identity() -> String {
    if let Ok(pod) = std::env::var("POD_NAME") {
        if !pod.is_empty() {
            return pod;
        }
    }
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "gateport".to_string());
    format!("{host}_{:08x}", rand::random::<u32>())
}

/// Observable state of the elector.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LeadershipState {
    Standby,
    Acquiring,
    Leading,
}

/// What an acquire attempt should do with the Lease it read.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LeaseAction {
    /// No Lease exists
    Create,
    /// We already hold it
    Renew,
    /// Free or expired
    TakeOver,
    /// Validly held by someone else
    Wait { holder: String },
}

/// Whether a lease has expired at `now`.
///
/// A lease with no renew time, no duration or no holder counts as expired.
#[must_use]
pub fn lease_expired(spec: Option<&LeaseSpec>, now: Timestamp) -> bool {
    let Some(spec) = spec else {
        return true;
    };
    if spec.holder_identity.as_deref().is_none_or(str::is_empty) {
        return true;
    }
    let renewed = spec
        .renew_time
        .as_ref()
        .or(spec.acquire_time.as_ref())
        .map(|t| t.0);
    match (renewed, spec.lease_duration_seconds) {
        (Some(renewed), Some(secs)) => {
            now.duration_since(renewed) > SignedDuration::from_secs(i64::from(secs))
        }
        _ => true,
    }
}

/// Decide how to treat the Lease read from the cluster.
#[must_use]
pub fn decide_lease_action(
    existing: Option<&Lease>,
    identity: &str,
    now: Timestamp,
) -> LeaseAction {
    let Some(lease) = existing else {
        return LeaseAction::Create;
    };
    let spec = lease.spec.as_ref();
    let holder = spec
        .and_then(|s| s.holder_identity.as_deref())
        .filter(|h| !h.is_empty());

    match holder {
        Some(h) if h == identity => LeaseAction::Renew,
        Some(h) if !lease_expired(spec, now) => LeaseAction::Wait {
            holder: h.to_string(),
        },
        _ => LeaseAction::TakeOver,
    }
}

/// Minimal Lease access.
#[async_trait]
pub trait LeaseClient: Send + Sync {
    /// Read the Lease, `None` if it does not exist.
    async fn get(&self, name: &str) -> Result<Option<Lease>, kube::Error>;
    async fn create(&self, lease: &Lease) -> Result<Lease, kube::Error>;
    async fn replace(&self, lease: &Lease) -> Result<Lease, kube::Error>;
}

/// [`LeaseClient`] backed by the Kubernetes API server.
pub struct KubeLeaseClient {
    api: Api<Lease>,
    params: PostParams,
}

impl KubeLeaseClient {
    #[must_use]
    pub fn new(client: Client, namespace: &str, field_manager: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            params: PostParams {
                field_manager: Some(field_manager.to_string()),
                ..Default::default()
            },
        }
    }
}

#[async_trait]
impl LeaseClient for KubeLeaseClient {
    async fn get(&self, name: &str) -> Result<Option<Lease>, kube::Error> {
        match self.api.get(name).await {
            Ok(lease) => Ok(Some(lease)),
            Err(e) if is_not_found(&e) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn create(&self, lease: &Lease) -> Result<Lease, kube::Error> {
        self.api.create(&self.params, lease).await
    }

    async fn replace(&self, lease: &Lease) -> Result<Lease, kube::Error> {
        let name = lease.metadata.name.clone().unwrap_or_default();
        self.api.replace(&name, &self.params, lease).await
    }
}

enum LeadershipEnd<T> {
    Shutdown,
    Lost,
    WorkloadExited(T),
    Fatal(LeaderElectionError),
}

/// Runs a workload only while this replica holds the Lease.
pub struct LeaderElector<L> {
    client: L,
    config: LeaseConfig,
    state: watch::Sender<LeadershipState>,
    observed_leader: Mutex<Option<String>>,
}

impl<L: LeaseClient> LeaderElector<L> {
    #[must_use]
    pub fn new(client: L, config: LeaseConfig) -> Self {
        let (state, _) = watch::channel(LeadershipState::Standby);
        Self {
            client,
            config,
            state,
            observed_leader: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn config(&self) -> &LeaseConfig {
        &self.config
    }

    /// Follow state transitions.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<LeadershipState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: LeadershipState) {
        self.state.send_replace(state);
    }

    fn observe_leader(&self, holder: &str) {
        let mut observed = self
            .observed_leader
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if observed.as_deref() != Some(holder) {
            info!(leader = %holder, identity = %self.config.identity, "New leader elected");
            *observed = Some(holder.to_string());
        }
    }

    fn classify(&self, e: kube::Error) -> LeaderElectionError {
        if is_forbidden(&e) {
            LeaderElectionError::Forbidden {
                namespace: self.config.namespace.clone(),
                name: self.config.name.clone(),
                source: e,
            }
        } else {
            LeaderElectionError::Kube(e)
        }
    }

    fn held_spec(&self, now: Timestamp, acquired: Option<MicroTime>, transitions: i32) -> LeaseSpec {
        LeaseSpec {
            holder_identity: Some(self.config.identity.clone()),
            lease_duration_seconds: Some(self.config.lease_duration_seconds()),
            acquire_time: Some(acquired.unwrap_or(MicroTime(now))),
            renew_time: Some(MicroTime(now)),
            lease_transitions: Some(transitions),
            ..Default::default()
        }
    }

    /// One acquire-or-renew round. Returns whether this replica holds the Lease afterwards.
    ///
    /// # Errors
    ///
    /// [`LeaderElectionError::Forbidden`] on 401/403, [`LeaderElectionError::Kube`]
    /// for any other failure except conflicts, which mean "not leader".
    pub async fn try_acquire_or_renew(&self) -> Result<bool, LeaderElectionError> {
        let existing = self
            .client
            .get(&self.config.name)
            .await
            .map_err(|e| self.classify(e))?;
        let now = Timestamp::now();

        let result = match decide_lease_action(existing.as_ref(), &self.config.identity, now) {
            LeaseAction::Wait { holder } => {
                self.observe_leader(&holder);
                return Ok(false);
            }
            LeaseAction::Create => {
                let lease = Lease {
                    metadata: ObjectMeta {
                        name: Some(self.config.name.clone()),
                        namespace: Some(self.config.namespace.clone()),
                        labels: Some(
                            [(K8S_MANAGED_BY.to_string(), MANAGED_BY_GATEPORT.to_string())].into(),
                        ),
                        ..Default::default()
                    },
                    spec: Some(self.held_spec(now, None, 0)),
                };
                self.client.create(&lease).await
            }
            LeaseAction::Renew => {
                let mut lease = existing.unwrap_or_default();
                let previous = lease.spec.take().unwrap_or_default();
                lease.spec = Some(self.held_spec(
                    now,
                    previous.acquire_time,
                    previous.lease_transitions.unwrap_or_default(),
                ));
                self.client.replace(&lease).await
            }
            LeaseAction::TakeOver => {
                let mut lease = existing.unwrap_or_default();
                let transitions = lease
                    .spec
                    .as_ref()
                    .and_then(|s| s.lease_transitions)
                    .unwrap_or_default();
                lease.spec = Some(self.held_spec(now, None, transitions + 1));
                self.client.replace(&lease).await
            }
        };

        match result {
            Ok(_) => {
                self.observe_leader(&self.config.identity);
                Ok(true)
            }
            Err(e) if is_conflict(&e) => {
                debug!(identity = %self.config.identity, "Lease changed concurrently");
                Ok(false)
            }
            Err(e) => Err(self.classify(e)),
        }
    }

    /// Give up the Lease if this replica still holds it.
    pub async fn release(&self) {
        let lease = match self.client.get(&self.config.name).await {
            Ok(Some(lease)) => lease,
            Ok(None) => return,
            Err(e) => {
                warn!(error = %e, "Failed to read lease for release");
                return;
            }
        };

        let holder = lease.spec.as_ref().and_then(|s| s.holder_identity.as_deref());
        if holder != Some(self.config.identity.as_str()) {
            debug!(identity = %self.config.identity, "Lease not held by us, skipping release");
            return;
        }

        let mut released = lease.clone();
        if let Some(spec) = released.spec.as_mut() {
            spec.holder_identity = None;
            spec.lease_duration_seconds = Some(1);
            spec.renew_time = Some(MicroTime(Timestamp::now()));
        }

        match self.client.replace(&released).await {
            Ok(_) => info!(identity = %self.config.identity, "Released leader lease"),
            Err(e) => warn!(error = %e, "Failed to release leader lease"),
        }
    }

    /// Acquire the Lease, run `on_leading` while holding it, and repeat after a loss.
    ///
    /// `on_leading` receives a token cancelled when leadership ends; the elector waits
    /// for the workload to return before acquiring again. Returns `Ok(None)` after
    /// `shutdown` fires, or `Ok(Some(output))` if the workload finished on its own.
    ///
    /// # Errors
    ///
    /// Returns [`LeaderElectionError::Forbidden`] when the Lease cannot be managed.
    pub async fn run<F, Fut, T>(
        &self,
        shutdown: CancellationToken,
        mut on_leading: F,
    ) -> Result<Option<T>, LeaderElectionError>
    where
        F: FnMut(CancellationToken) -> Fut,
        Fut: Future<Output = T>,
    {
        self.config.validate()?;

        loop {
            self.set_state(LeadershipState::Acquiring);
            info!(
                identity = %self.config.identity,
                lease = %format!("{}/{}", self.config.namespace, self.config.name),
                "Waiting to acquire leader lease"
            );

            if !self.acquire(&shutdown).await? {
                self.set_state(LeadershipState::Standby);
                return Ok(None);
            }

            self.set_state(LeadershipState::Leading);
            metrics::record_leader_elected(&self.config.identity);
            info!(identity = %self.config.identity, "Acquired leadership");

            let leading = shutdown.child_token();
            let end = self.lead(&shutdown, &leading, on_leading(leading.clone())).await;

            metrics::record_leader_lost(&self.config.identity);
            self.set_state(LeadershipState::Standby);

            match end {
                LeadershipEnd::Shutdown => {
                    self.release().await;
                    return Ok(None);
                }
                LeadershipEnd::WorkloadExited(output) => {
                    self.release().await;
                    return Ok(Some(output));
                }
                LeadershipEnd::Lost => {
                    warn!(identity = %self.config.identity, "Leadership lost");
                }
                LeadershipEnd::Fatal(e) => {
                    error!(identity = %self.config.identity, error = %e, "Leader election failed");
                    return Err(e);
                }
            }
        }
    }

    /// Retry until the Lease is ours. Returns `false` if `shutdown` fired first.
    async fn acquire(&self, shutdown: &CancellationToken) -> Result<bool, LeaderElectionError> {
        loop {
            let attempt = tokio::select! {
                () = shutdown.cancelled() => return Ok(false),
                attempt = self.try_acquire_or_renew() => attempt,
            };

            match attempt {
                Ok(true) => return Ok(true),
                Ok(false) => debug!(
                    identity = %self.config.identity,
                    retry_after = ?self.config.retry_period,
                    "Lease held by another replica"
                ),
                Err(e @ LeaderElectionError::Forbidden { .. }) => return Err(e),
                Err(e) => warn!(
                    identity = %self.config.identity,
                    error = %e,
                    retry_after = ?self.config.retry_period,
                    "Failed to acquire lease, retrying"
                ),
            }

            // jitter so replicas started together don't retry in lockstep
            let jitter = self.config.retry_period.mul_f64(rand::random::<f64>() * 0.2);
            tokio::select! {
                () = shutdown.cancelled() => return Ok(false),
                () = tokio::time::sleep(self.config.retry_period + jitter) => {}
            }
        }
    }

    /// Renew while the workload runs, then stop it and wait for it to return.
    async fn lead<Fut, T>(
        &self,
        shutdown: &CancellationToken,
        leading: &CancellationToken,
        workload: Fut,
    ) -> LeadershipEnd<T>
    where
        Fut: Future<Output = T>,
    {
        tokio::pin!(workload);
        let mut last_renewal = Instant::now();

        let end = loop {
            tokio::select! {
                () = shutdown.cancelled() => break LeadershipEnd::Shutdown,
                output = &mut workload => return LeadershipEnd::WorkloadExited(output),
                () = tokio::time::sleep(self.config.retry_period) => {
                    let remaining = self.config.renew_deadline.saturating_sub(last_renewal.elapsed());
                    match tokio::time::timeout(remaining, self.try_acquire_or_renew()).await {
                        Ok(Ok(true)) => {
                            last_renewal = Instant::now();
                            metrics::record_leader_renewed();
                        }
                        Ok(Ok(false)) => break LeadershipEnd::Lost,
                        Ok(Err(e @ LeaderElectionError::Forbidden { .. })) => {
                            break LeadershipEnd::Fatal(e);
                        }
                        Ok(Err(e)) => warn!(error = %e, "Failed to renew lease"),
                        Err(_) => warn!("Lease renewal timed out"),
                    }
                    if last_renewal.elapsed() >= self.config.renew_deadline {
                        warn!(
                            deadline = ?self.config.renew_deadline,
                            "Could not renew lease within the renew deadline"
                        );
                        break LeadershipEnd::Lost;
                    }
                }
            }
        };

        leading.cancel();
        workload.await;
        end
    }
}

#[cfg(test)]
#[path = "leader_election_tests.rs"]
mod leader_election_tests;
