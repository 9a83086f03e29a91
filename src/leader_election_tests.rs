// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Unit tests for `leader_election.rs`

#[cfg(test)]
mod tests {
    use super::super::*;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
    use std::sync::Arc;
    use tokio::time::timeout;

    const ME: &str = "gateport-0";
    const OTHER: &str = "gateport-1";

    fn api_error(code: u16) -> kube::Error {
        kube::Error::Api(Box::new(kube::core::Status {
            message: format!("HTTP {code}"),
            reason: "Test".to_string(),
            code,
            ..Default::default()
        }))
    }

    fn held_lease(holder: &str, renewed: Timestamp, duration_secs: i32) -> Lease {
        Lease {
            metadata: ObjectMeta {
                name: Some(DEFAULT_LEASE_NAME.to_string()),
                namespace: Some("gateport-system".to_string()),
                resource_version: Some("1".to_string()),
                ..Default::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: Some(holder.to_string()),
                lease_duration_seconds: Some(duration_secs),
                acquire_time: Some(MicroTime(renewed)),
                renew_time: Some(MicroTime(renewed)),
                lease_transitions: Some(3),
                ..Default::default()
            }),
        }
    }

    /// In-memory Lease with `resourceVersion` checks
    #[derive(Clone, Default)]
    struct FakeLeases {
        lease: Arc<std::sync::Mutex<Option<Lease>>>,
        version: Arc<AtomicU64>,
        forbidden: Arc<AtomicBool>,
    }

    impl FakeLeases {
        fn holder(&self) -> Option<String> {
            self.lease
                .lock()
                .unwrap()
                .as_ref()
                .and_then(|l| l.spec.as_ref())
                .and_then(|s| s.holder_identity.clone())
        }

        fn put(&self, mut lease: Lease) {
            let version = self.version.fetch_add(1, Ordering::SeqCst) + 1;
            lease.metadata.resource_version = Some(version.to_string());
            *self.lease.lock().unwrap() = Some(lease);
        }
    }

    #[async_trait]
    impl LeaseClient for FakeLeases {
        async fn get(&self, _name: &str) -> Result<Option<Lease>, kube::Error> {
            if self.forbidden.load(Ordering::SeqCst) {
                return Err(api_error(403));
            }
            Ok(self.lease.lock().unwrap().clone())
        }

        async fn create(&self, lease: &Lease) -> Result<Lease, kube::Error> {
            if self.lease.lock().unwrap().is_some() {
                return Err(api_error(409));
            }
            self.put(lease.clone());
            Ok(self.lease.lock().unwrap().clone().unwrap())
        }

        async fn replace(&self, lease: &Lease) -> Result<Lease, kube::Error> {
            let current = self
                .lease
                .lock()
                .unwrap()
                .as_ref()
                .and_then(|l| l.metadata.resource_version.clone());
            if current != lease.metadata.resource_version {
                return Err(api_error(409));
            }
            self.put(lease.clone());
            Ok(self.lease.lock().unwrap().clone().unwrap())
        }
    }

    fn fast_config(identity: &str) -> LeaseConfig {
        LeaseConfig {
            name: DEFAULT_LEASE_NAME.to_string(),
            namespace: "gateport-system".to_string(),
            identity: identity.to_string(),
            lease_duration: Duration::from_secs(3),
            renew_deadline: Duration::from_secs(2),
            retry_period: Duration::from_millis(20),
        }
    }

    #[test]
    fn test_default_timings_are_valid() {
        let manager = LeaseConfig::manager_defaults("ns", ME);
        assert_eq!(manager.lease_duration, Duration::from_secs(30));
        assert_eq!(manager.renew_deadline, Duration::from_secs(15));
        assert_eq!(manager.retry_period, Duration::from_secs(5));
        assert!(manager.validate().is_ok());

        let standalone = LeaseConfig::standalone_defaults("ns", ME);
        assert_eq!(standalone.lease_duration, Duration::from_secs(15));
        assert_eq!(standalone.renew_deadline, Duration::from_secs(10));
        assert!(standalone.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_misordered_timings() {
        let mut config = LeaseConfig::manager_defaults("ns", ME);
        config.renew_deadline = config.lease_duration;
        assert!(matches!(
            config.validate(),
            Err(LeaderElectionError::InvalidConfig(_))
        ));

        let mut config = LeaseConfig::manager_defaults("ns", ME);
        config.retry_period = Duration::from_secs(20);
        assert!(config.validate().is_err());

        let mut config = LeaseConfig::manager_defaults("ns", ME);
        config.identity = String::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_lease_expiry() {
        let now = Timestamp::now();
        let fresh = held_lease(OTHER, now, 15);
        let stale = held_lease(OTHER, now - SignedDuration::from_secs(30), 15);

        assert!(!lease_expired(fresh.spec.as_ref(), now));
        assert!(lease_expired(stale.spec.as_ref(), now));
        assert!(lease_expired(None, now));
        assert!(lease_expired(Some(&LeaseSpec::default()), now));
    }

    #[test]
    fn test_lease_expiry_boundary() {
        let renewed = Timestamp::now();
        let lease = held_lease(OTHER, renewed, 15);

        let at_deadline = renewed + SignedDuration::from_secs(15);
        assert!(!lease_expired(lease.spec.as_ref(), at_deadline));

        let past_deadline = at_deadline + SignedDuration::from_millis(1);
        assert!(lease_expired(lease.spec.as_ref(), past_deadline));
    }

    #[test]
    fn test_held_lease_records_renew_time() {
        let elector = LeaderElector::new(FakeLeases::default(), fast_config(ME));
        let now = Timestamp::now();
        let acquired = MicroTime(now - SignedDuration::from_secs(120));

        let spec = elector.held_spec(now, Some(acquired.clone()), 2);

        assert_eq!(spec.renew_time, Some(MicroTime(now)));
        assert_eq!(spec.acquire_time, Some(acquired));
        assert_eq!(spec.holder_identity.as_deref(), Some(ME));
        assert!(!lease_expired(Some(&spec), now));
    }

    #[test]
    fn test_decide_lease_action() {
        let now = Timestamp::now();

        assert_eq!(decide_lease_action(None, ME, now), LeaseAction::Create);
        assert_eq!(
            decide_lease_action(Some(&held_lease(ME, now, 15)), ME, now),
            LeaseAction::Renew
        );
        assert_eq!(
            decide_lease_action(Some(&held_lease(OTHER, now, 15)), ME, now),
            LeaseAction::Wait {
                holder: OTHER.to_string()
            }
        );
        assert_eq!(
            decide_lease_action(
                Some(&held_lease(OTHER, now - SignedDuration::from_secs(60), 15)),
                ME,
                now
            ),
            LeaseAction::TakeOver
        );
        assert_eq!(
            decide_lease_action(Some(&held_lease("", now, 15)), ME, now),
            LeaseAction::TakeOver
        );
    }

    #[test]
    fn test_default_identity_is_not_empty() {
        let identity = default_identity();
        assert!(!identity.is_empty());
    }

    #[tokio::test]
    async fn test_try_acquire_creates_then_renews() {
        let leases = FakeLeases::default();
        let elector = LeaderElector::new(leases.clone(), fast_config(ME));

        assert!(elector.try_acquire_or_renew().await.unwrap());
        assert_eq!(leases.holder().as_deref(), Some(ME));
        let labels = leases.lease.lock().unwrap().clone().unwrap().metadata.labels.unwrap();
        assert_eq!(labels.get(K8S_MANAGED_BY).map(String::as_str), Some("gateport"));

        assert!(elector.try_acquire_or_renew().await.unwrap());
        let spec = leases.lease.lock().unwrap().clone().unwrap().spec.unwrap();
        assert_eq!(spec.lease_transitions, Some(0));
        assert_eq!(spec.lease_duration_seconds, Some(3));
    }

    #[tokio::test]
    async fn test_try_acquire_waits_for_valid_holder() {
        let leases = FakeLeases::default();
        leases.put(held_lease(OTHER, Timestamp::now(), 15));
        let elector = LeaderElector::new(leases.clone(), fast_config(ME));

        assert!(!elector.try_acquire_or_renew().await.unwrap());
        assert_eq!(leases.holder().as_deref(), Some(OTHER));
    }

    #[tokio::test]
    async fn test_try_acquire_takes_over_expired_lease() {
        let leases = FakeLeases::default();
        leases.put(held_lease(OTHER, Timestamp::now() - SignedDuration::from_secs(60), 15));
        let elector = LeaderElector::new(leases.clone(), fast_config(ME));

        assert!(elector.try_acquire_or_renew().await.unwrap());
        let spec = leases.lease.lock().unwrap().clone().unwrap().spec.unwrap();
        assert_eq!(spec.holder_identity.as_deref(), Some(ME));
        assert_eq!(spec.lease_transitions, Some(4));
    }

    #[tokio::test]
    async fn test_forbidden_is_fatal() {
        let leases = FakeLeases::default();
        leases.forbidden.store(true, Ordering::SeqCst);
        let elector = LeaderElector::new(leases, fast_config(ME));

        let result = timeout(
            Duration::from_secs(2),
            elector.run(CancellationToken::new(), |_leading| async {}),
        )
        .await
        .unwrap();

        assert!(matches!(result, Err(LeaderElectionError::Forbidden { .. })));
    }

    #[tokio::test]
    async fn test_run_rejects_invalid_config() {
        let mut config = fast_config(ME);
        config.retry_period = Duration::from_secs(5);
        let elector = LeaderElector::new(FakeLeases::default(), config);

        let result = elector
            .run(CancellationToken::new(), |_leading| async {})
            .await;

        assert!(matches!(result, Err(LeaderElectionError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_shutdown_stops_workload_and_releases_lease() {
        let leases = FakeLeases::default();
        let elector = LeaderElector::new(leases.clone(), fast_config(ME));
        let mut states = elector.subscribe();
        let shutdown = CancellationToken::new();
        let finished = Arc::new(AtomicBool::new(false));

        let trigger = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let flag = Arc::clone(&finished);
        let result = timeout(
            Duration::from_secs(2),
            elector.run(shutdown, move |leading| {
                let flag = Arc::clone(&flag);
                async move {
                    leading.cancelled().await;
                    flag.store(true, Ordering::SeqCst);
                }
            }),
        )
        .await
        .unwrap();

        assert!(matches!(result, Ok(None)));
        assert!(finished.load(Ordering::SeqCst));
        assert_eq!(leases.holder(), None);
        assert_eq!(*states.borrow_and_update(), LeadershipState::Standby);
    }

    #[tokio::test]
    async fn test_workload_exit_returns_output() {
        let leases = FakeLeases::default();
        let elector = LeaderElector::new(leases.clone(), fast_config(ME));

        let result = timeout(
            Duration::from_secs(2),
            elector.run(CancellationToken::new(), |_leading| async { 42 }),
        )
        .await
        .unwrap();

        assert_eq!(result.unwrap(), Some(42));
        assert_eq!(leases.holder(), None);
    }

    #[tokio::test]
    async fn test_losing_the_lease_cancels_workload() {
        let leases = FakeLeases::default();
        let elector = LeaderElector::new(leases.clone(), fast_config(ME));
        let mut states = elector.subscribe();
        let shutdown = CancellationToken::new();
        let (lost_tx, mut lost_rx) = tokio::sync::mpsc::unbounded_channel();

        let run = elector.run(shutdown.clone(), move |leading| {
            let lost_tx = lost_tx.clone();
            async move {
                leading.cancelled().await;
                let _ = lost_tx.send(());
            }
        });

        let scenario = async {
            timeout(Duration::from_secs(2), async {
                while *states.borrow_and_update() != LeadershipState::Leading {
                    states.changed().await.unwrap();
                }
            })
            .await
            .unwrap();

            // another replica steals the lease
            leases.put(held_lease(OTHER, Timestamp::now(), 15));

            timeout(Duration::from_secs(2), lost_rx.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(leases.holder().as_deref(), Some(OTHER));
            shutdown.cancel();
        };

        let (result, ()) = tokio::join!(run, scenario);
        assert!(matches!(result, Ok(None)));
    }
}
