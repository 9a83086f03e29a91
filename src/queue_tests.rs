// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Unit tests for `queue.rs`

#[cfg(test)]
mod tests {
    use super::super::*;
    use tokio::time::timeout;

    fn queue(max_attempts: u32) -> Arc<ChangeQueue<ReconcileKey>> {
        Arc::new(ChangeQueue::new(RetryPolicy::queue(max_attempts)))
    }

    fn key(name: &str) -> ReconcileKey {
        ReconcileKey::new("istio-system", name)
    }

    #[test]
    fn test_reconcile_key_display() {
        assert_eq!(
            ReconcileKey::new("istio-system", "istio-ingressgateway").to_string(),
            "istio-system/istio-ingressgateway"
        );
    }

    #[tokio::test]
    async fn test_burst_of_enqueues_coalesces() {
        let q = queue(15);

        assert!(q.enqueue(key("svc")));
        assert!(!q.enqueue(key("svc")));
        assert!(!q.enqueue(key("svc")));
        assert_eq!(q.len(), 1);

        assert_eq!(q.dequeue().await, Some(key("svc")));
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn test_distinct_keys_are_fifo() {
        let q = queue(15);
        q.enqueue(key("a"));
        q.enqueue(key("b"));

        assert_eq!(q.dequeue().await, Some(key("a")));
        assert_eq!(q.dequeue().await, Some(key("b")));
    }

    #[tokio::test]
    async fn test_key_enqueued_while_processing_is_requeued_on_done() {
        let q = queue(15);
        q.enqueue(key("svc"));
        let k = q.dequeue().await.unwrap();

        assert!(q.enqueue(key("svc")));
        assert!(!q.enqueue(key("svc")));
        assert_eq!(q.len(), 0, "must not be handed out while in flight");

        q.done(&k);
        assert_eq!(q.len(), 1);
        assert_eq!(q.dequeue().await, Some(key("svc")));
    }

    #[tokio::test]
    async fn test_done_without_new_events_leaves_queue_empty() {
        let q = queue(15);
        q.enqueue(key("svc"));
        let k = q.dequeue().await.unwrap();
        q.done(&k);

        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn test_dequeue_waits_for_enqueue() {
        let q = queue(15);
        let producer = Arc::clone(&q);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            producer.enqueue(key("late"));
        });

        let got = timeout(Duration::from_secs(2), q.dequeue()).await.unwrap();
        assert_eq!(got, Some(key("late")));
    }

    #[tokio::test]
    async fn test_shut_down_releases_waiting_workers() {
        let q = queue(15);
        let worker = {
            let q = Arc::clone(&q);
            tokio::spawn(async move { q.dequeue().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        q.shut_down();

        let got = timeout(Duration::from_secs(2), worker).await.unwrap().unwrap();
        assert_eq!(got, None);
        assert!(!q.enqueue(key("svc")));
        assert!(q.is_shutting_down());
    }

    #[tokio::test]
    async fn test_requeue_rate_limited_backs_off_per_key() {
        let q = queue(15);

        assert_eq!(q.requeue_rate_limited(key("a")), Some(Duration::from_millis(5)));
        assert_eq!(q.requeue_rate_limited(key("a")), Some(Duration::from_millis(10)));
        assert_eq!(q.requeue_rate_limited(key("b")), Some(Duration::from_millis(5)));
        assert_eq!(q.num_requeues(&key("a")), 2);

        q.forget(&key("a"));
        assert_eq!(q.num_requeues(&key("a")), 0);
        assert_eq!(q.requeue_rate_limited(key("a")), Some(Duration::from_millis(5)));
    }

    #[tokio::test]
    async fn test_requeued_key_comes_back_after_delay() {
        let q = queue(15);

        q.requeue_rate_limited(key("svc"));

        let got = timeout(Duration::from_secs(2), q.dequeue()).await.unwrap();
        assert_eq!(got, Some(key("svc")));
    }

    #[tokio::test]
    async fn test_key_dropped_after_attempt_cap() {
        let q = queue(2);

        assert!(q.requeue_rate_limited(key("svc")).is_some());
        assert!(q.requeue_rate_limited(key("svc")).is_some());
        assert_eq!(q.requeue_rate_limited(key("svc")), None);
        assert_eq!(q.num_requeues(&key("svc")), 0);
    }

    #[tokio::test]
    async fn test_enqueue_after_delivers_later() {
        let q = queue(15);

        q.enqueue_after(key("svc"), Duration::from_millis(30));
        assert!(q.is_empty());

        let got = timeout(Duration::from_secs(2), q.dequeue()).await.unwrap();
        assert_eq!(got, Some(key("svc")));
    }

    #[tokio::test]
    async fn test_enqueue_after_is_discarded_on_shutdown() {
        let q = queue(15);

        q.enqueue_after(key("svc"), Duration::from_millis(20));
        q.shut_down();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn test_shut_down_with_drain_waits_for_in_flight_key() {
        let q = queue(15);
        q.enqueue(key("svc"));
        let k = q.dequeue().await.unwrap();

        let finisher = {
            let q = Arc::clone(&q);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(30)).await;
                q.done(&k);
            })
        };

        timeout(Duration::from_secs(2), q.shut_down_with_drain())
            .await
            .unwrap();
        finisher.await.unwrap();
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn test_shut_down_with_drain_returns_immediately_when_idle() {
        let q = queue(15);

        timeout(Duration::from_millis(500), q.shut_down_with_drain())
            .await
            .unwrap();
    }
}
