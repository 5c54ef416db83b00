use std::time;

use attribution_common::dispatcher::{Dispatcher, SweepReport};
use attribution_common::health::HealthHandle;
use tokio::time::Instant;
use tracing::error;

/// Periodically retries due items of the retry queue.
pub struct RetrySweeper {
    /// An identifier for this sweeper, used in logs.
    name: String,
    dispatcher: Dispatcher,
    /// The interval between two sweeps.
    sweep_interval: time::Duration,
    /// The liveness check handle, to call on a schedule to report healthy
    liveness: HealthHandle,
}

impl RetrySweeper {
    pub fn new(
        name: &str,
        dispatcher: Dispatcher,
        sweep_interval: time::Duration,
        liveness: HealthHandle,
    ) -> Self {
        Self {
            name: name.to_owned(),
            dispatcher,
            sweep_interval,
            liveness,
        }
    }

    /// Run one sweep. Failures are logged and reported as an empty sweep with one error, so the
    /// loop keeps going.
    pub async fn sweep(&self) -> SweepReport {
        let start = Instant::now();

        let report = match self.dispatcher.sweep_once().await {
            Ok(report) => report,
            Err(e) => {
                error!(sweeper = self.name, "failed to sweep retry queue: {}", e);
                SweepReport {
                    errors: 1,
                    ..SweepReport::default()
                }
            }
        };

        metrics::histogram!("attribution_sweep_duration_seconds")
            .record(start.elapsed().as_secs_f64());
        for (outcome, count) in [
            ("delivered", report.delivered),
            ("already_delivered", report.already_delivered),
            ("rescheduled", report.rescheduled),
            ("exhausted", report.exhausted),
            ("discarded", report.discarded),
            ("error", report.errors),
        ] {
            if count > 0 {
                metrics::counter!("attribution_sweep_items", &[("outcome", outcome)])
                    .increment(u64::try_from(count).unwrap_or(u64::MAX));
            }
        }

        report
    }

    /// Sweep on every tick of the interval, forever.
    pub async fn run(&self) {
        let mut interval = tokio::time::interval(self.sweep_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            interval.tick().await;
            self.liveness.report_healthy();

            self.sweep().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use attribution_common::attribution::AttributionResult;
    use attribution_common::delivery_log::{DedupConfig, DeliveryLog, DeliveryStatus};
    use attribution_common::health::HealthRegistry;
    use attribution_common::order::ConversionRecord;
    use attribution_common::queue::{QueueStatus, RetryQueue};
    use attribution_common::retry::RetryPolicy;
    use attribution_common::store::{EventStore, MemoryStore};
    use attribution_common::webhook::{build_http_client, webhook_destinations, WebhookConfig};
    use chrono::Utc;
    use httpmock::prelude::*;
    use serde_json::json;

    fn conversion(order_id: i64) -> ConversionRecord {
        ConversionRecord {
            order: serde_json::from_value(json!({
                "order_id": order_id,
                "email": "buyer@example.com",
                "total": 12.5,
                "currency": "USD",
            }))
            .unwrap(),
            touchpoints: Vec::new(),
            attribution: AttributionResult::default(),
            cross_device: None,
            email_hash: None,
            recorded_at: Utc::now(),
        }
    }

    async fn sweeper(store: Arc<MemoryStore>, server: &MockServer) -> RetrySweeper {
        let config: WebhookConfig = format!("hook={}", server.url("/events")).parse().unwrap();
        let client = build_http_client(time::Duration::from_secs(5)).unwrap();
        let policy = RetryPolicy::build(3, vec![time::Duration::ZERO]).provide();
        let dispatcher = Dispatcher::new(
            webhook_destinations(vec![config], &client),
            store.clone(),
            DeliveryLog::new(store.clone(), DedupConfig::default()),
            RetryQueue::new(store, policy),
            Default::default(),
        );
        let registry = HealthRegistry::new("liveness");
        let liveness = registry.register("sweeper", time::Duration::from_secs(30));

        RetrySweeper::new("test", dispatcher, time::Duration::from_millis(10), liveness)
    }

    #[tokio::test]
    async fn test_sweep_delivers_due_items() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST).path("/events");
            then.status(200).body("ok");
        });
        let store = Arc::new(MemoryStore::new());
        let sweeper = sweeper(store.clone(), &server).await;
        store.save_conversion(&conversion(1)).await.unwrap();
        let queue = sweeper.dispatcher.queue().clone();
        let item = queue
            .enqueue(1, "hook", "purchase", json!({"event_id": "purchase_1"}), "boom")
            .await
            .unwrap();

        let report = sweeper.sweep().await;

        assert_eq!(report.claimed, 1);
        assert_eq!(report.delivered, 1);
        mock.assert();
        assert_eq!(queue.get(item.id).await.unwrap().status, QueueStatus::Completed);
        let log = store.delivery_log_for_order(1).await.unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].status, DeliveryStatus::Success);
        assert_eq!(log[0].event_id, "purchase_1");
    }

    #[tokio::test]
    async fn test_sweep_exhausts_failing_items() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST).path("/events");
            then.status(500);
        });
        let store = Arc::new(MemoryStore::new());
        let sweeper = sweeper(store.clone(), &server).await;
        store.save_conversion(&conversion(2)).await.unwrap();
        let queue = sweeper.dispatcher.queue().clone();
        let item = queue
            .enqueue(2, "hook", "purchase", json!({}), "boom")
            .await
            .unwrap();
        // Only the last allowed attempt is left.
        for _ in 0..2 {
            queue.record_failure(item.id, "boom", None).await.unwrap();
        }

        let report = sweeper.sweep().await;

        assert_eq!(report.exhausted, 1);
        mock.assert_hits(1);
        let item = queue.get(item.id).await.unwrap();
        assert_eq!(item.status, QueueStatus::Failed);
        assert_eq!(item.attempts, 3);
    }

    #[tokio::test]
    async fn test_sweep_discards_items_without_conversion() {
        let server = MockServer::start();
        let store = Arc::new(MemoryStore::new());
        let sweeper = sweeper(store.clone(), &server).await;
        let queue = sweeper.dispatcher.queue().clone();
        let item = queue
            .enqueue(3, "hook", "purchase", json!({}), "boom")
            .await
            .unwrap();

        let report = sweeper.sweep().await;

        assert_eq!(report.discarded, 1);
        assert_eq!(queue.get(item.id).await.unwrap().status, QueueStatus::Failed);
    }
}
