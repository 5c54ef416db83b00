use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{error, info};

use attribution_common::delivery_log::{DedupConfig, DeliveryLog};
use attribution_common::fingerprint::FingerprintTracker;
use attribution_common::queue::RetryQueue;
use attribution_common::retry::RetryPolicy;
use attribution_common::store::EventStore;

use crate::cleanup::{Cleaner, CleanerError, CleanupReport};

/// How long each kind of record is kept.
#[derive(Debug, Clone)]
pub struct RetentionConfig {
    /// Completed, failed and cancelled queue items. Pending items are never purged.
    pub queue: chrono::Duration,
    pub delivery_log: chrono::Duration,
    /// Touchpoint history, stale buffers and fingerprints.
    pub touchpoints: chrono::Duration,
    /// Identity edges, counted from their `last_seen`.
    pub identity_edges: chrono::Duration,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            queue: chrono::Duration::days(30),
            delivery_log: chrono::Duration::days(90),
            touchpoints: chrono::Duration::days(90),
            identity_edges: chrono::Duration::days(365),
        }
    }
}

pub struct RetentionCleaner {
    store: Arc<dyn EventStore>,
    queue: RetryQueue,
    delivery_log: DeliveryLog,
    fingerprints: FingerprintTracker,
    retention: RetentionConfig,
}

impl RetentionCleaner {
    pub fn new(store: Arc<dyn EventStore>, retention: RetentionConfig) -> Self {
        Self {
            queue: RetryQueue::new(store.clone(), RetryPolicy::default()),
            delivery_log: DeliveryLog::new(store.clone(), DedupConfig::default()),
            fingerprints: FingerprintTracker::new(store.clone(), retention.touchpoints),
            store,
            retention,
        }
    }
}

fn record_step<E: fmt::Display>(report: &mut CleanupReport, step: &'static str, result: Result<u64, E>) {
    match result {
        Ok(count) => {
            info!(step, count, "purged expired rows");
            metrics::counter!("attribution_janitor_purged_rows", &[("step", step)]).increment(count);
            report.purged.insert(step, count);
        }
        Err(e) => {
            error!(step, "cleanup step failed: {}", e);
            metrics::counter!("attribution_janitor_failures", &[("step", step)]).increment(1);
            report.failures.push(CleanerError::StepFailed {
                step,
                error: e.to_string(),
            });
        }
    }
}

#[async_trait]
impl Cleaner for RetentionCleaner {
    async fn cleanup(&self) -> CleanupReport {
        let start = Instant::now();
        let now = Utc::now();
        let mut report = CleanupReport::default();

        record_step(
            &mut report,
            "retry_queue",
            self.queue.purge(self.retention.queue).await,
        );
        record_step(
            &mut report,
            "delivery_log",
            self.delivery_log.purge(self.retention.delivery_log).await,
        );
        record_step(
            &mut report,
            "touchpoints",
            self.store
                .purge_touchpoints(now - self.retention.touchpoints)
                .await,
        );
        record_step(
            &mut report,
            "fingerprints",
            self.fingerprints.purge_expired().await,
        );
        record_step(
            &mut report,
            "identity_edges",
            self.store
                .purge_identity_edges(now - self.retention.identity_edges)
                .await,
        );

        metrics::histogram!("attribution_janitor_cleanup_duration_seconds")
            .record(start.elapsed().as_secs_f64());

        report
    }
}
