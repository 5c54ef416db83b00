//! # Dispatcher
//!
//! Fans a conversion out to every destination, each independently: one slow or failing
//! destination never holds back or undoes another.
use std::collections::HashMap;
use std::sync::Arc;
use std::time;

use chrono::Utc;
use futures::future::join_all;
use futures::{stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::time::{timeout, Instant};
use tracing::{debug, error, info, warn};

use crate::delivery_log::{stable_event_id, Attempt, DeliveryLog};
use crate::destination::{Destination, SendResult};
use crate::order::ConversionRecord;
use crate::queue::{QueueError, QueueItem, QueueStatus, RetryQueue};
use crate::store::EventStore;

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Whether failed sends are queued for retry.
    pub queue_enabled: bool,
    /// Upper bound on a single send.
    pub send_timeout: time::Duration,
    /// Number of queue items retried at once by a sweep.
    pub sweep_concurrency: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            queue_enabled: true,
            send_timeout: time::Duration::from_secs(30),
            sweep_concurrency: 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// The order turned the destination off.
    Disabled,
    NotConfigured,
    /// The destination declined this conversion.
    Filtered,
    MissingClickId,
    /// Already delivered within the dedup window.
    Duplicate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DispatchOutcome {
    Sent {
        event_id: String,
        response_code: Option<u16>,
    },
    Skipped {
        reason: SkipReason,
    },
    Queued {
        error: String,
        queue_item_id: i64,
    },
    Failed {
        error: String,
    },
}

impl DispatchOutcome {
    fn label(&self) -> &'static str {
        match self {
            DispatchOutcome::Sent { .. } => "sent",
            DispatchOutcome::Skipped { .. } => "skipped",
            DispatchOutcome::Queued { .. } => "queued",
            DispatchOutcome::Failed { .. } => "failed",
        }
    }
}

/// What happened to one claimed queue item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryOutcome {
    Delivered,
    /// Another attempt already succeeded, so nothing was sent.
    AlreadyDelivered,
    Rescheduled,
    Exhausted,
    /// The item can never be delivered and was failed without sending.
    Discarded,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    pub claimed: usize,
    pub delivered: usize,
    pub already_delivered: usize,
    pub rescheduled: usize,
    pub exhausted: usize,
    pub discarded: usize,
    pub errors: usize,
}

#[derive(Clone)]
pub struct Dispatcher {
    destinations: Vec<Arc<dyn Destination>>,
    store: Arc<dyn EventStore>,
    delivery_log: DeliveryLog,
    queue: RetryQueue,
    config: DispatcherConfig,
}

impl Dispatcher {
    pub fn new(
        destinations: Vec<Arc<dyn Destination>>,
        store: Arc<dyn EventStore>,
        delivery_log: DeliveryLog,
        queue: RetryQueue,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            destinations,
            store,
            delivery_log,
            queue,
            config,
        }
    }

    pub fn destination_names(&self) -> Vec<&str> {
        self.destinations.iter().map(|d| d.name()).collect()
    }

    pub fn queue(&self) -> &RetryQueue {
        &self.queue
    }

    pub fn delivery_log(&self) -> &DeliveryLog {
        &self.delivery_log
    }

    /// Send a conversion to every destination concurrently.
    pub async fn dispatch(&self, conversion: &ConversionRecord) -> HashMap<String, DispatchOutcome> {
        let sends = self.destinations.iter().map(|destination| async move {
            let outcome = self.dispatch_one(destination.as_ref(), conversion).await;

            metrics::counter!(
                "attribution_dispatch_outcomes",
                &[
                    ("destination", destination.name().to_owned()),
                    ("outcome", outcome.label().to_owned()),
                ]
            )
            .increment(1);

            (destination.name().to_owned(), outcome)
        });

        join_all(sends).await.into_iter().collect()
    }

    async fn dispatch_one(
        &self,
        destination: &dyn Destination,
        conversion: &ConversionRecord,
    ) -> DispatchOutcome {
        let order = &conversion.order;
        let name = destination.name();
        let event_type = destination.event_type();

        if !order.destination_enabled(name) {
            return DispatchOutcome::Skipped {
                reason: SkipReason::Disabled,
            };
        }
        if !destination.is_configured() {
            return DispatchOutcome::Skipped {
                reason: SkipReason::NotConfigured,
            };
        }
        if !destination.should_send(conversion) {
            return DispatchOutcome::Skipped {
                reason: SkipReason::Filtered,
            };
        }
        if let Some(click_id_type) = destination.required_click_id() {
            if conversion.click_id(click_id_type).is_none() && !destination.supports_signalless() {
                return DispatchOutcome::Skipped {
                    reason: SkipReason::MissingClickId,
                };
            }
        }

        match self
            .delivery_log
            .is_duplicate(order.order_id, name, event_type, self.delivery_log.window())
            .await
        {
            Ok(true) => {
                debug!(order_id = order.order_id, destination = name, "skipping duplicate");
                return DispatchOutcome::Skipped {
                    reason: SkipReason::Duplicate,
                };
            }
            Ok(false) => {}
            Err(e) => {
                // An unknown dedup state is treated as "not sent": the destination dedups on the
                // stable event id anyway.
                warn!(
                    order_id = order.order_id,
                    destination = name,
                    "dedup check failed, sending anyway: {}",
                    e
                );
            }
        }

        let event_id = stable_event_id(order.order_id, name, event_type);
        let attempt = Attempt {
            order_id: order.order_id,
            destination: name,
            event_type,
            event_id: &event_id,
        };

        let payload = match destination.prepare_payload(conversion, &event_id) {
            Ok(payload) => payload,
            Err(e) => {
                let error = format!("payload error: {e}");
                error!(order_id = order.order_id, destination = name, "{}", error);
                self.log_failure(attempt, Some(conversion), None, &error).await;
                return DispatchOutcome::Failed { error };
            }
        };

        let result = self.send(destination, conversion, &payload).await;

        if result.success {
            self.log_success(attempt, Some(conversion), &result).await;
            info!(order_id = order.order_id, destination = name, "conversion sent");
            return DispatchOutcome::Sent {
                event_id,
                response_code: result.response_code,
            };
        }

        let error = result.error_message();
        self.log_failure(attempt, Some(conversion), result.response_code, &error)
            .await;

        if !self.config.queue_enabled {
            warn!(order_id = order.order_id, destination = name, "send failed: {}", error);
            return DispatchOutcome::Failed { error };
        }

        match self
            .queue
            .enqueue(order.order_id, name, event_type, payload, &error)
            .await
        {
            Ok(item) => DispatchOutcome::Queued {
                error,
                queue_item_id: item.id,
            },
            Err(e) => {
                error!(
                    order_id = order.order_id,
                    destination = name,
                    "failed to enqueue retry: {}",
                    e
                );
                DispatchOutcome::Failed {
                    error: format!("{error}; enqueue failed: {e}"),
                }
            }
        }
    }

    /// Retry one claimed queue item with its stored payload.
    pub async fn retry(&self, item: &QueueItem) -> Result<RetryOutcome, QueueError> {
        let Some(destination) = self
            .destinations
            .iter()
            .find(|destination| destination.name() == item.destination)
        else {
            self.queue
                .fail(item.id, &format!("unknown destination {}", item.destination))
                .await?;
            return Ok(RetryOutcome::Discarded);
        };

        let Some(conversion) = self.store.get_conversion(item.order_id).await? else {
            self.queue
                .fail(item.id, &format!("conversion {} not found", item.order_id))
                .await?;
            return Ok(RetryOutcome::Discarded);
        };

        match self
            .delivery_log
            .is_duplicate(
                item.order_id,
                &item.destination,
                &item.event_type,
                self.delivery_log.window(),
            )
            .await
        {
            Ok(true) => {
                self.queue.complete(item.id).await?;
                return Ok(RetryOutcome::AlreadyDelivered);
            }
            Ok(false) => {}
            Err(e) => warn!(queue_item_id = item.id, "dedup check failed, sending anyway: {}", e),
        }

        let event_id = item
            .payload
            .get("event_id")
            .and_then(|value| value.as_str())
            .map(str::to_owned)
            .unwrap_or_else(|| stable_event_id(item.order_id, &item.destination, &item.event_type));
        let attempt = Attempt {
            order_id: item.order_id,
            destination: &item.destination,
            event_type: &item.event_type,
            event_id: &event_id,
        };

        let result = self
            .send(destination.as_ref(), &conversion, &item.payload)
            .await;

        if result.success {
            self.log_success(attempt, Some(&conversion), &result).await;
            self.queue.complete(item.id).await?;
            info!(queue_item_id = item.id, destination = item.destination, "retry delivered");
            return Ok(RetryOutcome::Delivered);
        }

        let error = result.error_message();
        self.log_failure(attempt, Some(&conversion), result.response_code, &error)
            .await;

        let updated = self
            .queue
            .record_failure(item.id, &error, result.retry_after)
            .await?;

        Ok(match updated.status {
            QueueStatus::Failed => RetryOutcome::Exhausted,
            _ => RetryOutcome::Rescheduled,
        })
    }

    /// Claim a batch of due queue items and retry them with bounded concurrency.
    pub async fn sweep_once(&self) -> Result<SweepReport, QueueError> {
        let items = self.queue.claim_due(Utc::now()).await?;
        let mut report = SweepReport {
            claimed: items.len(),
            ..SweepReport::default()
        };

        if items.is_empty() {
            return Ok(report);
        }

        let results: Vec<Result<RetryOutcome, QueueError>> = stream::iter(items.iter())
            .map(|item| self.retry(item))
            .buffer_unordered(self.config.sweep_concurrency.max(1))
            .collect()
            .await;

        for result in results {
            match result {
                Ok(RetryOutcome::Delivered) => report.delivered += 1,
                Ok(RetryOutcome::AlreadyDelivered) => report.already_delivered += 1,
                Ok(RetryOutcome::Rescheduled) => report.rescheduled += 1,
                Ok(RetryOutcome::Exhausted) => report.exhausted += 1,
                Ok(RetryOutcome::Discarded) => report.discarded += 1,
                Err(e) => {
                    // The claim expires, so the item is picked up again by a later sweep.
                    error!("failed to retry queue item: {}", e);
                    report.errors += 1;
                }
            }
        }

        info!(
            claimed = report.claimed,
            delivered = report.delivered,
            rescheduled = report.rescheduled,
            exhausted = report.exhausted,
            "sweep finished"
        );

        Ok(report)
    }

    async fn send(
        &self,
        destination: &dyn Destination,
        conversion: &ConversionRecord,
        payload: &serde_json::Value,
    ) -> SendResult {
        let start = Instant::now();

        let result = match timeout(
            self.config.send_timeout,
            destination.send(&conversion.order, payload),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => SendResult::failure(format!(
                "send timed out after {}s",
                self.config.send_timeout.as_secs_f64()
            )),
        };

        metrics::histogram!(
            "attribution_send_duration_seconds",
            &[
                ("destination", destination.name().to_owned()),
                ("success", result.success.to_string()),
            ]
        )
        .record(start.elapsed().as_secs_f64());

        result
    }

    async fn log_success(
        &self,
        attempt: Attempt<'_>,
        conversion: Option<&ConversionRecord>,
        result: &SendResult,
    ) {
        // Failures to write the log are reported by the log itself.
        if self
            .delivery_log
            .log_success(
                attempt,
                conversion,
                result.response_code,
                result.response_body.as_deref(),
            )
            .await
            .is_err()
        {
            metrics::counter!("attribution_delivery_log_errors").increment(1);
        }
    }

    async fn log_failure(
        &self,
        attempt: Attempt<'_>,
        conversion: Option<&ConversionRecord>,
        response_code: Option<u16>,
        error: &str,
    ) {
        if self
            .delivery_log
            .log_failure(attempt, conversion, response_code, error)
            .await
            .is_err()
        {
            metrics::counter!("attribution_delivery_log_errors").increment(1);
        }
    }
}
