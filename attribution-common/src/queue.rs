//! # RetryQueue
//!
//! Durable queue of deliveries that failed and will be attempted again on a backoff ladder.
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::retry::RetryPolicy;
use crate::store::{EventStore, StoreError};

/// Enumeration of errors for operations on the RetryQueue.
#[derive(Error, Debug)]
pub enum QueueError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("queue item {0} does not exist")]
    NotFound(i64),
    #[error("queue item {id} is {status} and not pending")]
    NotPending { id: i64, status: QueueStatus },
    #[error("queue item {0} was modified by another worker")]
    ClaimLost(i64),
}

#[derive(Error, Debug, PartialEq)]
#[error("{0} is not a valid QueueStatus")]
pub struct ParseQueueStatusError(String);

/// Enumeration of possible statuses for a QueueItem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "queue_status")]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum QueueStatus {
    /// Waiting for its next attempt.
    Pending,
    /// Delivered on a retry, or found to be delivered already.
    Completed,
    /// Out of attempts, or not deliverable at all.
    Failed,
    /// Cancelled by an operator.
    Cancelled,
}

impl QueueStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, QueueStatus::Pending)
    }
}

impl FromStr for QueueStatus {
    type Err = ParseQueueStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(QueueStatus::Pending),
            "completed" => Ok(QueueStatus::Completed),
            "failed" => Ok(QueueStatus::Failed),
            "cancelled" => Ok(QueueStatus::Cancelled),
            invalid => Err(ParseQueueStatusError(invalid.to_owned())),
        }
    }
}

impl fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            QueueStatus::Pending => write!(f, "pending"),
            QueueStatus::Completed => write!(f, "completed"),
            QueueStatus::Failed => write!(f, "failed"),
            QueueStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// A delivery waiting to be retried.
#[derive(sqlx::FromRow, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: i64,
    pub order_id: i64,
    pub destination: String,
    pub event_type: String,
    /// The payload exactly as prepared for the first attempt.
    pub payload: serde_json::Value,
    pub status: QueueStatus,
    /// Number of failed attempts made from the queue.
    pub attempts: i32,
    pub max_attempts: i32,
    pub next_retry_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl QueueItem {
    /// Whether the item is out of attempts once it has failed `attempts` times. The limit is the
    /// one in force when the item was enqueued.
    pub fn is_exhausted(&self, attempts: i32) -> bool {
        attempts >= self.max_attempts
    }
}

/// The columns of a QueueItem chosen by the caller on insert.
#[derive(Debug, Clone, PartialEq)]
pub struct NewQueueItem {
    pub order_id: i64,
    pub destination: String,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub max_attempts: i32,
    pub next_retry_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A state transition of a pending QueueItem.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueUpdate {
    pub status: QueueStatus,
    pub attempts: i32,
    pub next_retry_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Item counts by status for one destination.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: i64,
    pub completed: i64,
    pub failed: i64,
    pub cancelled: i64,
}

#[derive(Clone)]
pub struct RetryQueue {
    store: Arc<dyn EventStore>,
    policy: RetryPolicy,
}

impl RetryQueue {
    pub fn new(store: Arc<dyn EventStore>, policy: RetryPolicy) -> Self {
        Self { store, policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Queue a delivery that just failed its first attempt outside the queue.
    pub async fn enqueue(
        &self,
        order_id: i64,
        destination: &str,
        event_type: &str,
        payload: serde_json::Value,
        error: &str,
    ) -> Result<QueueItem, QueueError> {
        let now = Utc::now();
        let item = self
            .store
            .insert_queue_item(&NewQueueItem {
                order_id,
                destination: destination.to_owned(),
                event_type: event_type.to_owned(),
                payload,
                max_attempts: self.policy.max_attempts,
                next_retry_at: self.policy.next_retry_at(now, 0, None),
                last_error: Some(error.to_owned()),
                created_at: now,
            })
            .await?;

        info!(
            queue_item_id = item.id,
            order_id, destination, "enqueued delivery for retry"
        );
        metrics::counter!("attribution_queue_enqueued", &[("destination", destination.to_owned())])
            .increment(1);

        Ok(item)
    }

    pub async fn get(&self, id: i64) -> Result<QueueItem, QueueError> {
        self.store
            .get_queue_item(id)
            .await?
            .ok_or(QueueError::NotFound(id))
    }

    /// Claim the items due at `now`. Claimed items are hidden from other sweeps until the claim
    /// times out, so a crashed sweep only delays them.
    pub async fn claim_due(&self, now: DateTime<Utc>) -> Result<Vec<QueueItem>, QueueError> {
        let items = self
            .store
            .claim_due_queue_items(now, self.policy.batch_size, self.policy.claim_until(now))
            .await?;

        if !items.is_empty() {
            debug!("claimed {} due queue items", items.len());
        }

        Ok(items)
    }

    pub async fn complete(&self, id: i64) -> Result<QueueItem, QueueError> {
        let item = self.get_pending(id).await?;
        let now = Utc::now();

        self.transition(
            &item,
            QueueUpdate {
                status: QueueStatus::Completed,
                attempts: item.attempts,
                next_retry_at: item.next_retry_at,
                last_error: item.last_error.clone(),
                updated_at: now,
            },
        )
        .await
    }

    /// Record a failed retry: schedule the next attempt, or fail the item once out of attempts.
    pub async fn record_failure(
        &self,
        id: i64,
        error: &str,
        preferred_retry_interval: Option<time::Duration>,
    ) -> Result<QueueItem, QueueError> {
        let item = self.get_pending(id).await?;
        let now = Utc::now();
        let attempts = item.attempts + 1;

        let update = if item.is_exhausted(attempts) {
            QueueUpdate {
                status: QueueStatus::Failed,
                attempts,
                next_retry_at: item.next_retry_at,
                last_error: Some(error.to_owned()),
                updated_at: now,
            }
        } else {
            QueueUpdate {
                status: QueueStatus::Pending,
                attempts,
                next_retry_at: self
                    .policy
                    .next_retry_at(now, attempts, preferred_retry_interval),
                last_error: Some(error.to_owned()),
                updated_at: now,
            }
        };

        let updated = self.transition(&item, update).await?;

        if updated.status == QueueStatus::Failed {
            warn!(
                queue_item_id = id,
                destination = updated.destination,
                attempts,
                "queue item exhausted its attempts: {}",
                error
            );
        }

        Ok(updated)
    }

    /// Fail an item immediately. Used for data errors that no retry can fix.
    pub async fn fail(&self, id: i64, error: &str) -> Result<QueueItem, QueueError> {
        let item = self.get_pending(id).await?;
        let now = Utc::now();

        self.transition(
            &item,
            QueueUpdate {
                status: QueueStatus::Failed,
                attempts: item.attempts,
                next_retry_at: item.next_retry_at,
                last_error: Some(error.to_owned()),
                updated_at: now,
            },
        )
        .await
    }

    pub async fn cancel(&self, id: i64) -> Result<QueueItem, QueueError> {
        let item = self.get_pending(id).await?;
        let now = Utc::now();

        let cancelled = self
            .transition(
                &item,
                QueueUpdate {
                    status: QueueStatus::Cancelled,
                    attempts: item.attempts,
                    next_retry_at: item.next_retry_at,
                    last_error: item.last_error.clone(),
                    updated_at: now,
                },
            )
            .await?;

        info!(queue_item_id = id, "cancelled queue item");

        Ok(cancelled)
    }

    /// Delete terminal items older than `retention`.
    pub async fn purge(&self, retention: chrono::Duration) -> Result<u64, QueueError> {
        Ok(self
            .store
            .purge_queue_items(Utc::now() - retention)
            .await?)
    }

    pub async fn stats(&self) -> Result<BTreeMap<String, QueueStats>, QueueError> {
        let mut stats: BTreeMap<String, QueueStats> = BTreeMap::new();

        for row in self.store.queue_counts().await? {
            let entry = stats.entry(row.destination).or_default();
            match row.status {
                QueueStatus::Pending => entry.pending += row.count,
                QueueStatus::Completed => entry.completed += row.count,
                QueueStatus::Failed => entry.failed += row.count,
                QueueStatus::Cancelled => entry.cancelled += row.count,
            }
        }

        Ok(stats)
    }

    async fn get_pending(&self, id: i64) -> Result<QueueItem, QueueError> {
        let item = self.get(id).await?;

        if item.status != QueueStatus::Pending {
            return Err(QueueError::NotPending {
                id,
                status: item.status,
            });
        }

        Ok(item)
    }

    async fn transition(&self, item: &QueueItem, update: QueueUpdate) -> Result<QueueItem, QueueError> {
        match self
            .store
            .update_pending_queue_item(item.id, Some(item.attempts), &update)
            .await?
        {
            Some(updated) => {
                metrics::counter!(
                    "attribution_queue_transitions",
                    &[
                        ("destination", updated.destination.clone()),
                        ("status", updated.status.to_string()),
                    ]
                )
                .increment(1);
                Ok(updated)
            }
            None => Err(QueueError::ClaimLost(item.id)),
        }
    }
}
