//! # DeliveryLog
//!
//! Append-only record of every delivery attempt. Doubles as the dedup oracle: a conversion is
//! never sent twice to the same destination while a successful attempt is within the window.
use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::order::ConversionRecord;
use crate::store::{EventStore, StoreError};

/// Enumeration of possible statuses for a DeliveryLogEntry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "delivery_status")]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Success,
    Failed,
}

#[derive(sqlx::FromRow, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryLogEntry {
    pub id: i64,
    pub order_id: i64,
    pub destination: String,
    pub event_type: String,
    pub event_id: String,
    pub status: DeliveryStatus,
    pub response_code: Option<i32>,
    pub response_body: Option<String>,
    pub click_ids_snapshot: serde_json::Value,
    pub attribution_snapshot: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewDeliveryLogEntry {
    pub order_id: i64,
    pub destination: String,
    pub event_type: String,
    pub event_id: String,
    pub status: DeliveryStatus,
    pub response_code: Option<i32>,
    pub response_body: Option<String>,
    pub click_ids_snapshot: serde_json::Value,
    pub attribution_snapshot: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Attempt counts by outcome for one destination.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryStats {
    pub success: i64,
    pub failed: i64,
}

/// Identifies one attempt being logged.
#[derive(Debug, Clone, Copy)]
pub struct Attempt<'a> {
    pub order_id: i64,
    pub destination: &'a str,
    pub event_type: &'a str,
    pub event_id: &'a str,
}

#[derive(Debug, Clone)]
pub struct DedupConfig {
    /// How far back a successful delivery suppresses another send.
    pub window: chrono::Duration,
    /// Response bodies are cut to this many characters before being stored.
    pub max_response_body: usize,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            window: chrono::Duration::hours(1),
            max_response_body: 1000,
        }
    }
}

/// A deterministic event id: the same order, destination and event type always produce the same
/// id, so destinations that deduplicate on it drop our repeats.
pub fn stable_event_id(order_id: i64, destination: &str, event_type: &str) -> String {
    let digest = Sha256::digest(format!("{order_id}:{destination}:{event_type}").as_bytes());
    let hex = hex::encode(digest);

    format!("{event_type}_{order_id}_{}", &hex[..16])
}

/// A fresh event id for every call, for correlating a single attempt across systems.
pub fn unique_event_id(order_id: i64, destination: &str, event_type: &str) -> String {
    let millis = Utc::now().timestamp_millis();
    let nonce = uuid::Uuid::new_v4();
    let digest = Sha256::digest(
        format!("{order_id}:{destination}:{event_type}:{millis}:{nonce}").as_bytes(),
    );
    let hex = hex::encode(digest);

    format!("{event_type}_{order_id}_{}", &hex[..16])
}

/// Cut a string to at most `max_chars` characters, respecting char boundaries.
pub fn truncate(body: &str, max_chars: usize) -> String {
    match body.char_indices().nth(max_chars) {
        Some((index, _)) => body[..index].to_owned(),
        None => body.to_owned(),
    }
}

#[derive(Clone)]
pub struct DeliveryLog {
    store: Arc<dyn EventStore>,
    config: DedupConfig,
}

impl DeliveryLog {
    pub fn new(store: Arc<dyn EventStore>, config: DedupConfig) -> Self {
        Self { store, config }
    }

    pub fn window(&self) -> chrono::Duration {
        self.config.window
    }

    /// Whether a successful delivery of this event to this destination exists within `window`.
    pub async fn is_duplicate(
        &self,
        order_id: i64,
        destination: &str,
        event_type: &str,
        window: chrono::Duration,
    ) -> Result<bool, StoreError> {
        self.store
            .has_successful_delivery(order_id, destination, event_type, Utc::now() - window)
            .await
    }

    pub async fn log_success(
        &self,
        attempt: Attempt<'_>,
        conversion: Option<&ConversionRecord>,
        response_code: Option<u16>,
        response_body: Option<&str>,
    ) -> Result<DeliveryLogEntry, StoreError> {
        self.append(attempt, DeliveryStatus::Success, conversion, response_code, response_body)
            .await
    }

    pub async fn log_failure(
        &self,
        attempt: Attempt<'_>,
        conversion: Option<&ConversionRecord>,
        response_code: Option<u16>,
        error: &str,
    ) -> Result<DeliveryLogEntry, StoreError> {
        self.append(attempt, DeliveryStatus::Failed, conversion, response_code, Some(error))
            .await
    }

    pub async fn entries_for_order(&self, order_id: i64) -> Result<Vec<DeliveryLogEntry>, StoreError> {
        self.store.delivery_log_for_order(order_id).await
    }

    /// Delete entries older than `retention`.
    pub async fn purge(&self, retention: chrono::Duration) -> Result<u64, StoreError> {
        self.store.purge_delivery_log(Utc::now() - retention).await
    }

    pub async fn stats(&self) -> Result<BTreeMap<String, DeliveryStats>, StoreError> {
        let mut stats: BTreeMap<String, DeliveryStats> = BTreeMap::new();

        for row in self.store.delivery_counts().await? {
            let entry = stats.entry(row.destination).or_default();
            match row.status {
                DeliveryStatus::Success => entry.success += row.count,
                DeliveryStatus::Failed => entry.failed += row.count,
            }
        }

        Ok(stats)
    }

    async fn append(
        &self,
        attempt: Attempt<'_>,
        status: DeliveryStatus,
        conversion: Option<&ConversionRecord>,
        response_code: Option<u16>,
        response_body: Option<&str>,
    ) -> Result<DeliveryLogEntry, StoreError> {
        let (click_ids_snapshot, attribution_snapshot) = snapshots(conversion);

        let entry = NewDeliveryLogEntry {
            order_id: attempt.order_id,
            destination: attempt.destination.to_owned(),
            event_type: attempt.event_type.to_owned(),
            event_id: attempt.event_id.to_owned(),
            status,
            response_code: response_code.map(i32::from),
            response_body: response_body.map(|body| truncate(body, self.config.max_response_body)),
            click_ids_snapshot,
            attribution_snapshot,
            created_at: Utc::now(),
        };

        let logged = self.store.append_delivery_log(&entry).await;

        if let Err(e) = &logged {
            warn!(
                order_id = attempt.order_id,
                destination = attempt.destination,
                "failed to write delivery log entry: {}",
                e
            );
        }

        logged
    }
}

/// Snapshots of what we knew when sending. Conversions without consent carry nothing.
fn snapshots(conversion: Option<&ConversionRecord>) -> (serde_json::Value, serde_json::Value) {
    match conversion {
        Some(record) if record.order.consent.allows_touchpoints() => (
            serde_json::to_value(record.click_ids()).unwrap_or_default(),
            serde_json::to_value(&record.attribution).unwrap_or_default(),
        ),
        _ => (serde_json::json!({}), serde_json::json!({})),
    }
}
