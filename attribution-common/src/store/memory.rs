//! In-process EventStore, used by tests and single-process deployments.
use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use super::{EventStore, StatusCount, StoreResult};
use crate::capture::{BufferAppend, CaptureOutcome};
use crate::delivery_log::{DeliveryLogEntry, DeliveryStatus, NewDeliveryLogEntry};
use crate::fingerprint::FingerprintRecord;
use crate::identity::IdentityEdge;
use crate::order::ConversionRecord;
use crate::queue::{NewQueueItem, QueueItem, QueueStatus, QueueUpdate};
use crate::touchpoint::{DeviceType, Touchpoint};

struct BufferRow {
    touchpoints: Vec<Touchpoint>,
    updated_at: DateTime<Utc>,
    converted_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct Inner {
    buffers: HashMap<String, BufferRow>,
    history: Vec<Touchpoint>,
    edges: Vec<IdentityEdge>,
    fingerprints: HashMap<String, FingerprintRecord>,
    conversions: HashMap<i64, ConversionRecord>,
    delivery_log: Vec<DeliveryLogEntry>,
    queue: BTreeMap<i64, QueueItem>,
    last_delivery_log_id: i64,
    last_queue_id: i64,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn count_by<S: Copy + Ord>(rows: impl Iterator<Item = (String, S)>) -> Vec<StatusCount<S>> {
    let mut counts: BTreeMap<(String, S), i64> = BTreeMap::new();
    for key in rows {
        *counts.entry(key).or_default() += 1;
    }

    counts
        .into_iter()
        .map(|((destination, status), count)| StatusCount {
            destination,
            status,
            count,
        })
        .collect()
}

fn removed(before: usize, after: usize) -> u64 {
    u64::try_from(before - after).unwrap_or(u64::MAX)
}

#[async_trait]
impl EventStore for MemoryStore {
    async fn load_buffer(&self, visitor_id: &str) -> StoreResult<Vec<Touchpoint>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .buffers
            .get(visitor_id)
            .map(|row| row.touchpoints.clone())
            .unwrap_or_default())
    }

    async fn append_to_buffer(
        &self,
        visitor_id: &str,
        append: &BufferAppend,
    ) -> StoreResult<CaptureOutcome> {
        let mut inner = self.inner.lock().await;
        let (current, converted_at) = match inner.buffers.remove(visitor_id) {
            Some(row) => (row.touchpoints, row.converted_at),
            None => (Vec::new(), None),
        };

        let update = append.apply(current, converted_at);
        inner.history.extend(update.history);
        inner.buffers.insert(
            visitor_id.to_owned(),
            BufferRow {
                touchpoints: update.buffer,
                updated_at: append.touchpoint.timestamp,
                converted_at,
            },
        );

        Ok(update.outcome)
    }

    async fn take_buffer(
        &self,
        visitor_id: &str,
        converted_at: DateTime<Utc>,
    ) -> StoreResult<Vec<Touchpoint>> {
        let mut inner = self.inner.lock().await;
        let taken = inner
            .buffers
            .insert(
                visitor_id.to_owned(),
                BufferRow {
                    touchpoints: Vec::new(),
                    updated_at: converted_at,
                    converted_at: Some(converted_at),
                },
            )
            .map(|row| row.touchpoints)
            .unwrap_or_default();
        Ok(taken)
    }

    async fn append_history(&self, touchpoint: &Touchpoint) -> StoreResult<()> {
        let mut inner = self.inner.lock().await;
        inner.history.push(touchpoint.clone());
        Ok(())
    }

    async fn history_for_visitors(&self, visitor_ids: &[String]) -> StoreResult<Vec<Touchpoint>> {
        let inner = self.inner.lock().await;
        let mut touchpoints: Vec<Touchpoint> = inner
            .history
            .iter()
            .filter(|touchpoint| visitor_ids.contains(&touchpoint.visitor_id))
            .cloned()
            .collect();
        touchpoints.sort_by_key(|touchpoint| touchpoint.timestamp);
        Ok(touchpoints)
    }

    async fn ip_hashes_for_visitor(&self, visitor_id: &str) -> StoreResult<Vec<String>> {
        let inner = self.inner.lock().await;
        let mut ip_hashes: Vec<String> = inner
            .history
            .iter()
            .filter(|touchpoint| touchpoint.visitor_id == visitor_id)
            .filter_map(|touchpoint| touchpoint.ip_hash.clone())
            .collect();
        ip_hashes.sort();
        ip_hashes.dedup();
        Ok(ip_hashes)
    }

    async fn visitors_with_ip_hashes(&self, ip_hashes: &[String]) -> StoreResult<Vec<String>> {
        let inner = self.inner.lock().await;
        let mut visitors: Vec<String> = inner
            .history
            .iter()
            .filter(|touchpoint| {
                touchpoint
                    .ip_hash
                    .as_ref()
                    .is_some_and(|ip_hash| ip_hashes.contains(ip_hash))
            })
            .map(|touchpoint| touchpoint.visitor_id.clone())
            .collect();
        visitors.sort();
        visitors.dedup();
        Ok(visitors)
    }

    async fn purge_touchpoints(&self, older_than: DateTime<Utc>) -> StoreResult<u64> {
        let mut inner = self.inner.lock().await;
        let before = inner.history.len() + inner.buffers.len();
        inner
            .history
            .retain(|touchpoint| touchpoint.timestamp >= older_than);
        inner
            .buffers
            .retain(|_, row| row.updated_at >= older_than);
        Ok(removed(before, inner.history.len() + inner.buffers.len()))
    }

    async fn upsert_identity_edge(&self, edge: &IdentityEdge) -> StoreResult<bool> {
        let mut inner = self.inner.lock().await;
        let position = inner.edges.iter().position(|existing| {
            existing.email_hash == edge.email_hash && existing.visitor_id == edge.visitor_id
        });

        match position {
            Some(index) => {
                let existing = &mut inner.edges[index];
                existing.last_seen = existing.last_seen.max(edge.last_seen);
                Ok(false)
            }
            None => {
                inner.edges.push(edge.clone());
                Ok(true)
            }
        }
    }

    async fn edges_for_email(&self, email_hash: &str) -> StoreResult<Vec<IdentityEdge>> {
        let inner = self.inner.lock().await;
        let mut edges: Vec<IdentityEdge> = inner
            .edges
            .iter()
            .filter(|edge| edge.email_hash == email_hash)
            .cloned()
            .collect();
        edges.sort_by_key(|edge| edge.first_seen);
        Ok(edges)
    }

    async fn edges_for_visitor(&self, visitor_id: &str) -> StoreResult<Vec<IdentityEdge>> {
        let inner = self.inner.lock().await;
        let mut edges: Vec<IdentityEdge> = inner
            .edges
            .iter()
            .filter(|edge| edge.visitor_id == visitor_id)
            .cloned()
            .collect();
        edges.sort_by(|a, b| b.last_seen.cmp(&a.last_seen));
        Ok(edges)
    }

    async fn reassign_edges(
        &self,
        visitor_id: &str,
        email_hash: &str,
        fallback_device: DeviceType,
        now: DateTime<Utc>,
    ) -> StoreResult<IdentityEdge> {
        let mut inner = self.inner.lock().await;

        let (moving, kept): (Vec<IdentityEdge>, Vec<IdentityEdge>) = std::mem::take(&mut inner.edges)
            .into_iter()
            .partition(|edge| edge.visitor_id == visitor_id);
        inner.edges = kept;

        let merged = match moving.iter().max_by_key(|edge| edge.last_seen) {
            Some(latest) => IdentityEdge {
                email_hash: email_hash.to_owned(),
                visitor_id: visitor_id.to_owned(),
                device_type: latest.device_type,
                first_seen: moving
                    .iter()
                    .map(|edge| edge.first_seen)
                    .min()
                    .unwrap_or(now),
                last_seen: latest.last_seen,
            },
            None => IdentityEdge {
                email_hash: email_hash.to_owned(),
                visitor_id: visitor_id.to_owned(),
                device_type: fallback_device,
                first_seen: now,
                last_seen: now,
            },
        };

        inner.edges.push(merged.clone());
        Ok(merged)
    }

    async fn purge_identity_edges(&self, older_than: DateTime<Utc>) -> StoreResult<u64> {
        let mut inner = self.inner.lock().await;
        let before = inner.edges.len();
        inner.edges.retain(|edge| edge.last_seen >= older_than);
        Ok(removed(before, inner.edges.len()))
    }

    async fn get_fingerprint(&self, fingerprint_hash: &str) -> StoreResult<Option<FingerprintRecord>> {
        let inner = self.inner.lock().await;
        Ok(inner.fingerprints.get(fingerprint_hash).cloned())
    }

    async fn put_fingerprint(&self, record: &FingerprintRecord) -> StoreResult<()> {
        let mut inner = self.inner.lock().await;
        inner
            .fingerprints
            .insert(record.fingerprint_hash.clone(), record.clone());
        Ok(())
    }

    async fn purge_fingerprints(&self, older_than: DateTime<Utc>) -> StoreResult<u64> {
        let mut inner = self.inner.lock().await;
        let before = inner.fingerprints.len();
        inner
            .fingerprints
            .retain(|_, record| record.last_seen >= older_than);
        Ok(removed(before, inner.fingerprints.len()))
    }

    async fn save_conversion(&self, record: &ConversionRecord) -> StoreResult<()> {
        let mut inner = self.inner.lock().await;
        inner
            .conversions
            .entry(record.order_id())
            .or_insert_with(|| record.clone());
        Ok(())
    }

    async fn get_conversion(&self, order_id: i64) -> StoreResult<Option<ConversionRecord>> {
        let inner = self.inner.lock().await;
        Ok(inner.conversions.get(&order_id).cloned())
    }

    async fn append_delivery_log(&self, entry: &NewDeliveryLogEntry) -> StoreResult<DeliveryLogEntry> {
        let mut inner = self.inner.lock().await;
        inner.last_delivery_log_id += 1;

        let logged = DeliveryLogEntry {
            id: inner.last_delivery_log_id,
            order_id: entry.order_id,
            destination: entry.destination.clone(),
            event_type: entry.event_type.clone(),
            event_id: entry.event_id.clone(),
            status: entry.status,
            response_code: entry.response_code,
            response_body: entry.response_body.clone(),
            click_ids_snapshot: entry.click_ids_snapshot.clone(),
            attribution_snapshot: entry.attribution_snapshot.clone(),
            created_at: entry.created_at,
        };
        inner.delivery_log.push(logged.clone());

        Ok(logged)
    }

    async fn has_successful_delivery(
        &self,
        order_id: i64,
        destination: &str,
        event_type: &str,
        since: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let inner = self.inner.lock().await;
        Ok(inner.delivery_log.iter().any(|entry| {
            entry.order_id == order_id
                && entry.destination == destination
                && entry.event_type == event_type
                && entry.status == DeliveryStatus::Success
                && entry.created_at >= since
        }))
    }

    async fn delivery_log_for_order(&self, order_id: i64) -> StoreResult<Vec<DeliveryLogEntry>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .delivery_log
            .iter()
            .filter(|entry| entry.order_id == order_id)
            .cloned()
            .collect())
    }

    async fn delivery_counts(&self) -> StoreResult<Vec<StatusCount<DeliveryStatus>>> {
        let inner = self.inner.lock().await;
        Ok(count_by(
            inner
                .delivery_log
                .iter()
                .map(|entry| (entry.destination.clone(), entry.status)),
        ))
    }

    async fn purge_delivery_log(&self, older_than: DateTime<Utc>) -> StoreResult<u64> {
        let mut inner = self.inner.lock().await;
        let before = inner.delivery_log.len();
        inner
            .delivery_log
            .retain(|entry| entry.created_at >= older_than);
        Ok(removed(before, inner.delivery_log.len()))
    }

    async fn insert_queue_item(&self, item: &NewQueueItem) -> StoreResult<QueueItem> {
        let mut inner = self.inner.lock().await;
        inner.last_queue_id += 1;

        let inserted = QueueItem {
            id: inner.last_queue_id,
            order_id: item.order_id,
            destination: item.destination.clone(),
            event_type: item.event_type.clone(),
            payload: item.payload.clone(),
            status: QueueStatus::Pending,
            attempts: 0,
            max_attempts: item.max_attempts,
            next_retry_at: item.next_retry_at,
            last_error: item.last_error.clone(),
            created_at: item.created_at,
            updated_at: item.created_at,
        };
        inner.queue.insert(inserted.id, inserted.clone());

        Ok(inserted)
    }

    async fn get_queue_item(&self, id: i64) -> StoreResult<Option<QueueItem>> {
        let inner = self.inner.lock().await;
        Ok(inner.queue.get(&id).cloned())
    }

    async fn queue_items_for_order(&self, order_id: i64) -> StoreResult<Vec<QueueItem>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .queue
            .values()
            .filter(|item| item.order_id == order_id)
            .cloned()
            .collect())
    }

    async fn claim_due_queue_items(
        &self,
        now: DateTime<Utc>,
        limit: u32,
        claim_until: DateTime<Utc>,
    ) -> StoreResult<Vec<QueueItem>> {
        let mut inner = self.inner.lock().await;

        let mut due: Vec<(DateTime<Utc>, i64)> = inner
            .queue
            .values()
            .filter(|item| item.status == QueueStatus::Pending && item.next_retry_at <= now)
            .map(|item| (item.next_retry_at, item.id))
            .collect();
        due.sort();
        due.truncate(usize::try_from(limit).unwrap_or(usize::MAX));

        let mut claimed = Vec::with_capacity(due.len());
        for (_, id) in due {
            if let Some(item) = inner.queue.get_mut(&id) {
                item.next_retry_at = claim_until;
                claimed.push(item.clone());
            }
        }

        Ok(claimed)
    }

    async fn update_pending_queue_item(
        &self,
        id: i64,
        expected_attempts: Option<i32>,
        update: &QueueUpdate,
    ) -> StoreResult<Option<QueueItem>> {
        let mut inner = self.inner.lock().await;

        let Some(item) = inner.queue.get_mut(&id) else {
            return Ok(None);
        };

        if item.status != QueueStatus::Pending
            || expected_attempts.is_some_and(|attempts| attempts != item.attempts)
        {
            return Ok(None);
        }

        item.status = update.status;
        item.attempts = update.attempts;
        item.next_retry_at = update.next_retry_at;
        item.last_error = update.last_error.clone();
        item.updated_at = update.updated_at;

        Ok(Some(item.clone()))
    }

    async fn queue_counts(&self) -> StoreResult<Vec<StatusCount<QueueStatus>>> {
        let inner = self.inner.lock().await;
        Ok(count_by(
            inner
                .queue
                .values()
                .map(|item| (item.destination.clone(), item.status)),
        ))
    }

    async fn purge_queue_items(&self, older_than: DateTime<Utc>) -> StoreResult<u64> {
        let mut inner = self.inner.lock().await;
        let before = inner.queue.len();
        inner
            .queue
            .retain(|_, item| !item.status.is_terminal() || item.updated_at >= older_than);
        Ok(removed(before, inner.queue.len()))
    }
}
