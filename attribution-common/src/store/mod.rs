//! # EventStore
//!
//! Persistence for everything the attribution pipeline records. Components only ever talk to
//! `dyn EventStore`, so the same code runs against Postgres in production and memory in tests.
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::capture::{BufferAppend, CaptureOutcome};
use crate::delivery_log::{DeliveryLogEntry, DeliveryStatus, NewDeliveryLogEntry};
use crate::fingerprint::FingerprintRecord;
use crate::identity::IdentityEdge;
use crate::order::ConversionRecord;
use crate::queue::{NewQueueItem, QueueItem, QueueStatus, QueueUpdate};
use crate::touchpoint::{DeviceType, Touchpoint};

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// Enumeration of errors raised by an EventStore.
/// Errors that originate from sqlx are wrapped to provide additional context.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("pool creation failed with: {error}")]
    PoolCreationError { error: sqlx::Error },
    #[error("connection failed with: {error}")]
    ConnectionError { error: sqlx::Error },
    #[error("{command} query failed with: {error}")]
    QueryError { command: String, error: sqlx::Error },
    #[error("could not serialize jsonb field: {error}")]
    SerializationError { error: serde_json::Error },
    #[error("transaction {command} failed with: {error}")]
    TransactionError { command: String, error: sqlx::Error },
    #[error("running migrations failed with: {error}")]
    MigrationError { error: sqlx::migrate::MigrateError },
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// A count of rows grouped by destination and status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusCount<S> {
    pub destination: String,
    pub status: S,
    pub count: i64,
}

#[async_trait]
pub trait EventStore: Send + Sync {
    /// The live touchpoint buffer of a visitor, oldest first.
    async fn load_buffer(&self, visitor_id: &str) -> StoreResult<Vec<Touchpoint>>;

    /// Apply a visit to the live buffer of a visitor while holding it, and add the touchpoints it
    /// keeps to the visitor's history.
    async fn append_to_buffer(
        &self,
        visitor_id: &str,
        append: &BufferAppend,
    ) -> StoreResult<CaptureOutcome>;

    /// Remove and return the live touchpoint buffer of a visitor in one step. The emptied buffer
    /// remembers `converted_at`, so touchpoints restored from a cookie are only accepted if they
    /// came later.
    async fn take_buffer(
        &self,
        visitor_id: &str,
        converted_at: DateTime<Utc>,
    ) -> StoreResult<Vec<Touchpoint>>;

    async fn append_history(&self, touchpoint: &Touchpoint) -> StoreResult<()>;

    /// Historical touchpoints of any of the given visitors, oldest first.
    async fn history_for_visitors(&self, visitor_ids: &[String]) -> StoreResult<Vec<Touchpoint>>;

    async fn ip_hashes_for_visitor(&self, visitor_id: &str) -> StoreResult<Vec<String>>;

    async fn visitors_with_ip_hashes(&self, ip_hashes: &[String]) -> StoreResult<Vec<String>>;

    /// Delete historical touchpoints and idle buffers last touched before `older_than`.
    async fn purge_touchpoints(&self, older_than: DateTime<Utc>) -> StoreResult<u64>;

    /// Insert an identity edge, or refresh `last_seen` of the existing one.
    /// Returns `true` when a new edge was inserted.
    async fn upsert_identity_edge(&self, edge: &IdentityEdge) -> StoreResult<bool>;

    async fn edges_for_email(&self, email_hash: &str) -> StoreResult<Vec<IdentityEdge>>;

    /// Edges of a visitor, most recently seen first.
    async fn edges_for_visitor(&self, visitor_id: &str) -> StoreResult<Vec<IdentityEdge>>;

    /// Atomically collapse every edge of `visitor_id` into a single edge pointing at
    /// `email_hash`, creating it from `fallback_device` if the visitor had none.
    async fn reassign_edges(
        &self,
        visitor_id: &str,
        email_hash: &str,
        fallback_device: DeviceType,
        now: DateTime<Utc>,
    ) -> StoreResult<IdentityEdge>;

    async fn purge_identity_edges(&self, older_than: DateTime<Utc>) -> StoreResult<u64>;

    async fn get_fingerprint(&self, fingerprint_hash: &str) -> StoreResult<Option<FingerprintRecord>>;

    async fn put_fingerprint(&self, record: &FingerprintRecord) -> StoreResult<()>;

    async fn purge_fingerprints(&self, older_than: DateTime<Utc>) -> StoreResult<u64>;

    async fn save_conversion(&self, record: &ConversionRecord) -> StoreResult<()>;

    async fn get_conversion(&self, order_id: i64) -> StoreResult<Option<ConversionRecord>>;

    async fn append_delivery_log(&self, entry: &NewDeliveryLogEntry)
        -> StoreResult<DeliveryLogEntry>;

    async fn has_successful_delivery(
        &self,
        order_id: i64,
        destination: &str,
        event_type: &str,
        since: DateTime<Utc>,
    ) -> StoreResult<bool>;

    async fn delivery_log_for_order(&self, order_id: i64) -> StoreResult<Vec<DeliveryLogEntry>>;

    async fn delivery_counts(&self) -> StoreResult<Vec<StatusCount<DeliveryStatus>>>;

    async fn purge_delivery_log(&self, older_than: DateTime<Utc>) -> StoreResult<u64>;

    async fn insert_queue_item(&self, item: &NewQueueItem) -> StoreResult<QueueItem>;

    async fn get_queue_item(&self, id: i64) -> StoreResult<Option<QueueItem>>;

    async fn queue_items_for_order(&self, order_id: i64) -> StoreResult<Vec<QueueItem>>;

    /// Claim up to `limit` pending items due at `now`, earliest first, by moving their
    /// `next_retry_at` to `claim_until`.
    async fn claim_due_queue_items(
        &self,
        now: DateTime<Utc>,
        limit: u32,
        claim_until: DateTime<Utc>,
    ) -> StoreResult<Vec<QueueItem>>;

    /// Apply `update` to a queue item only while it is still pending and, if given, still at
    /// `expected_attempts`. Returns `None` when the condition did not hold.
    async fn update_pending_queue_item(
        &self,
        id: i64,
        expected_attempts: Option<i32>,
        update: &QueueUpdate,
    ) -> StoreResult<Option<QueueItem>>;

    async fn queue_counts(&self) -> StoreResult<Vec<StatusCount<QueueStatus>>>;

    /// Delete completed, failed and cancelled items last updated before `older_than`.
    async fn purge_queue_items(&self, older_than: DateTime<Utc>) -> StoreResult<u64>;
}
