//! EventStore backed by PostgreSQL tables. See `migrations/` for the schema.
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{Postgres, Row, Transaction};

use super::{EventStore, StatusCount, StoreError, StoreResult};
use crate::capture::{BufferAppend, CaptureOutcome};
use crate::delivery_log::{DeliveryLogEntry, DeliveryStatus, NewDeliveryLogEntry};
use crate::fingerprint::FingerprintRecord;
use crate::identity::IdentityEdge;
use crate::order::ConversionRecord;
use crate::queue::{NewQueueItem, QueueItem, QueueStatus, QueueUpdate};
use crate::touchpoint::{DeviceType, Touchpoint};

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

fn query_error(command: &'static str) -> impl FnOnce(sqlx::Error) -> StoreError {
    move |error| StoreError::QueryError {
        command: command.to_owned(),
        error,
    }
}

fn edge_from_row(row: &PgRow) -> Result<IdentityEdge, sqlx::Error> {
    let device_type: String = row.try_get("device_type")?;

    Ok(IdentityEdge {
        email_hash: row.try_get("email_hash")?,
        visitor_id: row.try_get("visitor_id")?,
        device_type: DeviceType::from_str(&device_type).unwrap_or_default(),
        first_seen: row.try_get("first_seen")?,
        last_seen: row.try_get("last_seen")?,
    })
}

fn status_counts<S>(rows: Vec<(String, S, i64)>) -> Vec<StatusCount<S>> {
    rows.into_iter()
        .map(|(destination, status, count)| StatusCount {
            destination,
            status,
            count,
        })
        .collect()
}

async fn insert_history(
    tx: &mut Transaction<'_, Postgres>,
    touchpoint: &Touchpoint,
) -> StoreResult<()> {
    let query = r#"
INSERT INTO touchpoint_history
    (visitor_id, ip_hash, timestamp, touchpoint)
VALUES
    ($1, $2, $3, $4)
    "#;

    sqlx::query(query)
        .bind(&touchpoint.visitor_id)
        .bind(&touchpoint.ip_hash)
        .bind(touchpoint.timestamp)
        .bind(Json(touchpoint))
        .execute(&mut **tx)
        .await
        .map_err(query_error("INSERT"))?;

    Ok(())
}

impl PgStore {
    /// Initialize a new PgStore backed by a lazily connected pool.
    ///
    /// # Arguments
    ///
    /// * `url`: A URL pointing to where the PostgreSQL database is hosted.
    /// * `max_connections`: The maximum number of connections to keep in the pool.
    pub fn new(url: &str, max_connections: u32) -> StoreResult<Self> {
        let options = PgConnectOptions::from_str(url)
            .map_err(|error| StoreError::PoolCreationError { error })?;
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect_lazy_with(options);

        Ok(Self { pool })
    }

    pub fn new_from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> StoreResult<()> {
        sqlx::migrate!("../migrations")
            .run(&self.pool)
            .await
            .map_err(|error| StoreError::MigrationError { error })
    }
}

#[async_trait]
impl EventStore for PgStore {
    async fn load_buffer(&self, visitor_id: &str) -> StoreResult<Vec<Touchpoint>> {
        let row: Option<(Json<Vec<Touchpoint>>,)> =
            sqlx::query_as("SELECT touchpoints FROM touchpoint_buffers WHERE visitor_id = $1")
                .bind(visitor_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(query_error("SELECT"))?;

        Ok(row.map(|(Json(touchpoints),)| touchpoints).unwrap_or_default())
    }

    async fn append_to_buffer(
        &self,
        visitor_id: &str,
        append: &BufferAppend,
    ) -> StoreResult<CaptureOutcome> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|error| StoreError::ConnectionError { error })?;

        sqlx::query(
            "INSERT INTO touchpoint_buffers (visitor_id, updated_at) VALUES ($1, $2) ON CONFLICT (visitor_id) DO NOTHING",
        )
        .bind(visitor_id)
        .bind(append.touchpoint.timestamp)
        .execute(&mut *tx)
        .await
        .map_err(query_error("INSERT"))?;

        let (Json(current), converted_at): (Json<Vec<Touchpoint>>, Option<DateTime<Utc>>) =
            sqlx::query_as(
                "SELECT touchpoints, converted_at FROM touchpoint_buffers WHERE visitor_id = $1 FOR UPDATE",
            )
            .bind(visitor_id)
            .fetch_one(&mut *tx)
            .await
            .map_err(query_error("SELECT"))?;

        let update = append.apply(current, converted_at);

        sqlx::query(
            "UPDATE touchpoint_buffers SET touchpoints = $2, updated_at = $3 WHERE visitor_id = $1",
        )
        .bind(visitor_id)
        .bind(Json(&update.buffer))
        .bind(append.touchpoint.timestamp)
        .execute(&mut *tx)
        .await
        .map_err(query_error("UPDATE"))?;

        for touchpoint in &update.history {
            insert_history(&mut tx, touchpoint).await?;
        }

        tx.commit()
            .await
            .map_err(|error| StoreError::TransactionError {
                command: "COMMIT".to_owned(),
                error,
            })?;

        Ok(update.outcome)
    }

    async fn take_buffer(
        &self,
        visitor_id: &str,
        converted_at: DateTime<Utc>,
    ) -> StoreResult<Vec<Touchpoint>> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|error| StoreError::ConnectionError { error })?;

        let row: Option<(Json<Vec<Touchpoint>>,)> = sqlx::query_as(
            "SELECT touchpoints FROM touchpoint_buffers WHERE visitor_id = $1 FOR UPDATE",
        )
        .bind(visitor_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(query_error("SELECT"))?;

        let query = r#"
INSERT INTO touchpoint_buffers
    (visitor_id, touchpoints, updated_at, converted_at)
VALUES
    ($1, '[]', $2, $2)
ON CONFLICT (visitor_id) DO UPDATE
SET
    touchpoints = '[]',
    updated_at = EXCLUDED.updated_at,
    converted_at = EXCLUDED.converted_at
        "#;

        sqlx::query(query)
            .bind(visitor_id)
            .bind(converted_at)
            .execute(&mut *tx)
            .await
            .map_err(query_error("INSERT"))?;

        tx.commit()
            .await
            .map_err(|error| StoreError::TransactionError {
                command: "COMMIT".to_owned(),
                error,
            })?;

        Ok(row.map(|(Json(touchpoints),)| touchpoints).unwrap_or_default())
    }

    async fn append_history(&self, touchpoint: &Touchpoint) -> StoreResult<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|error| StoreError::ConnectionError { error })?;

        insert_history(&mut tx, touchpoint).await?;

        tx.commit()
            .await
            .map_err(|error| StoreError::TransactionError {
                command: "COMMIT".to_owned(),
                error,
            })
    }

    async fn history_for_visitors(&self, visitor_ids: &[String]) -> StoreResult<Vec<Touchpoint>> {
        let rows: Vec<(Json<Touchpoint>,)> = sqlx::query_as(
            "SELECT touchpoint FROM touchpoint_history WHERE visitor_id = ANY($1) ORDER BY timestamp, id",
        )
        .bind(visitor_ids)
        .fetch_all(&self.pool)
        .await
        .map_err(query_error("SELECT"))?;

        Ok(rows.into_iter().map(|(Json(touchpoint),)| touchpoint).collect())
    }

    async fn ip_hashes_for_visitor(&self, visitor_id: &str) -> StoreResult<Vec<String>> {
        sqlx::query_scalar(
            "SELECT DISTINCT ip_hash FROM touchpoint_history WHERE visitor_id = $1 AND ip_hash IS NOT NULL",
        )
        .bind(visitor_id)
        .fetch_all(&self.pool)
        .await
        .map_err(query_error("SELECT"))
    }

    async fn visitors_with_ip_hashes(&self, ip_hashes: &[String]) -> StoreResult<Vec<String>> {
        sqlx::query_scalar(
            "SELECT DISTINCT visitor_id FROM touchpoint_history WHERE ip_hash = ANY($1) ORDER BY visitor_id",
        )
        .bind(ip_hashes)
        .fetch_all(&self.pool)
        .await
        .map_err(query_error("SELECT"))
    }

    async fn purge_touchpoints(&self, older_than: DateTime<Utc>) -> StoreResult<u64> {
        let history = sqlx::query("DELETE FROM touchpoint_history WHERE timestamp < $1")
            .bind(older_than)
            .execute(&self.pool)
            .await
            .map_err(query_error("DELETE"))?;

        let buffers = sqlx::query("DELETE FROM touchpoint_buffers WHERE updated_at < $1")
            .bind(older_than)
            .execute(&self.pool)
            .await
            .map_err(query_error("DELETE"))?;

        Ok(history.rows_affected() + buffers.rows_affected())
    }

    async fn upsert_identity_edge(&self, edge: &IdentityEdge) -> StoreResult<bool> {
        // xmax is only zero for rows written by an INSERT.
        let query = r#"
INSERT INTO identity_edges
    (email_hash, visitor_id, device_type, first_seen, last_seen)
VALUES
    ($1, $2, $3, $4, $5)
ON CONFLICT (email_hash, visitor_id) DO UPDATE
SET
    last_seen = GREATEST(identity_edges.last_seen, EXCLUDED.last_seen)
RETURNING (xmax = 0) AS inserted
        "#;

        sqlx::query_scalar(query)
            .bind(&edge.email_hash)
            .bind(&edge.visitor_id)
            .bind(edge.device_type.as_str())
            .bind(edge.first_seen)
            .bind(edge.last_seen)
            .fetch_one(&self.pool)
            .await
            .map_err(query_error("INSERT"))
    }

    async fn edges_for_email(&self, email_hash: &str) -> StoreResult<Vec<IdentityEdge>> {
        let rows = sqlx::query(
            "SELECT * FROM identity_edges WHERE email_hash = $1 ORDER BY first_seen",
        )
        .bind(email_hash)
        .fetch_all(&self.pool)
        .await
        .map_err(query_error("SELECT"))?;

        rows.iter()
            .map(edge_from_row)
            .collect::<Result<_, _>>()
            .map_err(query_error("SELECT"))
    }

    async fn edges_for_visitor(&self, visitor_id: &str) -> StoreResult<Vec<IdentityEdge>> {
        let rows = sqlx::query(
            "SELECT * FROM identity_edges WHERE visitor_id = $1 ORDER BY last_seen DESC",
        )
        .bind(visitor_id)
        .fetch_all(&self.pool)
        .await
        .map_err(query_error("SELECT"))?;

        rows.iter()
            .map(edge_from_row)
            .collect::<Result<_, _>>()
            .map_err(query_error("SELECT"))
    }

    async fn reassign_edges(
        &self,
        visitor_id: &str,
        email_hash: &str,
        fallback_device: DeviceType,
        now: DateTime<Utc>,
    ) -> StoreResult<IdentityEdge> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|error| StoreError::ConnectionError { error })?;

        let rows = sqlx::query("DELETE FROM identity_edges WHERE visitor_id = $1 RETURNING *")
            .bind(visitor_id)
            .fetch_all(&mut *tx)
            .await
            .map_err(query_error("DELETE"))?;
        let moving: Vec<IdentityEdge> = rows
            .iter()
            .map(edge_from_row)
            .collect::<Result<_, _>>()
            .map_err(query_error("DELETE"))?;

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

        let query = r#"
INSERT INTO identity_edges
    (email_hash, visitor_id, device_type, first_seen, last_seen)
VALUES
    ($1, $2, $3, $4, $5)
        "#;

        sqlx::query(query)
            .bind(&merged.email_hash)
            .bind(&merged.visitor_id)
            .bind(merged.device_type.as_str())
            .bind(merged.first_seen)
            .bind(merged.last_seen)
            .execute(&mut *tx)
            .await
            .map_err(query_error("INSERT"))?;

        tx.commit()
            .await
            .map_err(|error| StoreError::TransactionError {
                command: "COMMIT".to_owned(),
                error,
            })?;

        Ok(merged)
    }

    async fn purge_identity_edges(&self, older_than: DateTime<Utc>) -> StoreResult<u64> {
        let result = sqlx::query("DELETE FROM identity_edges WHERE last_seen < $1")
            .bind(older_than)
            .execute(&self.pool)
            .await
            .map_err(query_error("DELETE"))?;

        Ok(result.rows_affected())
    }

    async fn get_fingerprint(&self, fingerprint_hash: &str) -> StoreResult<Option<FingerprintRecord>> {
        let row: Option<(Json<FingerprintRecord>,)> =
            sqlx::query_as("SELECT record FROM fingerprints WHERE fingerprint_hash = $1")
                .bind(fingerprint_hash)
                .fetch_optional(&self.pool)
                .await
                .map_err(query_error("SELECT"))?;

        Ok(row.map(|(Json(record),)| record))
    }

    async fn put_fingerprint(&self, record: &FingerprintRecord) -> StoreResult<()> {
        let query = r#"
INSERT INTO fingerprints
    (fingerprint_hash, record, last_seen)
VALUES
    ($1, $2, $3)
ON CONFLICT (fingerprint_hash) DO UPDATE
SET
    record = EXCLUDED.record,
    last_seen = EXCLUDED.last_seen
        "#;

        sqlx::query(query)
            .bind(&record.fingerprint_hash)
            .bind(Json(record))
            .bind(record.last_seen)
            .execute(&self.pool)
            .await
            .map_err(query_error("INSERT"))?;

        Ok(())
    }

    async fn purge_fingerprints(&self, older_than: DateTime<Utc>) -> StoreResult<u64> {
        let result = sqlx::query("DELETE FROM fingerprints WHERE last_seen < $1")
            .bind(older_than)
            .execute(&self.pool)
            .await
            .map_err(query_error("DELETE"))?;

        Ok(result.rows_affected())
    }

    async fn save_conversion(&self, record: &ConversionRecord) -> StoreResult<()> {
        // Conversion records are immutable: a repeated trigger keeps the first record.
        let query = r#"
INSERT INTO conversions
    (order_id, record, recorded_at)
VALUES
    ($1, $2, $3)
ON CONFLICT (order_id) DO NOTHING
        "#;

        sqlx::query(query)
            .bind(record.order_id())
            .bind(Json(record))
            .bind(record.recorded_at)
            .execute(&self.pool)
            .await
            .map_err(query_error("INSERT"))?;

        Ok(())
    }

    async fn get_conversion(&self, order_id: i64) -> StoreResult<Option<ConversionRecord>> {
        let row: Option<(Json<ConversionRecord>,)> =
            sqlx::query_as("SELECT record FROM conversions WHERE order_id = $1")
                .bind(order_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(query_error("SELECT"))?;

        Ok(row.map(|(Json(record),)| record))
    }

    async fn append_delivery_log(&self, entry: &NewDeliveryLogEntry) -> StoreResult<DeliveryLogEntry> {
        let query = r#"
INSERT INTO delivery_log
    (order_id, destination, event_type, event_id, status, response_code, response_body, click_ids_snapshot, attribution_snapshot, created_at)
VALUES
    ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
RETURNING *
        "#;

        sqlx::query_as::<_, DeliveryLogEntry>(query)
            .bind(entry.order_id)
            .bind(&entry.destination)
            .bind(&entry.event_type)
            .bind(&entry.event_id)
            .bind(entry.status)
            .bind(entry.response_code)
            .bind(&entry.response_body)
            .bind(&entry.click_ids_snapshot)
            .bind(&entry.attribution_snapshot)
            .bind(entry.created_at)
            .fetch_one(&self.pool)
            .await
            .map_err(query_error("INSERT"))
    }

    async fn has_successful_delivery(
        &self,
        order_id: i64,
        destination: &str,
        event_type: &str,
        since: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let query = r#"
SELECT EXISTS (
    SELECT 1
    FROM delivery_log
    WHERE
        order_id = $1
        AND destination = $2
        AND event_type = $3
        AND status = 'success'
        AND created_at >= $4
)
        "#;

        sqlx::query_scalar(query)
            .bind(order_id)
            .bind(destination)
            .bind(event_type)
            .bind(since)
            .fetch_one(&self.pool)
            .await
            .map_err(query_error("SELECT"))
    }

    async fn delivery_log_for_order(&self, order_id: i64) -> StoreResult<Vec<DeliveryLogEntry>> {
        sqlx::query_as::<_, DeliveryLogEntry>(
            "SELECT * FROM delivery_log WHERE order_id = $1 ORDER BY created_at, id",
        )
        .bind(order_id)
        .fetch_all(&self.pool)
        .await
        .map_err(query_error("SELECT"))
    }

    async fn delivery_counts(&self) -> StoreResult<Vec<StatusCount<DeliveryStatus>>> {
        let rows: Vec<(String, DeliveryStatus, i64)> = sqlx::query_as(
            "SELECT destination, status, COUNT(*) FROM delivery_log GROUP BY destination, status ORDER BY destination",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(query_error("SELECT"))?;

        Ok(status_counts(rows))
    }

    async fn purge_delivery_log(&self, older_than: DateTime<Utc>) -> StoreResult<u64> {
        let result = sqlx::query("DELETE FROM delivery_log WHERE created_at < $1")
            .bind(older_than)
            .execute(&self.pool)
            .await
            .map_err(query_error("DELETE"))?;

        Ok(result.rows_affected())
    }

    async fn insert_queue_item(&self, item: &NewQueueItem) -> StoreResult<QueueItem> {
        let query = r#"
INSERT INTO retry_queue
    (order_id, destination, event_type, payload, status, attempts, max_attempts, next_retry_at, last_error, created_at, updated_at)
VALUES
    ($1, $2, $3, $4, 'pending'::queue_status, 0, $5, $6, $7, $8, $8)
RETURNING *
        "#;

        sqlx::query_as::<_, QueueItem>(query)
            .bind(item.order_id)
            .bind(&item.destination)
            .bind(&item.event_type)
            .bind(&item.payload)
            .bind(item.max_attempts)
            .bind(item.next_retry_at)
            .bind(&item.last_error)
            .bind(item.created_at)
            .fetch_one(&self.pool)
            .await
            .map_err(query_error("INSERT"))
    }

    async fn get_queue_item(&self, id: i64) -> StoreResult<Option<QueueItem>> {
        sqlx::query_as::<_, QueueItem>("SELECT * FROM retry_queue WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(query_error("SELECT"))
    }

    async fn queue_items_for_order(&self, order_id: i64) -> StoreResult<Vec<QueueItem>> {
        sqlx::query_as::<_, QueueItem>(
            "SELECT * FROM retry_queue WHERE order_id = $1 ORDER BY created_at, id",
        )
        .bind(order_id)
        .fetch_all(&self.pool)
        .await
        .map_err(query_error("SELECT"))
    }

    async fn claim_due_queue_items(
        &self,
        now: DateTime<Utc>,
        limit: u32,
        claim_until: DateTime<Utc>,
    ) -> StoreResult<Vec<QueueItem>> {
        // The query that follows uses a FOR UPDATE SKIP LOCKED clause, so concurrent sweeps never
        // claim the same rows. Moving next_retry_at forward is the claim itself.
        let query = r#"
WITH due AS (
    SELECT
        id,
        next_retry_at AS due_at
    FROM
        retry_queue
    WHERE
        status = 'pending'
        AND next_retry_at <= $1
    ORDER BY
        next_retry_at,
        id
    LIMIT $2
    FOR UPDATE SKIP LOCKED
),
claimed AS (
    UPDATE
        retry_queue
    SET
        next_retry_at = $3
    FROM
        due
    WHERE
        retry_queue.id = due.id
    RETURNING
        retry_queue.*
)
SELECT
    claimed.*
FROM
    claimed
    JOIN due ON due.id = claimed.id
ORDER BY
    due.due_at,
    claimed.id
        "#;

        sqlx::query_as::<_, QueueItem>(query)
            .bind(now)
            .bind(i64::from(limit))
            .bind(claim_until)
            .fetch_all(&self.pool)
            .await
            .map_err(query_error("UPDATE"))
    }

    async fn update_pending_queue_item(
        &self,
        id: i64,
        expected_attempts: Option<i32>,
        update: &QueueUpdate,
    ) -> StoreResult<Option<QueueItem>> {
        let query = r#"
UPDATE
    retry_queue
SET
    status = $3,
    attempts = $4,
    next_retry_at = $5,
    last_error = $6,
    updated_at = $7
WHERE
    id = $1
    AND status = 'pending'::queue_status
    AND ($2::INTEGER IS NULL OR attempts = $2)
RETURNING *
        "#;

        sqlx::query_as::<_, QueueItem>(query)
            .bind(id)
            .bind(expected_attempts)
            .bind(update.status)
            .bind(update.attempts)
            .bind(update.next_retry_at)
            .bind(&update.last_error)
            .bind(update.updated_at)
            .fetch_optional(&self.pool)
            .await
            .map_err(query_error("UPDATE"))
    }

    async fn queue_counts(&self) -> StoreResult<Vec<StatusCount<QueueStatus>>> {
        let rows: Vec<(String, QueueStatus, i64)> = sqlx::query_as(
            "SELECT destination, status, COUNT(*) FROM retry_queue GROUP BY destination, status ORDER BY destination, status",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(query_error("SELECT"))?;

        Ok(status_counts(rows))
    }

    async fn purge_queue_items(&self, older_than: DateTime<Utc>) -> StoreResult<u64> {
        let result = sqlx::query(
            "DELETE FROM retry_queue WHERE status <> 'pending'::queue_status AND updated_at < $1",
        )
        .bind(older_than)
        .execute(&self.pool)
        .await
        .map_err(query_error("DELETE"))?;

        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::RetryQueue;
    use crate::retry::RetryPolicy;
    use serde_json::json;
    use std::sync::Arc;

    fn new_item(next_retry_at: DateTime<Utc>) -> NewQueueItem {
        NewQueueItem {
            order_id: 100,
            destination: "meta".to_owned(),
            event_type: "purchase".to_owned(),
            payload: json!({"value": 10}),
            max_attempts: 5,
            next_retry_at,
            last_error: Some("HTTP 503".to_owned()),
            created_at: Utc::now(),
        }
    }

    #[sqlx::test(migrations = "../migrations")]
    #[ignore = "requires a PostgreSQL database"]
    async fn test_claim_due_hides_claimed_items(db: PgPool) {
        let store = PgStore::new_from_pool(db);
        let now = Utc::now();
        let due = store
            .insert_queue_item(&new_item(now - chrono::Duration::seconds(1)))
            .await
            .unwrap();
        store
            .insert_queue_item(&new_item(now + chrono::Duration::hours(1)))
            .await
            .unwrap();

        let claim_until = now + chrono::Duration::minutes(5);
        let claimed = store
            .claim_due_queue_items(now, 10, claim_until)
            .await
            .unwrap();

        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, due.id);
        assert_eq!(claimed[0].status, QueueStatus::Pending);
        assert!(store
            .claim_due_queue_items(now, 10, claim_until)
            .await
            .unwrap()
            .is_empty());
    }

    #[sqlx::test(migrations = "../migrations")]
    #[ignore = "requires a PostgreSQL database"]
    async fn test_retry_queue_lifecycle(db: PgPool) {
        let queue = RetryQueue::new(Arc::new(PgStore::new_from_pool(db)), RetryPolicy::default());

        let item = queue
            .enqueue(100, "meta", "purchase", json!({}), "HTTP 503")
            .await
            .unwrap();
        let item = queue.record_failure(item.id, "HTTP 500", None).await.unwrap();
        assert_eq!(item.attempts, 1);

        let cancelled = queue.cancel(item.id).await.unwrap();
        assert_eq!(cancelled.status, QueueStatus::Cancelled);

        let stats = queue.stats().await.unwrap();
        assert_eq!(stats["meta"].cancelled, 1);
    }

    #[sqlx::test(migrations = "../migrations")]
    #[ignore = "requires a PostgreSQL database"]
    async fn test_identity_edges_upsert_and_reassign(db: PgPool) {
        let store = PgStore::new_from_pool(db);
        let now = Utc::now();
        let edge = IdentityEdge {
            email_hash: "email".to_owned(),
            visitor_id: "v1".to_owned(),
            device_type: DeviceType::Mobile,
            first_seen: now,
            last_seen: now,
        };

        assert!(store.upsert_identity_edge(&edge).await.unwrap());
        assert!(!store.upsert_identity_edge(&edge).await.unwrap());

        let merged = store
            .reassign_edges("v1", "other-email", DeviceType::Desktop, now)
            .await
            .unwrap();

        assert_eq!(merged.device_type, DeviceType::Mobile);
        assert!(store.edges_for_email("email").await.unwrap().is_empty());
        assert_eq!(store.edges_for_visitor("v1").await.unwrap(), vec![merged]);
    }

    #[sqlx::test(migrations = "../migrations")]
    #[ignore = "requires a PostgreSQL database"]
    async fn test_touchpoint_buffer_take_clears(db: PgPool) {
        let store = PgStore::new_from_pool(db);
        let visited_at = Utc::now() - chrono::Duration::hours(2);
        let touchpoint: Touchpoint = serde_json::from_value(json!({
            "visitor_id": "v1",
            "landing_page": "https://shop.example/",
            "timestamp": visited_at,
            "utm": {"source": "newsletter"},
        }))
        .unwrap();
        let append = |touchpoint: Touchpoint, restored: Vec<Touchpoint>| BufferAppend {
            touchpoint,
            restored,
            max_touchpoints: 50,
            touchpoint_ttl: chrono::Duration::days(90),
            dedup_window: chrono::Duration::minutes(5),
        };

        let outcome = store
            .append_to_buffer("v1", &append(touchpoint.clone(), Vec::new()))
            .await
            .unwrap();
        assert_eq!(outcome, CaptureOutcome::Recorded);

        let converted_at = Utc::now() - chrono::Duration::hours(1);
        assert_eq!(store.take_buffer("v1", converted_at).await.unwrap().len(), 1);
        assert!(store.load_buffer("v1").await.unwrap().is_empty());

        let later = Touchpoint {
            timestamp: Utc::now(),
            utm: Default::default(),
            ..touchpoint.clone()
        };
        let outcome = store
            .append_to_buffer("v1", &append(later, vec![touchpoint]))
            .await
            .unwrap();

        assert_eq!(outcome, CaptureOutcome::DirectEntry);
        assert_eq!(store.load_buffer("v1").await.unwrap().len(), 1);
        assert_eq!(
            store
                .history_for_visitors(&["v1".to_owned()])
                .await
                .unwrap()
                .len(),
            2
        );
    }
}
