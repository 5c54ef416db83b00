//! # Fingerprint
//!
//! Cookie-less fallback: a salted hash of request characteristics that lets a returning browser
//! without our visitor cookie be matched to the visitor it was last seen as.
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::store::{EventStore, StoreError};
use crate::touchpoint::{ClickId, UtmParams};

const INITIAL_CONFIDENCE: f64 = 0.85;
const REPEAT_HIT_BONUS: f64 = 0.02;
const MAX_HIT_CONFIDENCE: f64 = 0.95;
const LINKED_CONFIDENCE: f64 = 0.90;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FingerprintRecord {
    pub fingerprint_hash: String,
    pub visitor_id: Option<String>,
    pub click_ids: Vec<ClickId>,
    pub utm: UtmParams,
    pub landing_page: String,
    pub referrer: Option<String>,
    pub confidence: f64,
    pub hit_count: i64,
    pub last_seen: DateTime<Utc>,
}

/// What a single request tells us about the browser behind a fingerprint.
#[derive(Debug, Clone, Default)]
pub struct FingerprintObservation {
    pub click_id: Option<ClickId>,
    pub utm: UtmParams,
    pub landing_page: String,
    pub referrer: Option<String>,
}

/// SHA-256 hex of the salted request characteristics.
pub fn fingerprint_hash(salt: &str, ip: &str, user_agent: &str, accept_language: &str) -> String {
    let mut hasher = Sha256::new();
    for part in [salt, ip, user_agent, accept_language] {
        hasher.update(part.as_bytes());
        hasher.update(b"|");
    }
    hex::encode(hasher.finalize())
}

#[derive(Clone)]
pub struct FingerprintTracker {
    store: Arc<dyn EventStore>,
    ttl: chrono::Duration,
}

impl FingerprintTracker {
    pub fn new(store: Arc<dyn EventStore>, ttl: chrono::Duration) -> Self {
        Self { store, ttl }
    }

    /// Create a record for a new fingerprint, or bump the hit count and confidence of a live one.
    pub async fn observe(
        &self,
        fingerprint_hash: &str,
        observation: FingerprintObservation,
    ) -> Result<FingerprintRecord, StoreError> {
        let now = Utc::now();

        let record = match self.lookup_at(fingerprint_hash, now).await? {
            // Linked before its first visit was observed.
            Some(mut record) if record.hit_count == 0 => {
                record.hit_count = 1;
                record.click_ids = observation.click_id.into_iter().collect();
                record.utm = observation.utm;
                record.landing_page = observation.landing_page;
                record.referrer = observation.referrer;
                record.last_seen = now;
                record
            }
            Some(mut record) => {
                record.hit_count += 1;
                record.confidence = (record.confidence + REPEAT_HIT_BONUS)
                    .min(MAX_HIT_CONFIDENCE)
                    .max(record.confidence);
                record.last_seen = now;
                if let Some(click_id) = observation.click_id {
                    if !record.click_ids.contains(&click_id) {
                        record.click_ids.push(click_id);
                    }
                }
                if !observation.utm.is_empty() {
                    record.utm = observation.utm;
                }
                record
            }
            None => FingerprintRecord {
                fingerprint_hash: fingerprint_hash.to_owned(),
                visitor_id: None,
                click_ids: observation.click_id.into_iter().collect(),
                utm: observation.utm,
                landing_page: observation.landing_page,
                referrer: observation.referrer,
                confidence: INITIAL_CONFIDENCE,
                hit_count: 1,
                last_seen: now,
            },
        };

        self.store.put_fingerprint(&record).await?;

        Ok(record)
    }

    /// Attach a visitor id to a fingerprint. A record created here has no hits until the visit
    /// itself is observed.
    pub async fn link(
        &self,
        fingerprint_hash: &str,
        visitor_id: &str,
    ) -> Result<FingerprintRecord, StoreError> {
        let now = Utc::now();

        let mut record = match self.lookup_at(fingerprint_hash, now).await? {
            Some(record) => record,
            None => FingerprintRecord {
                fingerprint_hash: fingerprint_hash.to_owned(),
                visitor_id: None,
                click_ids: Vec::new(),
                utm: UtmParams::default(),
                landing_page: String::new(),
                referrer: None,
                confidence: INITIAL_CONFIDENCE,
                hit_count: 0,
                last_seen: now,
            },
        };

        record.visitor_id = Some(visitor_id.to_owned());
        record.confidence = record.confidence.max(LINKED_CONFIDENCE);
        record.last_seen = now;

        self.store.put_fingerprint(&record).await?;
        debug!("linked fingerprint to visitor {}", visitor_id);

        Ok(record)
    }

    /// The record for a fingerprint, unless it has been idle for longer than the TTL.
    pub async fn lookup(&self, fingerprint_hash: &str) -> Result<Option<FingerprintRecord>, StoreError> {
        self.lookup_at(fingerprint_hash, Utc::now()).await
    }

    /// The visitor a fingerprint is linked to, if any.
    pub async fn resolve_visitor(&self, fingerprint_hash: &str) -> Result<Option<String>, StoreError> {
        Ok(self
            .lookup(fingerprint_hash)
            .await?
            .and_then(|record| record.visitor_id))
    }

    pub async fn purge_expired(&self) -> Result<u64, StoreError> {
        self.store.purge_fingerprints(Utc::now() - self.ttl).await
    }

    async fn lookup_at(
        &self,
        fingerprint_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<FingerprintRecord>, StoreError> {
        Ok(self
            .store
            .get_fingerprint(fingerprint_hash)
            .await?
            .filter(|record| now - record.last_seen <= self.ttl))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::touchpoint::ClickIdType;

    fn tracker() -> (Arc<MemoryStore>, FingerprintTracker) {
        let store = Arc::new(MemoryStore::new());
        let tracker = FingerprintTracker::new(store.clone(), chrono::Duration::days(90));
        (store, tracker)
    }

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn test_fingerprint_hash_depends_on_every_part() {
        let base = fingerprint_hash("salt", "1.2.3.4", "Mozilla", "en-GB");

        assert_eq!(base, fingerprint_hash("salt", "1.2.3.4", "Mozilla", "en-GB"));
        assert_eq!(base.len(), 64);
        assert_ne!(base, fingerprint_hash("pepper", "1.2.3.4", "Mozilla", "en-GB"));
        assert_ne!(base, fingerprint_hash("salt", "1.2.3.5", "Mozilla", "en-GB"));
        assert_ne!(base, fingerprint_hash("salt", "1.2.3.4", "Mozilla", "de-DE"));
    }

    #[tokio::test]
    async fn test_confidence_grows_with_hits_and_caps() {
        let (_, tracker) = tracker();

        let record = tracker
            .observe("fp", FingerprintObservation::default())
            .await
            .unwrap();
        assert!(approx(record.confidence, 0.85));
        assert_eq!(record.hit_count, 1);

        let record = tracker
            .observe(
                "fp",
                FingerprintObservation {
                    click_id: Some(ClickId::new(ClickIdType::Gclid, "abc")),
                    ..FingerprintObservation::default()
                },
            )
            .await
            .unwrap();
        assert!(approx(record.confidence, 0.87));
        assert_eq!(record.hit_count, 2);
        assert_eq!(record.click_ids.len(), 1);

        let mut record = record;
        for _ in 0..10 {
            record = tracker
                .observe("fp", FingerprintObservation::default())
                .await
                .unwrap();
        }
        assert!(approx(record.confidence, 0.95));
    }

    #[tokio::test]
    async fn test_link_raises_confidence_and_resolves_visitor() {
        let (_, tracker) = tracker();
        tracker
            .observe("fp", FingerprintObservation::default())
            .await
            .unwrap();

        let record = tracker.link("fp", "visitor").await.unwrap();

        assert!(approx(record.confidence, 0.90));
        assert_eq!(
            tracker.resolve_visitor("fp").await.unwrap().as_deref(),
            Some("visitor")
        );
        assert_eq!(tracker.resolve_visitor("other").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_link_before_first_observation_records_one_hit() {
        let (_, tracker) = tracker();

        let linked = tracker.link("fp", "visitor").await.unwrap();
        assert_eq!(linked.hit_count, 0);

        let record = tracker
            .observe(
                "fp",
                FingerprintObservation {
                    landing_page: "https://shop.example/sale".to_owned(),
                    referrer: Some("https://news.example/".to_owned()),
                    ..FingerprintObservation::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(record.hit_count, 1);
        assert!(approx(record.confidence, 0.90));
        assert_eq!(record.landing_page, "https://shop.example/sale");
        assert_eq!(record.referrer.as_deref(), Some("https://news.example/"));
        assert_eq!(record.visitor_id.as_deref(), Some("visitor"));
    }

    #[tokio::test]
    async fn test_expired_records_are_not_returned() {
        let (store, tracker) = tracker();
        let record = FingerprintRecord {
            fingerprint_hash: "old".to_owned(),
            visitor_id: Some("visitor".to_owned()),
            click_ids: Vec::new(),
            utm: UtmParams::default(),
            landing_page: String::new(),
            referrer: None,
            confidence: 0.9,
            hit_count: 3,
            last_seen: Utc::now() - chrono::Duration::days(91),
        };
        store.put_fingerprint(&record).await.unwrap();

        assert!(tracker.lookup("old").await.unwrap().is_none());
        assert_eq!(tracker.purge_expired().await.unwrap(), 1);
    }
}
