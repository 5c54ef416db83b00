//! # Capture
//!
//! Turns raw page view signals into touchpoints on a visitor's live buffer. Capture runs inline
//! with the storefront request, so it never fails: problems are logged and the visit is skipped.
use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};
use url::Url;

use crate::consent::ConsentLevel;
use crate::cookie;
use crate::fingerprint::{fingerprint_hash, FingerprintObservation, FingerprintTracker};
use crate::store::{EventStore, StoreError};
use crate::touchpoint::{normalize_domain, ClickId, ClickIdType, DeviceType, Touchpoint, UtmParams};

const CRAWLER_MARKERS: [&str; 6] = [
    "bot",
    "crawler",
    "spider",
    "slurp",
    "facebookexternalhit",
    "preview",
];

#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Size of a visitor's live buffer. The oldest touchpoints are dropped beyond it.
    pub max_touchpoints: usize,
    /// Touchpoints older than this are dropped from buffers and history.
    pub touchpoint_ttl: chrono::Duration,
    /// Repeats of the previous touchpoint within this window are not recorded.
    pub dedup_window: chrono::Duration,
    /// Salt for IP and fingerprint hashes.
    pub ip_salt: String,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            max_touchpoints: 50,
            touchpoint_ttl: chrono::Duration::days(90),
            dedup_window: chrono::Duration::minutes(5),
            ip_salt: String::new(),
        }
    }
}

/// A raw signal captured by the storefront front-end for one page view.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VisitSignal {
    /// Full landing page URL, query string included.
    pub url: String,
    #[serde(default)]
    pub referrer: Option<String>,
    /// Extra parameters captured client side. These win over the URL query string.
    #[serde(default)]
    pub params: HashMap<String, String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub user_agent: Option<String>,
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(default)]
    pub accept_language: Option<String>,
    #[serde(default)]
    pub is_prefetch: bool,
    /// The touchpoint cookie held by the browser, if any.
    #[serde(default)]
    pub touchpoint_cookie: Option<String>,
}

impl VisitSignal {
    /// Whether this is a page view by a person, as opposed to a prefetch or a crawler.
    pub fn is_qualifying(&self) -> bool {
        if self.is_prefetch {
            return false;
        }

        let user_agent = self.user_agent.as_deref().unwrap_or_default().to_ascii_lowercase();
        !CRAWLER_MARKERS
            .iter()
            .any(|marker| user_agent.contains(marker))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureOutcome {
    /// A touchpoint with an attribution signal was appended.
    Recorded,
    /// The first, signal-less visit was recorded as a direct entry.
    DirectEntry,
    /// The signal repeated the previous touchpoint within the dedup window.
    Duplicate,
    /// No signal, and the visitor already has touchpoints.
    NoSignal,
    /// A prefetch or crawler.
    Ignored,
    /// The visitor has not consented to touchpoint storage.
    NoConsent,
    /// The store could not be read or written.
    StoreUnavailable,
}

/// One visit applied to a visitor's live buffer. Stores apply it while holding the buffer, so
/// concurrent visits of the same visitor never overwrite each other.
#[derive(Debug, Clone)]
pub struct BufferAppend {
    /// The new touchpoint. Its timestamp is the time of the visit.
    pub touchpoint: Touchpoint,
    /// Touchpoints held in the client cookie, restored when the server buffer is empty.
    pub restored: Vec<Touchpoint>,
    pub max_touchpoints: usize,
    pub touchpoint_ttl: chrono::Duration,
    pub dedup_window: chrono::Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BufferUpdate {
    pub outcome: CaptureOutcome,
    /// The new live buffer, oldest first.
    pub buffer: Vec<Touchpoint>,
    /// Touchpoints to add to the visitor's history, oldest first.
    pub history: Vec<Touchpoint>,
}

impl BufferAppend {
    /// Apply the visit to the stored buffer. Cookie touchpoints from before `converted_at` were
    /// already frozen into an order and are not restored.
    pub fn apply(
        &self,
        current: Vec<Touchpoint>,
        converted_at: Option<DateTime<Utc>>,
    ) -> BufferUpdate {
        let now = self.touchpoint.timestamp;
        let is_live = |touchpoint: &Touchpoint| now - touchpoint.timestamp <= self.touchpoint_ttl;

        let mut buffer: Vec<Touchpoint> = current
            .into_iter()
            .filter(|touchpoint| is_live(touchpoint))
            .collect();
        let mut history = Vec::new();

        if buffer.is_empty() {
            buffer = self
                .restored
                .iter()
                .filter(|restored| is_live(*restored))
                .filter(|restored| converted_at.map_or(true, |at| restored.timestamp > at))
                .map(|restored| Touchpoint {
                    visitor_id: self.touchpoint.visitor_id.clone(),
                    ..restored.clone()
                })
                .collect();
            buffer.sort_by_key(|restored| restored.timestamp);
            history.extend(buffer.iter().cloned());
        }

        let outcome = if self.touchpoint.has_attribution_signal() {
            match buffer.last() {
                Some(previous) if self.is_repeat(previous) => CaptureOutcome::Duplicate,
                _ => CaptureOutcome::Recorded,
            }
        } else if buffer.is_empty() {
            CaptureOutcome::DirectEntry
        } else {
            CaptureOutcome::NoSignal
        };

        if matches!(outcome, CaptureOutcome::Recorded | CaptureOutcome::DirectEntry) {
            let touchpoint = Touchpoint {
                is_direct_entry: outcome == CaptureOutcome::DirectEntry,
                ..self.touchpoint.clone()
            };
            buffer.push(touchpoint.clone());
            history.push(touchpoint);
        }

        if buffer.len() > self.max_touchpoints {
            let excess = buffer.len() - self.max_touchpoints;
            buffer.drain(..excess);
        }

        BufferUpdate {
            outcome,
            buffer,
            history,
        }
    }

    fn is_repeat(&self, previous: &Touchpoint) -> bool {
        let current = &self.touchpoint;

        !previous.is_direct_entry
            && current.timestamp - previous.timestamp <= self.dedup_window
            && previous.click_id == current.click_id
            && previous.utm.source == current.utm.source
            && previous.referrer_domain == current.referrer_domain
    }
}

#[derive(Clone)]
pub struct TouchpointCapture {
    store: Arc<dyn EventStore>,
    fingerprints: FingerprintTracker,
    config: CaptureConfig,
}

impl TouchpointCapture {
    pub fn new(store: Arc<dyn EventStore>, config: CaptureConfig) -> Self {
        let fingerprints = FingerprintTracker::new(store.clone(), config.touchpoint_ttl);

        Self {
            store,
            fingerprints,
            config,
        }
    }

    pub fn config(&self) -> &CaptureConfig {
        &self.config
    }

    pub fn fingerprints(&self) -> &FingerprintTracker {
        &self.fingerprints
    }

    /// Settle on a visitor id for a signal. Browsers without our cookie are matched through their
    /// fingerprint when consent allows it, and get a fresh id otherwise.
    pub async fn identify_visitor(
        &self,
        visitor_id: Option<&str>,
        signal: &VisitSignal,
        consent: ConsentLevel,
    ) -> String {
        let fingerprint = (consent.allows_identity() && signal.is_qualifying())
            .then(|| self.fingerprint(signal))
            .flatten();

        let known = match (visitor_id.filter(|id| !id.trim().is_empty()), &fingerprint) {
            (Some(visitor_id), _) => Some(visitor_id.to_owned()),
            (None, Some(hash)) => match self.fingerprints.resolve_visitor(hash).await {
                Ok(found) => found,
                Err(e) => {
                    warn!("failed to resolve fingerprint: {}", e);
                    None
                }
            },
            (None, None) => None,
        };

        let visitor_id = known.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        if let Some(hash) = fingerprint {
            if let Err(e) = self.fingerprints.link(&hash, &visitor_id).await {
                warn!("failed to link fingerprint: {}", e);
            }
        }

        visitor_id
    }

    /// Record a page view for a visitor.
    pub async fn record_visit(
        &self,
        visitor_id: &str,
        signal: &VisitSignal,
        consent: ConsentLevel,
    ) -> CaptureOutcome {
        if !signal.is_qualifying() {
            return CaptureOutcome::Ignored;
        }

        if !consent.allows_touchpoints() {
            return CaptureOutcome::NoConsent;
        }

        let touchpoint = self.build_touchpoint(visitor_id, signal, consent, Utc::now());
        let observation = consent
            .allows_identity()
            .then(|| self.fingerprint(signal))
            .flatten()
            .map(|hash| {
                let observation = FingerprintObservation {
                    click_id: touchpoint.click_id.clone(),
                    utm: touchpoint.utm.clone(),
                    landing_page: touchpoint.landing_page.clone(),
                    referrer: touchpoint.referrer.clone(),
                };
                (hash, observation)
            });

        let append = BufferAppend {
            touchpoint,
            restored: signal
                .touchpoint_cookie
                .as_deref()
                .map(cookie::decode)
                .unwrap_or_default(),
            max_touchpoints: self.config.max_touchpoints,
            touchpoint_ttl: self.config.touchpoint_ttl,
            dedup_window: self.config.dedup_window,
        };

        let outcome = match self.store.append_to_buffer(visitor_id, &append).await {
            Ok(outcome) => {
                metrics::counter!("attribution_visits", &[("outcome", format!("{outcome:?}"))])
                    .increment(1);
                if !matches!(outcome, CaptureOutcome::Recorded | CaptureOutcome::DirectEntry) {
                    debug!(visitor_id, "visit not recorded: {:?}", outcome);
                }
                outcome
            }
            Err(e) => {
                warn!(visitor_id, "failed to record visit: {}", e);
                CaptureOutcome::StoreUnavailable
            }
        };

        if let Some((hash, observation)) = observation {
            if let Err(e) = self.fingerprints.observe(&hash, observation).await {
                warn!("failed to observe fingerprint: {}", e);
            }
        }

        outcome
    }

    /// The visitor's live touchpoints, oldest first.
    pub async fn touchpoints(&self, visitor_id: &str) -> Result<Vec<Touchpoint>, StoreError> {
        let buffer = self.store.load_buffer(visitor_id).await?;
        Ok(self.live(buffer, Utc::now()))
    }

    /// Freeze the visitor's journey for a conversion and clear the live buffer.
    pub async fn take_journey(&self, visitor_id: &str) -> Result<Vec<Touchpoint>, StoreError> {
        let now = Utc::now();
        let buffer = self.store.take_buffer(visitor_id, now).await?;
        Ok(self.live(buffer, now))
    }

    fn build_touchpoint(
        &self,
        visitor_id: &str,
        signal: &VisitSignal,
        consent: ConsentLevel,
        now: DateTime<Utc>,
    ) -> Touchpoint {
        let landing = Url::parse(&signal.url).ok();
        let mut params: HashMap<String, String> = landing
            .as_ref()
            .map(|url| url.query_pairs().into_owned().collect())
            .unwrap_or_default();
        params.extend(signal.params.clone());

        let landing_host = landing
            .as_ref()
            .and_then(|url| url.host_str())
            .map(normalize_domain);

        let referrer = signal
            .referrer
            .as_deref()
            .map(str::trim)
            .filter(|referrer| !referrer.is_empty());
        let referrer_domain = referrer
            .and_then(|referrer| Url::parse(referrer).ok())
            .and_then(|url| url.host_str().map(normalize_domain))
            .filter(|host| !host.is_empty() && Some(host) != landing_host.as_ref());

        let ip_hash = match (consent, signal.ip.as_deref()) {
            (ConsentLevel::Full, Some(ip)) if !ip.trim().is_empty() => {
                Some(hash_ip(&self.config.ip_salt, ip.trim()))
            }
            _ => None,
        };

        Touchpoint {
            visitor_id: visitor_id.to_owned(),
            session_id: signal
                .session_id
                .clone()
                .filter(|session_id| !session_id.is_empty())
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            timestamp: now,
            click_id: extract_click_id(&params),
            utm: extract_utm(&params),
            referrer: referrer.map(str::to_owned),
            referrer_domain,
            landing_page: signal.url.clone(),
            device_type: DeviceType::from_user_agent(signal.user_agent.as_deref().unwrap_or_default()),
            ip_hash,
            is_direct_entry: false,
        }
    }

    fn live(&self, buffer: Vec<Touchpoint>, now: DateTime<Utc>) -> Vec<Touchpoint> {
        buffer
            .into_iter()
            .filter(|touchpoint| now - touchpoint.timestamp <= self.config.touchpoint_ttl)
            .collect()
    }

    fn fingerprint(&self, signal: &VisitSignal) -> Option<String> {
        let ip = signal.ip.as_deref().filter(|ip| !ip.is_empty())?;
        let user_agent = signal.user_agent.as_deref().filter(|ua| !ua.is_empty())?;

        Some(fingerprint_hash(
            &self.config.ip_salt,
            ip,
            user_agent,
            signal.accept_language.as_deref().unwrap_or_default(),
        ))
    }
}

/// SHA-256 hex of the salt followed by the IP address.
pub fn hash_ip(salt: &str, ip: &str) -> String {
    hex::encode(Sha256::digest(format!("{salt}{ip}").as_bytes()))
}

/// The first click id present, in platform order.
fn extract_click_id(params: &HashMap<String, String>) -> Option<ClickId> {
    ClickIdType::ALL.into_iter().find_map(|platform| {
        params
            .get(platform.param_name())
            .map(|value| value.trim())
            .filter(|value| !value.is_empty())
            .map(|value| ClickId::new(platform, value))
    })
}

fn extract_utm(params: &HashMap<String, String>) -> UtmParams {
    let get = |name: &str| {
        params
            .get(name)
            .map(|value| value.trim())
            .filter(|value| !value.is_empty())
            .map(str::to_owned)
    };

    UtmParams {
        source: get("utm_source"),
        medium: get("utm_medium"),
        campaign: get("utm_campaign"),
        term: get("utm_term"),
        content: get("utm_content"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn capture() -> (Arc<MemoryStore>, TouchpointCapture) {
        let store = Arc::new(MemoryStore::new());
        let config = CaptureConfig {
            ip_salt: "salt".to_owned(),
            ..CaptureConfig::default()
        };
        (store.clone(), TouchpointCapture::new(store, config))
    }

    fn visit(url: &str) -> VisitSignal {
        VisitSignal {
            url: url.to_owned(),
            user_agent: Some("Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7)".to_owned()),
            ip: Some("203.0.113.7".to_owned()),
            ..VisitSignal::default()
        }
    }

    #[tokio::test]
    async fn test_two_signal_less_visits_yield_one_direct_entry() {
        let (_, capture) = capture();

        let first = capture
            .record_visit("v1", &visit("https://shop.example/"), ConsentLevel::Full)
            .await;
        let second = capture
            .record_visit("v1", &visit("https://shop.example/shoes"), ConsentLevel::Full)
            .await;

        assert_eq!(first, CaptureOutcome::DirectEntry);
        assert_eq!(second, CaptureOutcome::NoSignal);

        let touchpoints = capture.touchpoints("v1").await.unwrap();
        assert_eq!(touchpoints.len(), 1);
        assert!(touchpoints[0].is_direct_entry);
    }

    #[tokio::test]
    async fn test_click_id_extraction_follows_platform_order() {
        let (_, capture) = capture();

        capture
            .record_visit(
                "v1",
                &visit("https://shop.example/?fbclid=fb1&gclid=g1&utm_source=%20news%20"),
                ConsentLevel::Full,
            )
            .await;

        let touchpoint = &capture.touchpoints("v1").await.unwrap()[0];
        assert_eq!(touchpoint.click_id, Some(ClickId::new(ClickIdType::Gclid, "g1")));
        assert_eq!(touchpoint.utm.source.as_deref(), Some("news"));
        assert!(touchpoint.ip_hash.is_some());
    }

    #[tokio::test]
    async fn test_repeat_within_window_is_deduplicated() {
        let (_, capture) = capture();
        let signal = visit("https://shop.example/?utm_source=newsletter");

        let first = capture.record_visit("v1", &signal, ConsentLevel::Full).await;
        let second = capture.record_visit("v1", &signal, ConsentLevel::Full).await;
        let other = capture
            .record_visit(
                "v1",
                &visit("https://shop.example/?utm_source=google"),
                ConsentLevel::Full,
            )
            .await;

        assert_eq!(first, CaptureOutcome::Recorded);
        assert_eq!(second, CaptureOutcome::Duplicate);
        assert_eq!(other, CaptureOutcome::Recorded);
        assert_eq!(capture.touchpoints("v1").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_internal_referrer_is_not_a_signal() {
        let (_, capture) = capture();
        let mut signal = visit("https://www.shop.example/cart");
        signal.referrer = Some("https://shop.example/".to_owned());
        capture.record_visit("v1", &signal, ConsentLevel::Full).await;

        let mut external = visit("https://shop.example/");
        external.referrer = Some("https://www.Reddit.com/r/shoes".to_owned());
        let outcome = capture.record_visit("v1", &external, ConsentLevel::Full).await;

        let touchpoints = capture.touchpoints("v1").await.unwrap();
        assert!(touchpoints[0].is_direct_entry);
        assert_eq!(touchpoints[0].referrer_domain, None);
        assert_eq!(outcome, CaptureOutcome::Recorded);
        assert_eq!(touchpoints[1].referrer_domain.as_deref(), Some("reddit.com"));
    }

    #[tokio::test]
    async fn test_consent_levels() {
        let (store, capture) = capture();
        let signal = visit("https://shop.example/?utm_source=newsletter");

        assert_eq!(
            capture.record_visit("none", &signal, ConsentLevel::None).await,
            CaptureOutcome::NoConsent
        );
        assert!(store.load_buffer("none").await.unwrap().is_empty());

        capture
            .record_visit("anonymous", &signal, ConsentLevel::Anonymous)
            .await;
        let touchpoints = capture.touchpoints("anonymous").await.unwrap();
        assert_eq!(touchpoints.len(), 1);
        assert_eq!(touchpoints[0].ip_hash, None);
    }

    #[tokio::test]
    async fn test_crawlers_and_prefetches_are_ignored() {
        let (_, capture) = capture();
        let mut crawler = visit("https://shop.example/?gclid=abc");
        crawler.user_agent = Some("Googlebot/2.1".to_owned());
        let mut prefetch = visit("https://shop.example/?gclid=abc");
        prefetch.is_prefetch = true;

        assert_eq!(
            capture.record_visit("v1", &crawler, ConsentLevel::Full).await,
            CaptureOutcome::Ignored
        );
        assert_eq!(
            capture.record_visit("v1", &prefetch, ConsentLevel::Full).await,
            CaptureOutcome::Ignored
        );
        assert!(capture.touchpoints("v1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_buffer_is_capped_dropping_oldest() {
        let store = Arc::new(MemoryStore::new());
        let capture = TouchpointCapture::new(
            store,
            CaptureConfig {
                max_touchpoints: 3,
                ..CaptureConfig::default()
            },
        );

        for i in 0..5 {
            capture
                .record_visit(
                    "v1",
                    &visit(&format!("https://shop.example/?utm_source=s{i}")),
                    ConsentLevel::Full,
                )
                .await;
        }

        let sources: Vec<String> = capture
            .touchpoints("v1")
            .await
            .unwrap()
            .into_iter()
            .filter_map(|t| t.utm.source)
            .collect();
        assert_eq!(sources, vec!["s2", "s3", "s4"]);
    }

    #[tokio::test]
    async fn test_take_journey_freezes_and_clears() {
        let (store, capture) = capture();
        capture
            .record_visit("v1", &visit("https://shop.example/?gclid=abc"), ConsentLevel::Full)
            .await;

        let journey = capture.take_journey("v1").await.unwrap();

        assert_eq!(journey.len(), 1);
        assert!(capture.touchpoints("v1").await.unwrap().is_empty());
        // History survives for cross-device journeys.
        assert_eq!(
            store.history_for_visitors(&["v1".to_owned()]).await.unwrap().len(),
            1
        );
    }

    #[tokio::test]
    async fn test_cookie_seeds_an_empty_buffer() {
        let (_, capture) = capture();
        capture
            .record_visit("old", &visit("https://shop.example/?utm_source=tiktok"), ConsentLevel::Full)
            .await;
        let cookie_value = cookie::encode(&capture.touchpoints("old").await.unwrap());

        let mut signal = visit("https://shop.example/?utm_source=newsletter");
        signal.touchpoint_cookie = Some(cookie_value);
        capture.record_visit("new", &signal, ConsentLevel::Full).await;

        let touchpoints = capture.touchpoints("new").await.unwrap();
        assert_eq!(touchpoints.len(), 2);
        assert!(touchpoints.iter().all(|t| t.visitor_id == "new"));
    }

    #[tokio::test]
    async fn test_fingerprint_recognizes_returning_browser() {
        let (_, capture) = capture();
        let signal = visit("https://shop.example/");

        let first = capture
            .identify_visitor(None, &signal, ConsentLevel::Full)
            .await;
        let second = capture
            .identify_visitor(None, &signal, ConsentLevel::Full)
            .await;
        let anonymous = capture
            .identify_visitor(None, &signal, ConsentLevel::Anonymous)
            .await;
        let explicit = capture
            .identify_visitor(Some("cookie-visitor"), &signal, ConsentLevel::Full)
            .await;

        assert_eq!(first, second);
        assert_ne!(first, anonymous);
        assert_eq!(explicit, "cookie-visitor");
    }

    #[tokio::test]
    async fn test_cookie_does_not_restore_a_converted_journey() {
        let (store, capture) = capture();
        capture
            .record_visit("v1", &visit("https://shop.example/?gclid=paid"), ConsentLevel::Full)
            .await;
        let cookie_value = cookie::encode(&capture.touchpoints("v1").await.unwrap());
        assert_eq!(capture.take_journey("v1").await.unwrap().len(), 1);

        let mut signal = visit("https://shop.example/?utm_source=newsletter");
        signal.touchpoint_cookie = Some(cookie_value);
        capture.record_visit("v1", &signal, ConsentLevel::Full).await;

        let touchpoints = capture.touchpoints("v1").await.unwrap();
        assert_eq!(touchpoints.len(), 1);
        assert_eq!(touchpoints[0].utm.source.as_deref(), Some("newsletter"));
        assert!(touchpoints.iter().all(|t| t.click_id.is_none()));
        assert_eq!(
            store.history_for_visitors(&["v1".to_owned()]).await.unwrap().len(),
            2
        );
    }

    #[tokio::test]
    async fn test_restored_cookie_touchpoints_are_kept_in_history() {
        let (store, capture) = capture();
        capture
            .record_visit("old", &visit("https://shop.example/?utm_source=tiktok"), ConsentLevel::Full)
            .await;
        let cookie_value = cookie::encode(&capture.touchpoints("old").await.unwrap());

        let mut signal = visit("https://shop.example/?utm_source=newsletter");
        signal.touchpoint_cookie = Some(cookie_value);
        capture.record_visit("new", &signal, ConsentLevel::Full).await;

        let history = store.history_for_visitors(&["new".to_owned()]).await.unwrap();
        let sources: Vec<_> = history.iter().filter_map(|t| t.utm.source.as_deref()).collect();
        assert_eq!(sources, vec!["tiktok", "newsletter"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_visits_are_all_kept() {
        let (_, capture) = capture();

        let handles: Vec<_> = (0..20)
            .map(|i| {
                let capture = capture.clone();
                tokio::spawn(async move {
                    capture
                        .record_visit(
                            "v1",
                            &visit(&format!("https://shop.example/?utm_source=s{i}")),
                            ConsentLevel::Full,
                        )
                        .await
                })
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.await.unwrap(), CaptureOutcome::Recorded);
        }

        assert_eq!(capture.touchpoints("v1").await.unwrap().len(), 20);
    }

    #[tokio::test]
    async fn test_first_visit_of_a_new_browser_counts_once() {
        let (_, capture) = capture();
        let signal = visit("https://shop.example/landing?utm_source=newsletter");
        let hash = capture.fingerprint(&signal).unwrap();

        let visitor_id = capture
            .identify_visitor(None, &signal, ConsentLevel::Full)
            .await;
        capture.record_visit(&visitor_id, &signal, ConsentLevel::Full).await;

        let record = capture.fingerprints().lookup(&hash).await.unwrap().unwrap();
        assert_eq!(record.hit_count, 1);
        assert_eq!(record.landing_page, signal.url);
        assert_eq!(record.visitor_id.as_deref(), Some(visitor_id.as_str()));
        assert!((record.confidence - 0.90).abs() < 1e-9);

        let returning = capture
            .identify_visitor(None, &signal, ConsentLevel::Full)
            .await;
        capture.record_visit(&returning, &signal, ConsentLevel::Full).await;

        let record = capture.fingerprints().lookup(&hash).await.unwrap().unwrap();
        assert_eq!(returning, visitor_id);
        assert_eq!(record.hit_count, 2);
        assert!((record.confidence - 0.92).abs() < 1e-9);
    }
}
