//! # Attribution
//!
//! Multi-touch attribution over an ordered sequence of touchpoints. Every computation here is
//! pure: there is no I/O and no failure state.
use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::touchpoint::{normalize_domain, Touchpoint};

const TIME_DECAY_HALF_LIFE_DAYS: f64 = 7.0;
const POSITION_BASED_ENDPOINT_WEIGHT: f64 = 0.4;
const MAX_UTM_SOURCE_LENGTH: usize = 100;
const SECONDS_PER_DAY: f64 = 86_400.0;

pub const DIRECT_SOURCE: &str = "direct";

/// Known referrer hosts, matched against any non-TLD label of the referrer domain.
const REFERRER_LABELS: [(&str, &str); 12] = [
    ("google", "google"),
    ("bing", "bing"),
    ("yahoo", "yahoo"),
    ("duckduckgo", "duckduckgo"),
    ("facebook", "facebook"),
    ("instagram", "instagram"),
    ("twitter", "twitter"),
    ("linkedin", "linkedin"),
    ("pinterest", "pinterest"),
    ("tiktok", "tiktok"),
    ("reddit", "reddit"),
    ("youtube", "youtube"),
];

/// Short domains that do not carry the platform name.
const REFERRER_ALIASES: [(&str, &str); 8] = [
    ("x.com", "twitter"),
    ("t.co", "twitter"),
    ("fb.com", "facebook"),
    ("fb.me", "facebook"),
    ("lnkd.in", "linkedin"),
    ("youtu.be", "youtube"),
    ("pin.it", "pinterest"),
    ("redd.it", "reddit"),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttributionModel {
    FirstTouch,
    LastTouch,
    Linear,
    PositionBased,
    TimeDecay,
}

impl AttributionModel {
    pub const ALL: [AttributionModel; 5] = [
        AttributionModel::FirstTouch,
        AttributionModel::LastTouch,
        AttributionModel::Linear,
        AttributionModel::PositionBased,
        AttributionModel::TimeDecay,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AttributionModel::FirstTouch => "first_touch",
            AttributionModel::LastTouch => "last_touch",
            AttributionModel::Linear => "linear",
            AttributionModel::PositionBased => "position_based",
            AttributionModel::TimeDecay => "time_decay",
        }
    }
}

impl fmt::Display for AttributionModel {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Credit assigned to one source under one model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceCredit {
    pub source: String,
    pub weight: f64,
}

/// Credit per model. Keyed by the model name so the stored JSON reads naturally.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AttributionResult(BTreeMap<String, Vec<SourceCredit>>);

impl AttributionResult {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Credits for a model, highest weight first.
    pub fn credits(&self, model: AttributionModel) -> &[SourceCredit] {
        self.0
            .get(model.as_str())
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// The weight a source received under a model, zero if it received none.
    pub fn weight(&self, model: AttributionModel, source: &str) -> f64 {
        self.credits(model)
            .iter()
            .find(|credit| credit.source == source)
            .map_or(0.0, |credit| credit.weight)
    }

    /// The source with the highest weight under a model.
    pub fn top_source(&self, model: AttributionModel) -> Option<&str> {
        self.credits(model).first().map(|credit| credit.source.as_str())
    }

    fn insert(&mut self, model: AttributionModel, credits: Vec<SourceCredit>) {
        self.0.insert(model.as_str().to_owned(), credits);
    }
}

/// Compute attribution for every model, with time decay measured against the current time.
pub fn compute(touchpoints: &[Touchpoint]) -> AttributionResult {
    compute_at(touchpoints, Utc::now())
}

/// Compute attribution for every model, with time decay measured against `now`.
pub fn compute_at(touchpoints: &[Touchpoint], now: DateTime<Utc>) -> AttributionResult {
    let mut result = AttributionResult::default();

    if touchpoints.is_empty() {
        return result;
    }

    let sources: Vec<String> = touchpoints.iter().map(resolve_source).collect();

    for model in AttributionModel::ALL {
        let weights = match model {
            AttributionModel::TimeDecay => time_decay_weights(touchpoints, now),
            positional => positional_weights(positional, touchpoints.len()),
        };
        result.insert(model, aggregate(&sources, &weights));
    }

    result
}

/// Per-touchpoint weights for the models that only depend on position in the sequence.
fn positional_weights(model: AttributionModel, n: usize) -> Vec<f64> {
    let mut weights = vec![0.0; n];

    if n == 1 {
        weights[0] = 1.0;
        return weights;
    }

    match model {
        AttributionModel::FirstTouch => weights[0] = 1.0,
        AttributionModel::LastTouch => weights[n - 1] = 1.0,
        AttributionModel::Linear => weights.fill(1.0 / n as f64),
        AttributionModel::PositionBased if n == 2 => {
            weights[0] = 0.5;
            weights[1] = 0.5;
        }
        AttributionModel::PositionBased => {
            let middle_weight =
                (1.0 - 2.0 * POSITION_BASED_ENDPOINT_WEIGHT) / (n - 2) as f64;
            weights.fill(middle_weight);
            weights[0] = POSITION_BASED_ENDPOINT_WEIGHT;
            weights[n - 1] = POSITION_BASED_ENDPOINT_WEIGHT;
        }
        AttributionModel::TimeDecay => unreachable!("time decay weights depend on timestamps"),
    }

    weights
}

/// Exponential decay with a 7-day half-life, normalized to sum to one.
/// Touchpoints in the future count as happening now.
fn time_decay_weights(touchpoints: &[Touchpoint], now: DateTime<Utc>) -> Vec<f64> {
    let raw: Vec<f64> = touchpoints
        .iter()
        .map(|touchpoint| {
            let days = ((now - touchpoint.timestamp).num_seconds() as f64 / SECONDS_PER_DAY).max(0.0);
            0.5_f64.powf(days / TIME_DECAY_HALF_LIFE_DAYS)
        })
        .collect();

    let total: f64 = raw.iter().sum();

    if total > 0.0 && total.is_finite() {
        raw.into_iter().map(|weight| weight / total).collect()
    } else {
        // Every touchpoint decayed to nothing: fall back to even credit.
        positional_weights(AttributionModel::Linear, touchpoints.len())
    }
}

/// Sum weights by source, highest weight first and ties broken by source name.
fn aggregate(sources: &[String], weights: &[f64]) -> Vec<SourceCredit> {
    let mut totals: BTreeMap<&str, f64> = BTreeMap::new();

    for (source, weight) in sources.iter().zip(weights) {
        *totals.entry(source.as_str()).or_default() += weight;
    }

    let mut credits: Vec<SourceCredit> = totals
        .into_iter()
        .filter(|(_, weight)| *weight > 0.0)
        .map(|(source, weight)| SourceCredit {
            source: source.to_owned(),
            weight,
        })
        .collect();

    credits.sort_by(|a, b| b.weight.total_cmp(&a.weight).then_with(|| a.source.cmp(&b.source)));

    credits
}

/// Resolve the source credited for a touchpoint.
/// Priority: click id platform, UTM source, known referrer, any other referrer, direct.
pub fn resolve_source(touchpoint: &Touchpoint) -> String {
    if let Some(click_id) = &touchpoint.click_id {
        return click_id.platform.source().to_owned();
    }

    if let Some(source) = touchpoint
        .utm
        .source
        .as_deref()
        .and_then(sanitize_utm_source)
    {
        return source;
    }

    if let Some(domain) = touchpoint.referrer_domain.as_deref() {
        let domain = normalize_domain(domain);
        if !domain.is_empty() {
            return match known_referrer_source(&domain) {
                Some(source) => source.to_owned(),
                None => format!("referral:{domain}"),
            };
        }
    }

    DIRECT_SOURCE.to_owned()
}

/// Lowercase, collapse whitespace to underscores and drop anything outside `[a-z0-9_.-]`.
/// Returns `None` when nothing usable is left.
pub fn sanitize_utm_source(raw: &str) -> Option<String> {
    let sanitized: String = raw
        .trim()
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("_")
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
        .take(MAX_UTM_SOURCE_LENGTH)
        .collect();

    if sanitized.is_empty() {
        None
    } else {
        Some(sanitized)
    }
}

fn known_referrer_source(domain: &str) -> Option<&'static str> {
    if let Some((_, source)) = REFERRER_ALIASES
        .iter()
        .find(|(alias, _)| domain == *alias || domain.ends_with(&format!(".{alias}")))
    {
        return Some(source);
    }

    let labels: Vec<&str> = domain.split('.').collect();
    let (_tld, names) = labels.split_last()?;

    REFERRER_LABELS
        .iter()
        .find(|(label, _)| names.contains(label))
        .map(|(_, source)| *source)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::touchpoint::{ClickId, ClickIdType, DeviceType, UtmParams};
    use chrono::Duration;

    const TOLERANCE: f64 = 0.01;

    fn touchpoint_at(source: &str, timestamp: DateTime<Utc>) -> Touchpoint {
        Touchpoint {
            visitor_id: "visitor".to_owned(),
            session_id: "session".to_owned(),
            timestamp,
            click_id: None,
            utm: UtmParams {
                source: Some(source.to_owned()),
                ..UtmParams::default()
            },
            referrer: None,
            referrer_domain: None,
            landing_page: "https://shop.example/".to_owned(),
            device_type: DeviceType::Desktop,
            ip_hash: None,
            is_direct_entry: false,
        }
    }

    fn journey(sources: &[&str]) -> Vec<Touchpoint> {
        let start = Utc::now() - Duration::days(sources.len() as i64);
        sources
            .iter()
            .enumerate()
            .map(|(i, source)| touchpoint_at(source, start + Duration::days(i as i64)))
            .collect()
    }

    fn assert_close(actual: f64, expected: f64) {
        assert!(
            (actual - expected).abs() < 1e-9,
            "expected {expected}, got {actual}"
        );
    }

    #[test]
    fn test_empty_sequence_has_no_results() {
        assert!(compute(&[]).is_empty());
    }

    #[test]
    fn test_weights_sum_to_one_for_every_model() {
        let journeys = [
            journey(&["a"]),
            journey(&["a", "b"]),
            journey(&["a", "b", "a"]),
            journey(&["a", "b", "c", "d", "e", "f", "g"]),
            journey(&["a", "a", "a", "a"]),
        ];

        for touchpoints in journeys {
            let result = compute(&touchpoints);
            for model in AttributionModel::ALL {
                let sum: f64 = result.credits(model).iter().map(|c| c.weight).sum();
                assert!(
                    (sum - 1.0).abs() <= TOLERANCE,
                    "{model} summed to {sum} for {} touchpoints",
                    touchpoints.len()
                );
            }
        }
    }

    #[test]
    fn test_single_touchpoint_gets_full_credit_under_every_model() {
        let result = compute(&journey(&["newsletter"]));

        for model in AttributionModel::ALL {
            assert_eq!(result.credits(model).len(), 1);
            assert_close(result.weight(model, "newsletter"), 1.0);
        }
    }

    #[test]
    fn test_first_and_last_touch() {
        let result = compute(&journey(&["a", "b", "c"]));

        assert_eq!(result.top_source(AttributionModel::FirstTouch), Some("a"));
        assert_close(result.weight(AttributionModel::FirstTouch, "a"), 1.0);
        assert_eq!(result.top_source(AttributionModel::LastTouch), Some("c"));
        assert_close(result.weight(AttributionModel::LastTouch, "c"), 1.0);
    }

    #[test]
    fn test_linear_sums_by_source() {
        let result = compute(&journey(&["a", "a", "b"]));

        assert_close(result.weight(AttributionModel::Linear, "a"), 2.0 / 3.0);
        assert_close(result.weight(AttributionModel::Linear, "b"), 1.0 / 3.0);
    }

    #[test]
    fn test_position_based_four_touchpoints() {
        let result = compute(&journey(&["a", "b", "c", "d"]));

        assert_close(result.weight(AttributionModel::PositionBased, "a"), 0.4);
        assert_close(result.weight(AttributionModel::PositionBased, "b"), 0.1);
        assert_close(result.weight(AttributionModel::PositionBased, "c"), 0.1);
        assert_close(result.weight(AttributionModel::PositionBased, "d"), 0.4);
    }

    #[test]
    fn test_position_based_two_touchpoints_split_evenly() {
        let result = compute(&journey(&["a", "b"]));

        assert_close(result.weight(AttributionModel::PositionBased, "a"), 0.5);
        assert_close(result.weight(AttributionModel::PositionBased, "b"), 0.5);
    }

    #[test]
    fn test_time_decay_prefers_recent_touchpoints() {
        let now = Utc::now();
        let touchpoints = vec![
            touchpoint_at("old", now - Duration::days(14)),
            touchpoint_at("recent", now - Duration::days(1)),
        ];

        let result = compute_at(&touchpoints, now);
        let old = result.weight(AttributionModel::TimeDecay, "old");
        let recent = result.weight(AttributionModel::TimeDecay, "recent");

        assert!(recent > old);
        // 13 days apart, with a 7 day half-life.
        assert_close(old / recent, 0.5_f64.powf(13.0 / 7.0));
    }

    #[test]
    fn test_time_decay_survives_ancient_touchpoints() {
        let now = Utc::now();
        let touchpoints = vec![
            touchpoint_at("a", now - Duration::days(365 * 200)),
            touchpoint_at("b", now - Duration::days(365 * 200)),
        ];

        let result = compute_at(&touchpoints, now);

        assert_close(result.weight(AttributionModel::TimeDecay, "a"), 0.5);
        assert_close(result.weight(AttributionModel::TimeDecay, "b"), 0.5);
    }

    #[test]
    fn test_credits_are_sorted_by_weight() {
        let result = compute(&journey(&["b", "a", "a", "c"]));
        let credits = result.credits(AttributionModel::Linear);

        assert_eq!(credits[0].source, "a");
        assert_eq!(credits[1].source, "b");
        assert_eq!(credits[2].source, "c");
    }

    #[test]
    fn test_source_priority() {
        let mut touchpoint = touchpoint_at("Spring Sale!", Utc::now());
        touchpoint.referrer_domain = Some("www.facebook.com".to_owned());
        touchpoint.click_id = Some(ClickId::new(ClickIdType::Msclkid, "xyz"));
        assert_eq!(resolve_source(&touchpoint), "bing_ads");

        touchpoint.click_id = None;
        assert_eq!(resolve_source(&touchpoint), "spring_sale");

        touchpoint.utm = UtmParams::default();
        assert_eq!(resolve_source(&touchpoint), "facebook");

        touchpoint.referrer_domain = Some("blog.example.org".to_owned());
        assert_eq!(resolve_source(&touchpoint), "referral:blog.example.org");

        touchpoint.referrer_domain = None;
        assert_eq!(resolve_source(&touchpoint), "direct");
    }

    #[test]
    fn test_every_click_id_platform_maps_to_a_source() {
        let expected = [
            (ClickIdType::Gclid, "google_ads"),
            (ClickIdType::Fbclid, "meta_ads"),
            (ClickIdType::Ttclid, "tiktok_ads"),
            (ClickIdType::Msclkid, "bing_ads"),
            (ClickIdType::LiFatId, "linkedin_ads"),
            (ClickIdType::Dclid, "google_display"),
        ];

        for (platform, source) in expected {
            let mut touchpoint = touchpoint_at("ignored", Utc::now());
            touchpoint.click_id = Some(ClickId::new(platform, "id"));
            assert_eq!(resolve_source(&touchpoint), source);
        }
    }

    #[test]
    fn test_known_referrers() {
        assert_eq!(known_referrer_source("google.co.uk"), Some("google"));
        assert_eq!(known_referrer_source("m.facebook.com"), Some("facebook"));
        assert_eq!(known_referrer_source("t.co"), Some("twitter"));
        assert_eq!(known_referrer_source("x.com"), Some("twitter"));
        assert_eq!(known_referrer_source("duckduckgo.com"), Some("duckduckgo"));
        assert_eq!(known_referrer_source("youtu.be"), Some("youtube"));
        assert_eq!(known_referrer_source("mygoogle.com"), None);
        assert_eq!(known_referrer_source("box.com"), None);
    }

    #[test]
    fn test_sanitize_utm_source() {
        assert_eq!(sanitize_utm_source("  News Letter "), Some("news_letter".to_owned()));
        assert_eq!(sanitize_utm_source("<script>"), Some("script".to_owned()));
        assert_eq!(sanitize_utm_source("!!!"), None);
        assert_eq!(sanitize_utm_source(&"a".repeat(500)).map(|s| s.len()), Some(100));
    }

    #[test]
    fn test_blank_utm_source_falls_through_to_referrer() {
        let mut touchpoint = touchpoint_at("   ", Utc::now());
        touchpoint.referrer_domain = Some("reddit.com".to_owned());

        assert_eq!(resolve_source(&touchpoint), "reddit");
    }
}
