//! # Touchpoint
//!
//! The marketing signals observed for a visitor, and the vocabulary they are expressed in.
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

/// Enumeration of parsing errors for touchpoint vocabulary.
#[derive(Error, Debug, PartialEq)]
pub enum ParseError {
    #[error("{0} is not a valid ClickIdType")]
    ParseClickIdTypeError(String),
    #[error("{0} is not a valid DeviceType")]
    ParseDeviceTypeError(String),
}

/// Ad platforms that append a click identifier to landing page URLs.
/// Variants are declared in extraction priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClickIdType {
    Gclid,
    Fbclid,
    Ttclid,
    Msclkid,
    LiFatId,
    Dclid,
}

impl ClickIdType {
    pub const ALL: [ClickIdType; 6] = [
        ClickIdType::Gclid,
        ClickIdType::Fbclid,
        ClickIdType::Ttclid,
        ClickIdType::Msclkid,
        ClickIdType::LiFatId,
        ClickIdType::Dclid,
    ];

    /// The query string parameter carrying this click id.
    pub fn param_name(&self) -> &'static str {
        match self {
            ClickIdType::Gclid => "gclid",
            ClickIdType::Fbclid => "fbclid",
            ClickIdType::Ttclid => "ttclid",
            ClickIdType::Msclkid => "msclkid",
            ClickIdType::LiFatId => "li_fat_id",
            ClickIdType::Dclid => "dclid",
        }
    }

    /// The attribution source credited for a touchpoint carrying this click id.
    pub fn source(&self) -> &'static str {
        match self {
            ClickIdType::Gclid => "google_ads",
            ClickIdType::Fbclid => "meta_ads",
            ClickIdType::Ttclid => "tiktok_ads",
            ClickIdType::Msclkid => "bing_ads",
            ClickIdType::LiFatId => "linkedin_ads",
            ClickIdType::Dclid => "google_display",
        }
    }
}

impl FromStr for ClickIdType {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ClickIdType::ALL
            .into_iter()
            .find(|click_id_type| click_id_type.param_name() == s)
            .ok_or_else(|| ParseError::ParseClickIdTypeError(s.to_owned()))
    }
}

impl fmt::Display for ClickIdType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.param_name())
    }
}

/// A platform-issued click identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClickId {
    pub platform: ClickIdType,
    pub value: String,
}

impl ClickId {
    pub fn new(platform: ClickIdType, value: &str) -> Self {
        Self {
            platform,
            value: value.to_owned(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    Mobile,
    Tablet,
    #[default]
    Desktop,
}

impl DeviceType {
    /// Classify a User-Agent header. Anything we cannot recognize is a desktop.
    pub fn from_user_agent(user_agent: &str) -> Self {
        let user_agent = user_agent.to_ascii_lowercase();

        if user_agent.contains("ipad")
            || user_agent.contains("tablet")
            || (user_agent.contains("android") && !user_agent.contains("mobile"))
        {
            DeviceType::Tablet
        } else if user_agent.contains("mobi")
            || user_agent.contains("iphone")
            || user_agent.contains("android")
        {
            DeviceType::Mobile
        } else {
            DeviceType::Desktop
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceType::Mobile => "mobile",
            DeviceType::Tablet => "tablet",
            DeviceType::Desktop => "desktop",
        }
    }
}

impl FromStr for DeviceType {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mobile" => Ok(DeviceType::Mobile),
            "tablet" => Ok(DeviceType::Tablet),
            "desktop" => Ok(DeviceType::Desktop),
            invalid => Err(ParseError::ParseDeviceTypeError(invalid.to_owned())),
        }
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// UTM campaign parameters. Empty values are never stored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UtmParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub medium: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub campaign: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub term: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

impl UtmParams {
    pub fn is_empty(&self) -> bool {
        self.source.is_none()
            && self.medium.is_none()
            && self.campaign.is_none()
            && self.term.is_none()
            && self.content.is_none()
    }
}

/// One observed marketing signal for a visitor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Touchpoint {
    pub visitor_id: String,
    #[serde(default)]
    pub session_id: String,
    #[serde(
        default = "Utc::now",
        deserialize_with = "deserialize_lenient_timestamp"
    )]
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub click_id: Option<ClickId>,
    #[serde(default, skip_serializing_if = "UtmParams::is_empty")]
    pub utm: UtmParams,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub referrer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub referrer_domain: Option<String>,
    #[serde(default)]
    pub landing_page: String,
    #[serde(default)]
    pub device_type: DeviceType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_hash: Option<String>,
    /// Set for the single entry recorded for a visit without any attribution signal.
    #[serde(default)]
    pub is_direct_entry: bool,
}

impl Touchpoint {
    /// Whether this touchpoint was recorded from a click id, UTM parameters or an external referrer.
    pub fn has_attribution_signal(&self) -> bool {
        self.click_id.is_some() || !self.utm.is_empty() || self.referrer_domain.is_some()
    }
}

/// Timestamps come back from client-held state, so anything we cannot make sense of is "now".
fn deserialize_lenient_timestamp<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;

    Ok(parse_timestamp(&value).unwrap_or_else(Utc::now))
}

fn parse_timestamp(value: &serde_json::Value) -> Option<DateTime<Utc>> {
    match value {
        serde_json::Value::String(s) => DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.with_timezone(&Utc))
            .ok()
            .or_else(|| {
                s.parse::<i64>()
                    .ok()
                    .and_then(|secs| DateTime::from_timestamp(secs, 0))
            }),
        serde_json::Value::Number(n) => n.as_i64().and_then(|secs| DateTime::from_timestamp(secs, 0)),
        _ => None,
    }
}

/// Strip a leading `www.` and lowercase a host name.
pub fn normalize_domain(host: &str) -> String {
    let host = host.trim().to_ascii_lowercase();

    match host.strip_prefix("www.") {
        Some(stripped) => stripped.to_owned(),
        None => host,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_click_id_type_round_trips_through_param_name() {
        for click_id_type in ClickIdType::ALL {
            let parsed: ClickIdType = click_id_type.param_name().parse().unwrap();
            assert_eq!(parsed, click_id_type);
        }

        assert_eq!(
            "utm_source".parse::<ClickIdType>(),
            Err(ParseError::ParseClickIdTypeError("utm_source".to_owned()))
        );
    }

    #[test]
    fn test_click_id_type_serializes_as_param_name() {
        let value = serde_json::to_value(ClickIdType::LiFatId).unwrap();
        assert_eq!(value, json!("li_fat_id"));
    }

    #[test]
    fn test_device_type_from_user_agent() {
        let iphone = "Mozilla/5.0 (iPhone; CPU iPhone OS 17_0 like Mac OS X) Mobile/15E148";
        let ipad = "Mozilla/5.0 (iPad; CPU OS 17_0 like Mac OS X)";
        let android_tablet = "Mozilla/5.0 (Linux; Android 13; SM-X700)";
        let android_phone = "Mozilla/5.0 (Linux; Android 13; Pixel 7) Mobile Safari/537.36";
        let mac = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) Safari/605.1.15";

        assert_eq!(DeviceType::from_user_agent(iphone), DeviceType::Mobile);
        assert_eq!(DeviceType::from_user_agent(ipad), DeviceType::Tablet);
        assert_eq!(DeviceType::from_user_agent(android_tablet), DeviceType::Tablet);
        assert_eq!(DeviceType::from_user_agent(android_phone), DeviceType::Mobile);
        assert_eq!(DeviceType::from_user_agent(mac), DeviceType::Desktop);
        assert_eq!(DeviceType::from_user_agent(""), DeviceType::Desktop);
    }

    #[test]
    fn test_malformed_timestamp_defaults_to_now() {
        let before = Utc::now();
        let touchpoint: Touchpoint = serde_json::from_value(json!({
            "visitor_id": "v1",
            "timestamp": "yesterday-ish",
            "landing_page": "https://shop.example/"
        }))
        .unwrap();

        assert!(touchpoint.timestamp >= before);
        assert!(touchpoint.timestamp <= Utc::now());
    }

    #[test]
    fn test_epoch_timestamp_is_accepted() {
        let touchpoint: Touchpoint = serde_json::from_value(json!({
            "visitor_id": "v1",
            "timestamp": 1_700_000_000,
        }))
        .unwrap();

        assert_eq!(touchpoint.timestamp.timestamp(), 1_700_000_000);
    }

    #[test]
    fn test_normalize_domain() {
        assert_eq!(normalize_domain("WWW.Google.com"), "google.com");
        assert_eq!(normalize_domain("news.ycombinator.com"), "news.ycombinator.com");
    }
}
