//! # Webhook
//!
//! A generic destination that POSTs the conversion as JSON to a configured URL. Platform-specific
//! adapters plug in through the same `Destination` trait.
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time;

use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use http::StatusCode;
use reqwest::{header, Client};
use serde_json::json;
use thiserror::Error;
use tracing::debug;
use url::Url;

use crate::consent::ConsentLevel;
use crate::destination::{user_data, Destination, DestinationError, SendResult, DEFAULT_EVENT_TYPE};
use crate::order::{ConversionRecord, Order};
use crate::touchpoint::ClickIdType;

/// Response bodies beyond this many bytes are not read.
const MAX_RESPONSE_BODY: usize = 64 * 1024;

#[derive(Error, Debug, PartialEq)]
pub enum WebhookConfigError {
    #[error("webhook destination must be given as name=url, got: {0}")]
    MissingSeparator(String),
    #[error("webhook destination name cannot be empty")]
    EmptyName,
    #[error("invalid webhook url for {name}: {error}")]
    InvalidUrl { name: String, error: url::ParseError },
    #[error("invalid webhook option for {name}: {option}")]
    InvalidOption { name: String, option: String },
}

/// A named webhook endpoint, parsed from `name=url`, optionally followed by `;event=<type>` and
/// `;click_id=<param>` to restrict sends to conversions carrying that click id.
#[derive(Debug, Clone, PartialEq)]
pub struct WebhookConfig {
    pub name: String,
    pub url: Url,
    pub event_type: Option<String>,
    pub required_click_id: Option<ClickIdType>,
}

impl FromStr for WebhookConfig {
    type Err = WebhookConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (name, rest) = s
            .split_once('=')
            .ok_or_else(|| WebhookConfigError::MissingSeparator(s.to_owned()))?;
        let name = name.trim();

        if name.is_empty() {
            return Err(WebhookConfigError::EmptyName);
        }

        let mut parts = rest.split(';');
        let url = parts.next().unwrap_or_default();
        let url = Url::parse(url.trim()).map_err(|error| WebhookConfigError::InvalidUrl {
            name: name.to_owned(),
            error,
        })?;

        let mut config = Self {
            name: name.to_owned(),
            url,
            event_type: None,
            required_click_id: None,
        };

        for option in parts.map(str::trim).filter(|option| !option.is_empty()) {
            let invalid = || WebhookConfigError::InvalidOption {
                name: config.name.clone(),
                option: option.to_owned(),
            };
            match option.split_once('=') {
                Some(("event", event_type)) if !event_type.is_empty() => {
                    config.event_type = Some(event_type.to_owned())
                }
                Some(("click_id", param)) => {
                    config.required_click_id = Some(param.parse().map_err(|_| invalid())?)
                }
                _ => return Err(invalid()),
            }
        }

        Ok(config)
    }
}

impl fmt::Display for WebhookConfig {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}={}", self.name, self.url)?;
        if let Some(event_type) = &self.event_type {
            write!(f, ";event={}", event_type)?;
        }
        if let Some(click_id_type) = &self.required_click_id {
            write!(f, ";click_id={}", click_id_type.param_name())?;
        }
        Ok(())
    }
}

/// Parse a comma separated list of `name=url` pairs.
pub fn parse_webhook_configs(s: &str) -> Result<Vec<WebhookConfig>, WebhookConfigError> {
    s.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(WebhookConfig::from_str)
        .collect()
}

pub fn build_http_client(request_timeout: time::Duration) -> reqwest::Result<Client> {
    let mut headers = header::HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("application/json"),
    );

    reqwest::Client::builder()
        .default_headers(headers)
        .user_agent("Conversion Attribution Dispatcher")
        .timeout(request_timeout)
        .build()
}

/// One destination per configured endpoint, sharing a single client.
pub fn webhook_destinations(configs: Vec<WebhookConfig>, client: &Client) -> Vec<Arc<dyn Destination>> {
    configs
        .into_iter()
        .map(|config| -> Arc<dyn Destination> {
            Arc::new(WebhookDestination::new(config, client.clone()))
        })
        .collect()
}

pub struct WebhookDestination {
    name: String,
    url: Option<Url>,
    client: Client,
    event_type: String,
    required_click_id: Option<ClickIdType>,
}

impl WebhookDestination {
    pub fn new(config: WebhookConfig, client: Client) -> Self {
        let destination = Self {
            name: config.name,
            url: Some(config.url),
            client,
            event_type: DEFAULT_EVENT_TYPE.to_owned(),
            required_click_id: None,
        };
        let destination = match config.event_type {
            Some(event_type) => destination.with_event_type(&event_type),
            None => destination,
        };
        match config.required_click_id {
            Some(click_id_type) => destination.with_required_click_id(click_id_type),
            None => destination,
        }
    }

    /// A destination without an endpoint. It is reported as not configured and never sent to.
    pub fn unconfigured(name: &str, client: Client) -> Self {
        Self {
            name: name.to_owned(),
            url: None,
            client,
            event_type: DEFAULT_EVENT_TYPE.to_owned(),
            required_click_id: None,
        }
    }

    pub fn with_event_type(mut self, event_type: &str) -> Self {
        self.event_type = event_type.to_owned();
        self
    }

    pub fn with_required_click_id(mut self, click_id_type: ClickIdType) -> Self {
        self.required_click_id = Some(click_id_type);
        self
    }
}

#[async_trait]
impl Destination for WebhookDestination {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_configured(&self) -> bool {
        self.url.is_some()
    }

    fn event_type(&self) -> &str {
        &self.event_type
    }

    fn required_click_id(&self) -> Option<ClickIdType> {
        self.required_click_id
    }

    fn supports_signalless(&self) -> bool {
        self.required_click_id.is_none()
    }

    fn prepare_payload(
        &self,
        conversion: &ConversionRecord,
        event_id: &str,
    ) -> Result<serde_json::Value, DestinationError> {
        let order = &conversion.order;

        if !order.total.is_finite() {
            return Err(DestinationError::InvalidPayload(format!(
                "order {} has a non-finite total",
                order.order_id
            )));
        }
        if order.currency.trim().is_empty() {
            return Err(DestinationError::MissingField("currency".to_owned()));
        }

        let mut payload = json!({
            "event_id": event_id,
            "event_type": self.event_type,
            "event_time": order.created_at.timestamp(),
            "order_id": order.order_id,
            "value": order.total,
            "currency": order.currency,
            "line_items": order.line_items,
        });

        if order.consent.allows_touchpoints() {
            payload["click_ids"] = serde_json::to_value(conversion.click_ids())?;
            payload["attribution"] = serde_json::to_value(&conversion.attribution)?;
        }
        if order.consent == ConsentLevel::Full {
            payload["user_data"] = serde_json::to_value(user_data(order))?;
            if let Some(cross_device) = &conversion.cross_device {
                payload["cross_device"] = serde_json::to_value(cross_device)?;
            }
        }

        Ok(payload)
    }

    async fn send(&self, order: &Order, payload: &serde_json::Value) -> SendResult {
        let Some(url) = &self.url else {
            return SendResult::failure(format!("{} has no url configured", self.name));
        };

        let response = match self.client.post(url.clone()).json(payload).send().await {
            Ok(response) => response,
            Err(e) => {
                debug!(order_id = order.order_id, "webhook request failed: {}", e);
                return SendResult::failure(e.to_string());
            }
        };

        let status = response.status();
        let retry_after = parse_retry_after_header(response.headers());
        let body = first_n_bytes_of_response(response, MAX_RESPONSE_BODY).await;

        if status.is_success() {
            return SendResult::success(status.as_u16(), body);
        }

        let kind = if is_retryable_status(status) {
            "retryable"
        } else {
            "non-retryable"
        };

        SendResult {
            success: false,
            response_code: Some(status.as_u16()),
            error: Some(format!("{kind} status {status}")),
            response_body: body,
            retry_after,
        }
    }
}

/// Read at most `n` bytes of a response body, lossily decoded.
async fn first_n_bytes_of_response(response: reqwest::Response, n: usize) -> Option<String> {
    let mut body = response.bytes_stream();
    let mut buffer: Vec<u8> = Vec::with_capacity(n.min(8 * 1024));

    while let Some(chunk) = body.next().await {
        if buffer.len() >= n {
            break;
        }

        match chunk {
            Ok(chunk) => {
                let upper_bound = std::cmp::min(n - buffer.len(), chunk.len());
                buffer.extend_from_slice(&chunk[..upper_bound]);
            }
            Err(e) => {
                debug!("failed to read response body: {}", e);
                break;
            }
        }
    }

    if buffer.is_empty() {
        None
    } else {
        Some(String::from_utf8_lossy(&buffer).into_owned())
    }
}

/// Return `true` if the given HTTP status code is worth retrying soon.
/// Every failure goes through the retry queue regardless; this only labels the error.
pub fn is_retryable_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

/// Attempt to parse a Duration from a Retry-After header, returning None if not possible.
/// Retry-After header can specify a date in RFC2822 or a number of seconds; we try to parse both.
pub fn parse_retry_after_header(header_map: &header::HeaderMap) -> Option<time::Duration> {
    let retry_after = header_map.get(header::RETRY_AFTER)?.to_str().ok()?;

    if let Ok(u) = retry_after.parse::<u64>() {
        return Some(time::Duration::from_secs(u));
    }

    if let Ok(dt) = chrono::DateTime::parse_from_rfc2822(retry_after) {
        let duration = chrono::DateTime::<Utc>::from(dt) - Utc::now();

        // This can only fail when negative, in which case we return None.
        return duration.to_std().ok();
    }

    None
}
