//! # Destination
//!
//! The contract every outbound adapter implements, and the user data helpers they share.
use std::time;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::order::{ConversionRecord, Order};
use crate::touchpoint::ClickIdType;

pub const DEFAULT_EVENT_TYPE: &str = "purchase";

/// Errors raised while preparing a payload. These are data errors, so they are never retried.
#[derive(Error, Debug)]
pub enum DestinationError {
    #[error("required field {0} is missing")]
    MissingField(String),
    #[error("could not serialize payload: {0}")]
    SerializationError(#[from] serde_json::Error),
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
}

/// Outcome of one send attempt.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SendResult {
    pub success: bool,
    pub response_code: Option<u16>,
    pub response_body: Option<String>,
    pub error: Option<String>,
    /// How long the destination asked us to wait before trying again.
    pub retry_after: Option<time::Duration>,
}

impl SendResult {
    pub fn success(response_code: u16, response_body: Option<String>) -> Self {
        Self {
            success: true,
            response_code: Some(response_code),
            response_body,
            ..Self::default()
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Self::default()
        }
    }

    /// The error message, falling back to the response code when there is none.
    pub fn error_message(&self) -> String {
        match (&self.error, self.response_code) {
            (Some(error), _) => error.clone(),
            (None, Some(code)) => format!("HTTP {code}"),
            (None, None) => "unknown error".to_owned(),
        }
    }
}

#[async_trait]
pub trait Destination: Send + Sync {
    /// A stable identifier, used in order flags, logs and the queue.
    fn name(&self) -> &str;

    /// Whether credentials and endpoints are present.
    fn is_configured(&self) -> bool;

    fn event_type(&self) -> &str {
        DEFAULT_EVENT_TYPE
    }

    /// A click id the destination cannot match conversions without.
    fn required_click_id(&self) -> Option<ClickIdType> {
        None
    }

    /// Whether the destination accepts conversions lacking `required_click_id`, e.g. by matching
    /// on hashed user data instead.
    fn supports_signalless(&self) -> bool {
        true
    }

    fn should_send(&self, _conversion: &ConversionRecord) -> bool {
        true
    }

    fn prepare_payload(
        &self,
        conversion: &ConversionRecord,
        event_id: &str,
    ) -> Result<serde_json::Value, DestinationError>;

    async fn send(&self, order: &Order, payload: &serde_json::Value) -> SendResult;
}

/// Hashed customer data in the shape ad platforms match conversions on.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserData {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub em: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ph: Option<String>,
    #[serde(rename = "fn", skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    #[serde(rename = "ln", skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ct: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub st: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub zp: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
}

/// SHA-256 hex of an already normalized value. Empty values hash to nothing.
pub fn hash_user_data(value: &str) -> Option<String> {
    if value.is_empty() {
        return None;
    }

    Some(hex::encode(Sha256::digest(value.as_bytes())))
}

pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

/// Digits only, country code included if the customer typed one.
pub fn normalize_phone(phone: &str) -> String {
    phone.chars().filter(char::is_ascii_digit).collect()
}

/// Lowercase letters only, so "  O'Brien " and "obrien" match.
pub fn normalize_name(name: &str) -> String {
    name.trim()
        .to_lowercase()
        .chars()
        .filter(|c| c.is_alphabetic())
        .collect()
}

fn normalize_location(value: &str) -> String {
    value
        .trim()
        .to_lowercase()
        .chars()
        .filter(|c| c.is_alphanumeric())
        .collect()
}

/// Hashed user data of an order's buyer.
pub fn user_data(order: &Order) -> UserData {
    let billing = &order.billing;
    let hashed = |value: Option<&String>, normalize: fn(&str) -> String| {
        value.and_then(|value| hash_user_data(&normalize(value)))
    };

    UserData {
        em: hash_user_data(&normalize_email(&order.email)),
        ph: hashed(billing.phone.as_ref(), normalize_phone),
        first_name: hashed(billing.first_name.as_ref(), normalize_name),
        last_name: hashed(billing.last_name.as_ref(), normalize_name),
        ct: hashed(billing.city.as_ref(), normalize_location),
        st: hashed(billing.state.as_ref(), normalize_location),
        zp: hashed(billing.postcode.as_ref(), normalize_location),
        country: hashed(billing.country.as_ref(), normalize_location),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::hash_email;
    use serde_json::json;

    #[test]
    fn test_normalizers() {
        assert_eq!(normalize_email("  Buyer@Example.COM "), "buyer@example.com");
        assert_eq!(normalize_phone("+44 (0) 20-7946 0958"), "4402079460958");
        assert_eq!(normalize_name("  O'Brien "), "obrien");
    }

    #[test]
    fn test_hash_user_data_skips_empty_values() {
        assert_eq!(hash_user_data(""), None);
        assert_eq!(hash_user_data("a").map(|h| h.len()), Some(64));
    }

    #[test]
    fn test_user_data_hashes_order_fields() {
        let order: Order = serde_json::from_value(json!({
            "order_id": 1,
            "email": " Buyer@Example.com",
            "total": 10.0,
            "currency": "EUR",
            "billing": {"first_name": "Ada", "phone": "", "country": "GB"}
        }))
        .unwrap();

        let data = user_data(&order);

        assert_eq!(data.em, Some(hash_email("buyer@example.com")));
        assert_eq!(data.first_name, hash_user_data("ada"));
        assert_eq!(data.country, hash_user_data("gb"));
        assert_eq!(data.ph, None);
        assert_eq!(data.last_name, None);

        let value = serde_json::to_value(&data).unwrap();
        assert!(value.get("fn").is_some());
        assert!(value.get("ln").is_none());
    }

    #[test]
    fn test_send_result_error_message() {
        assert_eq!(SendResult::failure("timeout").error_message(), "timeout");
        let result = SendResult {
            response_code: Some(503),
            ..SendResult::default()
        };
        assert_eq!(result.error_message(), "HTTP 503");
    }
}
