use axum::{
    body::Bytes,
    extract::State,
    http::{header, HeaderValue},
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use tracing::debug;

use attribution_common::capture::VisitSignal;
use attribution_common::consent::ConsentLevel;
use attribution_common::cookie::COOKIE_NAME;
use attribution_common::pipeline::ConversionPipeline;

/// Matches the default touchpoint lifetime.
const COOKIE_MAX_AGE_SECS: i64 = 90 * 24 * 60 * 60;

#[derive(Debug, Default, Deserialize)]
pub struct VisitRequest {
    #[serde(default)]
    visitor_id: Option<String>,
    #[serde(default)]
    consent: ConsentLevel,
    #[serde(flatten)]
    signal: VisitSignal,
}

/// Record a page view. Always answers 200 with a visitor id: a body we cannot read is treated as
/// a visit without any signal.
pub async fn post_visit(State(pipeline): State<ConversionPipeline>, body: Bytes) -> Response {
    let request: VisitRequest = serde_json::from_slice(&body).unwrap_or_else(|e| {
        debug!("unreadable visit payload, recording an empty signal: {}", e);
        VisitRequest::default()
    });

    let receipt = pipeline
        .record_visit(request.visitor_id.as_deref(), &request.signal, request.consent)
        .await;

    let cookie = receipt.cookie.as_ref().and_then(|value| {
        HeaderValue::from_str(&format!(
            "{COOKIE_NAME}={value}; Path=/; Max-Age={COOKIE_MAX_AGE_SECS}; SameSite=Lax; Secure"
        ))
        .ok()
    });

    let mut response = Json(receipt).into_response();
    if let Some(cookie) = cookie {
        response.headers_mut().insert(header::SET_COOKIE, cookie);
    }

    response
}
