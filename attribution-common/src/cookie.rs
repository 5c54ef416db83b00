//! # Touchpoint cookie
//!
//! Client-held copy of a visitor's touchpoint buffer. The blob carries an explicit version tag so
//! that old clients holding an unknown format are read as "no touchpoints" rather than garbage.
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::touchpoint::Touchpoint;

pub const COOKIE_NAME: &str = "_attr_tp";
pub const CURRENT_VERSION: u32 = 1;
const VERSION_PREFIX: &str = "v1.";

#[derive(Serialize, Deserialize)]
struct CookieEnvelope {
    v: u32,
    touchpoints: Vec<Touchpoint>,
}

/// Serialize touchpoints into a cookie-safe string.
pub fn encode(touchpoints: &[Touchpoint]) -> String {
    let envelope = CookieEnvelope {
        v: CURRENT_VERSION,
        touchpoints: touchpoints.to_vec(),
    };
    // Serializing plain data structs into a `Vec` cannot fail.
    let json = serde_json::to_vec(&envelope).unwrap_or_default();

    format!("{VERSION_PREFIX}{}", URL_SAFE_NO_PAD.encode(json))
}

/// Deserialize a cookie value. Any value we do not understand yields an empty list.
pub fn decode(value: &str) -> Vec<Touchpoint> {
    let Some(payload) = value.trim().strip_prefix(VERSION_PREFIX) else {
        debug!("ignoring touchpoint cookie with unknown version tag");
        return Vec::new();
    };

    let bytes = match URL_SAFE_NO_PAD.decode(payload) {
        Ok(bytes) => bytes,
        Err(e) => {
            debug!("ignoring touchpoint cookie with invalid encoding: {}", e);
            return Vec::new();
        }
    };

    match serde_json::from_slice::<CookieEnvelope>(&bytes) {
        Ok(envelope) if envelope.v == CURRENT_VERSION => envelope.touchpoints,
        Ok(envelope) => {
            debug!("ignoring touchpoint cookie with version {}", envelope.v);
            Vec::new()
        }
        Err(e) => {
            debug!("ignoring malformed touchpoint cookie: {}", e);
            Vec::new()
        }
    }
}
