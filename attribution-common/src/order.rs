//! # Order
//!
//! The conversion trigger received from the storefront, and the immutable record we build from it.
use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::attribution::AttributionResult;
use crate::consent::ConsentLevel;
use crate::identity::CrossDeviceAttribution;
use crate::touchpoint::{ClickId, ClickIdType, Touchpoint};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BillingDetails {
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub city: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub postcode: Option<String>,
    #[serde(default)]
    pub country: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineItem {
    pub sku: String,
    pub name: String,
    pub quantity: u32,
    pub price: f64,
}

/// A completed checkout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub order_id: i64,
    #[serde(default)]
    pub visitor_id: Option<String>,
    pub email: String,
    pub total: f64,
    pub currency: String,
    #[serde(default)]
    pub billing: BillingDetails,
    #[serde(default)]
    pub line_items: Vec<LineItem>,
    /// Per-destination enable flags. A destination missing from the map is enabled.
    #[serde(default)]
    pub destinations: HashMap<String, bool>,
    #[serde(default)]
    pub consent: ConsentLevel,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl Order {
    pub fn destination_enabled(&self, destination: &str) -> bool {
        self.destinations.get(destination).copied().unwrap_or(true)
    }
}

/// An order together with everything we knew about the buyer's journey at checkout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversionRecord {
    pub order: Order,
    pub touchpoints: Vec<Touchpoint>,
    pub attribution: AttributionResult,
    #[serde(default)]
    pub cross_device: Option<CrossDeviceAttribution>,
    #[serde(default)]
    pub email_hash: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

impl ConversionRecord {
    pub fn order_id(&self) -> i64 {
        self.order.order_id
    }

    /// Every click id seen on the journey, most recent occurrence per platform.
    pub fn click_ids(&self) -> HashMap<ClickIdType, String> {
        self.touchpoints
            .iter()
            .filter_map(|touchpoint| touchpoint.click_id.as_ref())
            .map(|ClickId { platform, value }| (*platform, value.clone()))
            .collect()
    }

    /// The copy of the record that may be persisted under the buyer's consent. Email and billing
    /// details are only kept with full consent. Without any consent the visitor id goes as well.
    pub fn for_storage(&self) -> ConversionRecord {
        let mut record = self.clone();
        if !self.order.consent.allows_identity() {
            record.order.email = String::new();
            record.order.billing = BillingDetails::default();
            record.email_hash = None;
            record.cross_device = None;
        }
        if !self.order.consent.allows_touchpoints() {
            record.order.visitor_id = None;
            record.touchpoints.clear();
            record.attribution = AttributionResult::default();
        }
        record
    }

    /// The most recent click id of one platform on the journey.
    pub fn click_id(&self, platform: ClickIdType) -> Option<&str> {
        self.touchpoints
            .iter()
            .rev()
            .filter_map(|touchpoint| touchpoint.click_id.as_ref())
            .find(|click_id| click_id.platform == platform)
            .map(|click_id| click_id.value.as_str())
    }
}
