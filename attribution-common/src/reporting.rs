//! # Reporting
//!
//! Read-only views for operators: what we knew about an order, who a buyer is across devices,
//! and how deliveries are going.
use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::attribution::AttributionResult;
use crate::delivery_log::{DeliveryLog, DeliveryLogEntry, DeliveryStats};
use crate::identity::{CrossDeviceAttribution, IdentityError, IdentityResolver};
use crate::queue::{QueueError, QueueItem, QueueStats, RetryQueue};
use crate::store::{EventStore, StoreError};
use crate::touchpoint::{DeviceType, Touchpoint};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderView {
    pub order_id: i64,
    pub touchpoints: Vec<Touchpoint>,
    pub attribution: AttributionResult,
    pub cross_device: Option<CrossDeviceAttribution>,
    pub deliveries: Vec<DeliveryLogEntry>,
    pub queue_items: Vec<QueueItem>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentitySummary {
    pub email_hash: String,
    pub visitor_count: usize,
    pub device_count: usize,
    pub visitor_ids: Vec<String>,
    pub devices: Vec<DeviceType>,
    pub cross_device: Option<CrossDeviceAttribution>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeliveryReport {
    pub queue: BTreeMap<String, QueueStats>,
    pub deliveries: BTreeMap<String, DeliveryStats>,
}

/// Everything recorded for an order, or `None` if it was never converted.
pub async fn order_view(store: &dyn EventStore, order_id: i64) -> Result<Option<OrderView>, StoreError> {
    let Some(record) = store.get_conversion(order_id).await? else {
        return Ok(None);
    };

    let deliveries = store.delivery_log_for_order(order_id).await?;
    let queue_items = store.queue_items_for_order(order_id).await?;

    Ok(Some(OrderView {
        order_id,
        touchpoints: record.touchpoints,
        attribution: record.attribution,
        cross_device: record.cross_device,
        deliveries,
        queue_items,
    }))
}

/// The identity graph around one email hash, or `None` if no visitor is linked to it.
pub async fn identity_summary(
    resolver: &IdentityResolver,
    email_hash: &str,
) -> Result<Option<IdentitySummary>, IdentityError> {
    let edges = resolver.edges_for_email(email_hash).await?;
    if edges.is_empty() {
        return Ok(None);
    }

    let visitor_ids: BTreeSet<String> = edges.iter().map(|edge| edge.visitor_id.clone()).collect();
    let devices: BTreeSet<DeviceType> = edges.iter().map(|edge| edge.device_type).collect();
    let cross_device = resolver.cross_device_attribution(email_hash).await?;

    Ok(Some(IdentitySummary {
        email_hash: email_hash.to_owned(),
        visitor_count: visitor_ids.len(),
        device_count: devices.len(),
        visitor_ids: visitor_ids.into_iter().collect(),
        devices: devices.into_iter().collect(),
        cross_device,
    }))
}

pub async fn delivery_stats(
    queue: &RetryQueue,
    delivery_log: &DeliveryLog,
) -> Result<DeliveryReport, QueueError> {
    Ok(DeliveryReport {
        queue: queue.stats().await?,
        deliveries: delivery_log.stats().await?,
    })
}
