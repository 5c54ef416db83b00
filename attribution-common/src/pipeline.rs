//! # Pipeline
//!
//! Glue between the storefront and everything else: visits go to capture, checkouts are frozen
//! into a conversion record, stitched with the buyer's other devices and dispatched.
use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::attribution::{self, AttributionModel, AttributionResult};
use crate::capture::{CaptureOutcome, TouchpointCapture, VisitSignal};
use crate::consent::ConsentLevel;
use crate::cookie;
use crate::dispatcher::{DispatchOutcome, Dispatcher};
use crate::events::{EventBus, PipelineEvent};
use crate::identity::{hash_email, CrossDeviceAttribution, IdentityResolver};
use crate::order::{ConversionRecord, Order};
use crate::store::EventStore;
use crate::touchpoint::Touchpoint;

/// What the storefront gets back for a page view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisitReceipt {
    pub visitor_id: String,
    pub outcome: CaptureOutcome,
    /// Refreshed value of the touchpoint cookie. Absent without consent.
    pub cookie: Option<String>,
}

/// Result of handling one checkout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversionReport {
    pub order_id: i64,
    pub touchpoint_count: usize,
    pub attribution: AttributionResult,
    pub cross_device: Option<CrossDeviceAttribution>,
    /// Whether the record was persisted. Dispatch goes ahead regardless.
    pub persisted: bool,
    pub outcomes: HashMap<String, DispatchOutcome>,
}

#[derive(Clone)]
pub struct ConversionPipeline {
    store: Arc<dyn EventStore>,
    capture: TouchpointCapture,
    identity: IdentityResolver,
    dispatcher: Dispatcher,
    events: EventBus,
}

impl ConversionPipeline {
    pub fn new(
        store: Arc<dyn EventStore>,
        capture: TouchpointCapture,
        identity: IdentityResolver,
        dispatcher: Dispatcher,
        events: EventBus,
    ) -> Self {
        Self {
            store,
            capture,
            identity,
            dispatcher,
            events,
        }
    }

    pub fn store(&self) -> &Arc<dyn EventStore> {
        &self.store
    }

    pub fn capture(&self) -> &TouchpointCapture {
        &self.capture
    }

    pub fn identity(&self) -> &IdentityResolver {
        &self.identity
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Record a page view. Never fails: the storefront always gets a visitor id back.
    pub async fn record_visit(
        &self,
        visitor_id: Option<&str>,
        signal: &VisitSignal,
        consent: ConsentLevel,
    ) -> VisitReceipt {
        let visitor_id = self
            .capture
            .identify_visitor(visitor_id, signal, consent)
            .await;
        let outcome = self.capture.record_visit(&visitor_id, signal, consent).await;

        let cookie = if consent.allows_touchpoints() {
            match self.capture.touchpoints(&visitor_id).await {
                Ok(touchpoints) if !touchpoints.is_empty() => Some(cookie::encode(&touchpoints)),
                Ok(_) => None,
                Err(e) => {
                    warn!(visitor_id, "failed to load touchpoints for cookie: {}", e);
                    None
                }
            }
        } else {
            None
        };

        self.events
            .publish(PipelineEvent::VisitRecorded {
                visitor_id: visitor_id.clone(),
                outcome,
            })
            .await;

        VisitReceipt {
            visitor_id,
            outcome,
            cookie,
        }
    }

    /// Freeze the buyer's journey, attribute it, persist the record and dispatch it.
    pub async fn handle_conversion(&self, order: Order) -> ConversionReport {
        let touchpoints = self.freeze_journey(&order).await;
        let attribution = attribution::compute(&touchpoints);

        let (email_hash, cross_device) = if order.consent.allows_identity() && !touchpoints.is_empty()
        {
            let email_hash = hash_email(&order.email);
            let cross_device = self.stitch_identity(&order, &email_hash, &touchpoints).await;
            (Some(email_hash), cross_device)
        } else {
            (None, None)
        };

        let record = ConversionRecord {
            order,
            touchpoints,
            attribution,
            cross_device,
            email_hash,
            recorded_at: Utc::now(),
        };
        let order_id = record.order_id();

        let persisted = match self.store.save_conversion(&record.for_storage()).await {
            Ok(()) => true,
            Err(e) => {
                warn!(order_id, "failed to persist conversion, dispatching anyway: {}", e);
                false
            }
        };

        self.events
            .publish(PipelineEvent::ConversionRecorded {
                order_id,
                visitor_id: record.order.visitor_id.clone(),
                touchpoint_count: record.touchpoints.len(),
                top_source: record
                    .attribution
                    .top_source(AttributionModel::LastTouch)
                    .map(str::to_owned),
                cross_device: record.cross_device.is_some(),
            })
            .await;

        let outcomes = self.dispatcher.dispatch(&record).await;

        self.events
            .publish(PipelineEvent::ConversionDispatched {
                order_id,
                outcomes: outcomes.clone(),
            })
            .await;

        ConversionReport {
            order_id,
            touchpoint_count: record.touchpoints.len(),
            attribution: record.attribution,
            cross_device: record.cross_device,
            persisted,
            outcomes,
        }
    }

    async fn freeze_journey(&self, order: &Order) -> Vec<Touchpoint> {
        if !order.consent.allows_touchpoints() {
            return Vec::new();
        }

        let Some(visitor_id) = order.visitor_id.as_deref().filter(|id| !id.is_empty()) else {
            info!(order_id = order.order_id, "conversion without a visitor id");
            return Vec::new();
        };

        match self.capture.take_journey(visitor_id).await {
            Ok(touchpoints) => touchpoints,
            Err(e) => {
                warn!(order_id = order.order_id, "failed to freeze journey: {}", e);
                Vec::new()
            }
        }
    }

    async fn stitch_identity(
        &self,
        order: &Order,
        email_hash: &str,
        touchpoints: &[Touchpoint],
    ) -> Option<CrossDeviceAttribution> {
        let visitor_id = order.visitor_id.as_deref()?;
        let device_type = touchpoints
            .last()
            .map(|touchpoint| touchpoint.device_type)
            .unwrap_or_default();

        if let Err(e) = self
            .identity
            .link_visitor_to_email(visitor_id, email_hash, device_type)
            .await
        {
            warn!(order_id = order.order_id, "failed to link identity: {}", e);
            return None;
        }

        match self.identity.cross_device_attribution(email_hash).await {
            Ok(cross_device) => cross_device,
            Err(e) => {
                warn!(order_id = order.order_id, "failed to compute cross-device attribution: {}", e);
                None
            }
        }
    }
}
