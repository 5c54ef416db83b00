//! # Events
//!
//! In-process notifications of what the pipeline did. Handlers are registered explicitly and run
//! in registration order.
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tracing::info;

use crate::capture::CaptureOutcome;
use crate::dispatcher::DispatchOutcome;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PipelineEvent {
    VisitRecorded {
        visitor_id: String,
        outcome: CaptureOutcome,
    },
    ConversionRecorded {
        order_id: i64,
        visitor_id: Option<String>,
        touchpoint_count: usize,
        /// Last touch source, when the journey had any touchpoints.
        top_source: Option<String>,
        cross_device: bool,
    },
    ConversionDispatched {
        order_id: i64,
        outcomes: HashMap<String, DispatchOutcome>,
    },
}

impl PipelineEvent {
    pub fn name(&self) -> &'static str {
        match self {
            PipelineEvent::VisitRecorded { .. } => "visit_recorded",
            PipelineEvent::ConversionRecorded { .. } => "conversion_recorded",
            PipelineEvent::ConversionDispatched { .. } => "conversion_dispatched",
        }
    }
}

#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &PipelineEvent);
}

#[derive(Clone, Default)]
pub struct EventBus {
    handlers: Vec<Arc<dyn EventHandler>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self, handler: Arc<dyn EventHandler>) {
        self.handlers.push(handler);
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }

    pub async fn publish(&self, event: PipelineEvent) {
        for handler in &self.handlers {
            handler.handle(&event).await;
        }
    }
}

/// Logs every event.
pub struct TracingEventHandler;

#[async_trait]
impl EventHandler for TracingEventHandler {
    async fn handle(&self, event: &PipelineEvent) {
        match event {
            PipelineEvent::VisitRecorded {
                visitor_id,
                outcome,
            } => {
                tracing::debug!(visitor_id, ?outcome, "visit recorded");
            }
            PipelineEvent::ConversionRecorded {
                order_id,
                touchpoint_count,
                top_source,
                cross_device,
                ..
            } => {
                info!(
                    order_id,
                    touchpoint_count,
                    top_source = top_source.as_deref().unwrap_or("none"),
                    cross_device,
                    "conversion recorded"
                );
            }
            PipelineEvent::ConversionDispatched { order_id, outcomes } => {
                info!(order_id, destinations = outcomes.len(), "conversion dispatched");
            }
        }
    }
}

/// Counts events by name.
pub struct MetricsEventHandler;

#[async_trait]
impl EventHandler for MetricsEventHandler {
    async fn handle(&self, event: &PipelineEvent) {
        metrics::counter!("attribution_pipeline_events", &[("event", event.name())]).increment(1);
    }
}
