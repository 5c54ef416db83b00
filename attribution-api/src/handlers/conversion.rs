use std::time::Instant;

use axum::{extract::State, Json};
use tracing::debug;

use attribution_common::order::Order;
use attribution_common::pipeline::{ConversionPipeline, ConversionReport};

/// Run the conversion pipeline for a completed checkout. Delivery failures are reported in the
/// outcomes, never as an error status.
pub async fn post_conversion(
    State(pipeline): State<ConversionPipeline>,
    Json(order): Json<Order>,
) -> Json<ConversionReport> {
    debug!(order_id = order.order_id, "received conversion");

    let start_time = Instant::now();

    let report = pipeline.handle_conversion(order).await;

    metrics::histogram!("attribution_api_conversion_duration_seconds")
        .record(start_time.elapsed().as_secs_f64());

    Json(report)
}
