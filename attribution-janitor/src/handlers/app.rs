use std::future::ready;

use axum::{routing, Router};
use metrics_exporter_prometheus::PrometheusHandle;

use attribution_common::health::HealthRegistry;
use attribution_common::metrics;

pub fn app(metrics: Option<PrometheusHandle>, liveness: HealthRegistry) -> Router {
    Router::new()
        .route("/", routing::get(index))
        .route("/_readiness", routing::get(index))
        .route("/_liveness", routing::get(move || ready(liveness.get_status())))
        .route(
            "/metrics",
            routing::get(move || match metrics {
                Some(ref recorder_handle) => ready(recorder_handle.render()),
                None => ready("no metrics recorder installed".to_owned()),
            }),
        )
        .layer(axum::middleware::from_fn(metrics::track_metrics))
}

pub async fn index() -> &'static str {
    "attribution janitor"
}
