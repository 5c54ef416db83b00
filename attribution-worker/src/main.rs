//! Sweep the retry queue and re-deliver conversions whose first attempt failed.
use std::sync::Arc;

use axum::{routing::get, Router};
use envconfig::Envconfig;
use tracing::error;
use tracing_subscriber::EnvFilter;

use attribution_common::health::HealthRegistry;
use attribution_common::metrics::{serve, setup_metrics_routes};
use attribution_common::store::{EventStore, PgStore};
use attribution_worker::config::Config;
use attribution_worker::error::WorkerError;
use attribution_worker::sweeper::RetrySweeper;

pub async fn index() -> &'static str {
    "attribution worker"
}

#[tokio::main]
async fn main() -> Result<(), WorkerError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::init_from_env().expect("Invalid configuration:");

    let liveness = HealthRegistry::new("liveness");

    let store = PgStore::new(&config.database_url, config.max_pg_connections)?;
    if config.run_migrations {
        store.migrate().await?;
    }
    let store: Arc<dyn EventStore> = Arc::new(store);

    let dispatcher = config.delivery.dispatcher(store)?;
    let sweeper = RetrySweeper::new(
        config.worker_name.as_str(),
        dispatcher,
        config.sweep_interval.0,
        liveness.register("sweeper", config.sweep_interval.0 * 4),
    );

    let router = Router::new()
        .route("/", get(index))
        .route("/_readiness", get(index))
        .route("/_liveness", get(move || std::future::ready(liveness.get_status())));
    let router = setup_metrics_routes(router)?;

    let bind = config.bind();
    tokio::task::spawn(async move {
        if let Err(e) = serve(router, &bind).await {
            error!("failed to serve metrics and health endpoints: {}", e);
        }
    });

    sweeper.run().await;

    Ok(())
}
