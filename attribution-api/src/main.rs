use std::sync::Arc;

use axum::Router;
use config::Config;
use envconfig::Envconfig;
use eyre::Result;
use tracing_subscriber::EnvFilter;

use attribution_common::capture::TouchpointCapture;
use attribution_common::events::{EventBus, MetricsEventHandler, TracingEventHandler};
use attribution_common::identity::IdentityResolver;
use attribution_common::metrics::setup_metrics_routes;
use attribution_common::pipeline::ConversionPipeline;
use attribution_common::store::{EventStore, PgStore};

mod config;
mod handlers;

async fn listen(app: Router, bind: String) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;

    axum::serve(listener, app).await?;

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::init_from_env().expect("failed to load configuration from env");

    let store = PgStore::new(&config.database_url, config.max_pg_connections)?;
    if config.run_migrations {
        store.migrate().await?;
    }
    let store: Arc<dyn EventStore> = Arc::new(store);

    let dispatcher = config.delivery.dispatcher(store.clone())?;
    tracing::info!(
        destinations = ?dispatcher.destination_names(),
        "configured destinations"
    );

    let mut events = EventBus::new();
    events.subscribe(Arc::new(TracingEventHandler));
    events.subscribe(Arc::new(MetricsEventHandler));

    let pipeline = ConversionPipeline::new(
        store.clone(),
        TouchpointCapture::new(store.clone(), config.capture.provide()),
        IdentityResolver::new(store),
        dispatcher,
        events,
    );

    let app = handlers::add_routes(
        Router::new(),
        pipeline,
        config.max_body_size,
        config.concurrency_limit,
    );
    let app = setup_metrics_routes(app)?;

    match listen(app, config.bind()).await {
        Ok(_) => {}
        Err(e) => tracing::error!("failed to start attribution-api http server, {}", e),
    }

    Ok(())
}
