//! Purge expired attribution data on an interval.
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use envconfig::Envconfig;
use eyre::Result;
use futures::future::{select, Either};
use tokio::sync::Semaphore;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use attribution_common::health::{HealthHandle, HealthRegistry};
use attribution_common::metrics;
use attribution_common::store::PgStore;
use cleanup::{Cleaner, CleanerModeName};
use config::Config;
use retention::RetentionCleaner;

mod cleanup;
mod config;
mod handlers;
mod retention;

async fn listen(app: Router, bind: String) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;

    axum::serve(listener, app).await?;

    Ok(())
}

async fn cleanup_loop(cleaner: Box<dyn Cleaner>, interval_secs: u64, liveness: HealthHandle) {
    let semaphore = Semaphore::new(1);
    let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));

    loop {
        let permit = semaphore.acquire().await;
        interval.tick().await;
        liveness.report_healthy();

        let report = cleaner.cleanup().await;
        let purged: u64 = report.purged.values().sum();
        if report.failures.is_empty() {
            info!(purged, "cleanup finished");
        } else {
            error!(purged, failures = report.failures.len(), "cleanup finished with failures");
        }

        drop(permit);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::init_from_env().expect("failed to load configuration from env");

    let mode_name = CleanerModeName::from_str(&config.mode)
        .unwrap_or_else(|_| panic!("invalid cleaner mode: {}", config.mode));

    let cleaner: Box<dyn Cleaner> = match mode_name {
        CleanerModeName::Retention => {
            let store = PgStore::new(&config.database_url, config.max_pg_connections)?;
            Box::new(RetentionCleaner::new(
                Arc::new(store),
                config.retention.provide(),
            ))
        }
    };

    let liveness = HealthRegistry::new("liveness");
    let cleanup_liveness = liveness.register(
        "cleanup",
        Duration::from_secs(config.cleanup_interval_secs * 4),
    );

    let cleanup_loop = Box::pin(cleanup_loop(
        cleaner,
        config.cleanup_interval_secs,
        cleanup_liveness,
    ));

    let recorder_handle = metrics::setup_metrics_recorder()?;
    let app = handlers::app(Some(recorder_handle), liveness);
    let http_server = Box::pin(listen(app, config.bind()));

    match select(http_server, cleanup_loop).await {
        Either::Left((listen_result, _)) => {
            if let Err(e) = listen_result {
                error!("failed to start attribution-janitor http server, {}", e);
                return Err(e);
            }
        }
        Either::Right((_, _)) => {
            error!("attribution-janitor cleanup task exited")
        }
    };

    Ok(())
}
