use attribution_common::config::ConfigError;
use attribution_common::store::StoreError;
use thiserror::Error;

/// Enumeration of errors raised while starting or running the retry sweep.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("failed to set up the event store: {0}")]
    StoreError(#[from] StoreError),
    #[error("invalid delivery configuration: {0}")]
    ConfigError(#[from] ConfigError),
    #[error("failed to install the metrics recorder: {0}")]
    MetricsError(#[from] metrics_exporter_prometheus::BuildError),
}
