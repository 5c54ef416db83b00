//! Environment configuration shared by the binaries that deliver conversions.
use std::str::FromStr;
use std::sync::Arc;
use std::time;

use envconfig::Envconfig;
use thiserror::Error;

use crate::delivery_log::{DedupConfig, DeliveryLog};
use crate::dispatcher::{Dispatcher, DispatcherConfig};
use crate::queue::RetryQueue;
use crate::retry::RetryPolicy;
use crate::store::EventStore;
use crate::webhook::{build_http_client, parse_webhook_configs, webhook_destinations, WebhookConfigError};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error(transparent)]
    Webhook(#[from] WebhookConfigError),
    #[error("failed to build http client: {0}")]
    HttpClient(#[from] reqwest::Error),
}

#[derive(Debug, Clone, Copy)]
pub struct EnvMsDuration(pub time::Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvMsDurationError;

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;

        Ok(EnvMsDuration(time::Duration::from_millis(ms)))
    }
}

impl EnvMsDuration {
    pub fn to_chrono(self) -> chrono::Duration {
        chrono::Duration::from_std(self.0).unwrap_or(chrono::Duration::MAX)
    }
}

/// A comma separated list of millisecond delays, e.g. `60000,300000`.
#[derive(Debug, Clone, PartialEq)]
pub struct EnvBackoffLadder(pub Vec<time::Duration>);

impl FromStr for EnvBackoffLadder {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ladder = s
            .split(',')
            .map(str::trim)
            .filter(|step| !step.is_empty())
            .map(|step| EnvMsDuration::from_str(step).map(|duration| duration.0))
            .collect::<Result<Vec<_>, _>>()?;

        if ladder.is_empty() {
            return Err(ParseEnvMsDurationError);
        }

        Ok(EnvBackoffLadder(ladder))
    }
}

#[derive(Debug, Clone)]
pub struct NonEmptyString(pub String);

impl NonEmptyString {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct StringIsEmptyError;

impl FromStr for NonEmptyString {
    type Err = StringIsEmptyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            Err(StringIsEmptyError)
        } else {
            Ok(NonEmptyString(s.to_owned()))
        }
    }
}

#[derive(Envconfig, Clone)]
pub struct RetryPolicyConfig {
    #[envconfig(default = "5")]
    pub max_attempts: i32,

    #[envconfig(default = "60000,300000,1800000,7200000,43200000")]
    pub backoff_ladder: EnvBackoffLadder,

    #[envconfig(default = "10")]
    pub batch_size: u32,

    #[envconfig(default = "300000")]
    pub claim_timeout: EnvMsDuration,
}

impl RetryPolicyConfig {
    pub fn provide(&self) -> RetryPolicy {
        RetryPolicy::build(self.max_attempts, self.backoff_ladder.0.clone())
            .batch_size(self.batch_size)
            .claim_timeout(self.claim_timeout.0)
            .provide()
    }
}

#[derive(Envconfig, Clone)]
pub struct DeliveryConfig {
    /// Comma separated `name=url` webhook endpoints.
    #[envconfig(default = "")]
    pub webhook_destinations: String,

    #[envconfig(default = "5000")]
    pub request_timeout: EnvMsDuration,

    #[envconfig(default = "30000")]
    pub send_timeout: EnvMsDuration,

    #[envconfig(default = "true")]
    pub queue_enabled: bool,

    #[envconfig(default = "4")]
    pub sweep_concurrency: usize,

    #[envconfig(default = "3600000")]
    pub dedup_window: EnvMsDuration,

    #[envconfig(default = "1000")]
    pub max_response_body: usize,

    #[envconfig(nested = true)]
    pub retry_policy: RetryPolicyConfig,
}

impl DeliveryConfig {
    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            queue_enabled: self.queue_enabled,
            send_timeout: self.send_timeout.0,
            sweep_concurrency: self.sweep_concurrency,
        }
    }

    pub fn dedup_config(&self) -> DedupConfig {
        DedupConfig {
            window: self.dedup_window.to_chrono(),
            max_response_body: self.max_response_body,
        }
    }

    /// Wire the configured destinations, log and queue into a Dispatcher.
    pub fn dispatcher(&self, store: Arc<dyn EventStore>) -> Result<Dispatcher, ConfigError> {
        let client = build_http_client(self.request_timeout.0)?;
        let destinations =
            webhook_destinations(parse_webhook_configs(&self.webhook_destinations)?, &client);

        Ok(Dispatcher::new(
            destinations,
            store.clone(),
            DeliveryLog::new(store.clone(), self.dedup_config()),
            RetryQueue::new(store, self.retry_policy.provide()),
            self.dispatcher_config(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[test]
    fn test_parse_backoff_ladder() {
        let ladder: EnvBackoffLadder = "1000, 5000,".parse().unwrap();

        assert_eq!(
            ladder.0,
            vec![time::Duration::from_secs(1), time::Duration::from_secs(5)]
        );
        assert!("".parse::<EnvBackoffLadder>().is_err());
        assert!("10,soon".parse::<EnvBackoffLadder>().is_err());
    }

    #[test]
    fn test_default_retry_policy_matches_ladder() {
        let config = RetryPolicyConfig {
            max_attempts: 5,
            backoff_ladder: "60000,300000,1800000,7200000,43200000".parse().unwrap(),
            batch_size: 10,
            claim_timeout: "300000".parse().unwrap(),
        };

        assert_eq!(config.provide(), RetryPolicy::default());
    }

    #[test]
    fn test_dispatcher_from_config() {
        let config = DeliveryConfig {
            webhook_destinations: "meta=https://meta.example/events,google=https://g.example/c"
                .to_owned(),
            request_timeout: "1000".parse().unwrap(),
            send_timeout: "2000".parse().unwrap(),
            queue_enabled: true,
            sweep_concurrency: 2,
            dedup_window: "60000".parse().unwrap(),
            max_response_body: 100,
            retry_policy: RetryPolicyConfig {
                max_attempts: 3,
                backoff_ladder: "1000".parse().unwrap(),
                batch_size: 5,
                claim_timeout: "1000".parse().unwrap(),
            },
        };

        let dispatcher = config.dispatcher(Arc::new(MemoryStore::new())).unwrap();

        assert_eq!(dispatcher.destination_names(), vec!["meta", "google"]);
        assert_eq!(dispatcher.queue().policy().max_attempts, 3);
        assert_eq!(dispatcher.delivery_log().window(), chrono::Duration::minutes(1));
    }

    #[test]
    fn test_invalid_destinations_are_rejected() {
        let config = DeliveryConfig {
            webhook_destinations: "meta".to_owned(),
            ..DeliveryConfig::init_from_hashmap(&Default::default()).unwrap()
        };

        assert!(matches!(
            config.dispatcher(Arc::new(MemoryStore::new())),
            Err(ConfigError::Webhook(_))
        ));
    }
}
