use std::collections::BTreeMap;
use std::result::Result;
use std::str::FromStr;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CleanerError {
    #[error("invalid cleaner mode")]
    InvalidCleanerMode,
    #[error("{step} cleanup failed: {error}")]
    StepFailed { step: &'static str, error: String },
}

// Mode names, used by config/environment parsing to verify the mode is supported.
#[derive(Debug, PartialEq)]
pub enum CleanerModeName {
    Retention,
}

impl FromStr for CleanerModeName {
    type Err = CleanerError;

    fn from_str(s: &str) -> Result<Self, CleanerError> {
        match s {
            "retention" => Ok(CleanerModeName::Retention),
            _ => Err(CleanerError::InvalidCleanerMode),
        }
    }
}

/// Rows removed by one cleanup run, per step, and the steps that failed.
#[derive(Debug, Default)]
pub struct CleanupReport {
    pub purged: BTreeMap<&'static str, u64>,
    pub failures: Vec<CleanerError>,
}

#[async_trait]
pub trait Cleaner: Send + Sync {
    async fn cleanup(&self) -> CleanupReport;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_mode() {
        assert_eq!(
            CleanerModeName::from_str("retention").unwrap(),
            CleanerModeName::Retention
        );
        assert!(CleanerModeName::from_str("webhooks").is_err());
    }
}
