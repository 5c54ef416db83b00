use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
#[error("{0} is not a valid ConsentLevel")]
pub struct ParseConsentLevelError(String);

/// Consent granted by the visitor, as reported by the consent-management collaborator.
/// A request that carries no consent signal is treated as `Anonymous`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsentLevel {
    /// Touchpoints, IP hashes and identity links may all be stored.
    Full,
    /// Touchpoints may be stored, but nothing that can identify the visitor.
    #[default]
    Anonymous,
    /// Only content-free delivery bookkeeping may happen.
    None,
}

impl ConsentLevel {
    pub fn allows_touchpoints(&self) -> bool {
        !matches!(self, ConsentLevel::None)
    }

    pub fn allows_identity(&self) -> bool {
        matches!(self, ConsentLevel::Full)
    }
}

impl FromStr for ConsentLevel {
    type Err = ParseConsentLevelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_ref() {
            "full" => Ok(ConsentLevel::Full),
            "anonymous" => Ok(ConsentLevel::Anonymous),
            "none" => Ok(ConsentLevel::None),
            invalid => Err(ParseConsentLevelError(invalid.to_owned())),
        }
    }
}

impl fmt::Display for ConsentLevel {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ConsentLevel::Full => write!(f, "full"),
            ConsentLevel::Anonymous => write!(f, "anonymous"),
            ConsentLevel::None => write!(f, "none"),
        }
    }
}
