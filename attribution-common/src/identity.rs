//! # Identity
//!
//! Stitches anonymous visitor timelines together once the same email is seen on checkout.
use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info};

use crate::attribution::{self, AttributionResult};
use crate::store::{EventStore, StoreError};
use crate::touchpoint::{DeviceType, Touchpoint};

const SHARED_IP_CONFIDENCE: f64 = 0.6;
const SHARED_IP_REASON: &str = "shared_ip";

#[derive(Error, Debug)]
pub enum IdentityError {
    #[error("visitor {0} cannot be merged into itself")]
    SameVisitor(String),
    #[error("visitor {0} is not linked to any email")]
    PrimaryNotIdentified(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// A link between a hashed email and one visitor id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentityEdge {
    pub email_hash: String,
    pub visitor_id: String,
    pub device_type: DeviceType,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkOutcome {
    /// A new edge was created.
    Linked,
    /// The edge already existed. Its `last_seen` was refreshed.
    Noop,
}

/// Attribution over the merged journey of every visitor linked to one email.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrossDeviceAttribution {
    pub attribution: AttributionResult,
    pub device_count: usize,
    pub visitor_count: usize,
    pub touchpoint_count: usize,
}

/// A visitor that may be the same person as the one asked about.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchCandidate {
    pub visitor_id: String,
    pub email_hash: String,
    pub confidence: f64,
    pub reason: String,
}

/// SHA-256 hex of the trimmed, lowercased email.
pub fn hash_email(email: &str) -> String {
    let normalized = email.trim().to_lowercase();
    hex::encode(Sha256::digest(normalized.as_bytes()))
}

#[derive(Clone)]
pub struct IdentityResolver {
    store: Arc<dyn EventStore>,
}

impl IdentityResolver {
    pub fn new(store: Arc<dyn EventStore>) -> Self {
        Self { store }
    }

    /// Link a visitor to an email. Linking the same pair again only refreshes `last_seen`.
    pub async fn link_visitor_to_email(
        &self,
        visitor_id: &str,
        email_hash: &str,
        device_type: DeviceType,
    ) -> Result<LinkOutcome, IdentityError> {
        let now = Utc::now();
        let inserted = self
            .store
            .upsert_identity_edge(&IdentityEdge {
                email_hash: email_hash.to_owned(),
                visitor_id: visitor_id.to_owned(),
                device_type,
                first_seen: now,
                last_seen: now,
            })
            .await?;

        if inserted {
            info!(visitor_id, "linked visitor to email");
            metrics::counter!("attribution_identity_links").increment(1);
            Ok(LinkOutcome::Linked)
        } else {
            Ok(LinkOutcome::Noop)
        }
    }

    pub async fn edges_for_email(&self, email_hash: &str) -> Result<Vec<IdentityEdge>, IdentityError> {
        Ok(self.store.edges_for_email(email_hash).await?)
    }

    /// The touchpoint history of every visitor linked to the email, oldest first.
    pub async fn resolve_journey(&self, email_hash: &str) -> Result<Vec<Touchpoint>, IdentityError> {
        let edges = self.store.edges_for_email(email_hash).await?;
        self.journey_for_edges(&edges).await
    }

    pub async fn cross_device_attribution(
        &self,
        email_hash: &str,
    ) -> Result<Option<CrossDeviceAttribution>, IdentityError> {
        let edges = self.store.edges_for_email(email_hash).await?;
        if edges.is_empty() {
            return Ok(None);
        }

        let journey = self.journey_for_edges(&edges).await?;
        if journey.is_empty() {
            return Ok(None);
        }

        let devices: BTreeSet<DeviceType> = edges.iter().map(|edge| edge.device_type).collect();
        let visitors: BTreeSet<&str> = edges.iter().map(|edge| edge.visitor_id.as_str()).collect();

        Ok(Some(CrossDeviceAttribution {
            attribution: attribution::compute(&journey),
            device_count: devices.len(),
            visitor_count: visitors.len(),
            touchpoint_count: journey.len(),
        }))
    }

    /// Identified visitors that shared an IP hash with `visitor_id`. These are suggestions only
    /// and never change the graph.
    pub async fn find_potential_matches(
        &self,
        visitor_id: &str,
    ) -> Result<Vec<MatchCandidate>, IdentityError> {
        let ip_hashes = self.store.ip_hashes_for_visitor(visitor_id).await?;
        if ip_hashes.is_empty() {
            return Ok(Vec::new());
        }

        let mut candidates = Vec::new();
        let visitors: BTreeSet<String> = self
            .store
            .visitors_with_ip_hashes(&ip_hashes)
            .await?
            .into_iter()
            .filter(|other| other != visitor_id)
            .collect();

        for other in visitors {
            let edges = self.store.edges_for_visitor(&other).await?;
            if let Some(edge) = edges.into_iter().next() {
                candidates.push(MatchCandidate {
                    visitor_id: other,
                    email_hash: edge.email_hash,
                    confidence: SHARED_IP_CONFIDENCE,
                    reason: SHARED_IP_REASON.to_owned(),
                });
            }
        }

        Ok(candidates)
    }

    /// Move every edge of `secondary` onto the email `primary` was most recently seen with.
    pub async fn merge_visitors(
        &self,
        primary: &str,
        secondary: &str,
    ) -> Result<IdentityEdge, IdentityError> {
        if primary == secondary {
            return Err(IdentityError::SameVisitor(primary.to_owned()));
        }

        let Some(primary_edge) = self.store.edges_for_visitor(primary).await?.into_iter().next()
        else {
            return Err(IdentityError::PrimaryNotIdentified(primary.to_owned()));
        };

        let fallback_device = self
            .store
            .history_for_visitors(&[secondary.to_owned()])
            .await?
            .last()
            .map(|touchpoint| touchpoint.device_type)
            .unwrap_or_default();

        let merged = self
            .store
            .reassign_edges(secondary, &primary_edge.email_hash, fallback_device, Utc::now())
            .await?;

        info!(primary, secondary, "merged visitors");

        Ok(merged)
    }

    async fn journey_for_edges(&self, edges: &[IdentityEdge]) -> Result<Vec<Touchpoint>, IdentityError> {
        let visitor_ids: Vec<String> = edges
            .iter()
            .map(|edge| edge.visitor_id.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        if visitor_ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut journey = self.store.history_for_visitors(&visitor_ids).await?;
        journey.sort_by_key(|touchpoint| touchpoint.timestamp);

        debug!(
            "resolved journey of {} touchpoints across {} visitors",
            journey.len(),
            visitor_ids.len()
        );

        Ok(journey)
    }
}
