//! Liveness of the long running loops of a service: the retry sweep and the cleanup loop.
//!
//! Each loop registers with a deadline and then beats more often than that. A loop that has not
//! beaten yet is still starting, and one whose last beat is older than its deadline has stalled.
//! The process is alive only while every registered loop is.
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use std::time;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, Utc};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum LoopStatus {
    Starting,
    Alive,
    Stalled,
}

#[derive(Default, Debug)]
pub struct HealthStatus {
    pub healthy: bool,
    pub loops: BTreeMap<String, LoopStatus>,
}

impl IntoResponse for HealthStatus {
    fn into_response(self) -> Response {
        let code = if self.healthy {
            StatusCode::OK
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        };
        (code, format!("{:?}", self.loops)).into_response()
    }
}

#[derive(Debug, Clone, Copy)]
struct Heartbeat {
    deadline: chrono::Duration,
    last_beat: Option<DateTime<Utc>>,
}

impl Heartbeat {
    fn status(&self, now: DateTime<Utc>) -> LoopStatus {
        match self.last_beat {
            None => LoopStatus::Starting,
            Some(at) if now - at <= self.deadline => LoopStatus::Alive,
            Some(_) => LoopStatus::Stalled,
        }
    }
}

type Heartbeats = Arc<RwLock<BTreeMap<String, Heartbeat>>>;

/// Held by a loop to report that it is still making progress.
pub struct HealthHandle {
    name: String,
    heartbeats: Heartbeats,
}

impl HealthHandle {
    pub fn report_healthy(&self) {
        self.beat_at(Utc::now());
    }

    fn beat_at(&self, at: DateTime<Utc>) {
        match self.heartbeats.write() {
            Ok(mut heartbeats) => {
                if let Some(heartbeat) = heartbeats.get_mut(&self.name) {
                    heartbeat.last_beat = Some(at);
                }
            }
            Err(_) => warn!("poisoned heartbeat lock, {} cannot report", self.name),
        }
    }
}

#[derive(Clone)]
pub struct HealthRegistry {
    name: String,
    heartbeats: Heartbeats,
}

impl HealthRegistry {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            heartbeats: Default::default(),
        }
    }

    /// Register a loop that must beat at least once per `deadline`.
    pub fn register(&self, name: &str, deadline: time::Duration) -> HealthHandle {
        let heartbeat = Heartbeat {
            deadline: chrono::Duration::from_std(deadline).unwrap_or(chrono::Duration::MAX),
            last_beat: None,
        };
        match self.heartbeats.write() {
            Ok(mut heartbeats) => {
                heartbeats.insert(name.to_owned(), heartbeat);
            }
            Err(_) => warn!("poisoned heartbeat lock, {} is not registered", name),
        }

        HealthHandle {
            name: name.to_owned(),
            heartbeats: self.heartbeats.clone(),
        }
    }

    /// Status of every registered loop. Unhealthy until the first loop registers.
    pub fn get_status(&self) -> HealthStatus {
        let Ok(heartbeats) = self.heartbeats.read() else {
            warn!("{} check failed: poisoned heartbeat lock", self.name);
            return HealthStatus::default();
        };

        let now = Utc::now();
        let loops: BTreeMap<String, LoopStatus> = heartbeats
            .iter()
            .map(|(name, heartbeat)| (name.clone(), heartbeat.status(now)))
            .collect();
        let healthy = !loops.is_empty() && loops.values().all(|status| *status == LoopStatus::Alive);

        if healthy {
            debug!("{} check ok", self.name);
        } else {
            warn!("{} check failed: {:?}", self.name, loops);
        }

        HealthStatus { healthy, loops }
    }
}
