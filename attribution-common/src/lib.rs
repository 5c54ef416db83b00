pub mod attribution;
pub mod capture;
pub mod config;
pub mod consent;
pub mod cookie;
pub mod delivery_log;
pub mod destination;
pub mod dispatcher;
pub mod events;
pub mod fingerprint;
pub mod health;
pub mod identity;
pub mod metrics;
pub mod order;
pub mod pipeline;
pub mod queue;
pub mod reporting;
pub mod retry;
pub mod store;
pub mod touchpoint;
pub mod webhook;
