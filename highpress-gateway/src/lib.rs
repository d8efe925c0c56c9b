//! Edge gateway: HTTP in, resilient RPC out
//!
//! Admits JSON traffic, fans it out to the counter fabric through
//! registry-driven channel pools and the resilience stack, and exposes
//! health, metrics and pool introspection.

pub mod client;
pub mod config;
pub mod error;
pub mod metrics;
pub mod routes;

pub use client::CounterClient;
pub use config::GatewayConfig;
pub use metrics::Metrics;
pub use routes::{router, AppState};
