//! Counter worker: the write path of the fabric
//!
//! Implements the counter RPC surface over the KV store and emits a
//! counter event for every acknowledged increment through the async
//! producer.

pub mod config;
pub mod service;

pub use config::{BatchConfig, WorkerConfig};
pub use service::CounterWorker;
