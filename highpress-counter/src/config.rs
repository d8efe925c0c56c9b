//! Counter worker configuration

use highpress_events::ProducerConfig;
use highpress_kv::KvConfig;
use highpress_registry::DiscoveryConfig;
use serde::{Deserialize, Serialize};

/// Limits for the batch-increment paths.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BatchConfig {
    /// Hard cap on operations per request.
    #[serde(default = "default_max_operations")]
    pub max_operations: usize,
    /// Concurrent store calls in sync mode; unbounded fan-out tends to
    /// collapse the store.
    #[serde(default = "default_sync_concurrency")]
    pub sync_concurrency: usize,
    /// Chunk size for async-accepted batches.
    #[serde(default = "default_async_chunk_size")]
    pub async_chunk_size: usize,
    /// Pause between chunks so background batches do not saturate the
    /// store.
    #[serde(default = "default_chunk_pause_ms")]
    pub chunk_pause_ms: u64,
}

fn default_max_operations() -> usize {
    1_000
}

fn default_sync_concurrency() -> usize {
    16
}

fn default_async_chunk_size() -> usize {
    100
}

fn default_chunk_pause_ms() -> u64 {
    50
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_operations: default_max_operations(),
            sync_concurrency: default_sync_concurrency(),
            async_chunk_size: default_async_chunk_size(),
            chunk_pause_ms: default_chunk_pause_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// gRPC bind address.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Address other services reach this worker on.
    #[serde(default = "default_advertise_address")]
    pub advertise_address: String,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub kv: KvConfig,
    #[serde(default)]
    pub producer: ProducerConfig,
    #[serde(default)]
    pub batch: BatchConfig,
    /// In-flight drain window on shutdown.
    #[serde(default = "default_drain_secs")]
    pub drain_secs: u64,
}

fn default_listen_addr() -> String {
    "0.0.0.0:9100".to_owned()
}

fn default_advertise_address() -> String {
    "127.0.0.1".to_owned()
}

fn default_drain_secs() -> u64 {
    30
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            advertise_address: default_advertise_address(),
            discovery: DiscoveryConfig::default(),
            kv: KvConfig::default(),
            producer: ProducerConfig::default(),
            batch: BatchConfig::default(),
            drain_secs: default_drain_secs(),
        }
    }
}

impl WorkerConfig {
    /// Load from an optional file with `HIGHPRESS_`-prefixed environment
    /// overrides layered on top.
    pub fn load(path: &str) -> Result<Self, config::ConfigError> {
        config::Config::builder()
            .add_source(config::File::with_name(path).required(false))
            .add_source(config::Environment::with_prefix("HIGHPRESS").separator("__"))
            .build()?
            .try_deserialize()
    }

    /// Port parsed from the listen address.
    pub fn port(&self) -> u16 {
        self.listen_addr
            .rsplit_once(':')
            .and_then(|(_, port)| port.parse().ok())
            .unwrap_or(9100)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_complete() {
        let config = WorkerConfig::default();
        assert_eq!(config.port(), 9100);
        assert_eq!(config.batch.max_operations, 1_000);
        assert_eq!(config.drain_secs, 30);
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let config = WorkerConfig::load("does-not-exist").unwrap();
        assert_eq!(config.listen_addr, "0.0.0.0:9100");
    }
}
