//! Analytics worker configuration

use highpress_events::ConsumerConfig;
use highpress_kv::KvConfig;
use highpress_registry::DiscoveryConfig;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyticsConfig {
    /// gRPC bind address.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Address other services reach this worker on.
    #[serde(default = "default_advertise_address")]
    pub advertise_address: String,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub consumer: ConsumerConfig,
    /// Durable source the aggregates revalidate against.
    #[serde(default)]
    pub kv: KvConfig,
    /// Background revalidation period.
    #[serde(default = "default_revalidate_secs")]
    pub revalidate_secs: u64,
}

fn default_listen_addr() -> String {
    "0.0.0.0:9200".to_owned()
}

fn default_advertise_address() -> String {
    "127.0.0.1".to_owned()
}

fn default_revalidate_secs() -> u64 {
    60
}

impl Default for AnalyticsConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            advertise_address: default_advertise_address(),
            discovery: DiscoveryConfig::default(),
            consumer: ConsumerConfig::default(),
            kv: KvConfig::default(),
            revalidate_secs: default_revalidate_secs(),
        }
    }
}

impl AnalyticsConfig {
    pub fn load(path: &str) -> Result<Self, config::ConfigError> {
        config::Config::builder()
            .add_source(config::File::with_name(path).required(false))
            .add_source(config::Environment::with_prefix("HIGHPRESS").separator("__"))
            .build()?
            .try_deserialize()
    }

    pub fn port(&self) -> u16 {
        self.listen_addr
            .rsplit_once(':')
            .and_then(|(_, port)| port.parse().ok())
            .unwrap_or(9200)
    }
}
