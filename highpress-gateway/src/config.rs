//! Gateway configuration
//!
//! Every resilience knob the deployment honors lives here; the serde
//! defaults match the values the rest of the fabric assumes.

use highpress::{
    Backoff, CircuitBreakerConfig, ErrorKind, FallbackTrigger, Jitter, RetryPolicy,
};
use highpress_pool::PoolConfig;
use highpress_registry::DiscoveryConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
#[error("invalid gateway configuration: {0}")]
pub struct InvalidConfig(String);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: usize,
    #[serde(default = "default_success_threshold")]
    pub success_threshold: usize,
    #[serde(default = "default_breaker_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_max_requests")]
    pub max_requests: usize,
    #[serde(default = "default_stat_window_ms")]
    pub stat_window_ms: u64,
}

fn default_true() -> bool {
    true
}

fn default_failure_threshold() -> usize {
    5
}

fn default_success_threshold() -> usize {
    2
}

fn default_breaker_timeout_ms() -> u64 {
    30_000
}

fn default_max_requests() -> usize {
    1
}

fn default_stat_window_ms() -> u64 {
    60_000
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            failure_threshold: default_failure_threshold(),
            success_threshold: default_success_threshold(),
            timeout_ms: default_breaker_timeout_ms(),
            max_requests: default_max_requests(),
            stat_window_ms: default_stat_window_ms(),
        }
    }
}

impl BreakerSettings {
    pub fn build(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.failure_threshold,
            success_threshold: self.success_threshold.max(1),
            timeout: Duration::from_millis(self.timeout_ms),
            max_requests: self.max_requests.max(1),
            stat_window: Duration::from_millis(self.stat_window_ms.max(1_000)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    #[serde(default = "default_jitter")]
    pub jitter: f64,
    #[serde(default = "default_overall_timeout_ms")]
    pub overall_timeout_ms: u64,
    #[serde(default = "default_retryable_codes")]
    pub retryable_codes: Vec<ErrorKind>,
}

fn default_max_attempts() -> usize {
    3
}

fn default_initial_backoff_ms() -> u64 {
    100
}

fn default_max_backoff_ms() -> u64 {
    2_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_jitter() -> f64 {
    0.2
}

fn default_overall_timeout_ms() -> u64 {
    10_000
}

fn default_retryable_codes() -> Vec<ErrorKind> {
    vec![ErrorKind::Network, ErrorKind::Timeout, ErrorKind::RateLimit]
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter: default_jitter(),
            overall_timeout_ms: default_overall_timeout_ms(),
            retryable_codes: default_retryable_codes(),
        }
    }
}

impl RetrySettings {
    pub fn build(&self) -> Result<RetryPolicy, InvalidConfig> {
        let backoff = Backoff::new(
            Duration::from_millis(self.initial_backoff_ms),
            self.backoff_multiplier,
            Duration::from_millis(self.max_backoff_ms),
        )
        .map_err(|e| InvalidConfig(e.to_string()))?;
        let jitter = Jitter::factor(self.jitter).map_err(|e| InvalidConfig(e.to_string()))?;
        let builder = RetryPolicy::builder()
            .max_attempts(self.max_attempts)
            .map_err(|e| InvalidConfig(e.to_string()))?
            .backoff(backoff)
            .with_jitter(jitter)
            .retry_kinds(self.retryable_codes.iter().copied())
            .overall_timeout(Some(Duration::from_millis(self.overall_timeout_ms)));
        Ok(builder.build())
    }
}

/// Trigger condition as configured.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TriggerSettings {
    CircuitOpen,
    ErrorRate { threshold: f64 },
    Latency { threshold_ms: u64 },
}

impl TriggerSettings {
    pub fn build(&self) -> FallbackTrigger {
        match self {
            Self::CircuitOpen => FallbackTrigger::CircuitOpen,
            Self::ErrorRate { threshold } => FallbackTrigger::ErrorRate { threshold: *threshold },
            Self::Latency { threshold_ms } => {
                FallbackTrigger::Latency { threshold: Duration::from_millis(*threshold_ms) }
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FallbackSettings {
    /// Reads degrade to the last cached value when enabled; mutations
    /// never degrade.
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_cache_ttl_ms")]
    pub cache_ttl_ms: u64,
    /// Aggregation window for the error-rate trigger.
    #[serde(default = "default_trigger_window_ms")]
    pub trigger_window_ms: u64,
    #[serde(default)]
    pub trigger_conditions: Vec<TriggerSettings>,
}

fn default_cache_ttl_ms() -> u64 {
    60_000
}

fn default_trigger_window_ms() -> u64 {
    60_000
}

impl Default for FallbackSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            cache_ttl_ms: default_cache_ttl_ms(),
            trigger_window_ms: default_trigger_window_ms(),
            trigger_conditions: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Address other services reach the gateway on.
    #[serde(default = "default_advertise_address")]
    pub advertise_address: String,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub circuit_breaker: BreakerSettings,
    #[serde(default)]
    pub retry: RetrySettings,
    #[serde(default)]
    pub fallback: FallbackSettings,
    /// Applied per attempt even when the client sends no deadline.
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,
    /// In-flight drain window on shutdown.
    #[serde(default = "default_drain_secs")]
    pub drain_secs: u64,
}

fn default_listen_addr() -> String {
    "0.0.0.0:8080".to_owned()
}

fn default_advertise_address() -> String {
    "127.0.0.1".to_owned()
}

fn default_call_timeout_ms() -> u64 {
    5_000
}

fn default_drain_secs() -> u64 {
    30
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            advertise_address: default_advertise_address(),
            discovery: DiscoveryConfig::default(),
            pool: PoolConfig::default(),
            circuit_breaker: BreakerSettings::default(),
            retry: RetrySettings::default(),
            fallback: FallbackSettings::default(),
            call_timeout_ms: default_call_timeout_ms(),
            drain_secs: default_drain_secs(),
        }
    }
}

impl GatewayConfig {
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
            .unwrap_or(8080)
    }
}
