//! Service registry client
//!
//! Workers register themselves at startup and deregister on shutdown; the
//! gateway discovers healthy instances and subscribes to membership
//! changes. The production backend is etcd ([`EtcdRegistry`]): instances
//! live as lease-bound JSON keys, so a dead process loses its entry when
//! the lease expires. [`StaticRegistry`] serves fixed instance sets for
//! tests and local runs.

mod etcd;
mod fixed;

pub use etcd::EtcdRegistry;
pub use fixed::StaticRegistry;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Health of a registered instance. Only `Passing` instances receive
/// traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Passing,
    Warning,
    Critical,
}

/// One discovered instance of a named service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInstance {
    pub service: String,
    pub instance_id: String,
    pub address: String,
    pub port: u16,
    #[serde(default)]
    pub tags: Vec<String>,
    pub health: HealthStatus,
}

impl ServiceInstance {
    /// `address:port`, the identity used for pool reconciliation.
    pub fn host_port(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }

    /// Plaintext HTTP/2 endpoint for internal traffic.
    pub fn endpoint(&self) -> String {
        format!("http://{}:{}", self.address, self.port)
    }

    pub fn is_passing(&self) -> bool {
        self.health == HealthStatus::Passing
    }
}

/// How the registry should check this instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum HealthCheckKind {
    /// TCP probe against the service port
    Tcp,
    /// HTTP GET against the given path
    Http { path: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheckSpec {
    pub kind: HealthCheckKind,
    #[serde(default = "default_check_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_check_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_check_interval_secs() -> u64 {
    10
}

fn default_check_timeout_secs() -> u64 {
    3
}

impl Default for HealthCheckSpec {
    fn default() -> Self {
        Self {
            kind: HealthCheckKind::Tcp,
            interval_secs: default_check_interval_secs(),
            timeout_secs: default_check_timeout_secs(),
        }
    }
}

/// Submission for [`Registry::register`].
#[derive(Debug, Clone)]
pub struct Registration {
    pub id: String,
    pub name: String,
    pub address: String,
    pub port: u16,
    pub tags: Vec<String>,
    pub health_check: HealthCheckSpec,
}

impl Registration {
    /// Registration with a generated instance id and default TCP check.
    pub fn new(name: impl Into<String>, address: impl Into<String>, port: u16) -> Self {
        let name = name.into();
        Self {
            id: format!("{}-{}", name, uuid::Uuid::new_v4()),
            name,
            address: address.into(),
            port,
            tags: vec!["v2".to_owned(), "microservice".to_owned()],
            health_check: HealthCheckSpec::default(),
        }
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }
}

/// Registry connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    #[serde(default = "default_registry_address")]
    pub registry_address: String,
    #[serde(default = "default_scheme")]
    pub scheme: String,
    /// `user:password` credentials, when the registry requires them.
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Key prefix all instances live under.
    #[serde(default = "default_namespace")]
    pub namespace: String,
    /// Lease TTL; derived as 3x the health-check interval when unset.
    #[serde(default)]
    pub lease_ttl_secs: Option<i64>,
}

fn default_registry_address() -> String {
    "127.0.0.1:2379".to_owned()
}

fn default_scheme() -> String {
    "http".to_owned()
}

fn default_timeout_ms() -> u64 {
    3_000
}

fn default_namespace() -> String {
    "/highpress/services".to_owned()
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            registry_address: default_registry_address(),
            scheme: default_scheme(),
            token: None,
            timeout_ms: default_timeout_ms(),
            namespace: default_namespace(),
            lease_ttl_secs: None,
        }
    }
}

impl DiscoveryConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn endpoint(&self) -> String {
        format!("{}://{}", self.scheme, self.registry_address)
    }
}

/// Errors from registry operations.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("registry backend error: {0}")]
    Backend(String),
    #[error("instance {0} is not registered")]
    NotRegistered(String),
    #[error("malformed instance record: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Stream of coalesced membership-change notifications for one service.
///
/// Delivery is best-effort: bursts collapse into a single notification, and
/// consumers are expected to reconcile periodically on their own.
#[derive(Debug)]
pub struct MembershipWatch {
    receiver: tokio::sync::mpsc::Receiver<()>,
}

impl MembershipWatch {
    pub fn new(receiver: tokio::sync::mpsc::Receiver<()>) -> Self {
        Self { receiver }
    }

    /// Wait for the next change; `None` when the watch has terminated.
    pub async fn changed(&mut self) -> Option<()> {
        self.receiver.recv().await
    }
}

/// Registry operations the fabric depends on.
#[async_trait]
pub trait Registry: Send + Sync + 'static {
    /// Submit an instance; the registry keeps it visible while the process
    /// stays alive.
    async fn register(&self, registration: Registration) -> Result<(), RegistryError>;

    /// Remove an instance; called on orderly shutdown.
    async fn deregister(&self, instance_id: &str) -> Result<(), RegistryError>;

    /// Instances of a named service, optionally restricted to `Passing`.
    async fn discover(
        &self,
        service: &str,
        only_passing: bool,
    ) -> Result<Vec<ServiceInstance>, RegistryError>;

    /// Subscribe to membership or health changes of a named service.
    async fn watch(&self, service: &str) -> Result<MembershipWatch, RegistryError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_port_identity() {
        let instance = ServiceInstance {
            service: "high-go-press-counter".into(),
            instance_id: "c-1".into(),
            address: "10.0.0.7".into(),
            port: 9100,
            tags: vec![],
            health: HealthStatus::Passing,
        };
        assert_eq!(instance.host_port(), "10.0.0.7:9100");
        assert_eq!(instance.endpoint(), "http://10.0.0.7:9100");
    }

    #[test]
    fn instance_record_round_trips_as_json() {
        let instance = ServiceInstance {
            service: "high-go-press-counter".into(),
            instance_id: "c-1".into(),
            address: "10.0.0.7".into(),
            port: 9100,
            tags: vec!["v2".into(), "microservice".into()],
            health: HealthStatus::Warning,
        };
        let json = serde_json::to_string(&instance).unwrap();
        let parsed: ServiceInstance = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, instance);
        assert!(json.contains("\"warning\""));
    }

    #[test]
    fn registration_defaults() {
        let registration = Registration::new("high-go-press-counter", "10.0.0.7", 9100);
        assert!(registration.id.starts_with("high-go-press-counter-"));
        assert_eq!(registration.health_check.interval_secs, 10);
        assert_eq!(registration.health_check.timeout_secs, 3);
        assert!(registration.tags.contains(&"v2".to_owned()));
    }

    #[test]
    fn discovery_config_defaults() {
        let config = DiscoveryConfig::default();
        assert_eq!(config.endpoint(), "http://127.0.0.1:2379");
        assert_eq!(config.timeout(), Duration::from_millis(3_000));
        assert_eq!(config.namespace, "/highpress/services");
    }
}
