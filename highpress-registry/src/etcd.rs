//! etcd-backed registry
//!
//! Instances are stored as JSON under
//! `{namespace}/{service}/{instance_id}`, bound to a lease the owning
//! process keeps alive. Losing the process loses the lease, which removes
//! the key; that is the liveness signal, so the registry itself runs no
//! probes. Watches are prefix watches coalesced into membership-change
//! notifications.

use crate::{
    DiscoveryConfig, HealthStatus, MembershipWatch, Registration, Registry, RegistryError,
    ServiceInstance,
};
use async_trait::async_trait;
use etcd_client::{Client, ConnectOptions, GetOptions, PutOptions, WatchOptions};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

struct LeaseHandle {
    lease_id: i64,
    keepalive: tokio::task::JoinHandle<()>,
    key: String,
}

pub struct EtcdRegistry {
    client: Client,
    config: DiscoveryConfig,
    leases: Arc<Mutex<HashMap<String, LeaseHandle>>>,
}

impl std::fmt::Debug for EtcdRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EtcdRegistry").field("endpoint", &self.config.endpoint()).finish()
    }
}

impl EtcdRegistry {
    pub async fn connect(config: DiscoveryConfig) -> Result<Self, RegistryError> {
        let mut options = ConnectOptions::new().with_timeout(config.timeout());
        if let Some(token) = &config.token {
            if let Some((user, password)) = token.split_once(':') {
                options = options.with_user(user, password);
            }
        }
        let client = Client::connect([config.endpoint()], Some(options))
            .await
            .map_err(|e| RegistryError::Backend(e.to_string()))?;
        Ok(Self { client, config, leases: Arc::new(Mutex::new(HashMap::new())) })
    }

    fn service_prefix(&self, service: &str) -> String {
        format!("{}/{}/", self.config.namespace, service)
    }

    fn instance_key(&self, service: &str, instance_id: &str) -> String {
        format!("{}{}", self.service_prefix(service), instance_id)
    }

    fn lease_ttl(&self, registration: &Registration) -> i64 {
        // Three missed check intervals before the instance drops out.
        self.config
            .lease_ttl_secs
            .unwrap_or((registration.health_check.interval_secs * 3) as i64)
            .max(2)
    }
}

#[async_trait]
impl Registry for EtcdRegistry {
    async fn register(&self, registration: Registration) -> Result<(), RegistryError> {
        let mut client = self.client.clone();
        let ttl = self.lease_ttl(&registration);

        let lease = client
            .lease_grant(ttl, None)
            .await
            .map_err(|e| RegistryError::Backend(e.to_string()))?;
        let lease_id = lease.id();

        let instance = ServiceInstance {
            service: registration.name.clone(),
            instance_id: registration.id.clone(),
            address: registration.address.clone(),
            port: registration.port,
            tags: registration.tags.clone(),
            health: HealthStatus::Passing,
        };
        let key = self.instance_key(&registration.name, &registration.id);
        let value = serde_json::to_string(&instance)?;

        client
            .put(key.clone(), value, Some(PutOptions::new().with_lease(lease_id)))
            .await
            .map_err(|e| RegistryError::Backend(e.to_string()))?;

        // Renew at a third of the TTL; a stalled process stops renewing and
        // the key expires on its own.
        let renew_every = Duration::from_secs((ttl as u64 / 3).max(1));
        let keepalive_client = self.client.clone();
        let keepalive_key = key.clone();
        let keepalive = tokio::spawn(async move {
            let mut client = keepalive_client;
            let (mut keeper, mut responses) = match client.lease_keep_alive(lease_id).await {
                Ok(pair) => pair,
                Err(e) => {
                    tracing::warn!(key = %keepalive_key, error = %e, "lease keepalive setup failed");
                    return;
                }
            };
            let mut ticker = tokio::time::interval(renew_every);
            loop {
                ticker.tick().await;
                if let Err(e) = keeper.keep_alive().await {
                    tracing::warn!(key = %keepalive_key, error = %e, "lease renewal failed");
                    return;
                }
                match responses.message().await {
                    Ok(Some(_)) => {}
                    Ok(None) => {
                        tracing::warn!(key = %keepalive_key, "lease keepalive stream closed");
                        return;
                    }
                    Err(e) => {
                        tracing::warn!(key = %keepalive_key, error = %e, "lease keepalive stream error");
                        return;
                    }
                }
            }
        });

        tracing::info!(
            service = %registration.name,
            instance = %registration.id,
            lease_ttl_secs = ttl,
            "registered instance"
        );
        self.leases
            .lock()
            .await
            .insert(registration.id, LeaseHandle { lease_id, keepalive, key });
        Ok(())
    }

    async fn deregister(&self, instance_id: &str) -> Result<(), RegistryError> {
        let handle = self
            .leases
            .lock()
            .await
            .remove(instance_id)
            .ok_or_else(|| RegistryError::NotRegistered(instance_id.to_owned()))?;
        handle.keepalive.abort();

        let mut client = self.client.clone();
        if let Err(e) = client.lease_revoke(handle.lease_id).await {
            tracing::warn!(instance = instance_id, error = %e, "lease revoke failed");
        }
        client
            .delete(handle.key, None)
            .await
            .map_err(|e| RegistryError::Backend(e.to_string()))?;
        tracing::info!(instance = instance_id, "deregistered instance");
        Ok(())
    }

    async fn discover(
        &self,
        service: &str,
        only_passing: bool,
    ) -> Result<Vec<ServiceInstance>, RegistryError> {
        let mut client = self.client.clone();
        let response = client
            .get(self.service_prefix(service), Some(GetOptions::new().with_prefix()))
            .await
            .map_err(|e| RegistryError::Backend(e.to_string()))?;

        let mut instances = Vec::with_capacity(response.kvs().len());
        for kv in response.kvs() {
            match serde_json::from_slice::<ServiceInstance>(kv.value()) {
                Ok(instance) => {
                    if !only_passing || instance.is_passing() {
                        instances.push(instance);
                    }
                }
                Err(e) => {
                    // A malformed record must not take discovery down.
                    tracing::warn!(error = %e, "skipping malformed instance record");
                }
            }
        }
        Ok(instances)
    }

    async fn watch(&self, service: &str) -> Result<MembershipWatch, RegistryError> {
        let mut client = self.client.clone();
        let (watcher, mut stream) = client
            .watch(self.service_prefix(service), Some(WatchOptions::new().with_prefix()))
            .await
            .map_err(|e| RegistryError::Backend(e.to_string()))?;

        let (tx, rx) = tokio::sync::mpsc::channel(4);
        let service_name = service.to_owned();
        tokio::spawn(async move {
            // The watcher must stay alive for the stream's lifetime.
            let _watcher = watcher;
            loop {
                match stream.message().await {
                    Ok(Some(response)) => {
                        if response.events().is_empty() {
                            continue;
                        }
                        // Coalesce: a full channel already carries a pending
                        // notification.
                        let _ = tx.try_send(());
                    }
                    Ok(None) => {
                        tracing::warn!(service = %service_name, "registry watch stream closed");
                        return;
                    }
                    Err(e) => {
                        tracing::warn!(service = %service_name, error = %e, "registry watch stream error");
                        return;
                    }
                }
            }
        });

        Ok(MembershipWatch::new(rx))
    }
}
