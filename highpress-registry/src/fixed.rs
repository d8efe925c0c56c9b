//! In-memory registry with fixed instance sets
//!
//! Static backend addresses are fine for tests and local runs; membership
//! changes are injected by hand with [`StaticRegistry::set_instances`].

use crate::{
    HealthStatus, MembershipWatch, Registration, Registry, RegistryError, ServiceInstance,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::mpsc;

#[derive(Debug, Default)]
pub struct StaticRegistry {
    instances: Mutex<HashMap<String, Vec<ServiceInstance>>>,
    watchers: Mutex<HashMap<String, Vec<mpsc::Sender<()>>>>,
}

impl StaticRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_service(self, service: impl Into<String>, instances: Vec<ServiceInstance>) -> Self {
        self.lock_instances().insert(service.into(), instances);
        self
    }

    /// Replace a service's instance set and notify watchers.
    pub fn set_instances(&self, service: &str, instances: Vec<ServiceInstance>) {
        self.lock_instances().insert(service.to_owned(), instances);
        self.notify(service);
    }

    /// Convenience: a passing instance on localhost.
    pub fn local_instance(service: &str, instance_id: &str, port: u16) -> ServiceInstance {
        ServiceInstance {
            service: service.to_owned(),
            instance_id: instance_id.to_owned(),
            address: "127.0.0.1".to_owned(),
            port,
            tags: vec!["v2".to_owned(), "microservice".to_owned()],
            health: HealthStatus::Passing,
        }
    }

    fn notify(&self, service: &str) {
        let mut watchers = self.watchers.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(senders) = watchers.get_mut(service) {
            senders.retain(|sender| match sender.try_send(()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(())) => true,
                Err(mpsc::error::TrySendError::Closed(())) => false,
            });
        }
    }

    fn lock_instances(
        &self,
    ) -> std::sync::MutexGuard<'_, HashMap<String, Vec<ServiceInstance>>> {
        self.instances.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl Registry for StaticRegistry {
    async fn register(&self, registration: Registration) -> Result<(), RegistryError> {
        let instance = ServiceInstance {
            service: registration.name.clone(),
            instance_id: registration.id,
            address: registration.address,
            port: registration.port,
            tags: registration.tags,
            health: HealthStatus::Passing,
        };
        self.lock_instances().entry(registration.name.clone()).or_default().push(instance);
        self.notify(&registration.name);
        Ok(())
    }

    async fn deregister(&self, instance_id: &str) -> Result<(), RegistryError> {
        let mut changed = None;
        {
            let mut instances = self.lock_instances();
            for (service, list) in instances.iter_mut() {
                let before = list.len();
                list.retain(|instance| instance.instance_id != instance_id);
                if list.len() != before {
                    changed = Some(service.clone());
                    break;
                }
            }
        }
        match changed {
            Some(service) => {
                self.notify(&service);
                Ok(())
            }
            None => Err(RegistryError::NotRegistered(instance_id.to_owned())),
        }
    }

    async fn discover(
        &self,
        service: &str,
        only_passing: bool,
    ) -> Result<Vec<ServiceInstance>, RegistryError> {
        let instances = self.lock_instances();
        Ok(instances
            .get(service)
            .map(|list| {
                list.iter()
                    .filter(|instance| !only_passing || instance.is_passing())
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn watch(&self, service: &str) -> Result<MembershipWatch, RegistryError> {
        let (tx, rx) = mpsc::channel(4);
        self.watchers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .entry(service.to_owned())
            .or_default()
            .push(tx);
        Ok(MembershipWatch::new(rx))
    }
}
