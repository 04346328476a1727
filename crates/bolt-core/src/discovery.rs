//! Service discovery port and an in-memory implementation.
//!
//! Watchers receive full instance-list snapshots, not deltas: the current
//! list on subscription and a fresh snapshot after every change. The
//! in-memory backend is mostly useful for tests and single-process wiring;
//! real deployments plug in an external registry behind the same trait.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::watch;

use crate::error::{Error, Result};

/// One reachable instance of a service.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceInstance {
    pub service_name: String,
    pub addr: String,
    pub metadata: HashMap<String, String>,
}

/// Snapshot stream handed to watchers.
pub type Watcher = watch::Receiver<Vec<ServiceInstance>>;

/// A service registry.
#[async_trait]
pub trait Discovery: Send + Sync {
    /// Registers (or re-registers, updating metadata) an instance.
    async fn register(
        &self,
        service_name: &str,
        addr: &str,
        metadata: HashMap<String, String>,
    ) -> Result<()>;

    /// Removes an instance; unknown instances are `not_found`.
    async fn unregister(&self, service_name: &str, addr: &str) -> Result<()>;

    /// The current instances of a service; `not_found` when none exist.
    async fn get_service(&self, service_name: &str) -> Result<Vec<ServiceInstance>>;

    /// Subscribes to instance-list snapshots for a service. The receiver
    /// holds the current list immediately and observes every later change.
    async fn watch(&self, service_name: &str) -> Result<Watcher>;
}

#[derive(Default)]
struct MemoryState {
    services: HashMap<String, Vec<ServiceInstance>>,
    watchers: HashMap<String, watch::Sender<Vec<ServiceInstance>>>,
}

impl MemoryState {
    fn notify(&mut self, service_name: &str) {
        if let Some(tx) = self.watchers.get(service_name) {
            let snapshot = self.services.get(service_name).cloned().unwrap_or_default();
            // send_replace keeps the stored snapshot fresh even while no
            // receiver is subscribed, so a late watcher sees current state.
            tx.send_replace(snapshot);
        }
    }
}

/// In-memory, process-local discovery.
#[derive(Default)]
pub struct MemoryDiscovery {
    state: Mutex<MemoryState>,
}

impl MemoryDiscovery {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Discovery for MemoryDiscovery {
    async fn register(
        &self,
        service_name: &str,
        addr: &str,
        metadata: HashMap<String, String>,
    ) -> Result<()> {
        let mut state = self.state.lock();
        let instances = state.services.entry(service_name.to_string()).or_default();
        if let Some(existing) = instances.iter_mut().find(|i| i.addr == addr) {
            existing.metadata = metadata;
        } else {
            instances.push(ServiceInstance {
                service_name: service_name.to_string(),
                addr: addr.to_string(),
                metadata,
            });
        }
        state.notify(service_name);
        Ok(())
    }

    async fn unregister(&self, service_name: &str, addr: &str) -> Result<()> {
        let mut state = self.state.lock();
        let Some(instances) = state.services.get_mut(service_name) else {
            return Err(Error::service_not_found());
        };
        let before = instances.len();
        instances.retain(|i| i.addr != addr);
        if instances.len() == before {
            return Err(Error::service_not_found());
        }
        if instances.is_empty() {
            state.services.remove(service_name);
        }
        state.notify(service_name);
        Ok(())
    }

    async fn get_service(&self, service_name: &str) -> Result<Vec<ServiceInstance>> {
        let state = self.state.lock();
        state
            .services
            .get(service_name)
            .cloned()
            .ok_or_else(Error::service_not_found)
    }

    async fn watch(&self, service_name: &str) -> Result<Watcher> {
        let mut state = self.state.lock();
        let current = state.services.get(service_name).cloned().unwrap_or_default();
        let tx = state
            .watchers
            .entry(service_name.to_string())
            .or_insert_with(|| watch::channel(current).0);
        Ok(tx.subscribe())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_register_and_get() {
        let discovery = MemoryDiscovery::new();
        discovery
            .register("Greeter", "127.0.0.1:4000", HashMap::new())
            .await
            .unwrap();
        let instances = discovery.get_service("Greeter").await.unwrap();
        assert_eq!(instances.len(), 1);
        assert_eq!(instances[0].addr, "127.0.0.1:4000");
    }

    #[tokio::test]
    async fn test_reregister_updates_metadata() {
        let discovery = MemoryDiscovery::new();
        discovery
            .register("Greeter", "127.0.0.1:4000", HashMap::new())
            .await
            .unwrap();
        let mut metadata = HashMap::new();
        metadata.insert("zone".to_string(), "eu-1".to_string());
        discovery
            .register("Greeter", "127.0.0.1:4000", metadata.clone())
            .await
            .unwrap();
        let instances = discovery.get_service("Greeter").await.unwrap();
        assert_eq!(instances.len(), 1);
        assert_eq!(instances[0].metadata, metadata);
    }

    #[tokio::test]
    async fn test_unregister_unknown_is_not_found() {
        let discovery = MemoryDiscovery::new();
        let err = discovery.unregister("Greeter", "nowhere").await.unwrap_err();
        assert!(err.is(&Error::service_not_found()));
    }

    #[tokio::test]
    async fn test_watch_sees_current_and_changes() {
        let discovery = MemoryDiscovery::new();
        discovery
            .register("Greeter", "127.0.0.1:4000", HashMap::new())
            .await
            .unwrap();

        let mut watcher = discovery.watch("Greeter").await.unwrap();
        assert_eq!(watcher.borrow().len(), 1, "current list on subscription");

        discovery
            .register("Greeter", "127.0.0.1:4001", HashMap::new())
            .await
            .unwrap();
        watcher.changed().await.unwrap();
        assert_eq!(watcher.borrow().len(), 2);

        discovery.unregister("Greeter", "127.0.0.1:4000").await.unwrap();
        discovery.unregister("Greeter", "127.0.0.1:4001").await.unwrap();
        watcher.changed().await.unwrap();
        assert!(watcher.borrow().is_empty(), "snapshots are full lists");
    }
}
