//! Process-scoped registry of running instances.
//!
//! Construct one per process (or per test) and call
//! [`InstanceManager::shutdown_all`] on the way out; there is no global
//! registry.

use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::Mutex;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use super::{Instance, InstanceHandle, InstanceState, InstanceStatus, RemoteInstance};
use crate::config::{EngineConfig, LocalInstanceConfig};
use crate::service::{Request, Response};
use crate::storage::distributed::normalize_endpoint;
use crate::Result;

type Slot = Arc<OnceCell<Arc<Instance>>>;

pub struct InstanceManager {
    /// Settings for remote connections.
    engine: EngineConfig,
    /// One slot per backend descriptor. Concurrent `ensure_local` callers
    /// share the slot, so only one of them starts the instance.
    local: Mutex<HashMap<String, Slot>>,
    remote: Mutex<HashMap<String, Arc<RemoteInstance>>>,
}

impl Default for InstanceManager {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}

impl InstanceManager {
    pub fn new(engine: EngineConfig) -> Self {
        Self { engine, local: Mutex::new(HashMap::new()), remote: Mutex::new(HashMap::new()) }
    }

    /// Start the local instance for `config`, or return the one already
    /// running on the same backend. A stopped instance is replaced, never
    /// restarted.
    pub async fn ensure_local(&self, config: LocalInstanceConfig) -> Result<InstanceHandle> {
        let descriptor = config.backend.descriptor();
        loop {
            let slot = self.local.lock().entry(descriptor.clone()).or_default().clone();
            let instance = slot
                .get_or_try_init(|| {
                    debug!(descriptor = %descriptor, "spawning local instance");
                    Instance::start(config.clone())
                })
                .await?;
            if instance.state() != InstanceState::Stopped {
                return Ok(InstanceHandle::Local(instance.clone()));
            }
            let mut local = self.local.lock();
            if local.get(&descriptor).is_some_and(|current| Arc::ptr_eq(current, &slot)) {
                local.remove(&descriptor);
            }
        }
    }

    /// Attach to an instance served by another process. Handles are cached
    /// per address.
    pub async fn connect(&self, address: &str) -> Result<InstanceHandle> {
        let address = normalize_endpoint(address);
        if let Some(remote) = self.remote.lock().get(&address) {
            return Ok(InstanceHandle::Remote(remote.clone()));
        }
        let remote = Arc::new(RemoteInstance::connect(&address, &self.engine).await?);
        let remote = self.remote.lock().entry(address).or_insert(remote).clone();
        Ok(InstanceHandle::Remote(remote))
    }

    /// Dispatch a request to the addressed instance.
    pub async fn route(&self, request: Request, handle: &InstanceHandle) -> Result<Response> {
        handle.route(request).await
    }

    /// Local instances that are not stopped.
    pub fn local_instances(&self) -> Vec<Arc<Instance>> {
        self.local
            .lock()
            .values()
            .filter_map(|slot| slot.get().cloned())
            .filter(|instance| instance.state() != InstanceState::Stopped)
            .collect()
    }

    pub fn statuses(&self) -> Vec<InstanceStatus> {
        let mut statuses: Vec<InstanceStatus> = self.local_instances().iter().map(|i| i.status()).collect();
        statuses.sort_by(|a, b| a.name.cmp(&b.name));
        statuses
    }

    /// Stop every local instance and forget remote handles. Every instance
    /// is stopped even if one fails; the first failure is returned.
    pub async fn shutdown_all(&self) -> Result<()> {
        let slots: Vec<Slot> = self.local.lock().drain().map(|(_, slot)| slot).collect();
        let mut first_error = None;
        let mut stopped = 0;
        for slot in slots {
            let Some(instance) = slot.get() else { continue };
            match instance.stop().await {
                Ok(()) => stopped += 1,
                Err(e) => {
                    warn!(instance = %instance.id(), error = %e, "instance shutdown failed");
                    first_error.get_or_insert(e);
                }
            }
        }
        self.remote.lock().clear();
        info!(stopped, "instance manager shut down");
        first_error.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_ensure_local_singleflight() {
        let dir = tempfile::tempdir().unwrap();
        let manager = Arc::new(InstanceManager::default());
        let config = LocalInstanceConfig::embedded("kb", dir.path().join("kb"));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let manager = manager.clone();
            let config = config.clone();
            tasks.push(tokio::spawn(async move { manager.ensure_local(config).await.unwrap() }));
        }
        let mut ids = Vec::new();
        for task in tasks {
            ids.push(task.await.unwrap().as_local().unwrap().id());
        }
        ids.dedup();
        assert_eq!(ids.len(), 1);
        assert_eq!(manager.local_instances().len(), 1);
        manager.shutdown_all().await.unwrap();
        assert!(manager.local_instances().is_empty());
    }

    #[tokio::test]
    async fn test_stopped_instance_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let manager = InstanceManager::default();
        let config = LocalInstanceConfig::embedded("kb", dir.path().join("kb"));
        let first = manager.ensure_local(config.clone()).await.unwrap();
        let first = first.as_local().unwrap().clone();
        first.stop().await.unwrap();

        let second = manager.ensure_local(config).await.unwrap();
        assert_ne!(second.as_local().unwrap().id(), first.id());
        assert_eq!(first.state(), InstanceState::Stopped);
        manager.shutdown_all().await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_start_is_retried() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("not-a-dir");
        std::fs::write(&file, b"x").unwrap();
        let manager = InstanceManager::default();
        let config = LocalInstanceConfig::embedded("kb", file.join("kb"));
        assert!(manager.ensure_local(config.clone()).await.is_err());
        assert!(manager.ensure_local(config).await.is_err());
        assert!(manager.local_instances().is_empty());
        assert!(matches!(manager.connect("127.0.0.1:9").await, Err(Error::Unavailable(_) | Error::Timeout(_))));
    }
}
