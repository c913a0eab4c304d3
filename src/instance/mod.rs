//! # Instances
//!
//! An [`Instance`] is one running knowledge base bound to one backend.
//!
//! ```text
//! Starting ──handshake ok──▶ Ready ◀──recovered──▶ Degraded
//!     │                        │                      │
//!     └──────────failure───────┴──────shutdown────────┴──▶ Stopped (terminal)
//! ```
//!
//! Degraded instances keep serving reads. Writes are rejected with
//! `Unavailable` or queued, per [`DegradedWritePolicy`]; queued writes are
//! drained in order before the instance reports Ready again.

mod manager;
mod remote;

pub use manager::InstanceManager;
pub use remote::RemoteInstance;

use std::collections::VecDeque;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::{DegradedWritePolicy, EngineConfig, LocalInstanceConfig};
use crate::service::{KnowledgeBase, Request, Response};
use crate::storage::{retry, BackendKind};
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    Starting,
    Ready,
    Degraded,
    Stopped,
}

impl InstanceState {
    fn can_become(self, next: InstanceState) -> bool {
        use InstanceState::*;
        matches!(
            (self, next),
            (Starting, Ready) | (Ready, Degraded) | (Degraded, Degraded) | (Degraded, Ready) | (Starting | Ready | Degraded, Stopped)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum DegradedReason {
    IndexRebuild { collection: String },
    BackendRecovery { detail: String },
}

impl fmt::Display for DegradedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DegradedReason::IndexRebuild { collection } => write!(f, "index rebuild of '{collection}'"),
            DegradedReason::BackendRecovery { detail } => write!(f, "backend recovery: {detail}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceStatus {
    pub id: Uuid,
    pub name: String,
    pub state: InstanceState,
    pub backend_kind: BackendKind,
    #[serde(default)]
    pub degraded_reason: Option<DegradedReason>,
    #[serde(default)]
    pub queued_writes: usize,
    #[serde(default)]
    pub listen: Option<SocketAddr>,
}

// ============================================================================
// Instance
// ============================================================================

struct Lifecycle {
    state: InstanceState,
    reason: Option<DegradedReason>,
    queue: VecDeque<Request>,
}

struct Listener {
    addr: SocketAddr,
    shutdown: CancellationToken,
}

pub struct Instance {
    id: Uuid,
    name: String,
    backend_kind: BackendKind,
    engine: EngineConfig,
    kb: RwLock<Option<Arc<KnowledgeBase>>>,
    lifecycle: Mutex<Lifecycle>,
    state_tx: watch::Sender<InstanceState>,
    draining: AtomicBool,
    listener: Mutex<Option<Listener>>,
}

impl Instance {
    /// Open the backend, handshake, load the knowledge base and (optionally)
    /// start serving the service RPC. Resolves once the instance is Ready;
    /// on failure it is Stopped and the backend released.
    pub async fn start(config: LocalInstanceConfig) -> Result<Arc<Self>> {
        config.engine.validate()?;
        let (state_tx, _) = watch::channel(InstanceState::Starting);
        let instance = Arc::new(Self {
            id: Uuid::new_v4(),
            name: config.name.clone(),
            backend_kind: config.backend.kind(),
            engine: config.engine.clone(),
            kb: RwLock::new(None),
            lifecycle: Mutex::new(Lifecycle { state: InstanceState::Starting, reason: None, queue: VecDeque::new() }),
            state_tx,
            draining: AtomicBool::new(false),
            listener: Mutex::new(None),
        });
        info!(instance = %instance.id, name = %instance.name, backend = ?instance.backend_kind, "instance starting");

        if let Err(e) = instance.boot(&config).await {
            warn!(instance = %instance.id, error = %e, "instance failed to start");
            if let Err(stop) = instance.stop().await {
                warn!(instance = %instance.id, error = %stop, "cleanup after failed start");
            }
            return Err(e);
        }
        Ok(instance)
    }

    async fn boot(self: &Arc<Self>, config: &LocalInstanceConfig) -> Result<()> {
        let backend = config.backend.open(&config.engine).await?;
        if let Err(e) = backend.handshake().await {
            backend.shutdown().await?;
            return Err(e);
        }
        let kb = match KnowledgeBase::open(backend.clone(), config.engine.clone()).await {
            Ok(kb) => kb,
            Err(e) => {
                backend.shutdown().await?;
                return Err(e);
            }
        };
        *self.kb.write() = Some(Arc::new(kb));
        if let Some(addr) = config.listen {
            self.serve(addr).await?;
        }
        self.transition(InstanceState::Ready, None);
        Ok(())
    }

    /// Serve the service RPC on `addr` until the instance stops.
    async fn serve(self: &Arc<Self>, addr: SocketAddr) -> Result<SocketAddr> {
        let shutdown = CancellationToken::new();
        let router = crate::server::service_router(Arc::clone(self));
        let (local, _) = crate::server::spawn(addr, router, shutdown.clone()).await?;
        *self.listener.lock() = Some(Listener { addr: local, shutdown });
        info!(instance = %self.id, addr = %local, "serving service rpc");
        Ok(local)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> InstanceState {
        self.lifecycle.lock().state
    }

    /// Address the service RPC is bound to, if any.
    pub fn listen_addr(&self) -> Option<SocketAddr> {
        self.listener.lock().as_ref().map(|l| l.addr)
    }

    pub fn status(&self) -> InstanceStatus {
        let lifecycle = self.lifecycle.lock();
        InstanceStatus {
            id: self.id,
            name: self.name.clone(),
            state: lifecycle.state,
            backend_kind: self.backend_kind,
            degraded_reason: lifecycle.reason.clone(),
            queued_writes: lifecycle.queue.len(),
            listen: self.listen_addr(),
        }
    }

    /// State changes, starting with the current state.
    pub fn subscribe(&self) -> watch::Receiver<InstanceState> {
        self.state_tx.subscribe()
    }

    /// Wait until the instance is Ready. `Unavailable` once it is Stopped.
    pub async fn wait_ready(&self) -> Result<()> {
        let mut rx = self.subscribe();
        loop {
            let state = *rx.borrow_and_update();
            match state {
                InstanceState::Ready => return Ok(()),
                InstanceState::Stopped => {
                    return Err(Error::Unavailable(format!("instance '{}' is stopped", self.name)));
                }
                InstanceState::Starting | InstanceState::Degraded => {}
            }
            rx.changed()
                .await
                .map_err(|_| Error::Unavailable(format!("instance '{}' went away", self.name)))?;
        }
    }

    /// The knowledge base, while the instance is running.
    pub fn knowledge_base(&self) -> Result<Arc<KnowledgeBase>> {
        self.kb
            .read()
            .clone()
            .ok_or_else(|| Error::Unavailable(format!("instance '{}' is not running", self.name)))
    }

    fn transition(&self, next: InstanceState, reason: Option<DegradedReason>) -> bool {
        let mut lifecycle = self.lifecycle.lock();
        self.transition_locked(&mut lifecycle, next, reason)
    }

    fn transition_locked(&self, lifecycle: &mut Lifecycle, next: InstanceState, reason: Option<DegradedReason>) -> bool {
        if !lifecycle.state.can_become(next) {
            return false;
        }
        let previous = lifecycle.state;
        lifecycle.state = next;
        lifecycle.reason = reason;
        self.state_tx.send_replace(next);
        match &lifecycle.reason {
            Some(reason) => warn!(instance = %self.id, from = ?previous, to = ?next, %reason, "instance state changed"),
            None => info!(instance = %self.id, from = ?previous, to = ?next, "instance state changed"),
        }
        true
    }

    /// Mark the instance Degraded. No effect unless it is Ready or Degraded.
    pub fn degrade(&self, reason: DegradedReason) {
        self.transition(InstanceState::Degraded, Some(reason));
    }

    /// Leave Degraded if the current reason matches `cause`: drain queued
    /// writes in order, then become Ready.
    async fn recover(&self, cause: fn(&DegradedReason) -> bool) {
        {
            let lifecycle = self.lifecycle.lock();
            if lifecycle.state != InstanceState::Degraded || !lifecycle.reason.as_ref().is_some_and(cause) {
                return;
            }
        }
        if self.draining.swap(true, Ordering::AcqRel) {
            return;
        }
        loop {
            let next = {
                let mut lifecycle = self.lifecycle.lock();
                match lifecycle.queue.pop_front() {
                    Some(request) => request,
                    None => {
                        self.transition_locked(&mut lifecycle, InstanceState::Ready, None);
                        break;
                    }
                }
            };
            let Ok(kb) = self.knowledge_base() else { break };
            match kb.handle(next.clone()).await {
                Ok(_) => {}
                Err(Error::Unavailable(detail)) => {
                    let mut lifecycle = self.lifecycle.lock();
                    lifecycle.queue.push_front(next);
                    let reason = DegradedReason::BackendRecovery { detail };
                    self.transition_locked(&mut lifecycle, InstanceState::Degraded, Some(reason));
                    break;
                }
                Err(e) => warn!(instance = %self.id, op = next.name(), error = %e, "queued write failed"),
            }
        }
        self.draining.store(false, Ordering::Release);
    }

    /// `None`: run the request now. `Some(depth)`: it was queued.
    fn admit(&self, request: &Request) -> Result<Option<usize>> {
        let mut lifecycle = self.lifecycle.lock();
        match lifecycle.state {
            InstanceState::Ready => Ok(None),
            InstanceState::Starting => Err(Error::Unavailable(format!("instance '{}' is starting", self.name))),
            InstanceState::Stopped => Err(Error::Unavailable(format!("instance '{}' is stopped", self.name))),
            InstanceState::Degraded if !request.is_write() => Ok(None),
            InstanceState::Degraded => {
                let reason = lifecycle.reason.as_ref().map(ToString::to_string).unwrap_or_default();
                match self.engine.degraded_writes {
                    DegradedWritePolicy::Reject => Err(Error::Unavailable(format!(
                        "instance '{}' is degraded ({reason}); write rejected",
                        self.name
                    ))),
                    DegradedWritePolicy::Queue if lifecycle.queue.len() >= self.engine.write_queue_capacity => {
                        Err(Error::Unavailable(format!(
                            "instance '{}' is degraded ({reason}) and its write queue is full",
                            self.name
                        )))
                    }
                    DegradedWritePolicy::Queue => {
                        lifecycle.queue.push_back(request.clone());
                        Ok(Some(lifecycle.queue.len()))
                    }
                }
            }
        }
    }

    /// Answer one request.
    ///
    /// Backend `Unavailable` errors are retried with backoff; once retries
    /// are exhausted the instance turns Degraded and the error surfaces. A
    /// later successful call brings it back.
    pub async fn handle(self: &Arc<Self>, request: Request) -> Result<Response> {
        if matches!(request, Request::Status) {
            return Ok(Response::Status { status: self.status() });
        }
        if let Some(depth) = self.admit(&request)? {
            return Ok(Response::Queued { depth });
        }
        let kb = self.knowledge_base()?;
        if let Request::RebuildIndex { collection } = request {
            return self.start_rebuild(kb, collection).await;
        }

        let kb = &kb;
        let request = &request;
        let result = retry::on_unavailable(&self.engine.unavailable_retry, request.name(), || kb.handle(request.clone())).await;
        match &result {
            Err(Error::Unavailable(detail)) if self.state() != InstanceState::Stopped => {
                self.degrade(DegradedReason::BackendRecovery { detail: detail.clone() });
            }
            Ok(_) => self.recover(|r| matches!(r, DegradedReason::BackendRecovery { .. })).await,
            _ => {}
        }
        result
    }

    async fn start_rebuild(self: &Arc<Self>, kb: Arc<KnowledgeBase>, collection: String) -> Result<Response> {
        let task = kb.rebuild_index(&collection).await?;
        self.degrade(DegradedReason::IndexRebuild { collection: collection.clone() });
        let instance = Arc::clone(self);
        let name = collection.clone();
        tokio::spawn(async move {
            match task.await {
                Ok(Ok(generation)) => info!(collection = %name, generation, "index rebuild finished"),
                Ok(Err(e)) => warn!(collection = %name, error = %e, "index rebuild failed"),
                Err(e) => warn!(collection = %name, error = %e, "index rebuild task aborted"),
            }
            if kb.store().rebuilding().is_empty() {
                instance.recover(|r| matches!(r, DegradedReason::IndexRebuild { .. })).await;
            }
        });
        Ok(Response::RebuildStarted { collection })
    }

    /// Stop serving and release the backend. Stopped is final.
    pub async fn stop(&self) -> Result<()> {
        let discarded = {
            let mut lifecycle = self.lifecycle.lock();
            if lifecycle.state == InstanceState::Stopped {
                return Ok(());
            }
            let discarded = lifecycle.queue.len();
            lifecycle.queue.clear();
            self.transition_locked(&mut lifecycle, InstanceState::Stopped, None);
            discarded
        };
        if discarded > 0 {
            warn!(instance = %self.id, discarded, "queued writes discarded at shutdown");
        }
        if let Some(listener) = self.listener.lock().take() {
            listener.shutdown.cancel();
        }
        let kb = self.kb.write().take();
        if let Some(kb) = kb {
            kb.backend().shutdown().await?;
        }
        info!(instance = %self.id, name = %self.name, "instance stopped");
        Ok(())
    }
}

impl fmt::Debug for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Instance")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("backend_kind", &self.backend_kind)
            .field("state", &self.state())
            .finish()
    }
}

// ============================================================================
// InstanceHandle
// ============================================================================

/// Where requests for one knowledge base go, local or remote.
#[derive(Debug, Clone)]
pub enum InstanceHandle {
    Local(Arc<Instance>),
    Remote(Arc<RemoteInstance>),
}

impl InstanceHandle {
    pub async fn route(&self, request: Request) -> Result<Response> {
        match self {
            InstanceHandle::Local(instance) => instance.handle(request).await,
            InstanceHandle::Remote(remote) => remote.call(&request).await,
        }
    }

    pub async fn status(&self) -> Result<InstanceStatus> {
        match self {
            InstanceHandle::Local(instance) => Ok(instance.status()),
            InstanceHandle::Remote(remote) => remote.status().await,
        }
    }

    pub fn as_local(&self) -> Option<&Arc<Instance>> {
        match self {
            InstanceHandle::Local(instance) => Some(instance),
            InstanceHandle::Remote(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Metric, Node, NodeId};

    fn config(dir: &tempfile::TempDir, policy: DegradedWritePolicy) -> LocalInstanceConfig {
        let engine = EngineConfig { degraded_writes: policy, write_queue_capacity: 2, ..EngineConfig::default() };
        LocalInstanceConfig::embedded("test", dir.path().join("kb")).with_engine(engine)
    }

    fn upsert(id: &str) -> Request {
        Request::UpsertNode { collection: "kb".into(), node: Node::new(NodeId::new(id).unwrap()) }
    }

    #[test]
    fn test_transitions() {
        use InstanceState::*;
        assert!(Starting.can_become(Ready));
        assert!(Degraded.can_become(Ready));
        assert!(!Stopped.can_become(Ready));
        assert!(!Stopped.can_become(Stopped));
        assert!(!Starting.can_become(Degraded));
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let dir = tempfile::tempdir().unwrap();
        let instance = Instance::start(config(&dir, DegradedWritePolicy::Reject)).await.unwrap();
        assert_eq!(instance.state(), InstanceState::Ready);
        instance.wait_ready().await.unwrap();
        instance.stop().await.unwrap();
        assert_eq!(instance.state(), InstanceState::Stopped);
        assert!(instance.wait_ready().await.is_err());
        assert!(matches!(instance.handle(upsert("a")).await, Err(Error::Unavailable(_))));
        let Response::Status { status } = instance.handle(Request::Status).await.unwrap() else {
            panic!("expected status");
        };
        assert_eq!(status.state, InstanceState::Stopped);
    }

    #[tokio::test]
    async fn test_degraded_rejects_writes_serves_reads() {
        let dir = tempfile::tempdir().unwrap();
        let instance = Instance::start(config(&dir, DegradedWritePolicy::Reject)).await.unwrap();
        instance.handle(Request::CreateCollection { name: "kb".into(), dimension: 2, metric: Metric::Cosine })
            .await
            .unwrap();
        instance.degrade(DegradedReason::BackendRecovery { detail: "test".into() });
        assert!(matches!(instance.handle(upsert("a")).await, Err(Error::Unavailable(_))));

        // A successful read ends backend recovery.
        instance.handle(Request::ListCollections).await.unwrap();
        assert_eq!(instance.state(), InstanceState::Ready);
        instance.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_degraded_queue_drains_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let instance = Instance::start(config(&dir, DegradedWritePolicy::Queue)).await.unwrap();
        instance.handle(Request::CreateCollection { name: "kb".into(), dimension: 2, metric: Metric::Cosine })
            .await
            .unwrap();
        instance.degrade(DegradedReason::BackendRecovery { detail: "test".into() });
        assert_eq!(instance.handle(upsert("a")).await.unwrap(), Response::Queued { depth: 1 });
        assert_eq!(instance.handle(upsert("b")).await.unwrap(), Response::Queued { depth: 2 });
        assert!(matches!(instance.handle(upsert("c")).await, Err(Error::Unavailable(_))));
        assert_eq!(instance.status().queued_writes, 2);

        instance.handle(Request::ListCollections).await.unwrap();
        assert_eq!(instance.state(), InstanceState::Ready);
        let kb = instance.knowledge_base().unwrap();
        assert!(kb.store().get_node("kb", &NodeId::new("b").unwrap()).await.unwrap().is_some());
        instance.stop().await.unwrap();
    }
}
