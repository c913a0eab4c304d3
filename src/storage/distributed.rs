//! Distributed storage backend.
//!
//! Speaks the KV protocol in [`super::wire`] to an ordered list of storage
//! node endpoints. Each call goes to the first endpoint that answers;
//! connection failures fail over to the next one. Endpoints must front the
//! same logical key space (replicas behind one consensus group, or a single
//! node); the backend adds no replication of its own.
//!
//! Snapshots are server-side leases. Every read renews the lease; a lease
//! that expired (or lives on a node we failed away from) surfaces as
//! `Conflict`, which `transact` retries on a fresh snapshot.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

use super::wire::{self, ErrorBody};
use super::{Backend, BackendKind, Credentials, Record};
use crate::config::RetryPolicy;
use crate::tx::{CommitSeq, SnapshotLease, Txn, TxId, TxMode};
use crate::{Error, Result};

pub struct DistributedBackend {
    inner: Arc<ClusterInner>,
}

struct ClusterInner {
    client: reqwest::Client,
    endpoints: Vec<String>,
    credentials: Option<Credentials>,
    timeout: Duration,
    policy: RetryPolicy,
    next_tx_id: AtomicU64,
    closed: AtomicBool,
}

/// `host:port` and trailing slashes are accepted; the scheme defaults to http.
pub(crate) fn normalize_endpoint(endpoint: &str) -> String {
    let trimmed = endpoint.trim().trim_end_matches('/');
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        trimmed.to_string()
    } else {
        format!("http://{trimmed}")
    }
}

/// Map a transport failure onto the error taxonomy. Deadline expiry is
/// `Timeout`; anything else means the endpoint could not be reached.
pub(crate) fn transport_error(endpoint: &str, e: &reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::Timeout(format!("{endpoint}: {e}"))
    } else {
        Error::Unavailable(format!("{endpoint}: {e}"))
    }
}

/// Decode a response: the payload on success, the remote error otherwise.
pub(crate) async fn decode_response<T: DeserializeOwned>(endpoint: &str, resp: reqwest::Response) -> Result<T> {
    let status = resp.status();
    if status.is_success() {
        return resp.json::<T>().await.map_err(|e| {
            if e.is_timeout() {
                Error::Timeout(format!("{endpoint}: {e}"))
            } else {
                Error::Storage(format!("{endpoint}: malformed response: {e}"))
            }
        });
    }
    match resp.json::<ErrorBody>().await {
        Ok(body) => Err(body.into()),
        Err(_) => Err(Error::Storage(format!("{endpoint}: HTTP {status}"))),
    }
}

impl DistributedBackend {
    pub fn connect(
        endpoints: Vec<String>,
        credentials: Option<Credentials>,
        timeout: Duration,
        policy: RetryPolicy,
    ) -> Result<Self> {
        if endpoints.is_empty() {
            return Err(Error::Config("distributed backend needs at least one endpoint".into()));
        }
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| Error::Config(format!("http client: {e}")))?;
        let endpoints: Vec<String> = endpoints.iter().map(|e| normalize_endpoint(e)).collect();
        info!(endpoints = ?endpoints, timeout_ms = timeout.as_millis() as u64, "distributed backend configured");
        Ok(Self {
            inner: Arc::new(ClusterInner {
                client,
                endpoints,
                credentials,
                timeout,
                policy,
                next_tx_id: AtomicU64::new(1),
                closed: AtomicBool::new(false),
            }),
        })
    }

    pub fn endpoints(&self) -> &[String] {
        &self.inner.endpoints
    }

    fn ensure_open(&self) -> Result<()> {
        if self.inner.closed.load(Ordering::Acquire) {
            Err(Error::Unavailable("distributed backend is shut down".into()))
        } else {
            Ok(())
        }
    }

    /// Send to the first endpoint that answers.
    async fn send<T, F>(&self, path: &str, build: F) -> Result<T>
    where
        T: DeserializeOwned,
        F: Fn(&reqwest::Client, String) -> reqwest::RequestBuilder,
    {
        self.ensure_open()?;
        let mut last = None;
        for endpoint in &self.inner.endpoints {
            let mut req = build(&self.inner.client, format!("{endpoint}{path}")).timeout(self.inner.timeout);
            if let Some(creds) = &self.inner.credentials {
                req = req.bearer_auth(&creds.token);
            }
            match req.send().await {
                Ok(resp) => return decode_response(endpoint, resp).await,
                Err(e) => {
                    let err = transport_error(endpoint, &e);
                    if matches!(err, Error::Timeout(_)) {
                        return Err(err);
                    }
                    warn!(endpoint = %endpoint, path, error = %e, "storage endpoint unreachable, failing over");
                    last = Some(err);
                }
            }
        }
        Err(last.unwrap_or_else(|| Error::Unavailable("no storage endpoints".into())))
    }

    async fn post<B: Serialize + Sync, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T> {
        self.send(path, |client, url| client.post(url).json(body)).await
    }

    fn lease_of(tx: &Txn) -> Result<&str> {
        match &tx.lease {
            Some(SnapshotLease::Remote(id)) => Ok(id),
            _ => Err(Error::InvalidArgument(format!("{} was not started by a distributed backend", tx.id()))),
        }
    }

    async fn release(&self, lease: &str) {
        let req = wire::ReleaseRequest { lease: lease.to_string() };
        if let Err(e) = self.post::<_, serde_json::Value>(wire::RELEASE, &req).await {
            // The lease expires on its own.
            debug!(lease, error = %e, "lease release failed");
        }
    }
}

#[async_trait]
impl Backend for DistributedBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Distributed
    }

    fn conflict_policy(&self) -> RetryPolicy {
        self.inner.policy
    }

    async fn handshake(&self) -> Result<()> {
        let health: wire::HealthResponse = self.send(wire::HEALTH, |client, url| client.get(url)).await?;
        debug!(status = %health.status, seq = health.seq, "storage cluster handshake");
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        self.inner.closed.store(true, Ordering::Release);
        Ok(())
    }

    async fn begin_tx(&self, mode: TxMode) -> Result<Txn> {
        let resp: wire::BeginResponse = self.post(wire::BEGIN, &wire::BeginRequest { mode }).await?;
        let id = TxId(self.inner.next_tx_id.fetch_add(1, Ordering::Relaxed));
        Ok(Txn::new(id, mode, resp.snapshot, Some(SnapshotLease::Remote(resp.lease))))
    }

    async fn commit_tx(&self, tx: Txn) -> Result<CommitSeq> {
        let lease = Self::lease_of(&tx)?.to_string();
        if tx.mode() == TxMode::ReadOnly || tx.is_empty() {
            self.release(&lease).await;
            return Ok(tx.snapshot());
        }
        let req = wire::CommitRequest {
            lease,
            snapshot: tx.snapshot(),
            writes: tx.to_ops(),
            guards: tx.guards().cloned().collect(),
            range_guards: tx.range_guards().cloned().collect(),
        };
        let resp: wire::CommitResponse = self.post(wire::COMMIT, &req).await?;
        Ok(resp.seq)
    }

    async fn rollback_tx(&self, tx: Txn) -> Result<()> {
        let lease = Self::lease_of(&tx)?;
        self.release(lease).await;
        Ok(())
    }

    async fn read_committed(&self, tx: &Txn, namespace: &str, key: &str) -> Result<Option<Record>> {
        let req = wire::GetRequest {
            lease: Self::lease_of(tx)?.to_string(),
            namespace: namespace.to_string(),
            key: key.to_string(),
        };
        let resp: wire::GetResponse = self.post(wire::GET, &req).await?;
        Ok(resp.value)
    }

    async fn scan_committed(&self, tx: &Txn, namespace: &str, prefix: &str) -> Result<Vec<(String, Record)>> {
        let req = wire::ScanRequest {
            lease: Self::lease_of(tx)?.to_string(),
            namespace: namespace.to_string(),
            prefix: prefix.to_string(),
        };
        let resp: wire::ScanResponse = self.post(wire::SCAN, &req).await?;
        Ok(resp.entries)
    }
}
