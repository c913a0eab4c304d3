//! # Backend Adapter
//!
//! This is THE contract between the engine and any storage substrate.
//! Entity store, vector index and query engine only ever see `dyn Backend`.
//!
//! ## Implementations
//!
//! | Backend | Module | Description |
//! |---------|--------|-------------|
//! | `EmbeddedBackend` | `embedded` | Single process, persisted to a local sled database |
//! | `DistributedBackend` | `distributed` | Same contract over HTTP against storage nodes |
//!
//! ## Isolation
//!
//! Both backends provide **snapshot isolation**: a transaction reads the
//! state as of `begin_tx` (plus its own staged writes) and commits with
//! first-committer-wins on every written or guarded key. Write skew is
//! prevented where it matters by guarding the keys a write depends on
//! (see `Txn::guard`). A distributed deployment gets the same guarantee
//! because every storage node runs the same multi-version key space; the
//! endpoints of one cluster must front a single logical key space.

pub mod keys;
pub mod mvcc;
pub mod retry;
pub mod embedded;
pub mod distributed;
pub mod wire;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::{EngineConfig, RetryPolicy};
use crate::tx::{CommitSeq, Txn, TxMode, WriteOp};
use crate::Result;

pub use distributed::DistributedBackend;
pub use embedded::EmbeddedBackend;

/// Stored record. JSON is the portable form on disk and on the wire.
pub type Record = serde_json::Value;

// ============================================================================
// Backend configuration
// ============================================================================

/// Which substrate a backend runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Embedded,
    Distributed,
}

/// Isolation level a backend guarantees for `transact` and snapshot reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Isolation {
    Snapshot,
    Serializable,
}

/// Bearer credentials for a cluster.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub token: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Credentials { token: <redacted> }")
    }
}

fn default_cluster_timeout_ms() -> u64 {
    10_000
}

/// Connection descriptor for a storage backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackendConfig {
    /// Local on-disk database.
    Embedded { path: PathBuf },

    /// Cluster of storage nodes, tried in order.
    Distributed {
        endpoints: Vec<String>,
        #[serde(default)]
        credentials: Option<Credentials>,
        #[serde(default = "default_cluster_timeout_ms")]
        timeout_ms: u64,
    },
}

impl BackendConfig {
    pub fn kind(&self) -> BackendKind {
        match self {
            BackendConfig::Embedded { .. } => BackendKind::Embedded,
            BackendConfig::Distributed { .. } => BackendKind::Distributed,
        }
    }

    /// Stable identity of the storage this config points at. Two configs
    /// with the same descriptor must never run two instances.
    pub fn descriptor(&self) -> String {
        match self {
            BackendConfig::Embedded { path } => format!("embedded:{}", resolve_path(path).display()),
            BackendConfig::Distributed { endpoints, .. } => {
                let mut sorted = endpoints.clone();
                sorted.sort();
                format!("distributed:{}", sorted.join(","))
            }
        }
    }

    /// Open (connect to) the configured backend.
    pub async fn open(&self, engine: &EngineConfig) -> Result<Arc<dyn Backend>> {
        match self {
            BackendConfig::Embedded { path } => {
                let backend = EmbeddedBackend::open(path.clone(), engine.conflict_retry).await?;
                Ok(Arc::new(backend))
            }
            BackendConfig::Distributed { endpoints, credentials, timeout_ms } => {
                let backend = DistributedBackend::connect(
                    endpoints.clone(),
                    credentials.clone(),
                    std::time::Duration::from_millis(*timeout_ms),
                    engine.conflict_retry,
                )?;
                Ok(Arc::new(backend))
            }
        }
    }
}

/// Canonical form of a path that may not exist yet: the nearest existing
/// ancestor is canonicalized and the missing tail appended, so the result
/// does not change once the directory is created.
fn resolve_path(path: &Path) -> PathBuf {
    let absolute = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());
    let mut existing = absolute.as_path();
    let mut missing = Vec::new();
    loop {
        if let Ok(real) = std::fs::canonicalize(existing) {
            return missing.iter().rev().fold(real, |acc, part| acc.join(part));
        }
        match (existing.parent(), existing.file_name()) {
            (Some(parent), Some(name)) => {
                missing.push(name.to_os_string());
                existing = parent;
            }
            _ => return absolute,
        }
    }
}

// ============================================================================
// Backend trait
// ============================================================================

/// The universal storage contract.
///
/// Implementors supply transactions and snapshot reads; the key-value
/// conveniences (`get`, `put`, `delete`, `scan`, `transact`) are provided on
/// top of them so both backends share the exact same semantics.
#[async_trait]
pub trait Backend: Send + Sync + 'static {
    fn kind(&self) -> BackendKind;

    fn isolation(&self) -> Isolation {
        Isolation::Snapshot
    }

    /// Policy `transact` uses for internal `Conflict` retries.
    fn conflict_policy(&self) -> RetryPolicy {
        RetryPolicy::conflicts()
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Verify the backend is reachable and serving.
    async fn handshake(&self) -> Result<()>;

    /// Flush pending writes and release the backend. Later calls fail with
    /// `Unavailable`.
    async fn shutdown(&self) -> Result<()>;

    // ========================================================================
    // Transactions
    // ========================================================================

    /// Begin a transaction pinned to the latest committed snapshot.
    async fn begin_tx(&self, mode: TxMode) -> Result<Txn>;

    /// Apply every staged write atomically, or fail with `Conflict` and
    /// apply nothing.
    async fn commit_tx(&self, tx: Txn) -> Result<CommitSeq>;

    async fn rollback_tx(&self, tx: Txn) -> Result<()>;

    /// Committed value as of the transaction's snapshot (staged writes ignored).
    async fn read_committed(&self, tx: &Txn, namespace: &str, key: &str) -> Result<Option<Record>>;

    /// Committed entries under `prefix` as of the snapshot, in key order.
    async fn scan_committed(
        &self,
        tx: &Txn,
        namespace: &str,
        prefix: &str,
    ) -> Result<Vec<(String, Record)>>;

    // ========================================================================
    // Transactional reads (snapshot + own writes)
    // ========================================================================

    async fn get_in(&self, tx: &Txn, namespace: &str, key: &str) -> Result<Option<Record>> {
        keys::validate_key(namespace, key)?;
        if let Some(staged) = tx.staged(namespace, key) {
            return Ok(staged.cloned());
        }
        self.read_committed(tx, namespace, key).await
    }

    async fn scan_in(&self, tx: &Txn, namespace: &str, prefix: &str) -> Result<Vec<(String, Record)>> {
        keys::validate_namespace(namespace)?;
        let mut merged: BTreeMap<String, Record> =
            self.scan_committed(tx, namespace, prefix).await?.into_iter().collect();
        for (key, staged) in tx.staged_prefix(namespace, prefix) {
            match staged {
                Some(v) => {
                    merged.insert(key.to_string(), v.clone());
                }
                None => {
                    merged.remove(key);
                }
            }
        }
        Ok(merged.into_iter().collect())
    }

    // ========================================================================
    // Auto-commit key-value operations
    // ========================================================================

    async fn get(&self, namespace: &str, key: &str) -> Result<Option<Record>> {
        let tx = self.begin_tx(TxMode::ReadOnly).await?;
        let out = self.get_in(&tx, namespace, key).await;
        self.rollback_tx(tx).await?;
        out
    }

    async fn scan(&self, namespace: &str, prefix: &str) -> Result<Vec<(String, Record)>> {
        let tx = self.begin_tx(TxMode::ReadOnly).await?;
        let out = self.scan_in(&tx, namespace, prefix).await;
        self.rollback_tx(tx).await?;
        out
    }

    async fn put(&self, namespace: &str, key: &str, value: Record) -> Result<CommitSeq> {
        self.transact(vec![WriteOp::Put {
            namespace: namespace.to_string(),
            key: key.to_string(),
            value,
        }])
        .await
    }

    async fn delete(&self, namespace: &str, key: &str) -> Result<CommitSeq> {
        self.transact(vec![WriteOp::Delete {
            namespace: namespace.to_string(),
            key: key.to_string(),
        }])
        .await
    }

    /// All-or-nothing batch. `Conflict` is retried internally per
    /// `conflict_policy` before it surfaces.
    async fn transact(&self, ops: Vec<WriteOp>) -> Result<CommitSeq> {
        let policy = self.conflict_policy();
        retry::on_conflict(&policy, "transact", || {
            let ops = ops.clone();
            async move {
                let mut tx = self.begin_tx(TxMode::ReadWrite).await?;
                if let Err(e) = tx.apply_ops(ops) {
                    self.rollback_tx(tx).await?;
                    return Err(e);
                }
                self.commit_tx(tx).await
            }
        })
        .await
    }
}
