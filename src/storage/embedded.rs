//! Embedded storage backend.
//!
//! A single-process backend persisted to a local `sled` database. The whole
//! key space is loaded into a [`VersionedStore`] at open; every commit is
//! written to sled as one atomic batch before its versions become visible.
//!
//! The same type backs a storage node: `server::storage_router` serves it
//! over HTTP through the lease/read/commit methods at the bottom of this file.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info};

use super::keys::{decode, encode, validate_key, validate_namespace};
use super::mvcc::{RawWrite, ReadGuards, VersionedStore};
use super::{Backend, BackendKind, Record};
use crate::config::RetryPolicy;
use crate::tx::{CommitSeq, SnapshotLease, Txn, TxId, TxKey, TxMode, WriteOp};
use crate::{Error, Result};

impl From<sled::Error> for Error {
    fn from(e: sled::Error) -> Self {
        Error::Storage(format!("sled: {e}"))
    }
}

// ============================================================================
// EmbeddedBackend
// ============================================================================

pub struct EmbeddedBackend {
    inner: Arc<EmbeddedInner>,
}

struct EmbeddedInner {
    db: sled::Db,
    store: VersionedStore,
    path: Option<PathBuf>,
    policy: RetryPolicy,
    next_tx_id: AtomicU64,
    closed: AtomicBool,
}

impl EmbeddedBackend {
    /// Open (or create) the database at `path` and load it.
    pub async fn open(path: impl Into<PathBuf>, policy: RetryPolicy) -> Result<Self> {
        let path = path.into();
        let db_path = path.clone();
        let (db, store) = tokio::task::spawn_blocking(move || -> Result<_> {
            let db = sled::open(&db_path)?;
            let store = load(&db)?;
            Ok((db, store))
        })
        .await
        .map_err(|e| Error::Storage(format!("open task failed: {e}")))??;

        info!(path = %path.display(), keys = store.len(), "embedded backend opened");
        Ok(Self::from_parts(db, store, Some(path), policy))
    }

    /// A throwaway database that is removed on drop.
    pub fn in_memory() -> Result<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Ok(Self::from_parts(db, VersionedStore::new(), None, RetryPolicy::conflicts()))
    }

    fn from_parts(db: sled::Db, store: VersionedStore, path: Option<PathBuf>, policy: RetryPolicy) -> Self {
        Self {
            inner: Arc::new(EmbeddedInner {
                db,
                store,
                path,
                policy,
                next_tx_id: AtomicU64::new(1),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.inner.path.as_deref()
    }

    /// Latest committed sequence.
    pub fn current_seq(&self) -> CommitSeq {
        self.inner.store.current_seq()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.inner.closed.load(Ordering::Acquire) {
            Err(Error::Unavailable("embedded backend is shut down".into()))
        } else {
            Ok(())
        }
    }

    fn next_id(&self) -> TxId {
        TxId(self.inner.next_tx_id.fetch_add(1, Ordering::Relaxed))
    }

    fn read_at(&self, at: CommitSeq, namespace: &str, key: &str) -> Result<Option<Record>> {
        self.ensure_open()?;
        validate_key(namespace, key)?;
        Ok(self.inner.store.get(at, &encode(namespace, key)))
    }

    fn scan_at(&self, at: CommitSeq, namespace: &str, prefix: &str) -> Result<Vec<(String, Record)>> {
        self.ensure_open()?;
        validate_namespace(namespace)?;
        self.inner
            .store
            .scan(at, &encode(namespace, prefix))
            .into_iter()
            .map(|(raw, value)| decode(&raw).map(|(_, key)| (key, value)))
            .collect()
    }

    /// Validate, persist and publish a write set taken at `snapshot`.
    fn commit_at(&self, snapshot: CommitSeq, writes: Vec<RawWrite>, guards: ReadGuards) -> Result<CommitSeq> {
        self.ensure_open()?;
        let db = &self.inner.db;
        let res = self.inner.store.commit(snapshot, writes, guards, |_, writes| {
            let mut batch = sled::Batch::default();
            for (key, value) in writes {
                match value {
                    Some(v) => batch.insert(key.as_slice(), serde_json::to_vec(v)?),
                    None => batch.remove(key.as_slice()),
                }
            }
            db.apply_batch(batch)?;
            Ok(())
        });
        if let Err(Error::Conflict(reason)) = &res {
            debug!(snapshot, %reason, "commit conflict");
        }
        res
    }

    // ========================================================================
    // Storage-node surface (leases instead of in-process snapshot guards)
    // ========================================================================

    /// Pin the latest snapshot under an expiring lease.
    pub fn open_lease(&self, ttl: Duration) -> Result<(CommitSeq, String)> {
        self.ensure_open()?;
        Ok(self.inner.store.lease(ttl))
    }

    /// Read under a lease, extending it. An expired lease is `Conflict`:
    /// the caller's snapshot may already be pruned.
    pub fn leased_get(&self, lease: &str, ttl: Duration, namespace: &str, key: &str) -> Result<Option<Record>> {
        let seq = self.inner.store.renew_lease(lease, ttl)?;
        self.read_at(seq, namespace, key)
    }

    pub fn leased_scan(
        &self,
        lease: &str,
        ttl: Duration,
        namespace: &str,
        prefix: &str,
    ) -> Result<Vec<(String, Record)>> {
        let seq = self.inner.store.renew_lease(lease, ttl)?;
        self.scan_at(seq, namespace, prefix)
    }

    /// Commit writes staged remotely against `snapshot`, then release the
    /// lease. The lease must still be live: it keeps the versions the
    /// conflict check needs.
    pub fn commit_ops(
        &self,
        lease: &str,
        ttl: Duration,
        snapshot: CommitSeq,
        ops: Vec<WriteOp>,
        guards: Vec<TxKey>,
        range_guards: Vec<TxKey>,
    ) -> Result<CommitSeq> {
        let leased = self.inner.store.renew_lease(lease, ttl)?;
        if leased != snapshot {
            return Err(Error::InvalidArgument(format!(
                "lease {lease} is for snapshot {leased}, not {snapshot}"
            )));
        }
        let res = self.commit_leased(snapshot, ops, guards, range_guards);
        self.inner.store.release_lease(lease);
        res
    }

    fn commit_leased(
        &self,
        snapshot: CommitSeq,
        ops: Vec<WriteOp>,
        guards: Vec<TxKey>,
        range_guards: Vec<TxKey>,
    ) -> Result<CommitSeq> {
        let mut writes = Vec::with_capacity(ops.len());
        for op in ops {
            match op {
                WriteOp::Put { namespace, key, value } => {
                    validate_key(&namespace, &key)?;
                    writes.push((encode(&namespace, &key), Some(value)));
                }
                WriteOp::Delete { namespace, key } => {
                    validate_key(&namespace, &key)?;
                    writes.push((encode(&namespace, &key), None));
                }
            }
        }
        let mut raw = ReadGuards::default();
        for g in guards {
            validate_key(&g.namespace, &g.key)?;
            raw.keys.push(encode(&g.namespace, &g.key));
        }
        for g in range_guards {
            validate_key(&g.namespace, &g.key)?;
            raw.prefixes.push(encode(&g.namespace, &g.key));
        }
        self.commit_at(snapshot, writes, raw)
    }

    pub fn release_lease(&self, lease: &str) {
        self.inner.store.release_lease(lease);
    }
}

/// Read every persisted record into a fresh versioned store.
fn load(db: &sled::Db) -> Result<VersionedStore> {
    let mut entries = Vec::new();
    for item in db.iter() {
        let (key, value) = item?;
        entries.push((key.to_vec(), serde_json::from_slice::<Record>(&value)?));
    }
    Ok(VersionedStore::from_entries(entries))
}

// ============================================================================
// Backend impl
// ============================================================================

#[async_trait]
impl Backend for EmbeddedBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Embedded
    }

    fn conflict_policy(&self) -> RetryPolicy {
        self.inner.policy
    }

    async fn handshake(&self) -> Result<()> {
        self.ensure_open()
    }

    async fn shutdown(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.inner.db.flush_async().await?;
        info!(path = ?self.inner.path, seq = self.current_seq(), "embedded backend closed");
        Ok(())
    }

    async fn begin_tx(&self, mode: TxMode) -> Result<Txn> {
        self.ensure_open()?;
        let guard = self.inner.store.pin();
        let snapshot = guard.seq();
        Ok(Txn::new(self.next_id(), mode, snapshot, Some(SnapshotLease::Local(guard))))
    }

    async fn commit_tx(&self, tx: Txn) -> Result<CommitSeq> {
        if tx.mode() == TxMode::ReadOnly || tx.is_empty() {
            return Ok(tx.snapshot());
        }
        let writes = tx
            .writes()
            .map(|(k, v)| (encode(&k.namespace, &k.key), v.cloned()))
            .collect();
        let guards = ReadGuards {
            keys: tx.guards().map(|k| encode(&k.namespace, &k.key)).collect(),
            prefixes: tx.range_guards().map(|k| encode(&k.namespace, &k.key)).collect(),
        };
        self.commit_at(tx.snapshot(), writes, guards)
    }

    async fn rollback_tx(&self, _tx: Txn) -> Result<()> {
        Ok(())
    }

    async fn read_committed(&self, tx: &Txn, namespace: &str, key: &str) -> Result<Option<Record>> {
        self.read_at(tx.snapshot(), namespace, key)
    }

    async fn scan_committed(&self, tx: &Txn, namespace: &str, prefix: &str) -> Result<Vec<(String, Record)>> {
        self.scan_at(tx.snapshot(), namespace, prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[tokio::test]
    async fn test_put_get_scan() {
        let b = EmbeddedBackend::in_memory().unwrap();
        b.put("docs", "n/a", json!({"x": 1})).await.unwrap();
        b.put("docs", "n/b", json!({"x": 2})).await.unwrap();
        b.put("other", "n/c", json!({"x": 3})).await.unwrap();

        assert_eq!(b.get("docs", "n/a").await.unwrap(), Some(json!({"x": 1})));
        let keys: Vec<String> = b.scan("docs", "n/").await.unwrap().into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["n/a".to_string(), "n/b".to_string()]);

        b.delete("docs", "n/a").await.unwrap();
        assert_eq!(b.get("docs", "n/a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_transaction_reads_own_writes() {
        let b = EmbeddedBackend::in_memory().unwrap();
        b.put("docs", "n/a", json!(1)).await.unwrap();

        let mut tx = b.begin_tx(TxMode::ReadWrite).await.unwrap();
        tx.put("docs", "n/b", json!(2)).unwrap();
        tx.delete("docs", "n/a").unwrap();
        let seen: Vec<String> = b.scan_in(&tx, "docs", "n/").await.unwrap().into_iter().map(|(k, _)| k).collect();
        assert_eq!(seen, vec!["n/b".to_string()]);
        // Not visible outside until commit.
        assert_eq!(b.get("docs", "n/b").await.unwrap(), None);

        b.commit_tx(tx).await.unwrap();
        assert_eq!(b.get("docs", "n/b").await.unwrap(), Some(json!(2)));
    }

    #[tokio::test]
    async fn test_concurrent_commit_conflicts() {
        let b = EmbeddedBackend::in_memory().unwrap();
        let mut t1 = b.begin_tx(TxMode::ReadWrite).await.unwrap();
        let mut t2 = b.begin_tx(TxMode::ReadWrite).await.unwrap();
        t1.put("docs", "n/a", json!(1)).unwrap();
        t2.put("docs", "n/a", json!(2)).unwrap();
        b.commit_tx(t1).await.unwrap();
        assert!(matches!(b.commit_tx(t2).await, Err(Error::Conflict(_))));
        assert_eq!(b.get("docs", "n/a").await.unwrap(), Some(json!(1)));
    }

    #[tokio::test]
    async fn test_rollback_discards() {
        let b = EmbeddedBackend::in_memory().unwrap();
        let mut tx = b.begin_tx(TxMode::ReadWrite).await.unwrap();
        tx.put("docs", "n/a", json!(1)).unwrap();
        b.rollback_tx(tx).await.unwrap();
        assert_eq!(b.get("docs", "n/a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_malformed_key_is_invalid_argument() {
        let b = EmbeddedBackend::in_memory().unwrap();
        assert!(matches!(b.put("docs", "", json!(1)).await, Err(Error::InvalidArgument(_))));
        assert!(matches!(b.get("bad ns", "k").await, Err(Error::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn test_reopen_restores_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db");
        {
            let b = EmbeddedBackend::open(&path, RetryPolicy::conflicts()).await.unwrap();
            b.transact(vec![
                WriteOp::Put { namespace: "docs".into(), key: "n/a".into(), value: json!("a") },
                WriteOp::Put { namespace: "docs".into(), key: "n/b".into(), value: json!("b") },
            ])
            .await
            .unwrap();
            b.delete("docs", "n/b").await.unwrap();
            b.shutdown().await.unwrap();
        }
        let b = EmbeddedBackend::open(&path, RetryPolicy::conflicts()).await.unwrap();
        assert_eq!(b.get("docs", "n/a").await.unwrap(), Some(json!("a")));
        assert_eq!(b.get("docs", "n/b").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_closed_backend_is_unavailable() {
        let b = EmbeddedBackend::in_memory().unwrap();
        b.shutdown().await.unwrap();
        assert!(matches!(b.handshake().await, Err(Error::Unavailable(_))));
        assert!(matches!(b.get("docs", "k").await, Err(Error::Unavailable(_))));
    }

    #[tokio::test]
    async fn test_lease_surface() {
        let b = EmbeddedBackend::in_memory().unwrap();
        b.put("docs", "n/a", json!(1)).await.unwrap();
        let ttl = Duration::from_secs(5);
        let (snap, lease) = b.open_lease(ttl).unwrap();
        b.put("docs", "n/a", json!(2)).await.unwrap();

        assert_eq!(b.leased_get(&lease, ttl, "docs", "n/a").unwrap(), Some(json!(1)));
        let ops = vec![WriteOp::Put { namespace: "docs".into(), key: "n/a".into(), value: json!(3) }];
        assert!(matches!(b.commit_ops(&lease, ttl, snap, ops, vec![], vec![]), Err(Error::Conflict(_))));
        // Released after the commit attempt.
        assert!(matches!(b.leased_get(&lease, ttl, "docs", "n/a"), Err(Error::Conflict(_))));
    }
}
