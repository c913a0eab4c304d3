//! Transaction management.
//!
//! A [`Txn`] pins a snapshot (commit sequence) at `begin_tx` and stages
//! writes locally until `commit_tx`. Both backends share this type so the
//! `Backend` trait stays object-safe.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::storage::keys::validate_key;
use crate::storage::mvcc::SnapshotGuard;
use crate::storage::Record;
use crate::{Error, Result};

/// Transaction mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxMode {
    ReadOnly,
    ReadWrite,
}

/// Opaque transaction identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TxId(pub u64);

impl std::fmt::Display for TxId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "tx{}", self.0)
    }
}

/// Commit sequence number. Monotonic per backend; a snapshot is the
/// sequence of the last commit it can see.
pub type CommitSeq = u64;

/// A key inside a namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TxKey {
    pub namespace: String,
    pub key: String,
}

impl TxKey {
    pub fn new(namespace: &str, key: &str) -> Result<Self> {
        validate_key(namespace, key)?;
        Ok(Self { namespace: namespace.to_string(), key: key.to_string() })
    }
}

/// One write of an all-or-nothing batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum WriteOp {
    Put { namespace: String, key: String, value: Record },
    Delete { namespace: String, key: String },
}

/// Snapshot pin held by a transaction.
pub(crate) enum SnapshotLease {
    /// Released when dropped.
    Local(SnapshotGuard),
    /// Server-side lease id; expires on its own if never released.
    Remote(String),
}

/// A transaction: snapshot + staged writes + guarded keys.
pub struct Txn {
    id: TxId,
    mode: TxMode,
    snapshot: CommitSeq,
    pub(crate) lease: Option<SnapshotLease>,
    writes: BTreeMap<TxKey, Option<Record>>,
    guards: BTreeSet<TxKey>,
    range_guards: BTreeSet<TxKey>,
}

impl Txn {
    pub(crate) fn new(id: TxId, mode: TxMode, snapshot: CommitSeq, lease: Option<SnapshotLease>) -> Self {
        Self {
            id,
            mode,
            snapshot,
            lease,
            writes: BTreeMap::new(),
            guards: BTreeSet::new(),
            range_guards: BTreeSet::new(),
        }
    }

    pub fn id(&self) -> TxId { self.id }
    pub fn mode(&self) -> TxMode { self.mode }
    pub fn snapshot(&self) -> CommitSeq { self.snapshot }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty() && self.guards.is_empty() && self.range_guards.is_empty()
    }

    fn writable(&self) -> Result<()> {
        match self.mode {
            TxMode::ReadWrite => Ok(()),
            TxMode::ReadOnly => Err(Error::InvalidArgument(format!("{} is read-only", self.id))),
        }
    }

    /// Stage a put.
    pub fn put(&mut self, namespace: &str, key: &str, value: Record) -> Result<()> {
        self.writable()?;
        self.writes.insert(TxKey::new(namespace, key)?, Some(value));
        Ok(())
    }

    /// Stage a delete.
    pub fn delete(&mut self, namespace: &str, key: &str) -> Result<()> {
        self.writable()?;
        self.writes.insert(TxKey::new(namespace, key)?, None);
        Ok(())
    }

    /// Treat a key that was only read as if it were written for conflict
    /// detection: commit fails if someone else committed it after our snapshot.
    pub fn guard(&mut self, namespace: &str, key: &str) -> Result<()> {
        self.writable()?;
        self.guards.insert(TxKey::new(namespace, key)?);
        Ok(())
    }

    /// Guard every key under `prefix`, including keys that did not exist at
    /// our snapshot. Used where a write must see every edge of a node.
    pub fn guard_prefix(&mut self, namespace: &str, prefix: &str) -> Result<()> {
        self.writable()?;
        self.range_guards.insert(TxKey::new(namespace, prefix)?);
        Ok(())
    }

    /// `Some(None)` = staged delete, `Some(Some(v))` = staged put, `None` = untouched.
    pub fn staged(&self, namespace: &str, key: &str) -> Option<Option<&Record>> {
        let k = TxKey { namespace: namespace.to_string(), key: key.to_string() };
        self.writes.get(&k).map(Option::as_ref)
    }

    /// Staged writes under a key prefix, in key order.
    pub fn staged_prefix<'a>(
        &'a self,
        namespace: &'a str,
        prefix: &'a str,
    ) -> impl Iterator<Item = (&'a str, Option<&'a Record>)> + 'a {
        self.writes
            .iter()
            .filter(move |(k, _)| k.namespace == namespace && k.key.starts_with(prefix))
            .map(|(k, v)| (k.key.as_str(), v.as_ref()))
    }

    pub fn writes(&self) -> impl Iterator<Item = (&TxKey, Option<&Record>)> {
        self.writes.iter().map(|(k, v)| (k, v.as_ref()))
    }

    pub fn guards(&self) -> impl Iterator<Item = &TxKey> {
        self.guards.iter()
    }

    pub fn range_guards(&self) -> impl Iterator<Item = &TxKey> {
        self.range_guards.iter()
    }

    pub fn write_count(&self) -> usize {
        self.writes.len()
    }

    /// Stage a batch of [`WriteOp`]s.
    pub fn apply_ops(&mut self, ops: impl IntoIterator<Item = WriteOp>) -> Result<()> {
        for op in ops {
            match op {
                WriteOp::Put { namespace, key, value } => self.put(&namespace, &key, value)?,
                WriteOp::Delete { namespace, key } => self.delete(&namespace, &key)?,
            }
        }
        Ok(())
    }

    /// Staged writes as wire ops, in key order.
    pub fn to_ops(&self) -> Vec<WriteOp> {
        self.writes
            .iter()
            .map(|(k, v)| match v {
                Some(value) => WriteOp::Put {
                    namespace: k.namespace.clone(),
                    key: k.key.clone(),
                    value: value.clone(),
                },
                None => WriteOp::Delete { namespace: k.namespace.clone(), key: k.key.clone() },
            })
            .collect()
    }
}

impl std::fmt::Debug for Txn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Txn")
            .field("id", &self.id)
            .field("mode", &self.mode)
            .field("snapshot", &self.snapshot)
            .field("writes", &self.writes.len())
            .field("guards", &self.guards.len())
            .field("range_guards", &self.range_guards.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_staging_overrides() {
        let mut tx = Txn::new(TxId(1), TxMode::ReadWrite, 0, None);
        tx.put("docs", "n/a", json!(1)).unwrap();
        tx.delete("docs", "n/a").unwrap();
        assert_eq!(tx.staged("docs", "n/a"), Some(None));
        assert_eq!(tx.staged("docs", "n/b"), None);
        assert_eq!(tx.write_count(), 1);
    }

    #[test]
    fn test_read_only_rejects_writes() {
        let mut tx = Txn::new(TxId(1), TxMode::ReadOnly, 0, None);
        assert!(matches!(tx.put("docs", "k", json!(1)), Err(Error::InvalidArgument(_))));
        assert!(tx.guard("docs", "k").is_err());
    }

    #[test]
    fn test_malformed_key_rejected() {
        let mut tx = Txn::new(TxId(1), TxMode::ReadWrite, 0, None);
        assert!(matches!(tx.put("docs", "", json!(1)), Err(Error::InvalidArgument(_))));
        assert!(tx.put("bad ns", "k", json!(1)).is_err());
        assert!(tx.put("docs", "a\0b", json!(1)).is_err());
    }

    #[test]
    fn test_staged_prefix_filters_namespace() {
        let mut tx = Txn::new(TxId(1), TxMode::ReadWrite, 0, None);
        tx.put("docs", "o/a/knows/b", json!(1)).unwrap();
        tx.put("docs", "o/b/knows/c", json!(2)).unwrap();
        tx.put("other", "o/a/knows/z", json!(3)).unwrap();
        let keys: Vec<_> = tx.staged_prefix("docs", "o/a/").map(|(k, _)| k.to_string()).collect();
        assert_eq!(keys, vec!["o/a/knows/b"]);
    }
}
