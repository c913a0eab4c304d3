//! Multi-version key space.
//!
//! Every committed write appends a version stamped with its commit sequence.
//! Readers see the newest version at or below their snapshot, so a long
//! traversal never observes a half-applied transaction and never blocks a
//! writer. Commits use first-committer-wins: a transaction whose written or
//! guarded keys changed after its snapshot fails with `Conflict`.
//!
//! Old versions are pruned on write once no pinned snapshot can see them.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};

use crate::storage::Record;
use crate::tx::CommitSeq;
use crate::{Error, Result};

#[derive(Debug, Clone)]
struct Version {
    seq: CommitSeq,
    /// `None` is a tombstone.
    value: Option<Record>,
}

struct Versions {
    seq: CommitSeq,
    map: BTreeMap<Vec<u8>, Vec<Version>>,
}

#[derive(Default)]
struct SnapshotRegistry {
    /// seq → number of local pins
    pinned: BTreeMap<CommitSeq, usize>,
    /// lease id → (seq, expiry)
    leases: HashMap<String, (CommitSeq, Instant)>,
}

impl SnapshotRegistry {
    fn oldest(&mut self) -> Option<CommitSeq> {
        let now = Instant::now();
        self.leases.retain(|_, (_, expiry)| *expiry > now);
        let lease_min = self.leases.values().map(|(seq, _)| *seq).min();
        let pin_min = self.pinned.keys().next().copied();
        match (lease_min, pin_min) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn unpin(&mut self, seq: CommitSeq) {
        if let Some(count) = self.pinned.get_mut(&seq) {
            *count -= 1;
            if *count == 0 {
                self.pinned.remove(&seq);
            }
        }
    }
}

/// Keeps a snapshot's versions alive until dropped.
pub struct SnapshotGuard {
    registry: Arc<Mutex<SnapshotRegistry>>,
    seq: CommitSeq,
}

impl SnapshotGuard {
    pub fn seq(&self) -> CommitSeq {
        self.seq
    }
}

impl Drop for SnapshotGuard {
    fn drop(&mut self) {
        self.registry.lock().unpin(self.seq);
    }
}

/// A staged write in physical (encoded) key form.
pub type RawWrite = (Vec<u8>, Option<Record>);

/// Reads promoted to conflict checks, in physical key form.
#[derive(Debug, Clone, Default)]
pub struct ReadGuards {
    /// Exact keys.
    pub keys: Vec<Vec<u8>>,
    /// Every key under these prefixes, including keys created after the snapshot.
    pub prefixes: Vec<Vec<u8>>,
}

impl ReadGuards {
    pub fn keys(keys: Vec<Vec<u8>>) -> Self {
        Self { keys, prefixes: Vec::new() }
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty() && self.prefixes.is_empty()
    }
}

pub struct VersionedStore {
    inner: RwLock<Versions>,
    snapshots: Arc<Mutex<SnapshotRegistry>>,
}

impl Default for VersionedStore {
    fn default() -> Self {
        Self::new()
    }
}

impl VersionedStore {
    pub fn new() -> Self {
        Self::from_entries(std::iter::empty())
    }

    /// Seed the store with already-durable records, visible at sequence 0.
    pub fn from_entries(entries: impl IntoIterator<Item = (Vec<u8>, Record)>) -> Self {
        let map = entries
            .into_iter()
            .map(|(k, v)| (k, vec![Version { seq: 0, value: Some(v) }]))
            .collect();
        Self {
            inner: RwLock::new(Versions { seq: 0, map }),
            snapshots: Arc::new(Mutex::new(SnapshotRegistry::default())),
        }
    }

    pub fn current_seq(&self) -> CommitSeq {
        self.inner.read().seq
    }

    /// Pin the latest snapshot.
    pub fn pin(&self) -> SnapshotGuard {
        // Holding the read lock keeps a commit from pruning between reading
        // the sequence and registering the pin.
        let inner = self.inner.read();
        let seq = inner.seq;
        *self.snapshots.lock().pinned.entry(seq).or_default() += 1;
        SnapshotGuard { registry: self.snapshots.clone(), seq }
    }

    /// Pin the latest snapshot under a named, expiring lease.
    pub fn lease(&self, ttl: Duration) -> (CommitSeq, String) {
        let inner = self.inner.read();
        let seq = inner.seq;
        let id = uuid::Uuid::new_v4().to_string();
        self.snapshots.lock().leases.insert(id.clone(), (seq, Instant::now() + ttl));
        (seq, id)
    }

    /// Extend a lease; fails once it has expired (its versions may be gone).
    pub fn renew_lease(&self, id: &str, ttl: Duration) -> Result<CommitSeq> {
        let mut reg = self.snapshots.lock();
        let now = Instant::now();
        match reg.leases.get_mut(id) {
            Some((seq, expiry)) if *expiry > now => {
                *expiry = now + ttl;
                Ok(*seq)
            }
            _ => {
                reg.leases.remove(id);
                Err(Error::Conflict(format!("snapshot lease {id} expired")))
            }
        }
    }

    pub fn release_lease(&self, id: &str) {
        self.snapshots.lock().leases.remove(id);
    }

    pub fn get(&self, at: CommitSeq, key: &[u8]) -> Option<Record> {
        let inner = self.inner.read();
        inner.map.get(key).and_then(|versions| visible(versions, at))
    }

    pub fn scan(&self, at: CommitSeq, prefix: &[u8]) -> Vec<(Vec<u8>, Record)> {
        let inner = self.inner.read();
        inner
            .map
            .range(prefix.to_vec()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .filter_map(|(k, versions)| visible(versions, at).map(|v| (k.clone(), v)))
            .collect()
    }

    /// Validate and apply a transaction atomically.
    ///
    /// `persist` runs under the commit lock after validation and before the
    /// versions become visible; an error from it aborts the commit.
    pub fn commit<F>(
        &self,
        snapshot: CommitSeq,
        writes: Vec<RawWrite>,
        guards: ReadGuards,
        persist: F,
    ) -> Result<CommitSeq>
    where
        F: FnOnce(CommitSeq, &[RawWrite]) -> Result<()>,
    {
        let mut inner = self.inner.write();

        let touched = writes.iter().map(|(k, _)| k).chain(guards.keys.iter());
        for key in touched {
            if let Some(latest) = inner.map.get(key).and_then(|v| v.last()) {
                if latest.seq > snapshot {
                    return Err(conflict(key, latest.seq, snapshot));
                }
            }
        }
        for prefix in &guards.prefixes {
            let changed = inner
                .map
                .range(prefix.clone()..)
                .take_while(|(k, _)| k.starts_with(prefix))
                .find_map(|(k, v)| v.last().filter(|latest| latest.seq > snapshot).map(|l| (k, l.seq)));
            if let Some((key, seq)) = changed {
                return Err(conflict(key, seq, snapshot));
            }
        }

        if writes.is_empty() {
            return Ok(inner.seq);
        }

        let seq = inner.seq + 1;
        persist(seq, &writes)?;

        let horizon = self.snapshots.lock().oldest().unwrap_or(seq);
        for (key, value) in writes {
            let versions = inner.map.entry(key.clone()).or_default();
            versions.push(Version { seq, value });
            prune(versions, horizon);
            if versions.is_empty() {
                inner.map.remove(&key);
            }
        }
        inner.seq = seq;
        Ok(seq)
    }

    /// Number of live keys at the latest sequence.
    pub fn len(&self) -> usize {
        let inner = self.inner.read();
        inner.map.values().filter(|v| v.last().is_some_and(|v| v.value.is_some())).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn conflict(key: &[u8], seq: CommitSeq, snapshot: CommitSeq) -> Error {
    Error::Conflict(format!(
        "key {} changed at seq {seq} after snapshot {snapshot}",
        String::from_utf8_lossy(key).replace('\0', "/"),
    ))
}

fn visible(versions: &[Version], at: CommitSeq) -> Option<Record> {
    versions
        .iter()
        .rev()
        .find(|v| v.seq <= at)
        .and_then(|v| v.value.clone())
}

/// Drop versions no snapshot at or above `horizon` can see.
fn prune(versions: &mut Vec<Version>, horizon: CommitSeq) {
    // Newest version at or below the horizon is still visible to the oldest
    // snapshot; everything before it is not.
    if let Some(pos) = versions.iter().rposition(|v| v.seq <= horizon) {
        versions.drain(..pos);
        if versions.len() == 1 && versions[0].value.is_none() {
            versions.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn put(key: &str, v: i64) -> RawWrite {
        (key.as_bytes().to_vec(), Some(json!(v)))
    }

    fn no_persist(_: CommitSeq, _: &[RawWrite]) -> Result<()> {
        Ok(())
    }

    #[test]
    fn test_snapshot_reads_ignore_later_commits() {
        let store = VersionedStore::new();
        store.commit(0, vec![put("k", 1)], ReadGuards::default(), no_persist).unwrap();
        let snap = store.pin();
        store.commit(1, vec![put("k", 2)], ReadGuards::default(), no_persist).unwrap();

        assert_eq!(store.get(snap.seq(), b"k"), Some(json!(1)));
        assert_eq!(store.get(store.current_seq(), b"k"), Some(json!(2)));
    }

    #[test]
    fn test_first_committer_wins() {
        let store = VersionedStore::new();
        let a = store.pin();
        let b = store.pin();
        store.commit(a.seq(), vec![put("k", 1)], ReadGuards::default(), no_persist).unwrap();
        let err = store.commit(b.seq(), vec![put("k", 2)], ReadGuards::default(), no_persist).unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
        assert_eq!(store.get(store.current_seq(), b"k"), Some(json!(1)));
    }

    #[test]
    fn test_guarded_key_conflicts() {
        let store = VersionedStore::new();
        let snap = store.pin();
        store.commit(snap.seq(), vec![put("node", 1)], ReadGuards::default(), no_persist).unwrap();
        let err = store
            .commit(snap.seq(), vec![put("edge", 1)], ReadGuards::keys(vec![b"node".to_vec()]), no_persist)
            .unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
    }

    #[test]
    fn test_prefix_guard_sees_new_keys() {
        let store = VersionedStore::new();
        let snap = store.pin();
        store.commit(snap.seq(), vec![put("i/b/knows/a", 1)], ReadGuards::default(), no_persist).unwrap();
        let guards = ReadGuards { keys: vec![], prefixes: vec![b"i/b/".to_vec()] };
        let err = store.commit(snap.seq(), vec![(b"n/b".to_vec(), None)], guards, no_persist).unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));

        let fresh = store.pin();
        let guards = ReadGuards { keys: vec![], prefixes: vec![b"i/c/".to_vec()] };
        assert!(store.commit(fresh.seq(), vec![(b"n/c".to_vec(), None)], guards, no_persist).is_ok());
    }

    #[test]
    fn test_failed_persist_applies_nothing() {
        let store = VersionedStore::new();
        let res = store.commit(0, vec![put("k", 1)], ReadGuards::default(), |_, _| {
            Err(Error::Storage("disk full".into()))
        });
        assert!(res.is_err());
        assert_eq!(store.current_seq(), 0);
        assert_eq!(store.get(0, b"k"), None);
    }

    #[test]
    fn test_prune_keeps_pinned_versions() {
        let store = VersionedStore::new();
        store.commit(0, vec![put("k", 1)], ReadGuards::default(), no_persist).unwrap();
        let snap = store.pin();
        for i in 2..10 {
            let seq = store.current_seq();
            store.commit(seq, vec![put("k", i)], ReadGuards::default(), no_persist).unwrap();
        }
        assert_eq!(store.get(snap.seq(), b"k"), Some(json!(1)));
        drop(snap);
        let seq = store.current_seq();
        store.commit(seq, vec![(b"k".to_vec(), None)], ReadGuards::default(), no_persist).unwrap();
        assert_eq!(store.get(store.current_seq(), b"k"), None);
        assert!(store.is_empty());
    }

    #[test]
    fn test_scan_prefix_at_snapshot() {
        let store = VersionedStore::new();
        store.commit(0, vec![put("a/1", 1), put("a/2", 2), put("b/1", 3)], ReadGuards::default(), no_persist).unwrap();
        let snap = store.pin();
        store.commit(1, vec![(b"a/1".to_vec(), None)], ReadGuards::default(), no_persist).unwrap();

        let old: Vec<_> = store.scan(snap.seq(), b"a/").into_iter().map(|(k, _)| k).collect();
        assert_eq!(old, vec![b"a/1".to_vec(), b"a/2".to_vec()]);
        assert_eq!(store.scan(store.current_seq(), b"a/").len(), 1);
    }

    #[test]
    fn test_expired_lease_cannot_renew() {
        let store = VersionedStore::new();
        let (_, id) = store.lease(Duration::from_millis(0));
        std::thread::sleep(Duration::from_millis(2));
        assert!(matches!(store.renew_lease(&id, Duration::from_secs(1)), Err(Error::Conflict(_))));
    }
}
