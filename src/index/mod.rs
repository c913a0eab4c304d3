//! Vector index.
//!
//! Exact nearest-neighbor search over an in-memory *generation* built from a
//! collection's `v/` keyspace. The live generation sits behind an `ArcSwap`:
//! searches load it once and keep using it even if a rebuild swaps in a new
//! one halfway through.
//!
//! Embeddings are persisted by the entity store in the same transaction as
//! the node write ([`stage`]); the index learns about them only after that
//! transaction commits ([`VectorIndex::apply`]), stamped with the commit
//! sequence. A generation built at snapshot `S` ignores changes at or below
//! `S`, and an entry ignores changes older than the one that produced it, so
//! late or reordered application never brings back a stale vector.
//! Removals leave a tombstone for that reason; tombstones no pending change
//! can still be ordered against are pruned ([`VectorIndex::prune_tombstones`]).

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use hashbrown::{HashMap, HashSet};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::model::{CollectionConfig, Metric, NodeId};
use crate::storage::Backend;
use crate::storage::keys::{VECTOR_PREFIX, id_from_key, vector_key};
use crate::tx::{CommitSeq, Txn, TxMode};
use crate::{Error, Result};

// ============================================================================
// Persisted form
// ============================================================================

/// Record stored under `v/{node}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorRecord {
    pub embedding: Vec<f32>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

/// Stage an embedding write (or removal, for `None`) into the transaction
/// that carries the node mutation.
pub fn stage(tx: &mut Txn, collection: &str, id: &NodeId, embedding: Option<&[f32]>) -> Result<()> {
    let key = vector_key(id);
    match embedding {
        Some(v) => {
            let record = VectorRecord { embedding: v.to_vec(), updated_at: Utc::now() };
            tx.put(collection, &key, serde_json::to_value(record)?)
        }
        None => tx.delete(collection, &key),
    }
}

/// A committed change to apply to the in-memory index.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorChange {
    pub id: NodeId,
    /// `None` removes the node from the index.
    pub embedding: Option<Arc<[f32]>>,
}

impl VectorChange {
    pub fn upsert(id: NodeId, embedding: &[f32]) -> Self {
        Self { id, embedding: Some(Arc::from(embedding)) }
    }

    pub fn remove(id: NodeId) -> Self {
        Self { id, embedding: None }
    }
}

// ============================================================================
// Generations
// ============================================================================

#[derive(Debug, Clone)]
struct Entry {
    seq: CommitSeq,
    /// `None` is a tombstone.
    vector: Option<Arc<[f32]>>,
}

/// One immutable-identity build of the index. Entries are updated in place
/// after commits; a rebuild replaces the whole generation.
pub struct IndexGeneration {
    number: u64,
    built_at: CommitSeq,
    entries: RwLock<HashMap<NodeId, Entry>>,
    /// Updated under the `entries` write lock.
    tombstones: AtomicUsize,
}

impl IndexGeneration {
    fn new(number: u64, built_at: CommitSeq) -> Self {
        Self { number, built_at, entries: RwLock::new(HashMap::new()), tombstones: AtomicUsize::new(0) }
    }

    pub fn number(&self) -> u64 {
        self.number
    }

    /// Snapshot this generation was built from.
    pub fn built_at(&self) -> CommitSeq {
        self.built_at
    }

    /// Live (non-tombstoned) entries.
    pub fn len(&self) -> usize {
        let entries = self.entries.read();
        entries.len() - self.tombstones.load(Ordering::Relaxed)
    }

    pub fn tombstones(&self) -> usize {
        self.tombstones.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, id: &NodeId) -> Option<Arc<[f32]>> {
        self.entries.read().get(id).and_then(|e| e.vector.clone())
    }

    fn apply(&self, seq: CommitSeq, change: &VectorChange) -> bool {
        if seq <= self.built_at {
            return false;
        }
        let mut entries = self.entries.write();
        let removes = change.embedding.is_none();
        match entries.get_mut(&change.id) {
            Some(entry) if entry.seq > seq => false,
            Some(entry) => {
                match (entry.vector.is_none(), removes) {
                    (false, true) => self.tombstones.fetch_add(1, Ordering::Relaxed),
                    (true, false) => self.tombstones.fetch_sub(1, Ordering::Relaxed),
                    _ => 0,
                };
                entry.seq = seq;
                entry.vector = change.embedding.clone();
                true
            }
            None => {
                if removes {
                    self.tombstones.fetch_add(1, Ordering::Relaxed);
                }
                entries.insert(change.id.clone(), Entry { seq, vector: change.embedding.clone() });
                true
            }
        }
    }

    /// Drop tombstones at or below `horizon`; `None` drops them all.
    fn prune(&self, horizon: Option<CommitSeq>) -> usize {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, e| e.vector.is_some() || horizon.is_some_and(|h| e.seq > h));
        let pruned = before - entries.len();
        self.tombstones.fetch_sub(pruned, Ordering::Relaxed);
        pruned
    }

    /// Copy out the entries to score, so scoring runs without the lock.
    fn live(&self, candidates: Option<&HashSet<NodeId>>) -> Vec<(NodeId, Arc<[f32]>)> {
        let entries = self.entries.read();
        let mut out: Vec<(NodeId, Arc<[f32]>)> = match candidates {
            Some(ids) => ids
                .iter()
                .filter_map(|id| entries.get(id).and_then(|e| e.vector.clone()).map(|v| (id.clone(), v)))
                .collect(),
            None => entries
                .iter()
                .filter_map(|(id, e)| e.vector.clone().map(|v| (id.clone(), v)))
                .collect(),
        };
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }
}

// ============================================================================
// VectorIndex
// ============================================================================

/// Restrictions applied during a search.
#[derive(Debug, Clone, Default)]
pub struct SearchFilter {
    /// Only score these nodes.
    pub candidates: Option<HashSet<NodeId>>,
    /// Minimum similarity (cosine, dot) or maximum distance (euclidean).
    pub threshold: Option<f32>,
}

impl SearchFilter {
    pub fn candidates(ids: impl IntoIterator<Item = NodeId>) -> Self {
        Self { candidates: Some(ids.into_iter().collect()), threshold: None }
    }

    pub fn with_threshold(mut self, threshold: f32) -> Self {
        self.threshold = Some(threshold);
        self
    }
}

/// Best first by the metric, ties by node id ascending.
pub fn rank_scored(scored: &mut [(NodeId, f32)], metric: Metric) {
    scored.sort_by(|a, b| metric.rank(a.1, b.1).then_with(|| a.0.cmp(&b.0)));
}

pub struct VectorIndex {
    config: CollectionConfig,
    batch_size: usize,
    current: ArcSwap<IndexGeneration>,
    /// `Some` while a rebuild runs: changes applied meanwhile, replayed into
    /// the new generation before it is swapped in.
    catch_up: Mutex<Option<Vec<(CommitSeq, VectorChange)>>>,
    generations: AtomicU64,
}

impl VectorIndex {
    /// An empty index for a collection created at `created_at`.
    pub fn empty(config: CollectionConfig, batch_size: usize, created_at: CommitSeq) -> Self {
        Self {
            config,
            batch_size: batch_size.max(1),
            current: ArcSwap::from_pointee(IndexGeneration::new(0, created_at)),
            catch_up: Mutex::new(None),
            generations: AtomicU64::new(0),
        }
    }

    /// Build the index from the collection's current committed state.
    pub async fn load(backend: &dyn Backend, config: CollectionConfig, batch_size: usize) -> Result<Self> {
        let generation = build_generation(backend, &config, 0).await?;
        debug!(collection = %config.name, vectors = generation.len(), "vector index loaded");
        let index = Self::empty(config, batch_size, generation.built_at);
        index.current.store(Arc::new(generation));
        Ok(index)
    }

    pub fn config(&self) -> &CollectionConfig {
        &self.config
    }

    /// The generation searches currently read.
    pub fn generation(&self) -> Arc<IndexGeneration> {
        self.current.load_full()
    }

    pub fn is_rebuilding(&self) -> bool {
        self.catch_up.lock().is_some()
    }

    /// Apply committed changes. Call only after the owning transaction
    /// committed at `seq`.
    pub fn apply(&self, seq: CommitSeq, changes: &[VectorChange]) {
        if changes.is_empty() {
            return;
        }
        // Held across the apply so a finishing rebuild can't swap between
        // buffering and applying.
        let mut pending = self.catch_up.lock();
        if let Some(buf) = pending.as_mut() {
            buf.extend(changes.iter().map(|c| (seq, c.clone())));
        }
        let generation = self.current.load();
        for change in changes {
            generation.apply(seq, change);
        }
    }

    /// Forget removals that no longer need to shadow a late change.
    ///
    /// `horizon` bounds the commits that may still be applied: every change
    /// not yet applied has a commit seq above it. `None` means nothing is
    /// pending. Returns the number of tombstones dropped.
    pub fn prune_tombstones(&self, horizon: Option<CommitSeq>) -> usize {
        let pruned = self.current.load().prune(horizon);
        if pruned > 0 {
            debug!(collection = %self.config.name, pruned, ?horizon, "index tombstones pruned");
        }
        pruned
    }

    /// The `k` best matches for `query`, best first.
    ///
    /// Scores in batches of the configured size and gives up with `Timeout`
    /// once `cancel` fires.
    pub async fn search(
        &self,
        query: &[f32],
        k: usize,
        filter: &SearchFilter,
        cancel: &CancellationToken,
    ) -> Result<Vec<(NodeId, f32)>> {
        self.config.check_vector(query)?;
        if k == 0 {
            return Ok(Vec::new());
        }
        let metric = self.config.metric;
        let generation = self.current.load_full();
        let entries = generation.live(filter.candidates.as_ref());

        let mut scored = Vec::new();
        for batch in entries.chunks(self.batch_size) {
            if cancel.is_cancelled() {
                return Err(Error::Timeout(format!(
                    "similarity search in '{}' cancelled",
                    self.config.name
                )));
            }
            for (id, vector) in batch {
                let score = metric.score(query, vector);
                if filter.threshold.is_none_or(|t| metric.passes(score, t)) {
                    scored.push((id.clone(), score));
                }
            }
            tokio::task::yield_now().await;
        }
        rank_scored(&mut scored, metric);
        scored.truncate(k);
        Ok(scored)
    }

    /// Score specific nodes without ranking or truncation.
    pub fn score_of(&self, query: &[f32], id: &NodeId) -> Option<f32> {
        self.current.load().get(id).map(|v| self.config.metric.score(query, &v))
    }

    /// Rebuild in the background. Searches keep reading the old generation
    /// until the new one is swapped in. Resolves to the new generation number.
    pub fn rebuild(self: &Arc<Self>, backend: Arc<dyn Backend>) -> Result<JoinHandle<Result<u64>>> {
        {
            let mut pending = self.catch_up.lock();
            if pending.is_some() {
                return Err(Error::Conflict(format!(
                    "index rebuild of '{}' already running",
                    self.config.name
                )));
            }
            *pending = Some(Vec::new());
        }
        let index = Arc::clone(self);
        Ok(tokio::spawn(async move {
            let number = index.generations.fetch_add(1, Ordering::Relaxed) + 1;
            info!(collection = %index.config.name, generation = number, "index rebuild started");
            let built = build_generation(backend.as_ref(), &index.config, number).await;
            index.finish_rebuild(built)
        }))
    }

    fn finish_rebuild(&self, built: Result<IndexGeneration>) -> Result<u64> {
        let mut pending = self.catch_up.lock();
        let buffered = pending.take().unwrap_or_default();
        match built {
            Ok(generation) => {
                for (seq, change) in &buffered {
                    generation.apply(*seq, change);
                }
                let number = generation.number;
                info!(
                    collection = %self.config.name,
                    generation = number,
                    vectors = generation.len(),
                    replayed = buffered.len(),
                    "index rebuild finished"
                );
                self.current.store(Arc::new(generation));
                Ok(number)
            }
            Err(e) => {
                warn!(collection = %self.config.name, error = %e, "index rebuild failed, keeping old generation");
                Err(e)
            }
        }
    }
}

/// Read every vector record of a collection at one snapshot.
async fn build_generation(backend: &dyn Backend, config: &CollectionConfig, number: u64) -> Result<IndexGeneration> {
    let tx = backend.begin_tx(TxMode::ReadOnly).await?;
    let rows = backend.scan_in(&tx, &config.name, VECTOR_PREFIX).await;
    let snapshot = tx.snapshot();
    backend.rollback_tx(tx).await?;

    let generation = IndexGeneration::new(number, snapshot);
    {
        let mut entries = generation.entries.write();
        for (key, value) in rows? {
            let Some(raw_id) = id_from_key(&key, VECTOR_PREFIX) else { continue };
            let id = NodeId::new(raw_id)?;
            let record: VectorRecord = serde_json::from_value(value)?;
            if let Err(e) = config.check_vector(&record.embedding) {
                warn!(collection = %config.name, node = %id, error = %e, "skipping malformed embedding");
                continue;
            }
            entries.insert(id, Entry { seq: snapshot, vector: Some(Arc::from(record.embedding)) });
        }
    }
    Ok(generation)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::EmbeddedBackend;
    use pretty_assertions::assert_eq;

    fn id(s: &str) -> NodeId {
        NodeId::new(s).unwrap()
    }

    fn index(metric: Metric) -> VectorIndex {
        VectorIndex::empty(CollectionConfig::new("docs", 2, metric).unwrap(), 2, 0)
    }

    #[tokio::test]
    async fn test_search_ranks_and_breaks_ties_by_id() {
        let idx = index(Metric::Cosine);
        idx.apply(1, &[
            VectorChange::upsert(id("c"), &[1.0, 0.0]),
            VectorChange::upsert(id("a"), &[2.0, 0.0]),
            VectorChange::upsert(id("b"), &[0.0, 1.0]),
        ]);
        let hits = idx.search(&[1.0, 0.0], 10, &SearchFilter::default(), &CancellationToken::new()).await.unwrap();
        let ids: Vec<&str> = hits.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(ids, vec!["a", "c", "b"]);
    }

    #[tokio::test]
    async fn test_euclidean_lower_is_better_with_threshold() {
        let idx = index(Metric::Euclidean);
        idx.apply(1, &[
            VectorChange::upsert(id("near"), &[0.0, 1.0]),
            VectorChange::upsert(id("far"), &[0.0, 5.0]),
        ]);
        let filter = SearchFilter::default().with_threshold(2.0);
        let hits = idx.search(&[0.0, 0.0], 10, &filter, &CancellationToken::new()).await.unwrap();
        assert_eq!(hits, vec![(id("near"), 1.0)]);
    }

    #[tokio::test]
    async fn test_candidate_filter() {
        let idx = index(Metric::Dot);
        idx.apply(1, &[
            VectorChange::upsert(id("a"), &[1.0, 0.0]),
            VectorChange::upsert(id("b"), &[3.0, 0.0]),
        ]);
        let filter = SearchFilter::candidates([id("a"), id("ghost")]);
        let hits = idx.search(&[1.0, 0.0], 5, &filter, &CancellationToken::new()).await.unwrap();
        assert_eq!(hits, vec![(id("a"), 1.0)]);
    }

    #[test]
    fn test_out_of_order_apply_keeps_newest() {
        let idx = index(Metric::Cosine);
        idx.apply(7, &[VectorChange::remove(id("x"))]);
        idx.apply(5, &[VectorChange::upsert(id("x"), &[1.0, 0.0])]);
        assert_eq!(idx.generation().get(&id("x")), None);

        idx.apply(9, &[VectorChange::upsert(id("y"), &[0.0, 1.0])]);
        idx.apply(8, &[VectorChange::upsert(id("y"), &[1.0, 0.0])]);
        assert_eq!(idx.generation().get(&id("y")).as_deref(), Some(&[0.0, 1.0][..]));
    }

    #[test]
    fn test_prune_tombstones_respects_horizon() {
        let idx = index(Metric::Cosine);
        idx.apply(3, &[VectorChange::upsert(id("a"), &[1.0, 0.0]), VectorChange::upsert(id("b"), &[0.0, 1.0])]);
        idx.apply(4, &[VectorChange::remove(id("a"))]);
        idx.apply(8, &[VectorChange::remove(id("b"))]);
        idx.apply(9, &[VectorChange::remove(id("ghost"))]);
        assert_eq!(idx.generation().tombstones(), 3);
        assert_eq!(idx.generation().len(), 0);

        // Changes above 5 may still arrive, so only the removal at 4 goes.
        assert_eq!(idx.prune_tombstones(Some(5)), 1);
        idx.apply(7, &[VectorChange::upsert(id("b"), &[1.0, 1.0])]);
        assert_eq!(idx.generation().get(&id("b")), None);

        assert_eq!(idx.prune_tombstones(None), 2);
        assert_eq!(idx.generation().tombstones(), 0);
        idx.apply(10, &[VectorChange::upsert(id("a"), &[1.0, 0.0])]);
        assert_eq!(idx.generation().len(), 1);
    }

    #[tokio::test]
    async fn test_wrong_dimension_query_rejected() {
        let idx = index(Metric::Cosine);
        let res = idx.search(&[1.0], 1, &SearchFilter::default(), &CancellationToken::new()).await;
        assert!(matches!(res, Err(Error::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn test_cancelled_search_times_out() {
        let idx = index(Metric::Cosine);
        idx.apply(1, &[VectorChange::upsert(id("a"), &[1.0, 0.0])]);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let res = idx.search(&[1.0, 0.0], 1, &SearchFilter::default(), &cancel).await;
        assert!(matches!(res, Err(Error::Timeout(_))));
    }

    #[tokio::test]
    async fn test_rebuild_swaps_generation() {
        let backend: Arc<dyn Backend> = Arc::new(EmbeddedBackend::in_memory().unwrap());
        let mut tx = backend.begin_tx(TxMode::ReadWrite).await.unwrap();
        stage(&mut tx, "docs", &id("a"), Some(&[1.0, 0.0])).unwrap();
        stage(&mut tx, "docs", &id("b"), Some(&[0.0, 1.0])).unwrap();
        backend.commit_tx(tx).await.unwrap();

        let idx = Arc::new(index(Metric::Cosine));
        assert!(idx.generation().is_empty());
        let handle = idx.rebuild(backend.clone()).unwrap();
        assert!(idx.is_rebuilding());
        assert!(matches!(idx.rebuild(backend.clone()), Err(Error::Conflict(_))));

        let number = handle.await.unwrap().unwrap();
        assert_eq!(number, 1);
        assert!(!idx.is_rebuilding());
        assert_eq!(idx.generation().len(), 2);
    }

    #[tokio::test]
    async fn test_load_reads_committed_vectors() {
        let backend = EmbeddedBackend::in_memory().unwrap();
        let mut tx = backend.begin_tx(TxMode::ReadWrite).await.unwrap();
        stage(&mut tx, "docs", &id("a"), Some(&[1.0, 0.0])).unwrap();
        let seq = backend.commit_tx(tx).await.unwrap();

        let cfg = CollectionConfig::new("docs", 2, Metric::Cosine).unwrap();
        let idx = VectorIndex::load(&backend, cfg, 16).await.unwrap();
        assert_eq!(idx.generation().built_at(), seq);
        // Already reflected in the build snapshot.
        idx.apply(seq, &[VectorChange::remove(id("a"))]);
        assert_eq!(idx.generation().len(), 1);
    }
}
