//! # Entity Store
//!
//! Typed graph primitives on top of the Backend Adapter. Every mutation is
//! one backend transaction; referential integrity is enforced at write time:
//!
//! - `create_edge` guards both endpoint node keys, so a concurrent
//!   `delete_node` of an endpoint conflicts instead of leaving a dangling edge.
//! - `delete_node` guards the node's adjacency prefixes, so an edge created
//!   concurrently conflicts instead of surviving the cascade.
//! - Node and edge writes guard the collection's catalog entry, so they
//!   conflict with a concurrent `drop_collection`.
//!
//! Embeddings are staged into the same transaction as the node write and
//! published to the collection's [`VectorIndex`] only after commit. A
//! commit published while the collection has no registered index is held
//! and replayed once one is registered. Until its changes are applied, a
//! commit holds back tombstone pruning in every index.

mod neighbors;

pub use neighbors::{Neighbors, Reached};

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use hashbrown::HashMap;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};

use crate::config::EngineConfig;
use crate::index::{self, VectorChange, VectorIndex, VectorRecord};
use crate::model::collection::validate_collection_name;
use crate::model::{validate_ident, CollectionConfig, Direction, Edge, EdgeKey, Metric, Node, NodeId};
use crate::storage::keys::{
    self, CATALOG, COLLECTION_PREFIX, IN_PREFIX, NODE_PREFIX, OUT_PREFIX, VECTOR_PREFIX,
};
use crate::storage::{retry, Backend, Record};
use crate::tx::{CommitSeq, Txn, TxMode};
use crate::{Error, Result};

pub(crate) fn decode_node(record: Record) -> Result<Node> {
    Ok(serde_json::from_value(record)?)
}

fn encode_node(node: &Node) -> Result<Record> {
    let mut stored = node.clone();
    stored.embedding = None;
    Ok(serde_json::to_value(stored)?)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WriteMode {
    Create,
    Update,
    Upsert,
}

// ============================================================================
// EntityStore
// ============================================================================

pub struct EntityStore {
    backend: Arc<dyn Backend>,
    config: EngineConfig,
    indexes: RwLock<HashMap<String, Arc<VectorIndex>>>,
    /// Changes published while their collection had no registered index.
    /// Only touched with `indexes` held.
    pending: Mutex<HashMap<String, Vec<(CommitSeq, Vec<VectorChange>)>>>,
    /// Commits (or, before commit, snapshots) whose vector changes are not
    /// applied yet, with a count per seq.
    unpublished: Mutex<BTreeMap<CommitSeq, usize>>,
}

/// A write whose vector changes are not applied yet. Holds back tombstone
/// pruning until dropped.
pub(crate) struct Unpublished<'a> {
    store: &'a EntityStore,
    seq: CommitSeq,
}

impl Drop for Unpublished<'_> {
    fn drop(&mut self) {
        let mut unpublished = self.store.unpublished.lock();
        if let Some(count) = unpublished.get_mut(&self.seq) {
            *count -= 1;
            if *count == 0 {
                unpublished.remove(&self.seq);
            }
        }
    }
}

impl EntityStore {
    /// Open the store and load the vector index of every existing collection.
    pub async fn open(backend: Arc<dyn Backend>, config: EngineConfig) -> Result<Self> {
        let store = Self {
            backend,
            config,
            indexes: RwLock::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            unpublished: Mutex::new(BTreeMap::new()),
        };
        for cfg in store.list_collections().await? {
            let name = cfg.name.clone();
            let index = VectorIndex::load(store.backend.as_ref(), cfg, store.config.search_batch_size).await?;
            store.register(&name, Arc::new(index));
        }
        info!(collections = store.indexes.read().len(), "entity store opened");
        Ok(store)
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The collection's vector index. Collections created behind this
    /// store's back (another process on a shared cluster) are loaded on
    /// first use.
    pub async fn index(&self, collection: &str) -> Result<Arc<VectorIndex>> {
        if let Some(index) = self.indexes.read().get(collection) {
            return Ok(index.clone());
        }
        let cfg = self.collection(collection).await?;
        let loaded = VectorIndex::load(self.backend.as_ref(), cfg, self.config.search_batch_size).await?;
        Ok(self.register(collection, Arc::new(loaded)))
    }

    /// Install `index` unless one is already registered, then replay what
    /// was published for the collection in the meantime. Changes the index
    /// already covers are ignored by its generation.
    fn register(&self, collection: &str, index: Arc<VectorIndex>) -> Arc<VectorIndex> {
        let mut indexes = self.indexes.write();
        let index = indexes.entry(collection.to_string()).or_insert(index).clone();
        if let Some(buffered) = self.pending.lock().remove(collection) {
            debug!(collection, commits = buffered.len(), "replaying vector changes into registered index");
            for (seq, changes) in buffered {
                index.apply(seq, &changes);
            }
        }
        index
    }

    /// Push committed embedding changes into the collection's index, or
    /// hold them until one is registered. Prunes tombstones once they
    /// outnumber live vectors.
    pub(crate) fn publish(&self, collection: &str, commit: Unpublished<'_>, changes: &[VectorChange]) {
        let indexes = self.indexes.read();
        let Some(index) = indexes.get(collection) else {
            if !changes.is_empty() {
                self.pending.lock().entry(collection.to_string()).or_default().push((commit.seq, changes.to_vec()));
            }
            return;
        };
        index.apply(commit.seq, changes);
        drop(commit);

        let generation = index.generation();
        let tombstones = generation.tombstones();
        if tombstones > 0 && tombstones >= generation.len() {
            index.prune_tombstones(self.publish_horizon());
        }
    }

    /// Every change still to be applied commits above this seq; `None` when
    /// nothing is pending.
    fn publish_horizon(&self) -> Option<CommitSeq> {
        self.unpublished.lock().keys().next().copied()
    }

    fn hold(&self, seq: CommitSeq) -> Unpublished<'_> {
        *self.unpublished.lock().entry(seq).or_default() += 1;
        Unpublished { store: self, seq }
    }

    /// Commit a staged transaction, or roll it back if staging failed.
    pub(crate) async fn finish<T>(&self, tx: Txn, staged: Result<T>) -> Result<(T, CommitSeq)> {
        match staged {
            Ok(out) => {
                let seq = self.backend.commit_tx(tx).await?;
                Ok((out, seq))
            }
            Err(e) => {
                if let Err(rollback) = self.backend.rollback_tx(tx).await {
                    debug!(error = %rollback, "rollback after failed write");
                }
                Err(e)
            }
        }
    }

    async fn read_tx(&self) -> Result<Txn> {
        self.backend.begin_tx(TxMode::ReadOnly).await
    }

    async fn collection_in(&self, tx: &Txn, name: &str) -> Result<CollectionConfig> {
        validate_collection_name(name)?;
        match self.backend.get_in(tx, CATALOG, &keys::collection_key(name)).await? {
            Some(record) => Ok(serde_json::from_value(record)?),
            None => Err(Error::NotFound(format!("collection '{name}'"))),
        }
    }

    /// Collection lookup for a write: also guards the catalog entry.
    async fn collection_for_write(&self, tx: &mut Txn, name: &str) -> Result<CollectionConfig> {
        let cfg = self.collection_in(tx, name).await?;
        tx.guard(CATALOG, &keys::collection_key(name))?;
        Ok(cfg)
    }

    async fn node_exists(&self, tx: &Txn, collection: &str, id: &NodeId) -> Result<bool> {
        Ok(self.backend.get_in(tx, collection, &keys::node_key(id)).await?.is_some())
    }

    /// [`finish`](Self::finish) for a write whose vector changes go to
    /// [`publish`](Self::publish) next. The write counts as unpublished from
    /// before its commit until the returned handle is published or dropped.
    pub(crate) async fn finish_published<T>(&self, tx: Txn, staged: Result<T>) -> Result<(T, Unpublished<'_>)> {
        let before_commit = self.hold(tx.snapshot());
        let (out, seq) = self.finish(tx, staged).await?;
        let committed = self.hold(seq);
        drop(before_commit);
        Ok((out, committed))
    }

    // ========================================================================
    // Collections
    // ========================================================================

    pub async fn create_collection(&self, name: &str, dimension: usize, metric: Metric) -> Result<CollectionConfig> {
        let cfg = CollectionConfig::new(name, dimension, metric)?;
        let (cfg, seq) = retry::on_conflict(&self.config.conflict_retry, "create_collection", || {
            let cfg = cfg.clone();
            async move {
                let mut tx = self.backend.begin_tx(TxMode::ReadWrite).await?;
                let staged = self.stage_collection(&mut tx, cfg).await;
                self.finish(tx, staged).await
            }
        })
        .await?;
        self.register(&cfg.name, Arc::new(VectorIndex::empty(cfg.clone(), self.config.search_batch_size, seq)));
        info!(collection = %cfg.name, dimension = cfg.dimension, metric = ?cfg.metric, "collection created");
        Ok(cfg)
    }

    async fn stage_collection(&self, tx: &mut Txn, cfg: CollectionConfig) -> Result<CollectionConfig> {
        let key = keys::collection_key(&cfg.name);
        if self.backend.get_in(tx, CATALOG, &key).await?.is_some() {
            return Err(Error::InvalidArgument(format!("collection '{}' already exists", cfg.name)));
        }
        tx.put(CATALOG, &key, serde_json::to_value(&cfg)?)?;
        Ok(cfg)
    }

    pub async fn collection(&self, name: &str) -> Result<CollectionConfig> {
        let tx = self.read_tx().await?;
        let out = self.collection_in(&tx, name).await;
        self.backend.rollback_tx(tx).await?;
        out
    }

    pub async fn list_collections(&self) -> Result<Vec<CollectionConfig>> {
        self.backend
            .scan(CATALOG, COLLECTION_PREFIX)
            .await?
            .into_iter()
            .map(|(_, record)| Ok(serde_json::from_value(record)?))
            .collect()
    }

    /// Remove a collection and everything in it. Returns the number of
    /// records removed (catalog entry excluded).
    pub async fn drop_collection(&self, name: &str) -> Result<usize> {
        let (removed, _) = retry::on_conflict(&self.config.conflict_retry, "drop_collection", || async move {
            let mut tx = self.backend.begin_tx(TxMode::ReadWrite).await?;
            let staged = self.stage_drop_collection(&mut tx, name).await;
            self.finish(tx, staged).await
        })
        .await?;
        {
            let mut indexes = self.indexes.write();
            indexes.remove(name);
            self.pending.lock().remove(name);
        }
        info!(collection = name, removed, "collection dropped");
        Ok(removed)
    }

    async fn stage_drop_collection(&self, tx: &mut Txn, name: &str) -> Result<usize> {
        self.collection_in(tx, name).await?;
        let mut removed = 0;
        for prefix in [NODE_PREFIX, VECTOR_PREFIX, OUT_PREFIX, IN_PREFIX] {
            tx.guard_prefix(name, prefix)?;
            for (key, _) in self.backend.scan_in(tx, name, prefix).await? {
                tx.delete(name, &key)?;
                removed += 1;
            }
        }
        tx.delete(CATALOG, &keys::collection_key(name))?;
        Ok(removed)
    }

    // ========================================================================
    // Nodes
    // ========================================================================

    /// Create a node. Fails with `InvalidArgument` if the id is taken.
    pub async fn create_node(&self, collection: &str, node: Node) -> Result<Node> {
        self.write_node(collection, node, WriteMode::Create).await
    }

    /// Replace labels and properties of an existing node (`NotFound` if
    /// absent). A node without an embedding keeps its stored one.
    pub async fn update_node(&self, collection: &str, node: Node) -> Result<Node> {
        self.write_node(collection, node, WriteMode::Update).await
    }

    pub async fn upsert_node(&self, collection: &str, node: Node) -> Result<Node> {
        self.write_node(collection, node, WriteMode::Upsert).await
    }

    async fn write_node(&self, collection: &str, node: Node, mode: WriteMode) -> Result<Node> {
        let node = &node;
        self.index(collection).await?;
        let ((stored, changes), commit) = retry::on_conflict(&self.config.conflict_retry, "write_node", move || async move {
            let mut tx = self.backend.begin_tx(TxMode::ReadWrite).await?;
            let staged = self.stage_node(&mut tx, collection, node, mode).await;
            self.finish_published(tx, staged).await
        })
        .await?;
        self.publish(collection, commit, &changes);
        Ok(stored)
    }

    pub(crate) async fn stage_node(
        &self,
        tx: &mut Txn,
        collection: &str,
        node: &Node,
        mode: WriteMode,
    ) -> Result<(Node, Vec<VectorChange>)> {
        let cfg = self.collection_for_write(tx, collection).await?;
        node.id.validate()?;
        for label in &node.labels {
            validate_ident("label", label)?;
        }
        if let Some(partition) = &node.partition {
            validate_ident("partition", partition)?;
        }
        if let Some(embedding) = &node.embedding {
            cfg.check_vector(embedding)?;
        }

        let key = keys::node_key(&node.id);
        let existing = match self.backend.get_in(tx, collection, &key).await? {
            Some(record) => Some(decode_node(record)?),
            None => None,
        };
        match (mode, &existing) {
            (WriteMode::Create, Some(_)) => {
                return Err(Error::InvalidArgument(format!(
                    "node '{}' already exists in '{collection}'",
                    node.id
                )));
            }
            (WriteMode::Update, None) => {
                return Err(Error::NotFound(format!("node '{}' in '{collection}'", node.id)));
            }
            _ => {}
        }

        let now = Utc::now();
        let mut stored = node.clone();
        stored.created_at = existing.as_ref().map_or(now, |n| n.created_at);
        stored.updated_at = now;
        tx.put(collection, &key, encode_node(&stored)?)?;

        let mut changes = Vec::new();
        if let Some(embedding) = &stored.embedding {
            index::stage(tx, collection, &stored.id, Some(embedding))?;
            changes.push(VectorChange::upsert(stored.id.clone(), embedding));
        }
        Ok((stored, changes))
    }

    /// Remove a node's embedding, keeping the node.
    pub async fn clear_embedding(&self, collection: &str, id: &NodeId) -> Result<()> {
        self.index(collection).await?;
        let ((), commit) = retry::on_conflict(&self.config.conflict_retry, "clear_embedding", || async move {
            let mut tx = self.backend.begin_tx(TxMode::ReadWrite).await?;
            let staged = self.stage_clear_embedding(&mut tx, collection, id).await;
            self.finish_published(tx, staged).await
        })
        .await?;
        self.publish(collection, commit, &[VectorChange::remove(id.clone())]);
        Ok(())
    }

    async fn stage_clear_embedding(&self, tx: &mut Txn, collection: &str, id: &NodeId) -> Result<()> {
        self.collection_for_write(tx, collection).await?;
        if !self.node_exists(tx, collection, id).await? {
            return Err(Error::NotFound(format!("node '{id}' in '{collection}'")));
        }
        tx.guard(collection, &keys::node_key(id))?;
        index::stage(tx, collection, id, None)
    }

    /// Delete a node and every edge touching it, atomically. Only direct
    /// edges are removed; neighbors are untouched. Returns the number of
    /// edges removed.
    pub async fn delete_node(&self, collection: &str, id: &NodeId) -> Result<usize> {
        self.index(collection).await?;
        let (removed, commit) = retry::on_conflict(&self.config.conflict_retry, "delete_node", || async move {
            let mut tx = self.backend.begin_tx(TxMode::ReadWrite).await?;
            let staged = self.stage_delete_node(&mut tx, collection, id).await;
            self.finish_published(tx, staged).await
        })
        .await?;
        self.publish(collection, commit, &[VectorChange::remove(id.clone())]);
        debug!(collection, node = %id, edges = removed, "node deleted");
        Ok(removed)
    }

    async fn stage_delete_node(&self, tx: &mut Txn, collection: &str, id: &NodeId) -> Result<usize> {
        self.collection_for_write(tx, collection).await?;
        let key = keys::node_key(id);
        if self.backend.get_in(tx, collection, &key).await?.is_none() {
            return Err(Error::NotFound(format!("node '{id}' in '{collection}'")));
        }

        let mut removed = 0;
        for prefix in keys::adjacency_prefixes(id, None, Direction::Both) {
            tx.guard_prefix(collection, &prefix)?;
            for (adjacency, record) in self.backend.scan_in(tx, collection, &prefix).await? {
                let edge: Edge = serde_json::from_value(record)?;
                let edge_key = edge.key();
                tx.delete(collection, &adjacency)?;
                // Remove the mirror entry on the other endpoint.
                let mirror = if adjacency.starts_with(OUT_PREFIX) {
                    keys::in_key(&edge_key)
                } else {
                    keys::out_key(&edge_key)
                };
                // Staged deletes hide the mirror from the inbound scan, so a
                // self-loop is counted once.
                tx.delete(collection, &mirror)?;
                removed += 1;
            }
        }
        tx.delete(collection, &key)?;
        index::stage(tx, collection, id, None)?;
        Ok(removed)
    }

    /// A node with its embedding, as of the latest snapshot.
    pub async fn get_node(&self, collection: &str, id: &NodeId) -> Result<Option<Node>> {
        let tx = self.read_tx().await?;
        let out = self.get_node_in(&tx, collection, id).await;
        self.backend.rollback_tx(tx).await?;
        out
    }

    async fn get_node_in(&self, tx: &Txn, collection: &str, id: &NodeId) -> Result<Option<Node>> {
        self.collection_in(tx, collection).await?;
        let Some(record) = self.backend.get_in(tx, collection, &keys::node_key(id)).await? else {
            return Ok(None);
        };
        let mut node = decode_node(record)?;
        if let Some(vector) = self.backend.get_in(tx, collection, &keys::vector_key(id)).await? {
            let vector: VectorRecord = serde_json::from_value(vector)?;
            node.embedding = Some(vector.embedding);
        }
        Ok(Some(node))
    }

    /// Nodes carrying `label`, in id order (embeddings not loaded).
    pub async fn nodes_by_label(&self, collection: &str, label: &str) -> Result<Vec<Node>> {
        self.scan_nodes(collection, |node| node.has_label(label)).await
    }

    /// Nodes in `partition`, in id order (embeddings not loaded).
    pub async fn nodes_by_partition(&self, collection: &str, partition: &str) -> Result<Vec<Node>> {
        validate_ident("partition", partition)?;
        self.scan_nodes(collection, |node| node.in_partition(partition)).await
    }

    async fn scan_nodes(&self, collection: &str, keep: impl Fn(&Node) -> bool) -> Result<Vec<Node>> {
        let tx = self.read_tx().await?;
        let out: Result<Vec<Node>> = async {
            self.collection_in(&tx, collection).await?;
            let mut nodes = Vec::new();
            for (_, record) in self.backend.scan_in(&tx, collection, NODE_PREFIX).await? {
                let node = decode_node(record)?;
                if keep(&node) {
                    nodes.push(node);
                }
            }
            Ok(nodes)
        }
        .await;
        self.backend.rollback_tx(tx).await?;
        out
    }

    // ========================================================================
    // Edges
    // ========================================================================

    /// Create an edge. `NotFound` if an endpoint is absent, `InvalidArgument`
    /// if the edge already exists.
    pub async fn create_edge(&self, collection: &str, edge: Edge) -> Result<Edge> {
        self.write_edge(collection, edge, WriteMode::Create).await
    }

    /// Create or replace an edge's weight and properties.
    pub async fn upsert_edge(&self, collection: &str, edge: Edge) -> Result<Edge> {
        self.write_edge(collection, edge, WriteMode::Upsert).await
    }

    async fn write_edge(&self, collection: &str, edge: Edge, mode: WriteMode) -> Result<Edge> {
        let edge = &edge;
        let (stored, _) = retry::on_conflict(&self.config.conflict_retry, "write_edge", move || async move {
            let mut tx = self.backend.begin_tx(TxMode::ReadWrite).await?;
            let staged = self.stage_edge(&mut tx, collection, edge, mode).await;
            self.finish(tx, staged).await
        })
        .await?;
        Ok(stored)
    }

    pub(crate) async fn stage_edge(&self, tx: &mut Txn, collection: &str, edge: &Edge, mode: WriteMode) -> Result<Edge> {
        self.collection_for_write(tx, collection).await?;
        let key = edge.key();
        key.validate()?;
        if !edge.weight.is_finite() {
            return Err(Error::InvalidArgument(format!("edge {key} has a non-finite weight")));
        }
        if let Some(partition) = &edge.partition {
            validate_ident("partition", partition)?;
        }
        for endpoint in [&key.source, &key.target] {
            if !self.node_exists(tx, collection, endpoint).await? {
                return Err(Error::NotFound(format!(
                    "edge endpoint '{endpoint}' in '{collection}'"
                )));
            }
            tx.guard(collection, &keys::node_key(endpoint))?;
        }

        let out = keys::out_key(&key);
        if mode == WriteMode::Create && self.backend.get_in(tx, collection, &out).await?.is_some() {
            return Err(Error::InvalidArgument(format!("edge {key} already exists in '{collection}'")));
        }
        let record = serde_json::to_value(edge)?;
        tx.put(collection, &out, record.clone())?;
        tx.put(collection, &keys::in_key(&key), record)?;
        Ok(edge.clone())
    }

    pub async fn delete_edge(&self, collection: &str, key: &EdgeKey) -> Result<()> {
        retry::on_conflict(&self.config.conflict_retry, "delete_edge", || async move {
            let mut tx = self.backend.begin_tx(TxMode::ReadWrite).await?;
            let staged = self.stage_delete_edge(&mut tx, collection, key).await;
            self.finish(tx, staged).await
        })
        .await?;
        Ok(())
    }

    async fn stage_delete_edge(&self, tx: &mut Txn, collection: &str, key: &EdgeKey) -> Result<()> {
        self.collection_for_write(tx, collection).await?;
        key.validate()?;
        let out = keys::out_key(key);
        if self.backend.get_in(tx, collection, &out).await?.is_none() {
            return Err(Error::NotFound(format!("edge {key} in '{collection}'")));
        }
        tx.delete(collection, &out)?;
        tx.delete(collection, &keys::in_key(key))
    }

    pub async fn get_edge(&self, collection: &str, key: &EdgeKey) -> Result<Option<Edge>> {
        key.validate()?;
        let tx = self.read_tx().await?;
        let out: Result<Option<Edge>> = async {
            self.collection_in(&tx, collection).await?;
            match self.backend.get_in(&tx, collection, &keys::out_key(key)).await? {
                Some(record) => Ok(Some(serde_json::from_value(record)?)),
                None => Ok(None),
            }
        }
        .await;
        self.backend.rollback_tx(tx).await?;
        out
    }

    /// Edges touching `node` on the given side(s), outbound first, each in
    /// key order.
    pub async fn edges_of(&self, collection: &str, node: &NodeId, direction: Direction) -> Result<Vec<Edge>> {
        let tx = self.read_tx().await?;
        let out: Result<Vec<Edge>> = async {
            self.collection_in(&tx, collection).await?;
            let mut edges = Vec::new();
            for prefix in keys::adjacency_prefixes(node, None, direction) {
                for (_, record) in self.backend.scan_in(&tx, collection, &prefix).await? {
                    edges.push(serde_json::from_value(record)?);
                }
            }
            Ok(edges)
        }
        .await;
        self.backend.rollback_tx(tx).await?;
        out
    }

    // ========================================================================
    // Traversal
    // ========================================================================

    /// Direct neighbors of `node`, optionally restricted to one relation type.
    pub async fn neighbors(
        &self,
        collection: &str,
        node: &NodeId,
        relation: Option<&str>,
        direction: Direction,
    ) -> Result<Neighbors> {
        let relations: Vec<String> = relation.into_iter().map(str::to_string).collect();
        self.traverse(collection, std::slice::from_ref(node), &relations, direction, 1).await
    }

    /// Direct neighbors of `node` that stay inside `partition`: both the
    /// connecting edge and the neighbor must carry it. Ordered by neighbor
    /// id, then relation.
    pub async fn neighbors_in_partition(
        &self,
        collection: &str,
        node: &NodeId,
        partition: &str,
        direction: Direction,
    ) -> Result<Vec<(Edge, Node)>> {
        validate_ident("partition", partition)?;
        let tx = self.read_tx().await?;
        let out: Result<Vec<(Edge, Node)>> = async {
            self.check_start(&tx, collection, std::slice::from_ref(node)).await?;
            let mut out = Vec::new();
            for prefix in keys::adjacency_prefixes(node, None, direction) {
                for (_, record) in self.backend.scan_in(&tx, collection, &prefix).await? {
                    let edge: Edge = serde_json::from_value(record)?;
                    if !edge.in_partition(partition) {
                        continue;
                    }
                    let Some(other) = edge.other_node(node).cloned() else { continue };
                    let Some(record) = self.backend.get_in(&tx, collection, &keys::node_key(&other)).await? else {
                        continue;
                    };
                    let neighbor = decode_node(record)?;
                    if neighbor.in_partition(partition) {
                        out.push((edge, neighbor));
                    }
                }
            }
            out.sort_by(|a, b| a.1.id.cmp(&b.1.id).then_with(|| a.0.relation.cmp(&b.0.relation)));
            Ok(out)
        }
        .await;
        self.backend.rollback_tx(tx).await?;
        out
    }

    /// Nodes within `max_hops` of any start node. Unknown start nodes are
    /// `NotFound`; `max_hops` outside `1..=max_hops_ceiling` is
    /// `InvalidArgument`.
    pub async fn traverse(
        &self,
        collection: &str,
        start: &[NodeId],
        relations: &[String],
        direction: Direction,
        max_hops: usize,
    ) -> Result<Neighbors> {
        if max_hops == 0 || max_hops > self.config.max_hops_ceiling {
            return Err(Error::InvalidArgument(format!(
                "max_hops {max_hops} outside 1..={}",
                self.config.max_hops_ceiling
            )));
        }
        for relation in relations {
            validate_ident("relation", relation)?;
        }
        let tx = self.read_tx().await?;
        if let Err(e) = self.check_start(&tx, collection, start).await {
            self.backend.rollback_tx(tx).await?;
            return Err(e);
        }
        Ok(Neighbors::new(
            self.backend.clone(),
            tx,
            collection.to_string(),
            start.to_vec(),
            relations.to_vec(),
            direction,
            max_hops,
        ))
    }

    async fn check_start(&self, tx: &Txn, collection: &str, start: &[NodeId]) -> Result<()> {
        self.collection_in(tx, collection).await?;
        for id in start {
            if !self.node_exists(tx, collection, id).await? {
                return Err(Error::NotFound(format!("node '{id}' in '{collection}'")));
            }
        }
        Ok(())
    }

    /// Average number of edges per start node in `direction`.
    pub async fn mean_degree(&self, collection: &str, start: &[NodeId], direction: Direction) -> Result<f64> {
        if start.is_empty() {
            return Ok(0.0);
        }
        let mut total = 0usize;
        for id in start {
            total += self.edges_of(collection, id, direction).await?.len();
        }
        Ok(total as f64 / start.len() as f64)
    }

    // ========================================================================
    // Index maintenance
    // ========================================================================

    /// Start a background rebuild of a collection's vector index.
    pub async fn rebuild_index(&self, collection: &str) -> Result<tokio::task::JoinHandle<Result<u64>>> {
        let index = self.index(collection).await?;
        index.rebuild(self.backend.clone())
    }

    /// Collections whose index is being rebuilt.
    pub fn rebuilding(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .indexes
            .read()
            .iter()
            .filter(|(_, index)| index.is_rebuilding())
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }
}
