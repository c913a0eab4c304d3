//! Lazy breadth-first neighbor cursor.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use hashbrown::HashSet;
use tokio_util::sync::CancellationToken;

use super::decode_node;
use crate::model::{Direction, Edge, Node, NodeId, Path};
use crate::storage::Backend;
use crate::storage::keys::{adjacency_prefixes, node_key, parse_adjacency};
use crate::tx::Txn;
use crate::{Error, Result};

/// A node reached by a traversal.
#[derive(Debug, Clone, PartialEq)]
pub struct Reached {
    /// Node record as of the cursor's snapshot (embedding not loaded).
    pub node: Node,
    pub hops: usize,
    /// From one of the start nodes to `node`.
    pub path: Path,
}

/// Yields the nodes reachable from a start set, one hop level at a time,
/// ordered by hop distance then node id. Each node is yielded once, at its
/// shortest distance; start nodes are never yielded.
///
/// The cursor reads one snapshot for its whole life, so a rewind replays
/// exactly the same sequence. Nothing is read until `next` is called, and
/// each call expands at most one more level.
pub struct Neighbors {
    backend: Arc<dyn Backend>,
    tx: Option<Txn>,
    collection: String,
    start: Vec<NodeId>,
    relations: Vec<String>,
    direction: Direction,
    max_hops: usize,
    cancel: Option<CancellationToken>,

    visited: HashSet<NodeId>,
    frontier: Vec<(NodeId, Path)>,
    ready: VecDeque<Reached>,
    depth: usize,
}

impl Neighbors {
    pub(crate) fn new(
        backend: Arc<dyn Backend>,
        tx: Txn,
        collection: String,
        mut start: Vec<NodeId>,
        relations: Vec<String>,
        direction: Direction,
        max_hops: usize,
    ) -> Self {
        start.sort();
        start.dedup();
        let mut cursor = Self {
            backend,
            tx: Some(tx),
            collection,
            start,
            relations,
            direction,
            max_hops,
            cancel: None,
            visited: HashSet::new(),
            frontier: Vec::new(),
            ready: VecDeque::new(),
            depth: 0,
        };
        cursor.rewind();
        cursor
    }

    /// Stop with `Timeout` at the next traversal step once `token` fires.
    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn max_hops(&self) -> usize {
        self.max_hops
    }

    /// Restart from the start set on the same snapshot.
    pub fn rewind(&mut self) {
        self.visited = self.start.iter().cloned().collect();
        self.frontier = self.start.iter().map(|id| (id.clone(), Path::single(id.clone()))).collect();
        self.ready.clear();
        self.depth = 0;
    }

    /// Start over from another start set and direction, still on the same
    /// snapshot. The new start nodes are not checked for existence.
    pub(crate) fn restart(&mut self, mut start: Vec<NodeId>, direction: Direction) {
        start.sort();
        start.dedup();
        self.start = start;
        self.direction = direction;
        self.rewind();
    }

    /// A node record as of the cursor's snapshot (embedding not loaded).
    pub(crate) async fn node(&self, id: &NodeId) -> Result<Option<Node>> {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| Error::InvalidArgument("neighbor cursor already closed".into()))?;
        match self.backend.get_in(tx, &self.collection, &node_key(id)).await? {
            Some(record) => Ok(Some(decode_node(record)?)),
            None => Ok(None),
        }
    }

    pub async fn next(&mut self) -> Result<Option<Reached>> {
        loop {
            if let Some(reached) = self.ready.pop_front() {
                return Ok(Some(reached));
            }
            if self.depth >= self.max_hops || self.frontier.is_empty() {
                return Ok(None);
            }
            self.expand_level().await?;
        }
    }

    /// Drain the rest of the cursor.
    pub async fn try_collect(&mut self) -> Result<Vec<Reached>> {
        let mut out = Vec::new();
        while let Some(reached) = self.next().await? {
            out.push(reached);
        }
        Ok(out)
    }

    /// Drain the rest of the cursor, keeping only the nodes.
    pub async fn nodes(&mut self) -> Result<Vec<Node>> {
        Ok(self.try_collect().await?.into_iter().map(|r| r.node).collect())
    }

    /// Release the snapshot now instead of on drop.
    pub async fn close(mut self) -> Result<()> {
        match self.tx.take() {
            Some(tx) => self.backend.rollback_tx(tx).await,
            None => Ok(()),
        }
    }

    fn check_cancelled(&self) -> Result<()> {
        match &self.cancel {
            Some(token) if token.is_cancelled() => {
                Err(Error::Timeout(format!("traversal in '{}' cancelled", self.collection)))
            }
            _ => Ok(()),
        }
    }

    async fn expand_level(&mut self) -> Result<()> {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| Error::InvalidArgument("neighbor cursor already closed".into()))?;
        self.depth += 1;

        // BTreeMap: next level in id order; the first path found wins, and
        // frontier plus adjacency keys are both scanned in order.
        let mut next: BTreeMap<NodeId, Path> = BTreeMap::new();
        for (node, path) in &self.frontier {
            for prefix in self.prefixes(node) {
                self.check_cancelled()?;
                for (key, value) in self.backend.scan_in(tx, &self.collection, &prefix).await? {
                    let Some((_, _, other)) = parse_adjacency(&key) else { continue };
                    let other = NodeId::new(other)?;
                    if self.visited.contains(&other) || next.contains_key(&other) {
                        continue;
                    }
                    let edge: Edge = serde_json::from_value(value)?;
                    let mut extended = path.clone();
                    extended.append(edge, other.clone());
                    next.insert(other, extended);
                }
            }
        }

        self.frontier.clear();
        for (id, path) in next {
            self.check_cancelled()?;
            self.visited.insert(id.clone());
            if let Some(record) = self.backend.get_in(tx, &self.collection, &node_key(&id)).await? {
                self.ready.push_back(Reached { node: decode_node(record)?, hops: self.depth, path: path.clone() });
            }
            self.frontier.push((id, path));
        }
        Ok(())
    }

    fn prefixes(&self, node: &NodeId) -> Vec<String> {
        if self.relations.is_empty() {
            adjacency_prefixes(node, None, self.direction)
        } else {
            self.relations
                .iter()
                .flat_map(|rel| adjacency_prefixes(node, Some(rel), self.direction))
                .collect()
        }
    }
}

impl std::fmt::Debug for Neighbors {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Neighbors")
            .field("collection", &self.collection)
            .field("start", &self.start)
            .field("relations", &self.relations)
            .field("direction", &self.direction)
            .field("max_hops", &self.max_hops)
            .field("depth", &self.depth)
            .finish()
    }
}
