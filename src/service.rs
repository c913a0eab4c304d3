//! Service interface.
//!
//! [`KnowledgeBase`] is one knowledge base (entity store, vector indexes,
//! query engine) over one backend. [`Request`] / [`Response`] are the
//! serde-tagged envelopes that carry every operation unchanged across the
//! service RPC, so a local and a remote instance answer identically.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::EngineConfig;
use crate::execution::{self, Hit, QueryResult};
use crate::graph::EntityStore;
use crate::ingest::{self, BulkRecord, BulkReport};
use crate::instance::InstanceStatus;
use crate::model::{CollectionConfig, Direction, Edge, EdgeKey, Metric, Node, NodeId};
use crate::planner::HybridQuery;
use crate::storage::Backend;
use crate::{Error, Result};

fn default_max_hops() -> usize {
    1
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    CreateCollection {
        name: String,
        dimension: usize,
        #[serde(default)]
        metric: Metric,
    },
    ListCollections,
    DropCollection {
        name: String,
    },
    UpsertNode {
        collection: String,
        node: Node,
    },
    UpsertEdge {
        collection: String,
        edge: Edge,
    },
    DeleteNode {
        collection: String,
        id: NodeId,
    },
    DeleteEdge {
        collection: String,
        key: EdgeKey,
    },
    GetNode {
        collection: String,
        id: NodeId,
    },
    NodesByPartition {
        collection: String,
        partition: String,
    },
    Neighbors {
        collection: String,
        node: NodeId,
        #[serde(default)]
        relation: Option<String>,
        #[serde(default)]
        direction: Direction,
        #[serde(default = "default_max_hops")]
        max_hops: usize,
    },
    Query {
        query: HybridQuery,
    },
    BulkLoad {
        collection: String,
        records: Vec<BulkRecord>,
    },
    RebuildIndex {
        collection: String,
    },
    Status,
}

impl Request {
    /// Whether the request mutates the knowledge base. Writes are the
    /// requests a degraded instance queues or rejects.
    pub fn is_write(&self) -> bool {
        matches!(
            self,
            Request::CreateCollection { .. }
                | Request::DropCollection { .. }
                | Request::UpsertNode { .. }
                | Request::UpsertEdge { .. }
                | Request::DeleteNode { .. }
                | Request::DeleteEdge { .. }
                | Request::BulkLoad { .. }
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            Request::CreateCollection { .. } => "create_collection",
            Request::ListCollections => "list_collections",
            Request::DropCollection { .. } => "drop_collection",
            Request::UpsertNode { .. } => "upsert_node",
            Request::UpsertEdge { .. } => "upsert_edge",
            Request::DeleteNode { .. } => "delete_node",
            Request::DeleteEdge { .. } => "delete_edge",
            Request::GetNode { .. } => "get_node",
            Request::NodesByPartition { .. } => "nodes_by_partition",
            Request::Neighbors { .. } => "neighbors",
            Request::Query { .. } => "query",
            Request::BulkLoad { .. } => "bulk_load",
            Request::RebuildIndex { .. } => "rebuild_index",
            Request::Status => "status",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum Response {
    Collection { config: CollectionConfig },
    Collections { collections: Vec<CollectionConfig> },
    Dropped { removed: usize },
    Node { node: Node },
    MaybeNode { node: Option<Node> },
    Nodes { nodes: Vec<Node> },
    Edge { edge: Edge },
    /// Node deleted along with `edges_removed` edges.
    NodeDeleted { edges_removed: usize },
    EdgeDeleted,
    Neighbors { hits: Vec<Hit> },
    Query {
        #[serde(rename = "query_result")]
        result: QueryResult,
    },
    BulkLoad { report: BulkReport },
    RebuildStarted { collection: String },
    Status { status: InstanceStatus },
    /// A degraded instance accepted the write for later; `depth` counts the
    /// writes waiting, this one included.
    Queued { depth: usize },
}

// ============================================================================
// KnowledgeBase
// ============================================================================

pub struct KnowledgeBase {
    store: EntityStore,
}

impl KnowledgeBase {
    pub async fn open(backend: Arc<dyn Backend>, config: EngineConfig) -> Result<Self> {
        let store = EntityStore::open(backend, config).await?;
        Ok(Self { store })
    }

    pub fn store(&self) -> &EntityStore {
        &self.store
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        self.store.backend()
    }

    pub async fn create_collection(&self, name: &str, dimension: usize, metric: Metric) -> Result<CollectionConfig> {
        self.store.create_collection(name, dimension, metric).await
    }

    pub async fn upsert_node(&self, collection: &str, node: Node) -> Result<Node> {
        self.store.upsert_node(collection, node).await
    }

    pub async fn upsert_edge(&self, collection: &str, edge: Edge) -> Result<Edge> {
        self.store.upsert_edge(collection, edge).await
    }

    pub async fn delete_node(&self, collection: &str, id: &NodeId) -> Result<usize> {
        self.store.delete_node(collection, id).await
    }

    pub async fn delete_edge(&self, collection: &str, key: &EdgeKey) -> Result<()> {
        self.store.delete_edge(collection, key).await
    }

    pub async fn query(&self, query: HybridQuery) -> Result<QueryResult> {
        self.query_with_cancel(query, &CancellationToken::new()).await
    }

    pub async fn query_with_cancel(&self, query: HybridQuery, cancel: &CancellationToken) -> Result<QueryResult> {
        execution::query(&self.store, query, cancel).await
    }

    pub async fn bulk_load(&self, collection: &str, records: &[BulkRecord]) -> Result<BulkReport> {
        ingest::bulk_load(&self.store, collection, records).await
    }

    /// Start a background rebuild of `collection`'s vector index. Searches
    /// keep serving the current generation until the swap.
    pub async fn rebuild_index(&self, collection: &str) -> Result<JoinHandle<Result<u64>>> {
        let handle = self.store.rebuild_index(collection).await?;
        info!(collection, "index rebuild started");
        Ok(handle)
    }

    async fn neighbors(
        &self,
        collection: &str,
        node: &NodeId,
        relation: Option<String>,
        direction: Direction,
        max_hops: usize,
    ) -> Result<Vec<Hit>> {
        let relations: Vec<String> = relation.into_iter().collect();
        let mut cursor = self
            .store
            .traverse(collection, std::slice::from_ref(node), &relations, direction, max_hops)
            .await?;
        let reached = cursor.try_collect().await;
        cursor.close().await?;
        Ok(reached?
            .into_iter()
            .map(|r| Hit { node: r.node, score: None, hops: r.hops, path: r.path })
            .collect())
    }

    /// Answer one request. `Status` belongs to the serving instance and is
    /// rejected here.
    pub async fn handle(&self, request: Request) -> Result<Response> {
        match request {
            Request::CreateCollection { name, dimension, metric } => {
                let config = self.create_collection(&name, dimension, metric).await?;
                Ok(Response::Collection { config })
            }
            Request::ListCollections => {
                Ok(Response::Collections { collections: self.store.list_collections().await? })
            }
            Request::DropCollection { name } => {
                Ok(Response::Dropped { removed: self.store.drop_collection(&name).await? })
            }
            Request::UpsertNode { collection, node } => {
                Ok(Response::Node { node: self.upsert_node(&collection, node).await? })
            }
            Request::UpsertEdge { collection, edge } => {
                Ok(Response::Edge { edge: self.upsert_edge(&collection, edge).await? })
            }
            Request::DeleteNode { collection, id } => {
                Ok(Response::NodeDeleted { edges_removed: self.delete_node(&collection, &id).await? })
            }
            Request::DeleteEdge { collection, key } => {
                self.delete_edge(&collection, &key).await?;
                Ok(Response::EdgeDeleted)
            }
            Request::GetNode { collection, id } => {
                Ok(Response::MaybeNode { node: self.store.get_node(&collection, &id).await? })
            }
            Request::NodesByPartition { collection, partition } => {
                Ok(Response::Nodes { nodes: self.store.nodes_by_partition(&collection, &partition).await? })
            }
            Request::Neighbors { collection, node, relation, direction, max_hops } => {
                let hits = self.neighbors(&collection, &node, relation, direction, max_hops).await?;
                Ok(Response::Neighbors { hits })
            }
            Request::Query { query } => Ok(Response::Query { result: self.query(query).await? }),
            Request::BulkLoad { collection, records } => {
                Ok(Response::BulkLoad { report: self.bulk_load(&collection, &records).await? })
            }
            Request::RebuildIndex { collection } => {
                // Detached: completion is observed through instance status.
                drop(self.rebuild_index(&collection).await?);
                Ok(Response::RebuildStarted { collection })
            }
            Request::Status => Err(Error::InvalidArgument("status is answered by the serving instance".into())),
        }
    }
}
