//! Query planner: turns a [`HybridQuery`] into a [`QueryPlan`].
//!
//! The planner is backend-agnostic. It validates the request against the
//! collection and the engine limits, then picks the cheaper-first strategy
//! from a size estimate the execution engine supplies.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::model::{validate_ident, CollectionConfig, Direction, Node, NodeId};
use crate::model::collection::validate_collection_name;
use crate::{Error, Result};

fn default_max_hops() -> usize {
    1
}

fn default_limit() -> usize {
    10
}

/// Graph constraint of a hybrid query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Traversal {
    /// Relation types to follow; empty follows every relation.
    #[serde(default)]
    pub relation_types: SmallVec<[String; 4]>,
    #[serde(default)]
    pub direction: Direction,
    #[serde(default = "default_max_hops")]
    pub max_hops: usize,
}

impl Default for Traversal {
    fn default() -> Self {
        Self { relation_types: SmallVec::new(), direction: Direction::Outbound, max_hops: default_max_hops() }
    }
}

impl Traversal {
    pub fn new(direction: Direction, max_hops: usize) -> Self {
        Self { direction, max_hops, ..Self::default() }
    }

    pub fn relation(mut self, relation: impl Into<String>) -> Self {
        self.relation_types.push(relation.into());
        self
    }
}

/// Vector constraint of a hybrid query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Similarity {
    pub vector: Vec<f32>,
    /// Keep at most this many matches.
    #[serde(default)]
    pub top_k: Option<usize>,
    /// Minimum similarity (cosine, dot) or maximum distance (euclidean).
    #[serde(default)]
    pub threshold: Option<f32>,
}

impl Similarity {
    pub fn new(vector: Vec<f32>) -> Self {
        Self { vector, top_k: None, threshold: None }
    }

    pub fn top_k(mut self, k: usize) -> Self {
        self.top_k = Some(k);
        self
    }

    pub fn threshold(mut self, threshold: f32) -> Self {
        self.threshold = Some(threshold);
        self
    }
}

/// Execution order of the graph and vector steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Materialize the traversal, then rank the candidates.
    TraverseThenRank,
    /// Rank the whole collection, then keep matches a reverse traversal
    /// connects to the start set.
    RankThenVerify,
    /// No start set: seed by similarity, then optionally expand.
    RankThenExpand,
}

/// A hybrid retrieval request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HybridQuery {
    pub collection: String,
    /// Starting node set; empty means vector-only.
    #[serde(default)]
    pub start: Vec<NodeId>,
    #[serde(default)]
    pub traversal: Option<Traversal>,
    #[serde(default)]
    pub similarity: Option<Similarity>,
    /// Keep only nodes carrying any of these type tags.
    #[serde(default)]
    pub labels: Vec<String>,
    /// Keep only nodes in this partition.
    #[serde(default)]
    pub partition: Option<String>,
    #[serde(default = "default_limit")]
    pub limit: usize,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// Force a strategy instead of letting the planner pick.
    #[serde(default)]
    pub strategy: Option<Strategy>,
}

impl HybridQuery {
    /// Start from explicit nodes.
    pub fn from_nodes(collection: impl Into<String>, start: impl IntoIterator<Item = NodeId>) -> Self {
        Self {
            collection: collection.into(),
            start: start.into_iter().collect(),
            traversal: None,
            similarity: None,
            labels: Vec::new(),
            partition: None,
            limit: default_limit(),
            timeout_ms: None,
            strategy: None,
        }
    }

    /// Vector-only entry point.
    pub fn similar_to(collection: impl Into<String>, vector: Vec<f32>) -> Self {
        Self::from_nodes(collection, []).rank_by(Similarity::new(vector))
    }

    pub fn traverse(mut self, traversal: Traversal) -> Self {
        self.traversal = Some(traversal);
        self
    }

    pub fn rank_by(mut self, similarity: Similarity) -> Self {
        self.similarity = Some(similarity);
        self
    }

    pub fn with_labels(mut self, labels: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.labels = labels.into_iter().map(Into::into).collect();
        self
    }

    pub fn in_partition(mut self, partition: impl Into<String>) -> Self {
        self.partition = Some(partition.into());
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn timeout_ms(mut self, ms: u64) -> Self {
        self.timeout_ms = Some(ms);
        self
    }

    pub fn strategy(mut self, strategy: Strategy) -> Self {
        self.strategy = Some(strategy);
        self
    }
}

/// Inputs to the size estimate.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Estimate {
    /// Mean degree of the start nodes in the traversal direction.
    pub mean_degree: f64,
    /// Vectors in the collection's index.
    pub indexed: usize,
}

impl Estimate {
    /// Expected traversal result size: `start · degree^hops`.
    pub fn traversal_size(&self, start: usize, hops: usize) -> f64 {
        let hops = i32::try_from(hops).unwrap_or(i32::MAX);
        start as f64 * self.mean_degree.max(1.0).powi(hops)
    }
}

/// A validated, request-scoped execution plan.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryPlan {
    pub strategy: Strategy,
    pub collection: String,
    pub start: Vec<NodeId>,
    pub traversal: Option<Traversal>,
    pub similarity: Option<Similarity>,
    pub labels: Vec<String>,
    pub partition: Option<String>,
    /// `min(top_k, limit)`.
    pub cap: usize,
    pub limit: usize,
    pub deadline: Duration,
    pub estimated_candidates: f64,
}

impl QueryPlan {
    pub fn max_hops(&self) -> usize {
        self.traversal.as_ref().map_or(0, |t| t.max_hops)
    }

    pub fn relations(&self) -> Vec<String> {
        self.traversal.as_ref().map(|t| t.relation_types.to_vec()).unwrap_or_default()
    }

    pub fn direction(&self) -> Direction {
        self.traversal.as_ref().map(|t| t.direction).unwrap_or_default()
    }

    /// Whether `node` passes the label and partition filters.
    pub fn keeps(&self, node: &Node) -> bool {
        let labelled = self.labels.is_empty() || self.labels.iter().any(|l| node.has_label(l));
        labelled && self.partition.as_deref().is_none_or(|p| node.in_partition(p))
    }
}

/// Check a request without touching storage.
pub fn validate(query: &HybridQuery, max_hops_ceiling: usize) -> Result<()> {
    validate_collection_name(&query.collection)?;
    if query.start.is_empty() && query.similarity.is_none() {
        return Err(Error::InvalidArgument(
            "a hybrid query needs a start set, a similarity clause, or both".into(),
        ));
    }
    if query.limit == 0 {
        return Err(Error::InvalidArgument("limit must be > 0".into()));
    }
    for id in &query.start {
        id.validate()?;
    }
    for label in &query.labels {
        validate_ident("label", label)?;
    }
    if let Some(partition) = &query.partition {
        validate_ident("partition", partition)?;
    }
    if let Some(t) = &query.traversal {
        if t.max_hops == 0 || t.max_hops > max_hops_ceiling {
            return Err(Error::InvalidArgument(format!(
                "max_hops {} outside 1..={max_hops_ceiling}",
                t.max_hops
            )));
        }
        for relation in &t.relation_types {
            validate_ident("relation", relation)?;
        }
    }
    if let Some(s) = &query.similarity {
        if s.top_k == Some(0) {
            return Err(Error::InvalidArgument("top_k must be > 0".into()));
        }
        if s.threshold.is_some_and(|t| !t.is_finite()) {
            return Err(Error::InvalidArgument("threshold must be finite".into()));
        }
    }
    Ok(())
}

/// Build the plan for `query` against `collection`.
pub fn plan(
    query: HybridQuery,
    collection: &CollectionConfig,
    estimate: Estimate,
    max_hops_ceiling: usize,
    default_timeout: Duration,
) -> Result<QueryPlan> {
    validate(&query, max_hops_ceiling)?;
    if let Some(s) = &query.similarity {
        collection.check_vector(&s.vector)?;
    }

    let hops = query.traversal.as_ref().map_or(0, |t| t.max_hops);
    let estimated = estimate.traversal_size(query.start.len(), hops);
    let strategy = match query.strategy {
        Some(forced) => check_forced(forced, &query)?,
        None if query.start.is_empty() => Strategy::RankThenExpand,
        None if query.similarity.is_some()
            && query.traversal.is_some()
            && estimated > estimate.indexed as f64 =>
        {
            Strategy::RankThenVerify
        }
        None => Strategy::TraverseThenRank,
    };

    let top_k = query.similarity.as_ref().and_then(|s| s.top_k).unwrap_or(usize::MAX);
    Ok(QueryPlan {
        strategy,
        cap: top_k.min(query.limit),
        limit: query.limit,
        deadline: query.timeout_ms.map_or(default_timeout, Duration::from_millis),
        estimated_candidates: estimated,
        collection: query.collection,
        start: query.start,
        traversal: query.traversal,
        similarity: query.similarity,
        labels: query.labels,
        partition: query.partition,
    })
}

fn check_forced(strategy: Strategy, query: &HybridQuery) -> Result<Strategy> {
    let ok = match strategy {
        Strategy::TraverseThenRank => !query.start.is_empty(),
        Strategy::RankThenVerify => {
            !query.start.is_empty() && query.similarity.is_some() && query.traversal.is_some()
        }
        Strategy::RankThenExpand => query.start.is_empty(),
    };
    if ok {
        Ok(strategy)
    } else {
        Err(Error::InvalidArgument(format!("strategy {strategy:?} does not fit this query")))
    }
}
