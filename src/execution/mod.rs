//! Hybrid Query Engine.
//!
//! Executes a [`QueryPlan`] against an [`EntityStore`] and its vector
//! indexes. The whole run races the plan's deadline; when it expires the
//! cancellation token fires and the call fails with `Timeout`. Traversal
//! steps and similarity batches both check the token, so no work outlives
//! the request.

use std::future::Future;
use std::time::{Duration, Instant};

use hashbrown::{HashMap, HashSet};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::graph::{EntityStore, Neighbors, Reached};
use crate::index::{SearchFilter, VectorIndex};
use crate::model::{Metric, Node, NodeId, Path};
use crate::planner::{self, Estimate, HybridQuery, QueryPlan, Similarity, Strategy};
use crate::{Error, Result};

/// One ranked result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hit {
    /// Node record (embedding not included).
    pub node: Node,
    /// Similarity (or distance, for euclidean); `None` when the query has
    /// no similarity clause or the node has no embedding.
    pub score: Option<f32>,
    pub hops: usize,
    /// Route from a start (or seed) node to `node`.
    pub path: Path,
}

/// Execution statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionStats {
    pub candidates: usize,
    pub scored: usize,
    pub verified: usize,
    pub execution_time_ms: u64,
}

/// Query execution result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    pub strategy: Strategy,
    pub hits: Vec<Hit>,
    pub stats: ExecutionStats,
}

impl QueryResult {
    pub fn ids(&self) -> Vec<&NodeId> {
        self.hits.iter().map(|h| &h.node.id).collect()
    }
}

/// Plan and run a hybrid query.
///
/// The deadline starts before the collection lookup, so planning on a slow
/// backend counts against it too. `cancel` lets the caller abort early; it
/// is never fired by the engine itself (a child token is used internally).
pub async fn query(store: &EntityStore, query: HybridQuery, cancel: &CancellationToken) -> Result<QueryResult> {
    let config = store.config();
    planner::validate(&query, config.max_hops_ceiling)?;
    let started = Instant::now();
    let deadline = query.timeout_ms.map_or(config.query_timeout(), Duration::from_millis);
    let token = cancel.child_token();

    let work = async {
        let plan = prepare(store, query).await?;
        debug!(collection = %plan.collection, strategy = ?plan.strategy, cap = plan.cap, "executing hybrid query");
        let (hits, stats) = run(store, &plan, &token).await?;
        Ok((plan.strategy, hits, stats))
    };
    let (strategy, hits, mut stats) = race(cancel, &token, deadline, work).await?;
    stats.execution_time_ms = started.elapsed().as_millis() as u64;
    Ok(QueryResult { strategy, hits, stats })
}

async fn prepare(store: &EntityStore, query: HybridQuery) -> Result<QueryPlan> {
    let config = store.config();
    let collection = store.collection(&query.collection).await?;
    let index = store.index(&collection.name).await?;

    let estimate = match (&query.traversal, query.start.is_empty()) {
        (Some(t), false) => Estimate {
            mean_degree: store.mean_degree(&collection.name, &query.start, t.direction).await?,
            indexed: index.generation().len(),
        },
        _ => Estimate { mean_degree: 0.0, indexed: index.generation().len() },
    };
    planner::plan(query, &collection, estimate, config.max_hops_ceiling, config.query_timeout())
}

/// Run a plan under its deadline.
pub async fn execute(store: &EntityStore, plan: QueryPlan, cancel: &CancellationToken) -> Result<QueryResult> {
    let token = cancel.child_token();
    let started = Instant::now();
    debug!(collection = %plan.collection, strategy = ?plan.strategy, cap = plan.cap, "executing hybrid query");

    let (hits, mut stats) = race(cancel, &token, plan.deadline, run(store, &plan, &token)).await?;
    stats.execution_time_ms = started.elapsed().as_millis() as u64;
    Ok(QueryResult { strategy: plan.strategy, hits, stats })
}

/// Race `work` against caller cancellation and `deadline`. On expiry
/// `token` fires so traversal and scoring stop at their next check.
async fn race<T>(
    cancel: &CancellationToken,
    token: &CancellationToken,
    deadline: Duration,
    work: impl Future<Output = Result<T>>,
) -> Result<T> {
    if deadline.is_zero() {
        return Err(Error::Timeout("hybrid query has a zero deadline".into()));
    }
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Error::Timeout("hybrid query cancelled by caller".into())),
        _ = tokio::time::sleep(deadline) => {
            token.cancel();
            Err(Error::Timeout(format!("hybrid query exceeded {} ms", deadline.as_millis())))
        }
        res = work => res,
    }
}

async fn run(store: &EntityStore, plan: &QueryPlan, token: &CancellationToken) -> Result<(Vec<Hit>, ExecutionStats)> {
    match plan.strategy {
        Strategy::TraverseThenRank => traverse_then_rank(store, plan, token).await,
        Strategy::RankThenVerify => rank_then_verify(store, plan, token).await,
        Strategy::RankThenExpand => rank_then_expand(store, plan, token).await,
    }
}

fn into_hit(reached: Reached, score: Option<f32>) -> Hit {
    Hit { node: reached.node, score, hops: reached.hops, path: reached.path }
}

fn strip(mut node: Node) -> Node {
    node.embedding = None;
    node
}

/// Scored hits first (best first, ties by id), then unscored by hops and id.
fn order_hits(hits: &mut [Hit], metric: Metric) {
    hits.sort_by(|a, b| match (a.score, b.score) {
        (Some(x), Some(y)) => metric.rank(x, y).then_with(|| a.node.id.cmp(&b.node.id)),
        (Some(_), None) => std::cmp::Ordering::Less,
        (None, Some(_)) => std::cmp::Ordering::Greater,
        (None, None) => a.hops.cmp(&b.hops).then_with(|| a.node.id.cmp(&b.node.id)),
    });
}

/// Score candidates against the similarity clause. Candidates that fail
/// the threshold are dropped; with a threshold, so are candidates without
/// an embedding.
async fn rank(
    store: &EntityStore,
    plan: &QueryPlan,
    candidates: Vec<Reached>,
    token: &CancellationToken,
    stats: &mut ExecutionStats,
) -> Result<Vec<Hit>> {
    let Some(similarity) = &plan.similarity else {
        return Ok(candidates.into_iter().map(|r| into_hit(r, None)).collect());
    };
    let index = store.index(&plan.collection).await?;
    let metric = index.config().metric;
    let filter = SearchFilter::candidates(candidates.iter().map(|r| r.node.id.clone()));
    let scores: HashMap<NodeId, f32> = index
        .search(&similarity.vector, usize::MAX, &filter, token)
        .await?
        .into_iter()
        .collect();
    stats.scored = scores.len();

    let mut hits = Vec::with_capacity(candidates.len());
    for reached in candidates {
        match scores.get(&reached.node.id).copied() {
            Some(score) => {
                if similarity.threshold.is_none_or(|t| metric.passes(score, t)) {
                    hits.push(into_hit(reached, Some(score)));
                }
            }
            None if similarity.threshold.is_none() => hits.push(into_hit(reached, None)),
            None => {}
        }
    }
    order_hits(&mut hits, metric);
    Ok(hits)
}

async fn traverse_then_rank(
    store: &EntityStore,
    plan: &QueryPlan,
    token: &CancellationToken,
) -> Result<(Vec<Hit>, ExecutionStats)> {
    let mut stats = ExecutionStats::default();
    let candidates: Vec<Reached> = match &plan.traversal {
        Some(t) => {
            let mut cursor = store
                .traverse(&plan.collection, &plan.start, &plan.relations(), t.direction, t.max_hops)
                .await?
                .with_cancel(token.clone());
            let reached = cursor.try_collect().await?;
            cursor.close().await?;
            reached
        }
        None => {
            let mut start = plan.start.clone();
            start.sort();
            start.dedup();
            let mut reached = Vec::with_capacity(start.len());
            for id in start {
                let node = store
                    .get_node(&plan.collection, &id)
                    .await?
                    .ok_or_else(|| Error::NotFound(format!("node '{id}' in '{}'", plan.collection)))?;
                reached.push(Reached { node: strip(node), hops: 0, path: Path::single(id) });
            }
            reached
        }
    };
    let candidates: Vec<Reached> = candidates.into_iter().filter(|r| plan.keeps(&r.node)).collect();
    stats.candidates = candidates.len();

    let mut hits = rank(store, plan, candidates, token, &mut stats).await?;
    hits.truncate(plan.cap);
    Ok((hits, stats))
}

async fn rank_then_verify(
    store: &EntityStore,
    plan: &QueryPlan,
    token: &CancellationToken,
) -> Result<(Vec<Hit>, ExecutionStats)> {
    let mut stats = ExecutionStats::default();
    let similarity = plan
        .similarity
        .as_ref()
        .ok_or_else(|| Error::InvalidArgument("rank-then-verify needs a similarity clause".into()))?;
    let index = store.index(&plan.collection).await?;
    let filter = SearchFilter { candidates: None, threshold: similarity.threshold };
    let ranked = index.search(&similarity.vector, usize::MAX, &filter, token).await?;
    stats.scored = ranked.len();

    // Every lookup and reverse walk below reads this cursor's snapshot.
    let mut cursor = store
        .traverse(&plan.collection, &plan.start, &plan.relations(), plan.direction(), plan.max_hops())
        .await?
        .with_cancel(token.clone());
    let verified = verify(&mut cursor, plan, &index, similarity, ranked, token, &mut stats).await;
    cursor.close().await?;
    Ok((verified?, stats))
}

/// Keep the ranked matches a reverse walk connects to the start set. Without
/// a threshold, reachable nodes that have no embedding follow the scored
/// ones, by hops then id, the same order traverse-then-rank gives them.
async fn verify(
    cursor: &mut Neighbors,
    plan: &QueryPlan,
    index: &VectorIndex,
    similarity: &Similarity,
    ranked: Vec<(NodeId, f32)>,
    token: &CancellationToken,
    stats: &mut ExecutionStats,
) -> Result<Vec<Hit>> {
    let start: HashSet<&NodeId> = plan.start.iter().collect();
    let reverse = plan.direction().reverse();
    let mut hits = Vec::new();
    for (id, score) in ranked {
        if hits.len() >= plan.cap {
            return Ok(hits);
        }
        if token.is_cancelled() {
            return Err(Error::Timeout("hybrid query cancelled".into()));
        }
        if start.contains(&id) {
            continue;
        }
        stats.candidates += 1;
        let Some(node) = cursor.node(&id).await? else { continue };
        if !plan.keeps(&node) {
            continue;
        }
        cursor.restart(vec![id], reverse);
        let mut found = None;
        while let Some(reached) = cursor.next().await? {
            if start.contains(&reached.node.id) {
                found = Some(reached);
                break;
            }
        }
        if let Some(reached) = found {
            stats.verified += 1;
            hits.push(Hit { node, score: Some(score), hops: reached.hops, path: reached.path.reversed() });
        }
    }

    if similarity.threshold.is_some() || hits.len() >= plan.cap {
        return Ok(hits);
    }
    cursor.restart(plan.start.clone(), plan.direction());
    while let Some(reached) = cursor.next().await? {
        if hits.len() >= plan.cap {
            break;
        }
        if plan.keeps(&reached.node) && index.score_of(&similarity.vector, &reached.node.id).is_none() {
            stats.candidates += 1;
            hits.push(into_hit(reached, None));
        }
    }
    Ok(hits)
}

async fn rank_then_expand(
    store: &EntityStore,
    plan: &QueryPlan,
    token: &CancellationToken,
) -> Result<(Vec<Hit>, ExecutionStats)> {
    let mut stats = ExecutionStats::default();
    let similarity = plan
        .similarity
        .as_ref()
        .ok_or_else(|| Error::InvalidArgument("a vector-only query needs a similarity clause".into()))?;
    let index = store.index(&plan.collection).await?;
    let metric = index.config().metric;
    let filter = SearchFilter { candidates: None, threshold: similarity.threshold };
    let ranked = index.search(&similarity.vector, usize::MAX, &filter, token).await?;
    stats.scored = ranked.len();

    // Seeds: best matches that pass the label filter. Without an expansion
    // step they are the result.
    let seeds = match &plan.traversal {
        Some(_) => similarity.top_k.unwrap_or(plan.limit).min(plan.limit),
        None => plan.cap,
    };
    let mut hits: Vec<Hit> = Vec::new();
    for (id, score) in ranked {
        if hits.len() >= seeds {
            break;
        }
        if token.is_cancelled() {
            return Err(Error::Timeout("hybrid query cancelled".into()));
        }
        let Some(node) = store.get_node(&plan.collection, &id).await? else { continue };
        if plan.keeps(&node) {
            hits.push(Hit { node: strip(node), score: Some(score), hops: 0, path: Path::single(id) });
        }
    }
    stats.candidates = hits.len();

    let Some(t) = &plan.traversal else {
        return Ok((hits, stats));
    };
    if hits.is_empty() {
        return Ok((hits, stats));
    }

    // Neighbors of the seeds follow them, best first.
    let seeds: Vec<NodeId> = hits.iter().map(|h| h.node.id.clone()).collect();
    let mut cursor = store
        .traverse(&plan.collection, &seeds, &plan.relations(), t.direction, t.max_hops)
        .await?
        .with_cancel(token.clone());
    let expanded: Vec<Reached> = cursor
        .try_collect()
        .await?
        .into_iter()
        .filter(|r| plan.keeps(&r.node))
        .collect();
    cursor.close().await?;
    stats.candidates += expanded.len();

    let mut more = Vec::with_capacity(expanded.len());
    for reached in expanded {
        let score = index.score_of(&similarity.vector, &reached.node.id);
        if let (Some(s), Some(t)) = (score, similarity.threshold) {
            if !metric.passes(s, t) {
                continue;
            }
        }
        if score.is_none() && similarity.threshold.is_some() {
            continue;
        }
        more.push(into_hit(reached, score));
    }
    order_hits(&mut more, metric);
    hits.extend(more);
    hits.truncate(plan.limit);
    Ok((hits, stats))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::config::EngineConfig;
    use crate::model::{Direction, Edge};
    use crate::planner::Traversal;
    use crate::storage::{Backend, EmbeddedBackend};
    use pretty_assertions::assert_eq;

    fn id(s: &str) -> NodeId {
        NodeId::new(s).unwrap()
    }

    /// n1 -> n2..n5 (`rel`), n5 -> n6. Embeddings along a quarter circle.
    async fn fixture() -> EntityStore {
        let backend: Arc<dyn Backend> = Arc::new(EmbeddedBackend::in_memory().unwrap());
        let store = EntityStore::open(backend, EngineConfig::default()).await.unwrap();
        store.create_collection("kb", 2, Metric::Cosine).await.unwrap();
        let vectors = [
            ("n1", [1.0, 0.0]),
            ("n2", [0.9, 0.1]),
            ("n3", [0.1, 0.9]),
            ("n4", [0.9, 0.1]),
            ("n5", [0.5, 0.5]),
            ("n6", [1.0, 0.0]),
        ];
        for (name, v) in vectors {
            let label = if name == "n3" { "Other" } else { "Doc" };
            store
                .create_node("kb", Node::new(id(name)).with_labels([label]).with_embedding(v.to_vec()))
                .await
                .unwrap();
        }
        for dst in ["n2", "n3", "n4", "n5"] {
            store.create_edge("kb", Edge::new(id("n1"), "rel", id(dst))).await.unwrap();
        }
        store.create_edge("kb", Edge::new(id("n5"), "rel", id("n6"))).await.unwrap();
        store
    }

    fn hit_ids(result: &QueryResult) -> Vec<&str> {
        result.hits.iter().map(|h| h.node.id.as_str()).collect()
    }

    #[tokio::test]
    async fn test_traverse_then_rank_ties_by_id() {
        let store = fixture().await;
        let q = HybridQuery::from_nodes("kb", [id("n1")])
            .traverse(Traversal::new(Direction::Outbound, 1))
            .rank_by(Similarity::new(vec![1.0, 0.0]).top_k(2));
        let result = query(&store, q, &CancellationToken::new()).await.unwrap();
        assert_eq!(result.strategy, Strategy::TraverseThenRank);
        assert_eq!(hit_ids(&result), vec!["n2", "n4"]);
        assert_eq!(result.hits[0].score, result.hits[1].score);
        assert_eq!(result.hits[0].path.nodes, vec![id("n1"), id("n2")]);
    }

    #[tokio::test]
    async fn test_pure_traversal_orders_by_hops() {
        let store = fixture().await;
        let q = HybridQuery::from_nodes("kb", [id("n1")]).traverse(Traversal::new(Direction::Outbound, 2)).limit(10);
        let result = query(&store, q, &CancellationToken::new()).await.unwrap();
        assert_eq!(hit_ids(&result), vec!["n2", "n3", "n4", "n5", "n6"]);
        assert_eq!(result.hits[4].hops, 2);
    }

    #[tokio::test]
    async fn test_label_filter() {
        let store = fixture().await;
        let q = HybridQuery::from_nodes("kb", [id("n1")])
            .traverse(Traversal::new(Direction::Outbound, 1))
            .with_labels(["Other"]);
        let result = query(&store, q, &CancellationToken::new()).await.unwrap();
        assert_eq!(hit_ids(&result), vec!["n3"]);
    }

    #[tokio::test]
    async fn test_strategies_agree() {
        let store = fixture().await;
        let base = HybridQuery::from_nodes("kb", [id("n1")])
            .traverse(Traversal::new(Direction::Outbound, 2))
            .rank_by(Similarity::new(vec![1.0, 0.0]).top_k(3));
        let a = query(&store, base.clone().strategy(Strategy::TraverseThenRank), &CancellationToken::new())
            .await
            .unwrap();
        let b = query(&store, base.strategy(Strategy::RankThenVerify), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(hit_ids(&a), vec!["n6", "n2", "n4"]);
        assert_eq!(hit_ids(&a), hit_ids(&b));
        assert_eq!(b.hits[0].hops, 2);
        assert_eq!(b.hits[0].path.nodes, vec![id("n1"), id("n5"), id("n6")]);
    }

    #[tokio::test]
    async fn test_strategies_agree_on_unembedded_nodes() {
        let store = fixture().await;
        store.create_node("kb", Node::new(id("b")).with_labels(["Doc"])).await.unwrap();
        store.create_node("kb", Node::new(id("c")).with_labels(["Doc"])).await.unwrap();
        store.create_edge("kb", Edge::new(id("n1"), "rel", id("b"))).await.unwrap();
        store.create_edge("kb", Edge::new(id("b"), "rel", id("c"))).await.unwrap();

        let expected = ["n6", "n2", "n4", "n5", "n3", "b", "c"];
        for top_k in [3, 6, 10] {
            let base = HybridQuery::from_nodes("kb", [id("n1")])
                .traverse(Traversal::new(Direction::Outbound, 2))
                .rank_by(Similarity::new(vec![1.0, 0.0]).top_k(top_k));
            let a = query(&store, base.clone().strategy(Strategy::TraverseThenRank), &CancellationToken::new())
                .await
                .unwrap();
            let b = query(&store, base.strategy(Strategy::RankThenVerify), &CancellationToken::new())
                .await
                .unwrap();
            assert_eq!(hit_ids(&a), expected[..top_k.min(expected.len())].to_vec(), "top_k {top_k}");
            assert_eq!(hit_ids(&a), hit_ids(&b), "top_k {top_k}");
        }

        let base = HybridQuery::from_nodes("kb", [id("n1")])
            .traverse(Traversal::new(Direction::Outbound, 2))
            .rank_by(Similarity::new(vec![1.0, 0.0]));
        let b = query(&store, base.clone().strategy(Strategy::RankThenVerify), &CancellationToken::new())
            .await
            .unwrap();
        let unscored: Vec<(&str, usize)> =
            b.hits.iter().filter(|h| h.score.is_none()).map(|h| (h.node.id.as_str(), h.hops)).collect();
        assert_eq!(unscored, vec![("b", 1), ("c", 2)]);
        assert_eq!(b.hits[6].path.nodes, vec![id("n1"), id("b"), id("c")]);

        // A threshold drops nodes that can't be scored, on both paths.
        let base = base.rank_by(Similarity::new(vec![1.0, 0.0]).threshold(0.5));
        let a = query(&store, base.clone().strategy(Strategy::TraverseThenRank), &CancellationToken::new())
            .await
            .unwrap();
        let b = query(&store, base.strategy(Strategy::RankThenVerify), &CancellationToken::new()).await.unwrap();
        assert_eq!(hit_ids(&a), vec!["n6", "n2", "n4", "n5"]);
        assert_eq!(hit_ids(&a), hit_ids(&b));
    }

    #[tokio::test]
    async fn test_partition_filter() {
        let store = fixture().await;
        for (name, partition) in [("p1", "work"), ("p2", "personal")] {
            let node = Node::new(id(name)).with_partition(partition).with_embedding(vec![1.0, 0.0]);
            store.create_node("kb", node).await.unwrap();
            store.create_edge("kb", Edge::new(id("n1"), "rel", id(name))).await.unwrap();
        }

        let base = HybridQuery::from_nodes("kb", [id("n1")])
            .traverse(Traversal::new(Direction::Outbound, 2))
            .rank_by(Similarity::new(vec![1.0, 0.0]))
            .in_partition("work");
        for strategy in [Strategy::TraverseThenRank, Strategy::RankThenVerify] {
            let result = query(&store, base.clone().strategy(strategy), &CancellationToken::new()).await.unwrap();
            assert_eq!(hit_ids(&result), vec!["p1"], "{strategy:?}");
        }

        let q = HybridQuery::similar_to("kb", vec![1.0, 0.0]).in_partition("personal");
        let result = query(&store, q, &CancellationToken::new()).await.unwrap();
        assert_eq!(hit_ids(&result), vec!["p2"]);

        let bad = HybridQuery::similar_to("kb", vec![1.0, 0.0]).in_partition("");
        assert!(matches!(query(&store, bad, &CancellationToken::new()).await, Err(Error::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn test_vector_only_then_expand() {
        let store = fixture().await;
        let q = HybridQuery::similar_to("kb", vec![0.0, 1.0]).rank_by(Similarity::new(vec![0.0, 1.0]).top_k(1));
        let result = query(&store, q, &CancellationToken::new()).await.unwrap();
        assert_eq!(result.strategy, Strategy::RankThenExpand);
        assert_eq!(hit_ids(&result), vec!["n3"]);

        let q = HybridQuery::similar_to("kb", vec![0.0, 1.0])
            .rank_by(Similarity::new(vec![0.0, 1.0]).top_k(1))
            .traverse(Traversal::new(Direction::Inbound, 1));
        let result = query(&store, q, &CancellationToken::new()).await.unwrap();
        assert_eq!(hit_ids(&result), vec!["n3", "n1"]);
        assert_eq!(result.hits[1].hops, 1);
        assert_eq!(result.hits[1].path.nodes, vec![id("n3"), id("n1")]);
    }

    #[tokio::test]
    async fn test_unknown_start_is_not_found() {
        let store = fixture().await;
        let q = HybridQuery::from_nodes("kb", [id("ghost")]).traverse(Traversal::default());
        assert!(matches!(query(&store, q, &CancellationToken::new()).await, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_caller_cancellation() {
        let store = fixture().await;
        let cancel = CancellationToken::new();
        cancel.cancel();
        let q = HybridQuery::similar_to("kb", vec![1.0, 0.0]);
        assert!(matches!(query(&store, q, &cancel).await, Err(Error::Timeout(_))));
    }

    #[tokio::test]
    async fn test_deadline() {
        let store = fixture().await;
        let plan = QueryPlan {
            strategy: Strategy::RankThenExpand,
            collection: "kb".into(),
            start: vec![],
            traversal: None,
            similarity: Some(Similarity::new(vec![1.0, 0.0])),
            labels: vec![],
            partition: None,
            cap: 10,
            limit: 10,
            deadline: Duration::ZERO,
            estimated_candidates: 0.0,
        };
        let res = execute(&store, plan, &CancellationToken::new()).await;
        assert!(matches!(res, Err(Error::Timeout(_))));
    }

    #[tokio::test]
    async fn test_deadline_covers_planning() {
        let store = fixture().await;
        let q = HybridQuery::similar_to("missing", vec![1.0, 0.0]);
        assert!(matches!(query(&store, q.clone(), &CancellationToken::new()).await, Err(Error::NotFound(_))));
        // The collection lookup already runs under the deadline.
        let q = q.timeout_ms(0);
        assert!(matches!(query(&store, q, &CancellationToken::new()).await, Err(Error::Timeout(_))));
    }
}
