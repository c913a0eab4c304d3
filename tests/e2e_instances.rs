//! End-to-end tests for the instance manager: singleflight startup,
//! degraded serving during index rebuild, and remote instances over the
//! service RPC.

use std::sync::Arc;
use std::time::{Duration, Instant};

use knowdb::{
    DegradedReason, Direction, Edge, EngineConfig, Error, HybridQuery, InstanceHandle, InstanceManager,
    InstanceState, LocalInstanceConfig, Metric, Node, NodeId, Request, Response, RetryPolicy, Similarity,
    Traversal,
};
use pretty_assertions::assert_eq;

fn id(s: &str) -> NodeId {
    NodeId::new(s).unwrap()
}

async fn ok(handle: &InstanceHandle, request: Request) -> Response {
    handle.route(request).await.unwrap()
}

// ============================================================================
// 1. ensure_local
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_ensure_local_is_idempotent_under_concurrency() {
    let dir = tempfile::tempdir().unwrap();
    let manager = Arc::new(InstanceManager::default());
    let config = LocalInstanceConfig::embedded("notes", dir.path().join("notes"));

    let tasks: Vec<_> = (0..16)
        .map(|_| {
            let manager = manager.clone();
            let config = config.clone();
            tokio::spawn(async move { manager.ensure_local(config).await })
        })
        .collect();
    let mut ids = Vec::new();
    for task in tasks {
        let handle = task.await.unwrap().unwrap();
        ids.push(handle.as_local().unwrap().id());
    }
    assert_eq!(ids.len(), 16);
    assert!(ids.windows(2).all(|w| w[0] == w[1]));

    let statuses = manager.statuses();
    assert_eq!(statuses.len(), 1);
    assert_eq!(statuses[0].state, InstanceState::Ready);
    assert_eq!(statuses[0].name, "notes");

    manager.shutdown_all().await.unwrap();
    assert!(manager.statuses().is_empty());
}

#[tokio::test]
async fn test_data_survives_instance_restart() {
    let dir = tempfile::tempdir().unwrap();
    let manager = InstanceManager::default();
    let config = LocalInstanceConfig::embedded("notes", dir.path().join("notes"));

    let handle = manager.ensure_local(config.clone()).await.unwrap();
    ok(&handle, Request::CreateCollection { name: "kb".into(), dimension: 2, metric: Metric::Dot }).await;
    let node = Node::new(id("ada")).with_embedding(vec![0.5, 0.5]);
    ok(&handle, Request::UpsertNode { collection: "kb".into(), node }).await;
    handle.as_local().unwrap().stop().await.unwrap();

    let handle = manager.ensure_local(config).await.unwrap();
    let resp = ok(&handle, Request::GetNode { collection: "kb".into(), id: id("ada") }).await;
    let Response::MaybeNode { node: Some(node) } = resp else { panic!("unexpected {resp:?}") };
    assert_eq!(node.embedding, Some(vec![0.5, 0.5]));
    manager.shutdown_all().await.unwrap();
}

// ============================================================================
// 2. Degraded while an index rebuilds
// ============================================================================

#[tokio::test]
async fn test_searches_during_rebuild() {
    let dir = tempfile::tempdir().unwrap();
    let manager = InstanceManager::default();
    let handle = manager.ensure_local(LocalInstanceConfig::embedded("kb", dir.path().join("kb"))).await.unwrap();
    let instance = handle.as_local().unwrap().clone();

    ok(&handle, Request::CreateCollection { name: "kb".into(), dimension: 3, metric: Metric::Euclidean }).await;
    for i in 0..200 {
        let x = i as f32;
        let node = Node::new(id(&format!("n{i:03}"))).with_embedding(vec![x, x * 0.5, 1.0]);
        ok(&handle, Request::UpsertNode { collection: "kb".into(), node }).await;
    }

    let resp = ok(&handle, Request::RebuildIndex { collection: "kb".into() }).await;
    assert_eq!(resp, Response::RebuildStarted { collection: "kb".into() });
    let status = instance.status();
    assert_eq!(status.state, InstanceState::Degraded);
    assert_eq!(status.degraded_reason, Some(DegradedReason::IndexRebuild { collection: "kb".into() }));

    // Writes are rejected by default while degraded.
    let write = Request::UpsertNode { collection: "kb".into(), node: Node::new(id("late")) };
    assert!(matches!(handle.route(write).await, Err(Error::Unavailable(_))));

    for round in 0..20 {
        let query = HybridQuery::similar_to("kb", vec![round as f32, 0.0, 1.0]).limit(10);
        let Response::Query { result } = ok(&handle, Request::Query { query }).await else {
            panic!("expected a query result");
        };
        let mut seen: Vec<&str> = result.hits.iter().map(|h| h.node.id.as_str()).collect();
        assert_eq!(seen.len(), 10);
        seen.sort();
        seen.dedup();
        assert_eq!(seen.len(), 10, "duplicate hits in round {round}");
    }

    instance.wait_ready().await.unwrap();
    assert_eq!(instance.status().degraded_reason, None);
    let write = Request::UpsertNode { collection: "kb".into(), node: Node::new(id("late")) };
    ok(&handle, write).await;
    manager.shutdown_all().await.unwrap();
}

// ============================================================================
// 3. Remote instances
// ============================================================================

#[tokio::test]
async fn test_remote_instance_answers_like_local() {
    let dir = tempfile::tempdir().unwrap();
    let server = InstanceManager::default();
    let config = LocalInstanceConfig::embedded("shared", dir.path().join("shared"))
        .with_listen("127.0.0.1:0".parse().unwrap());
    let local = server.ensure_local(config).await.unwrap();
    let addr = local.as_local().unwrap().listen_addr().unwrap();

    let client = InstanceManager::default();
    let remote = client.connect(&addr.to_string()).await.unwrap();
    assert!(remote.as_local().is_none());
    let again = client.connect(&format!("http://{addr}/")).await.unwrap();
    let (InstanceHandle::Remote(a), InstanceHandle::Remote(b)) = (&remote, &again) else {
        panic!("expected remote handles");
    };
    assert!(Arc::ptr_eq(a, b));

    let create = Request::CreateCollection { name: "kb".into(), dimension: 2, metric: Metric::Cosine };
    client.route(create, &remote).await.unwrap();
    for (name, v) in [("a", [1.0, 0.0]), ("b", [0.9, 0.1]), ("c", [0.0, 1.0])] {
        let node = Node::new(id(name)).with_embedding(v.to_vec());
        client.route(Request::UpsertNode { collection: "kb".into(), node }, &remote).await.unwrap();
    }
    for dst in ["b", "c"] {
        let edge = Edge::new(id("a"), "near", id(dst));
        client.route(Request::UpsertEdge { collection: "kb".into(), edge }, &remote).await.unwrap();
    }

    let query = HybridQuery::from_nodes("kb", [id("a")])
        .traverse(Traversal::new(Direction::Outbound, 1))
        .rank_by(Similarity::new(vec![1.0, 0.0]).top_k(1));
    let via_remote = client.route(Request::Query { query: query.clone() }, &remote).await.unwrap();
    let via_local = server.route(Request::Query { query }, &local).await.unwrap();
    let (Response::Query { result: r }, Response::Query { result: l }) = (&via_remote, &via_local) else {
        panic!("expected query results");
    };
    assert_eq!(r.ids(), l.ids());
    assert_eq!(r.ids(), vec![&id("b")]);
    assert_eq!(r.hits[0].path, l.hits[0].path);

    // Error kinds survive the wire.
    let missing = Request::GetNode { collection: "nope".into(), id: id("a") };
    assert!(matches!(client.route(missing, &remote).await, Err(Error::NotFound(_))));
    let bad = Request::CreateCollection { name: "kb".into(), dimension: 2, metric: Metric::Cosine };
    assert!(matches!(client.route(bad, &remote).await, Err(Error::InvalidArgument(_))));

    let status = remote.status().await.unwrap();
    assert_eq!(status.state, InstanceState::Ready);
    assert_eq!(status.listen, Some(addr));

    client.shutdown_all().await.unwrap();
    server.shutdown_all().await.unwrap();
}

#[tokio::test]
async fn test_remote_degraded_write_is_rejected_without_retry() {
    let dir = tempfile::tempdir().unwrap();
    let server = InstanceManager::default();
    let config = LocalInstanceConfig::embedded("shared", dir.path().join("shared"))
        .with_listen("127.0.0.1:0".parse().unwrap());
    let local = server.ensure_local(config).await.unwrap();
    let instance = local.as_local().unwrap().clone();
    let addr = instance.listen_addr().unwrap();
    server
        .route(Request::CreateCollection { name: "kb".into(), dimension: 2, metric: Metric::Dot }, &local)
        .await
        .unwrap();

    // Backoff long enough that a single retry would show in the elapsed time.
    let engine = EngineConfig {
        unavailable_retry: RetryPolicy { max_attempts: 5, initial_backoff_ms: 300, max_backoff_ms: 1000 },
        ..EngineConfig::default()
    };
    let client = InstanceManager::new(engine);
    let remote = client.connect(&addr.to_string()).await.unwrap();

    instance.degrade(DegradedReason::BackendRecovery { detail: "replica resync".into() });
    let write = Request::UpsertNode { collection: "kb".into(), node: Node::new(id("late")) };
    let started = Instant::now();
    let res = client.route(write, &remote).await;
    assert!(matches!(res, Err(Error::Unavailable(_))), "unexpected {res:?}");
    assert!(started.elapsed() < Duration::from_millis(250), "took {:?}", started.elapsed());

    // Reads are still served.
    let read = Request::GetNode { collection: "kb".into(), id: id("late") };
    assert_eq!(client.route(read, &remote).await.unwrap(), Response::MaybeNode { node: None });

    client.shutdown_all().await.unwrap();
    server.shutdown_all().await.unwrap();
}
