//! HTTP surfaces.
//!
//! - [`service_router`]: the service RPC. `POST /rpc/v1` takes a
//!   [`Request`] and answers with a [`Response`].
//! - [`storage_router`]: the storage-node KV protocol a
//!   [`DistributedBackend`](crate::storage::DistributedBackend) speaks,
//!   served from an [`EmbeddedBackend`].
//!
//! Errors travel as [`ErrorBody`] with the status code of their kind, so
//! remote callers see the same taxonomy as local ones.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::{StatusCode, header::AUTHORIZATION};
use axum::middleware::{self, Next};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::instance::Instance;
use crate::service::{Request, Response};
use crate::storage::{Backend, EmbeddedBackend};
use crate::storage::wire::{self, ErrorBody};
use crate::{Error, ErrorKind, Result};

pub const RPC_PATH: &str = "/rpc/v1";

impl IntoResponse for Error {
    fn into_response(self) -> axum::response::Response {
        let status = match self.kind() {
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::InvalidArgument => StatusCode::BAD_REQUEST,
            ErrorKind::Conflict => StatusCode::CONFLICT,
            ErrorKind::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
            ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(ErrorBody::from(&self))).into_response()
    }
}

/// Bind `addr` and serve `router` until `shutdown` fires.
pub async fn spawn(addr: SocketAddr, router: Router, shutdown: CancellationToken) -> Result<(SocketAddr, JoinHandle<()>)> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let local = listener.local_addr()?;
    let task = tokio::spawn(async move {
        let served = axum::serve(listener, router)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await;
        if let Err(e) = served {
            warn!(addr = %local, error = %e, "listener failed");
        }
    });
    info!(addr = %local, "listening");
    Ok((local, task))
}

// ============================================================================
// Service RPC
// ============================================================================

pub fn service_router(instance: Arc<Instance>) -> Router {
    Router::new().route(RPC_PATH, post(rpc)).with_state(instance)
}

async fn rpc(State(instance): State<Arc<Instance>>, Json(request): Json<Request>) -> Result<Json<Response>> {
    Ok(Json(instance.handle(request).await?))
}

// ============================================================================
// Storage node
// ============================================================================

#[derive(Clone)]
struct StorageNode {
    backend: Arc<EmbeddedBackend>,
    token: Option<Arc<str>>,
    lease_ttl: Duration,
}

/// KV protocol over `backend`. With a `token`, every call must carry it as
/// a bearer credential.
pub fn storage_router(backend: Arc<EmbeddedBackend>, token: Option<String>, lease_ttl: Duration) -> Router {
    let node = StorageNode { backend, token: token.map(Arc::from), lease_ttl };
    Router::new()
        .route(wire::HEALTH, get(health))
        .route(wire::BEGIN, post(begin))
        .route(wire::GET, post(read))
        .route(wire::SCAN, post(scan))
        .route(wire::COMMIT, post(commit))
        .route(wire::RELEASE, post(release))
        .layer(middleware::from_fn_with_state(node.clone(), require_token))
        .with_state(node)
}

async fn require_token(
    State(node): State<StorageNode>,
    request: axum::extract::Request,
    next: Next,
) -> axum::response::Response {
    if let Some(expected) = &node.token {
        let provided = request
            .headers()
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "));
        if provided != Some(expected.as_ref()) {
            warn!(path = %request.uri().path(), "storage request without valid credentials");
            let body = ErrorBody { kind: ErrorKind::InvalidArgument, message: "missing or invalid bearer token".into() };
            return (StatusCode::UNAUTHORIZED, Json(body)).into_response();
        }
    }
    next.run(request).await
}

async fn health(State(node): State<StorageNode>) -> Result<Json<wire::HealthResponse>> {
    node.backend.handshake().await?;
    Ok(Json(wire::HealthResponse { status: "ok".into(), seq: node.backend.current_seq() }))
}

async fn begin(State(node): State<StorageNode>, Json(_req): Json<wire::BeginRequest>) -> Result<Json<wire::BeginResponse>> {
    let (snapshot, lease) = node.backend.open_lease(node.lease_ttl)?;
    Ok(Json(wire::BeginResponse { snapshot, lease }))
}

async fn read(State(node): State<StorageNode>, Json(req): Json<wire::GetRequest>) -> Result<Json<wire::GetResponse>> {
    let value = node.backend.leased_get(&req.lease, node.lease_ttl, &req.namespace, &req.key)?;
    Ok(Json(wire::GetResponse { value }))
}

async fn scan(State(node): State<StorageNode>, Json(req): Json<wire::ScanRequest>) -> Result<Json<wire::ScanResponse>> {
    let entries = node.backend.leased_scan(&req.lease, node.lease_ttl, &req.namespace, &req.prefix)?;
    Ok(Json(wire::ScanResponse { entries }))
}

async fn commit(State(node): State<StorageNode>, Json(req): Json<wire::CommitRequest>) -> Result<Json<wire::CommitResponse>> {
    let seq = node.backend.commit_ops(
        &req.lease,
        node.lease_ttl,
        req.snapshot,
        req.writes,
        req.guards,
        req.range_guards,
    )?;
    Ok(Json(wire::CommitResponse { seq }))
}

async fn release(State(node): State<StorageNode>, Json(req): Json<wire::ReleaseRequest>) -> Json<serde_json::Value> {
    node.backend.release_lease(&req.lease);
    Json(serde_json::json!({ "released": true }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryPolicy;
    use crate::storage::{Credentials, DistributedBackend};
    use crate::tx::TxMode;
    use serde_json::json;

    async fn node(token: Option<&str>) -> (SocketAddr, CancellationToken) {
        let backend = Arc::new(EmbeddedBackend::in_memory().unwrap());
        let router = storage_router(backend, token.map(str::to_string), Duration::from_secs(30));
        let shutdown = CancellationToken::new();
        let (addr, _) = spawn("127.0.0.1:0".parse().unwrap(), router, shutdown.clone()).await.unwrap();
        (addr, shutdown)
    }

    fn client(addr: SocketAddr, token: Option<&str>) -> DistributedBackend {
        let credentials = token.map(|t| Credentials { token: t.into() });
        DistributedBackend::connect(vec![addr.to_string()], credentials, Duration::from_secs(5), RetryPolicy::conflicts())
            .unwrap()
    }

    #[test]
    fn test_error_status_codes() {
        let resp = Error::Timeout("slow".into()).into_response();
        assert_eq!(resp.status(), StatusCode::GATEWAY_TIMEOUT);
        let resp = Error::Storage("disk".into()).into_response();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_kv_over_http() {
        let (addr, shutdown) = node(None).await;
        let cluster = client(addr, None);
        cluster.handshake().await.unwrap();
        cluster.put("docs", "n/a", json!({"v": 1})).await.unwrap();
        assert_eq!(cluster.get("docs", "n/a").await.unwrap(), Some(json!({"v": 1})));

        // First committer wins across HTTP as well.
        let mut t1 = cluster.begin_tx(TxMode::ReadWrite).await.unwrap();
        let mut t2 = cluster.begin_tx(TxMode::ReadWrite).await.unwrap();
        t1.put("docs", "n/a", json!({"v": 2})).unwrap();
        t2.put("docs", "n/a", json!({"v": 3})).unwrap();
        cluster.commit_tx(t1).await.unwrap();
        assert!(matches!(cluster.commit_tx(t2).await, Err(Error::Conflict(_))));

        assert!(matches!(cluster.get("docs", "").await, Err(Error::InvalidArgument(_))));
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_token_required() {
        let (addr, shutdown) = node(Some("s3cret")).await;
        assert!(matches!(client(addr, None).handshake().await, Err(Error::InvalidArgument(_))));
        client(addr, Some("s3cret")).handshake().await.unwrap();
        shutdown.cancel();
    }
}
