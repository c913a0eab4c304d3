//! Storage-node KV protocol.
//!
//! JSON over HTTP POST. A distributed backend speaks this to every cluster
//! endpoint; `server::storage_router` answers it. Errors come back as
//! [`ErrorBody`] with the status code of their kind.

use serde::{Deserialize, Serialize};

use super::Record;
use crate::tx::{CommitSeq, TxKey, TxMode, WriteOp};
use crate::{Error, ErrorKind};

pub const HEALTH: &str = "/kv/v1/health";
pub const BEGIN: &str = "/kv/v1/begin";
pub const GET: &str = "/kv/v1/get";
pub const SCAN: &str = "/kv/v1/scan";
pub const COMMIT: &str = "/kv/v1/commit";
pub const RELEASE: &str = "/kv/v1/release";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub seq: CommitSeq,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BeginRequest {
    pub mode: TxMode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BeginResponse {
    pub snapshot: CommitSeq,
    pub lease: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetRequest {
    pub lease: String,
    pub namespace: String,
    pub key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetResponse {
    pub value: Option<Record>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanRequest {
    pub lease: String,
    pub namespace: String,
    pub prefix: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanResponse {
    pub entries: Vec<(String, Record)>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitRequest {
    pub lease: String,
    pub snapshot: CommitSeq,
    pub writes: Vec<WriteOp>,
    #[serde(default)]
    pub guards: Vec<TxKey>,
    #[serde(default)]
    pub range_guards: Vec<TxKey>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitResponse {
    pub seq: CommitSeq,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseRequest {
    pub lease: String,
}

/// Error envelope shared by every HTTP surface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&Error> for ErrorBody {
    fn from(e: &Error) -> Self {
        Self { kind: e.kind(), message: e.message() }
    }
}

impl From<ErrorBody> for Error {
    fn from(body: ErrorBody) -> Self {
        Error::from_kind(body.kind, body.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_body_keeps_kind() {
        let body = ErrorBody::from(&Error::Conflict("key n/a changed".into()));
        let json = serde_json::to_string(&body).unwrap();
        assert_eq!(json, r#"{"kind":"conflict","message":"key n/a changed"}"#);
        let back: Error = serde_json::from_str::<ErrorBody>(&json).unwrap().into();
        assert!(matches!(back, Error::Conflict(m) if m == "key n/a changed"));
    }

    #[test]
    fn test_commit_request_guards_default() {
        let req: CommitRequest =
            serde_json::from_str(r#"{"lease":"l","snapshot":3,"writes":[{"op":"delete","namespace":"docs","key":"n/a"}]}"#)
                .unwrap();
        assert!(req.guards.is_empty() && req.range_guards.is_empty());
        assert_eq!(req.writes.len(), 1);
    }
}
