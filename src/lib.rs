//! # knowdb: Hybrid Graph/Vector Memory for Agents
//!
//! One store for structured knowledge (nodes, typed edges, properties) and
//! semantic recall (per-node embeddings), queried together.
//!
//! ## Design Principles
//!
//! 1. **Trait-first**: `Backend` is the contract between the engine and storage
//! 2. **Clean DTOs**: `Node`, `Edge`, `Value` cross all boundaries
//! 3. **Same schema everywhere**: a knowledge base moves from embedded to
//!    distributed storage by reconfiguration, not transformation
//! 4. **Backend-agnostic planner**: query plans don't know about storage
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use knowdb::{InstanceManager, LocalInstanceConfig, Metric, Node, Request};
//!
//! # async fn example() -> knowdb::Result<()> {
//! let manager = InstanceManager::default();
//! let handle = manager.ensure_local(LocalInstanceConfig::embedded("notes", "./notes.db")).await?;
//!
//! let create = Request::CreateCollection {
//!     name: "memories".into(),
//!     dimension: 4,
//!     metric: Metric::Cosine,
//! };
//! manager.route(create, &handle).await?;
//!
//! let node = Node::new("ada".try_into()?)
//!     .with_labels(["Person"])
//!     .with_embedding(vec![0.1, 0.2, 0.3, 0.4]);
//! manager.route(Request::UpsertNode { collection: "memories".into(), node }, &handle).await?;
//!
//! manager.shutdown_all().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Storage Backends
//!
//! | Backend | Config | Description |
//! |---------|--------|-------------|
//! | Embedded | `BackendConfig::Embedded` | Single process, on-disk sled database |
//! | Distributed | `BackendConfig::Distributed` | Storage-node cluster over HTTP |

// ============================================================================
// Modules
// ============================================================================

pub mod model;
pub mod tx;
pub mod storage;
pub mod graph;
pub mod index;
pub mod planner;
pub mod execution;
pub mod ingest;
pub mod export;
pub mod service;
pub mod instance;
pub mod server;
pub mod config;

// ============================================================================
// Re-exports: Model (the DTOs)
// ============================================================================

pub use model::{
    Node, NodeId, Edge, EdgeKey, Direction, Path, Value, PropertyMap,
    CollectionConfig, Metric,
};

// ============================================================================
// Re-exports: Storage
// ============================================================================

pub use storage::{
    Backend, BackendConfig, BackendKind, Credentials, Isolation, Record,
    EmbeddedBackend, DistributedBackend,
};

// ============================================================================
// Re-exports: Transactions
// ============================================================================

pub use tx::{Txn, TxMode, TxId, WriteOp};

// ============================================================================
// Re-exports: Engine & service
// ============================================================================

pub use graph::{EntityStore, Neighbors};
pub use index::{VectorIndex, SearchFilter};
pub use planner::{HybridQuery, Traversal, Similarity, Strategy};
pub use execution::{QueryResult, Hit};
pub use ingest::{BulkRecord, BulkReport, RecordOutcome};
pub use service::{KnowledgeBase, Request, Response};
pub use instance::{
    Instance, InstanceHandle, InstanceManager, InstanceState, InstanceStatus,
    DegradedReason, RemoteInstance,
};
pub use config::{EngineConfig, LocalInstanceConfig, RetryPolicy, DegradedWritePolicy};

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Unavailable: {0}")]
    Unavailable(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

/// Wire-stable error category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    InvalidArgument,
    Conflict,
    Unavailable,
    Timeout,
    Internal,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Error::Conflict(_) => ErrorKind::Conflict,
            Error::Unavailable(_) => ErrorKind::Unavailable,
            Error::Timeout(_) => ErrorKind::Timeout,
            Error::Storage(_) | Error::Serialization(_) | Error::Io(_) | Error::Config(_) => {
                ErrorKind::Internal
            }
        }
    }

    /// `Conflict` and `Unavailable` may succeed on a later attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Conflict(_) | Error::Unavailable(_))
    }

    /// The detail without the category prefix.
    pub fn message(&self) -> String {
        match self {
            Error::NotFound(m)
            | Error::InvalidArgument(m)
            | Error::Conflict(m)
            | Error::Unavailable(m)
            | Error::Timeout(m)
            | Error::Storage(m)
            | Error::Config(m) => m.clone(),
            Error::Serialization(e) => e.to_string(),
            Error::Io(e) => e.to_string(),
        }
    }

    /// Rebuild an error received over the wire.
    pub fn from_kind(kind: ErrorKind, message: String) -> Self {
        match kind {
            ErrorKind::NotFound => Error::NotFound(message),
            ErrorKind::InvalidArgument => Error::InvalidArgument(message),
            ErrorKind::Conflict => Error::Conflict(message),
            ErrorKind::Unavailable => Error::Unavailable(message),
            ErrorKind::Timeout => Error::Timeout(message),
            ErrorKind::Internal => Error::Storage(message),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
