//! Engine configuration.
//!
//! Loaded from TOML; every field has a default so an empty file is valid.

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::storage::BackendConfig;
use crate::{Error, Result};

/// Exponential backoff policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl RetryPolicy {
    /// Default for write-write conflicts: quick, several attempts.
    pub const fn conflicts() -> Self {
        Self { max_attempts: 5, initial_backoff_ms: 5, max_backoff_ms: 200 }
    }

    /// Default for unreachable backends: slower, fewer attempts.
    pub const fn unavailable() -> Self {
        Self { max_attempts: 3, initial_backoff_ms: 50, max_backoff_ms: 2000 }
    }

    pub const fn none() -> Self {
        Self { max_attempts: 1, initial_backoff_ms: 0, max_backoff_ms: 0 }
    }

    /// Backoff before attempt `attempt + 1` (attempts are 1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(20);
        let ms = self.initial_backoff_ms.saturating_mul(1u64 << shift);
        Duration::from_millis(ms.min(self.max_backoff_ms))
    }
}

/// What an instance does with writes while Degraded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DegradedWritePolicy {
    /// Fail fast with `Unavailable`.
    #[default]
    Reject,
    /// Hold writes in a bounded queue and apply them once Ready again.
    Queue,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Upper bound for `max_hops` in traversals.
    #[serde(default = "default_max_hops_ceiling")]
    pub max_hops_ceiling: usize,

    /// Deadline applied to hybrid queries that don't carry their own.
    #[serde(default = "default_query_timeout_ms")]
    pub default_query_timeout_ms: u64,

    /// Vectors scored between cancellation checks.
    #[serde(default = "default_search_batch_size")]
    pub search_batch_size: usize,

    #[serde(default = "RetryPolicy::conflicts")]
    pub conflict_retry: RetryPolicy,

    #[serde(default = "RetryPolicy::unavailable")]
    pub unavailable_retry: RetryPolicy,

    #[serde(default)]
    pub degraded_writes: DegradedWritePolicy,

    #[serde(default = "default_write_queue_capacity")]
    pub write_queue_capacity: usize,

    /// Records per transaction during bulk load.
    #[serde(default = "default_bulk_batch_size")]
    pub bulk_batch_size: usize,

    /// Default deadline for every remote call.
    #[serde(default = "default_remote_timeout_ms")]
    pub remote_timeout_ms: u64,

    /// TTL of storage-node snapshot leases.
    #[serde(default = "default_snapshot_lease_ms")]
    pub snapshot_lease_ms: u64,
}

fn default_max_hops_ceiling() -> usize {
    8
}

fn default_query_timeout_ms() -> u64 {
    5_000
}

fn default_search_batch_size() -> usize {
    256
}

fn default_write_queue_capacity() -> usize {
    1024
}

fn default_bulk_batch_size() -> usize {
    128
}

fn default_remote_timeout_ms() -> u64 {
    10_000
}

fn default_snapshot_lease_ms() -> u64 {
    30_000
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_hops_ceiling: default_max_hops_ceiling(),
            default_query_timeout_ms: default_query_timeout_ms(),
            search_batch_size: default_search_batch_size(),
            conflict_retry: RetryPolicy::conflicts(),
            unavailable_retry: RetryPolicy::unavailable(),
            degraded_writes: DegradedWritePolicy::default(),
            write_queue_capacity: default_write_queue_capacity(),
            bulk_batch_size: default_bulk_batch_size(),
            remote_timeout_ms: default_remote_timeout_ms(),
            snapshot_lease_ms: default_snapshot_lease_ms(),
        }
    }
}

impl EngineConfig {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Self = toml::from_str(s).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        debug!(path = %path.display(), "loading engine config");
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        if self.search_batch_size == 0 || self.bulk_batch_size == 0 {
            return Err(Error::Config("batch sizes must be > 0".into()));
        }
        if self.conflict_retry.max_attempts == 0 || self.unavailable_retry.max_attempts == 0 {
            return Err(Error::Config("retry policies need at least one attempt".into()));
        }
        Ok(())
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.default_query_timeout_ms)
    }

    pub fn remote_timeout(&self) -> Duration {
        Duration::from_millis(self.remote_timeout_ms)
    }

    pub fn snapshot_lease(&self) -> Duration {
        Duration::from_millis(self.snapshot_lease_ms)
    }
}

/// Configuration of one instance started by the instance manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalInstanceConfig {
    /// Knowledge base name, for status and logs.
    pub name: String,
    pub backend: BackendConfig,
    /// Serve the service RPC on this address so other processes can connect.
    #[serde(default)]
    pub listen: Option<SocketAddr>,
    #[serde(default)]
    pub engine: EngineConfig,
}

impl LocalInstanceConfig {
    pub fn embedded(name: impl Into<String>, path: impl Into<std::path::PathBuf>) -> Self {
        Self {
            name: name.into(),
            backend: BackendConfig::Embedded { path: path.into() },
            listen: None,
            engine: EngineConfig::default(),
        }
    }

    pub fn with_listen(mut self, addr: SocketAddr) -> Self {
        self.listen = Some(addr);
        self
    }

    pub fn with_engine(mut self, engine: EngineConfig) -> Self {
        self.engine = engine;
        self
    }
}
