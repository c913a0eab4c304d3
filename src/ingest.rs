//! Bulk load.
//!
//! Records are applied in batches of `bulk_batch_size`, one transaction per
//! batch. When a batch fails, its records are replayed one transaction each
//! so a bad record never takes its neighbours down with it. Every record
//! gets its own outcome; the pipeline retries only the failed ones.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::graph::{EntityStore, WriteMode};
use crate::index::VectorChange;
use crate::model::{Edge, Node};
use crate::storage::retry;
use crate::tx::{Txn, TxMode};
use crate::{ErrorKind, Result};

/// One ingestion record. Nodes (with an optional embedding) and edges are
/// both upserts, so a retried record is harmless.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BulkRecord {
    Node { node: Node },
    Edge { edge: Edge },
}

impl From<Node> for BulkRecord {
    fn from(node: Node) -> Self {
        BulkRecord::Node { node }
    }
}

impl From<Edge> for BulkRecord {
    fn from(edge: Edge) -> Self {
        BulkRecord::Edge { edge }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RecordOutcome {
    Applied,
    Failed { kind: ErrorKind, message: String },
}

impl RecordOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, RecordOutcome::Applied)
    }
}

/// Per-record outcomes, in input order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BulkReport {
    pub outcomes: Vec<RecordOutcome>,
    pub applied: usize,
    pub failed: usize,
    /// Batches that had to fall back to per-record transactions.
    pub split_batches: usize,
}

impl BulkReport {
    /// Input positions of the records that failed.
    pub fn failed_indices(&self) -> Vec<usize> {
        self.outcomes
            .iter()
            .enumerate()
            .filter(|(_, o)| !o.is_applied())
            .map(|(i, _)| i)
            .collect()
    }

    fn record(&mut self, outcome: RecordOutcome) {
        if outcome.is_applied() {
            self.applied += 1;
        } else {
            self.failed += 1;
        }
        self.outcomes.push(outcome);
    }
}

/// Load `records` into `collection`. Only an unknown collection (or an
/// unreachable backend before the first batch) fails the whole call.
pub async fn bulk_load(store: &EntityStore, collection: &str, records: &[BulkRecord]) -> Result<BulkReport> {
    // Loads the index too, so published batches land in it directly.
    store.index(collection).await?;
    let batch_size = store.config().bulk_batch_size.max(1);
    let mut report = BulkReport::default();

    for chunk in records.chunks(batch_size) {
        match apply(store, collection, chunk).await {
            Ok(()) => {
                for _ in chunk {
                    report.record(RecordOutcome::Applied);
                }
            }
            Err(e) => {
                debug!(collection, records = chunk.len(), error = %e, "batch failed, applying records one by one");
                report.split_batches += 1;
                for record in chunk {
                    let outcome = match apply(store, collection, std::slice::from_ref(record)).await {
                        Ok(()) => RecordOutcome::Applied,
                        Err(e) => RecordOutcome::Failed { kind: e.kind(), message: e.message() },
                    };
                    report.record(outcome);
                }
            }
        }
    }

    info!(collection, applied = report.applied, failed = report.failed, "bulk load finished");
    Ok(report)
}

/// One transaction for all of `records`.
async fn apply(store: &EntityStore, collection: &str, records: &[BulkRecord]) -> Result<()> {
    let (changes, commit) = retry::on_conflict(&store.config().conflict_retry, "bulk_load", || async move {
        let mut tx = store.backend().begin_tx(TxMode::ReadWrite).await?;
        let staged = stage_all(store, &mut tx, collection, records).await;
        store.finish_published(tx, staged).await
    })
    .await?;
    store.publish(collection, commit, &changes);
    Ok(())
}

async fn stage_all(
    store: &EntityStore,
    tx: &mut Txn,
    collection: &str,
    records: &[BulkRecord],
) -> Result<Vec<VectorChange>> {
    let mut changes = Vec::new();
    for record in records {
        match record {
            BulkRecord::Node { node } => {
                let (_, staged) = store.stage_node(tx, collection, node, WriteMode::Upsert).await?;
                changes.extend(staged);
            }
            BulkRecord::Edge { edge } => {
                store.stage_edge(tx, collection, edge, WriteMode::Upsert).await?;
            }
        }
    }
    Ok(changes)
}
