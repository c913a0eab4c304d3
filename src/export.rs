//! Collection dump and migration.
//!
//! Both work on the logical schema (`_catalog` entry plus the `n/`, `v/`,
//! `o/`, `i/` keyspaces), which is identical across backends, so records
//! are copied verbatim. This is the embedded → distributed migration path.
//!
//! ```text
//! EmbeddedBackend ──dump_collection()──▶ JSON lines ──restore_collection()──▶ any Backend
//! EmbeddedBackend ──────────────migrate_collection()─────────────────────────▶ DistributedBackend
//! ```

use std::io::{BufRead, Write};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::model::CollectionConfig;
use crate::model::collection::validate_collection_name;
use crate::storage::keys::{self, CATALOG, IN_PREFIX, NODE_PREFIX, OUT_PREFIX, VECTOR_PREFIX};
use crate::storage::{Backend, Record};
use crate::tx::{TxMode, WriteOp};
use crate::{Error, Result};

/// Records per transaction while copying into the target.
const COPY_BATCH: usize = 512;

const KEYSPACES: [&str; 4] = [NODE_PREFIX, VECTOR_PREFIX, OUT_PREFIX, IN_PREFIX];

/// One line of a dump.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "line", rename_all = "snake_case")]
pub enum DumpLine {
    /// Always the first line.
    Collection { config: CollectionConfig },
    Record { key: String, value: Record },
}

/// Read a whole collection from one snapshot.
async fn snapshot(backend: &dyn Backend, name: &str) -> Result<(CollectionConfig, Vec<(String, Record)>)> {
    validate_collection_name(name)?;
    let tx = backend.begin_tx(TxMode::ReadOnly).await?;
    let out: Result<(CollectionConfig, Vec<(String, Record)>)> = async {
        let config = match backend.get_in(&tx, CATALOG, &keys::collection_key(name)).await? {
            Some(record) => serde_json::from_value(record)?,
            None => return Err(Error::NotFound(format!("collection '{name}'"))),
        };
        let mut records = Vec::new();
        for prefix in KEYSPACES {
            records.extend(backend.scan_in(&tx, name, prefix).await?);
        }
        Ok((config, records))
    }
    .await;
    backend.rollback_tx(tx).await?;
    out
}

/// Write every logical record of `name` as JSON lines. Returns the number
/// of records written (the collection line excluded).
pub async fn dump_collection(backend: &dyn Backend, name: &str, writer: &mut dyn Write) -> Result<usize> {
    let (config, records) = snapshot(backend, name).await?;
    serde_json::to_writer(&mut *writer, &DumpLine::Collection { config })?;
    writeln!(writer)?;
    let count = records.len();
    for (key, value) in records {
        serde_json::to_writer(&mut *writer, &DumpLine::Record { key, value })?;
        writeln!(writer)?;
    }
    writer.flush()?;
    Ok(count)
}

/// Load a dump into `backend`. The collection must not exist there yet.
pub async fn restore_collection(backend: &dyn Backend, reader: &mut dyn BufRead) -> Result<CollectionConfig> {
    let mut lines = reader.lines();
    let config = match lines.next() {
        Some(line) => match serde_json::from_str(&line?)? {
            DumpLine::Collection { config } => config,
            DumpLine::Record { .. } => {
                return Err(Error::InvalidArgument("dump does not start with a collection line".into()));
            }
        },
        None => return Err(Error::InvalidArgument("empty dump".into())),
    };
    let mut records = Vec::new();
    for line in lines {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str(&line)? {
            DumpLine::Record { key, value } => records.push((key, value)),
            DumpLine::Collection { .. } => {
                return Err(Error::InvalidArgument("dump holds more than one collection".into()));
            }
        }
    }
    copy_into(backend, &config, records).await?;
    Ok(config)
}

/// Copy collection `name` from one backend to another, record for record.
/// Returns the number of records copied.
pub async fn migrate_collection(from: &dyn Backend, to: &dyn Backend, name: &str) -> Result<usize> {
    let (config, records) = snapshot(from, name).await?;
    let count = records.len();
    copy_into(to, &config, records).await?;
    info!(collection = name, records = count, from = ?from.kind(), to = ?to.kind(), "collection migrated");
    Ok(count)
}

/// The catalog entry is written last, so an interrupted copy never shows
/// up as a collection.
async fn copy_into(to: &dyn Backend, config: &CollectionConfig, records: Vec<(String, Record)>) -> Result<()> {
    config.validate()?;
    let catalog_key = keys::collection_key(&config.name);
    if to.get(CATALOG, &catalog_key).await?.is_some() {
        return Err(Error::InvalidArgument(format!("collection '{}' already exists in the target", config.name)));
    }
    for chunk in records.chunks(COPY_BATCH) {
        let ops = chunk
            .iter()
            .map(|(key, value)| WriteOp::Put {
                namespace: config.name.clone(),
                key: key.clone(),
                value: value.clone(),
            })
            .collect();
        to.transact(ops).await?;
    }
    to.put(CATALOG, &catalog_key, serde_json::to_value(config)?).await?;
    Ok(())
}
