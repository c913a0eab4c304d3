//! Logical key layout.
//!
//! The same layout is used by every backend, so a knowledge base moves
//! between embedded and distributed storage without transformation.
//!
//! | Namespace      | Key                          | Record            |
//! |----------------|------------------------------|-------------------|
//! | `_catalog`     | `collection/{name}`          | CollectionConfig  |
//! | `{collection}` | `n/{node}`                   | node record       |
//! | `{collection}` | `v/{node}`                   | embedding record  |
//! | `{collection}` | `o/{src}/{relation}/{dst}`   | edge record       |
//! | `{collection}` | `i/{dst}/{relation}/{src}`   | edge record       |

use crate::model::{Direction, EdgeKey, NodeId};
use crate::{Error, Result};

pub const CATALOG: &str = "_catalog";
pub const COLLECTION_PREFIX: &str = "collection/";
pub const NODE_PREFIX: &str = "n/";
pub const VECTOR_PREFIX: &str = "v/";
pub const OUT_PREFIX: &str = "o/";
pub const IN_PREFIX: &str = "i/";

/// Namespace names: `[A-Za-z0-9_-]+`.
pub fn validate_namespace(namespace: &str) -> Result<()> {
    let ok = !namespace.is_empty()
        && namespace.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if ok {
        Ok(())
    } else {
        Err(Error::InvalidArgument(format!("malformed namespace: {namespace:?}")))
    }
}

pub fn validate_key(namespace: &str, key: &str) -> Result<()> {
    validate_namespace(namespace)?;
    if key.is_empty() || key.contains('\0') {
        return Err(Error::InvalidArgument(format!("malformed key: {key:?}")));
    }
    Ok(())
}

/// Physical encoding shared by the on-disk and in-memory key spaces:
/// `namespace \0 key`. Namespaces never contain NUL, so prefix scans stay
/// inside one namespace.
pub fn encode(namespace: &str, key: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(namespace.len() + 1 + key.len());
    out.extend_from_slice(namespace.as_bytes());
    out.push(0);
    out.extend_from_slice(key.as_bytes());
    out
}

pub fn decode(raw: &[u8]) -> Result<(String, String)> {
    let split = raw
        .iter()
        .position(|b| *b == 0)
        .ok_or_else(|| Error::Storage("stored key without namespace separator".into()))?;
    let ns = std::str::from_utf8(&raw[..split])
        .map_err(|e| Error::Storage(format!("non-utf8 namespace: {e}")))?;
    let key = std::str::from_utf8(&raw[split + 1..])
        .map_err(|e| Error::Storage(format!("non-utf8 key: {e}")))?;
    Ok((ns.to_string(), key.to_string()))
}

// ============================================================================
// Builders
// ============================================================================

pub fn collection_key(name: &str) -> String {
    format!("{COLLECTION_PREFIX}{name}")
}

pub fn node_key(id: &NodeId) -> String {
    format!("{NODE_PREFIX}{id}")
}

pub fn vector_key(id: &NodeId) -> String {
    format!("{VECTOR_PREFIX}{id}")
}

pub fn out_key(edge: &EdgeKey) -> String {
    format!("{OUT_PREFIX}{}/{}/{}", edge.source, edge.relation, edge.target)
}

pub fn in_key(edge: &EdgeKey) -> String {
    format!("{IN_PREFIX}{}/{}/{}", edge.target, edge.relation, edge.source)
}

/// Adjacency prefixes to scan for a node, one per side selected by `dir`.
pub fn adjacency_prefixes(node: &NodeId, relation: Option<&str>, dir: Direction) -> Vec<String> {
    let suffix = match relation {
        Some(rel) => format!("{node}/{rel}/"),
        None => format!("{node}/"),
    };
    match dir {
        Direction::Outbound => vec![format!("{OUT_PREFIX}{suffix}")],
        Direction::Inbound => vec![format!("{IN_PREFIX}{suffix}")],
        Direction::Both => vec![format!("{OUT_PREFIX}{suffix}"), format!("{IN_PREFIX}{suffix}")],
    }
}

/// The id part of an `n/` or `v/` key.
pub fn id_from_key<'a>(key: &'a str, prefix: &str) -> Option<&'a str> {
    key.strip_prefix(prefix)
}

/// Split an adjacency key into `(node, relation, other)`.
pub fn parse_adjacency(key: &str) -> Option<(&str, &str, &str)> {
    let rest = key.strip_prefix(OUT_PREFIX).or_else(|| key.strip_prefix(IN_PREFIX))?;
    let mut parts = rest.splitn(3, '/');
    Some((parts.next()?, parts.next()?, parts.next()?))
}
