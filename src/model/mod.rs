//! # Hybrid Graph Model
//!
//! Clean DTOs for the graph + vector memory layer.
//! These types cross every boundary: storage ↔ index ↔ planner ↔ execution ↔ caller.
//!
//! Design rule: NO sled types, NO HTTP types here.
//! This module is pure data: no I/O and no async.

pub mod node;
pub mod edge;
pub mod path;
pub mod value;
pub mod property_map;
pub mod collection;

pub use node::{Node, NodeId};
pub use edge::{Edge, EdgeKey, Direction};
pub use path::Path;
pub use value::Value;
pub use property_map::PropertyMap;
pub use collection::{CollectionConfig, Metric};

use crate::{Error, Result};

/// Identifiers (node ids, relation labels) become key segments, so they are
/// restricted to a separator-free alphabet.
pub(crate) fn validate_ident(kind: &str, s: &str) -> Result<()> {
    if s.is_empty() {
        return Err(Error::InvalidArgument(format!("{kind} must not be empty")));
    }
    if s.len() > 256 {
        return Err(Error::InvalidArgument(format!("{kind} longer than 256 bytes")));
    }
    let ok = s.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | ':'));
    if !ok {
        return Err(Error::InvalidArgument(format!("invalid {kind}: {s:?}")));
    }
    Ok(())
}
