//! PropertyMap: the key-value store on nodes and edges.

use std::collections::BTreeMap;
use super::Value;

/// A map of property names to values. Key order carries no meaning; the
/// sorted map only keeps serialized records deterministic across backends.
pub type PropertyMap = BTreeMap<String, Value>;
