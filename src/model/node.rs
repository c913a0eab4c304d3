//! Node in the hybrid graph.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use super::{PropertyMap, Value, validate_ident};
use crate::Result;

/// Stable node identifier.
///
/// Caller-chosen (or generated) string that survives a move between
/// backends unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    /// Validate and wrap an identifier.
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        validate_ident("node id", &id)?;
        Ok(Self(id))
    }

    /// A fresh random identifier.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Re-check the invariant after deserialization from an untrusted source.
    pub fn validate(&self) -> Result<()> {
        validate_ident("node id", &self.0)
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<&str> for NodeId {
    type Error = crate::Error;

    fn try_from(s: &str) -> Result<Self> {
        NodeId::new(s)
    }
}

/// A node in the graph.
///
/// `embedding` is populated on reads from the vector keyspace; on writes it
/// is routed to the vector index of the node's collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    /// Type tags (open set).
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub properties: PropertyMap,
    /// Scope the node belongs to (e.g. "personal", "work"); `None` is
    /// unpartitioned.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partition: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl Node {
    pub fn new(id: NodeId) -> Self {
        let now = Utc::now();
        Self {
            id,
            labels: Vec::new(),
            properties: PropertyMap::new(),
            partition: None,
            embedding: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_labels(mut self, labels: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.labels = labels.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn with_partition(mut self, partition: impl Into<String>) -> Self {
        self.partition = Some(partition.into());
        self
    }

    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self
    }

    pub fn has_label(&self, label: &str) -> bool {
        self.labels.iter().any(|l| l == label)
    }

    pub fn in_partition(&self, partition: &str) -> bool {
        self.partition.as_deref() == Some(partition)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.properties.get(key)
    }
}
