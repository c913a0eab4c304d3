//! Edge (directed relation) in the hybrid graph.

use serde::{Deserialize, Serialize};
use super::{NodeId, PropertyMap, Value, validate_ident};
use crate::Result;

/// Traversal direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    #[default]
    Outbound,
    Inbound,
    Both,
}

impl Direction {
    /// The direction a reverse walk has to take.
    pub fn reverse(self) -> Self {
        match self {
            Direction::Outbound => Direction::Inbound,
            Direction::Inbound => Direction::Outbound,
            Direction::Both => Direction::Both,
        }
    }
}

/// Identity of an edge. At most one edge exists per `(source, relation, target)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EdgeKey {
    pub source: NodeId,
    pub relation: String,
    pub target: NodeId,
}

impl EdgeKey {
    pub fn new(source: NodeId, relation: impl Into<String>, target: NodeId) -> Result<Self> {
        let relation = relation.into();
        validate_ident("relation", &relation)?;
        Ok(Self { source, relation, target })
    }

    pub fn validate(&self) -> Result<()> {
        self.source.validate()?;
        self.target.validate()?;
        validate_ident("relation", &self.relation)
    }
}

impl std::fmt::Display for EdgeKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({})-[{}]->({})", self.source, self.relation, self.target)
    }
}

fn default_weight() -> f32 {
    1.0
}

/// A directed edge. Not independently embeddable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub source: NodeId,
    pub relation: String,
    pub target: NodeId,
    #[serde(default = "default_weight")]
    pub weight: f32,
    #[serde(default)]
    pub properties: PropertyMap,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partition: Option<String>,
}

impl Edge {
    pub fn new(source: NodeId, relation: impl Into<String>, target: NodeId) -> Self {
        Self {
            source,
            relation: relation.into(),
            target,
            weight: default_weight(),
            properties: PropertyMap::new(),
            partition: None,
        }
    }

    pub fn with_weight(mut self, weight: f32) -> Self {
        self.weight = weight;
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

    pub fn in_partition(&self, partition: &str) -> bool {
        self.partition.as_deref() == Some(partition)
    }

    pub fn key(&self) -> EdgeKey {
        EdgeKey {
            source: self.source.clone(),
            relation: self.relation.clone(),
            target: self.target.clone(),
        }
    }

    /// The "other" end of the edge from the given node.
    pub fn other_node(&self, from: &NodeId) -> Option<&NodeId> {
        if *from == self.source { Some(&self.target) }
        else if *from == self.target { Some(&self.source) }
        else { None }
    }
}
