//! Path: the traversal route that reached a result node.

use serde::{Deserialize, Serialize};
use super::{Edge, NodeId};

/// A path in the graph: node -[edge]- node -[edge]- node ...
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Path {
    /// Nodes along the path. Always has one more element than `edges`.
    pub nodes: Vec<NodeId>,
    /// Edges connecting consecutive nodes, as stored (source → target).
    pub edges: Vec<Edge>,
}

impl Path {
    pub fn single(node: NodeId) -> Self {
        Self { nodes: vec![node], edges: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.edges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    pub fn start(&self) -> &NodeId {
        &self.nodes[0]
    }

    pub fn end(&self) -> &NodeId {
        &self.nodes[self.nodes.len() - 1]
    }

    /// Extend path with an edge and the node it leads to.
    pub fn append(&mut self, edge: Edge, node: NodeId) {
        self.edges.push(edge);
        self.nodes.push(node);
    }

    /// The same route walked from the other end.
    pub fn reversed(mut self) -> Self {
        self.nodes.reverse();
        self.edges.reverse();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> NodeId {
        NodeId::new(s).unwrap()
    }

    #[test]
    fn test_append_and_reverse() {
        let mut p = Path::single(id("a"));
        p.append(Edge::new(id("a"), "knows", id("b")), id("b"));
        p.append(Edge::new(id("b"), "knows", id("c")), id("c"));
        assert_eq!(p.len(), 2);
        assert_eq!(p.end(), &id("c"));

        let r = p.reversed();
        assert_eq!(r.start(), &id("c"));
        assert_eq!(r.edges[0].source, id("b"));
    }
}
