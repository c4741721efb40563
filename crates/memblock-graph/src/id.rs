//! Strongly-typed identifiers and anchor references.

use std::fmt;

/// Identifies a node within a [`Graph`](crate::Graph).
///
/// Nodes are stored in topological order, so a `NodeId` doubles as the
/// node's topological id: `NodeId(n)` is the n-th node added to the graph
/// and every producer has a smaller id than its consumers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u32);

impl NodeId {
    /// The id as a `usize` index into the node arena.
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for NodeId {
    fn from(v: u32) -> Self {
        Self(v)
    }
}

/// A logical execution queue on the target device.
///
/// Nodes on one stream execute in topological order; nodes on different
/// streams are only ordered through explicit cross-stream edges.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(pub i64);

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for StreamId {
    fn from(v: i64) -> Self {
        Self(v)
    }
}

/// Identifies the (partitioned) sub-graph a node belongs to.
///
/// The root graph is `SubGraphId(0)`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubGraphId(pub u32);

impl fmt::Display for SubGraphId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for SubGraphId {
    fn from(v: u32) -> Self {
        Self(v)
    }
}

/// Identifies an alias-equivalence class of output anchors.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SymbolId(pub u32);

impl fmt::Display for SymbolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sym{}", self.0)
    }
}

/// An output anchor: `(node, output index)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OutputRef {
    /// Producing node.
    pub node: NodeId,
    /// Output index on the producing node.
    pub index: u32,
}

impl OutputRef {
    /// Create an output anchor reference.
    pub fn new(node: NodeId, index: u32) -> Self {
        Self { node, index }
    }
}

impl fmt::Display for OutputRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:out{}", self.node, self.index)
    }
}

/// An input anchor: `(node, input index)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InputRef {
    /// Consuming node.
    pub node: NodeId,
    /// Input index on the consuming node.
    pub index: u32,
}

impl InputRef {
    /// Create an input anchor reference.
    pub fn new(node: NodeId, index: u32) -> Self {
        Self { node, index }
    }
}

impl fmt::Display for InputRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:in{}", self.node, self.index)
    }
}
