//! Error types for graph construction and anchor lookup.

use std::error::Error;
use std::fmt;

use crate::id::{NodeId, OutputRef, SymbolId};

/// Which kind of anchor an [`GraphError::InvalidAnchor`] refers to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AnchorKind {
    /// A data output anchor.
    Output,
    /// A data input anchor.
    Input,
    /// A workspace slot.
    Workspace,
}

impl fmt::Display for AnchorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Output => write!(f, "output"),
            Self::Input => write!(f, "input"),
            Self::Workspace => write!(f, "workspace"),
        }
    }
}

/// Errors from graph construction, lookup, and write-back.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GraphError {
    /// A `NodeId` that does not exist in the graph.
    UnknownNode {
        /// The unrecognised node.
        node: NodeId,
    },
    /// An anchor index beyond the node's declared anchor count.
    InvalidAnchor {
        /// Name of the node owning the anchor.
        node_name: String,
        /// Kind of anchor.
        kind: AnchorKind,
        /// The out-of-range index.
        index: u32,
    },
    /// An edge whose source does not precede its destination.
    NotTopological {
        /// Name of the edge source.
        src: String,
        /// Name of the edge destination.
        dst: String,
    },
    /// An input anchor that already has a producer.
    InputAlreadyConnected {
        /// Name of the consuming node.
        node_name: String,
        /// The doubly-connected input index.
        index: u32,
    },
    /// A ref relation chain that revisits a node.
    RefCycle {
        /// Name of the node where the cycle was detected.
        node_name: String,
    },
    /// An output anchor registered in two different symbols.
    DuplicateSymbolMember {
        /// The anchor.
        anchor: OutputRef,
        /// The symbol it already belongs to.
        existing: SymbolId,
        /// The symbol it was being added to.
        requested: SymbolId,
    },
}

impl fmt::Display for GraphError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownNode { node } => write!(f, "unknown node id {node}"),
            Self::InvalidAnchor {
                node_name,
                kind,
                index,
            } => {
                write!(f, "node '{node_name}' has no {kind} anchor {index}")
            }
            Self::NotTopological { src, dst } => {
                write!(
                    f,
                    "edge '{src}' -> '{dst}' violates topological order"
                )
            }
            Self::InputAlreadyConnected { node_name, index } => {
                write!(f, "input {index} of node '{node_name}' is already connected")
            }
            Self::RefCycle { node_name } => {
                write!(f, "ref relation cycle through node '{node_name}'")
            }
            Self::DuplicateSymbolMember {
                anchor,
                existing,
                requested,
            } => {
                write!(
                    f,
                    "anchor {anchor} already belongs to {existing}, cannot join {requested}"
                )
            }
        }
    }
}

impl Error for GraphError {}
