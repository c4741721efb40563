//! Assignment error types.

use std::error::Error;
use std::fmt;

use memblock_graph::{GraphError, OutputRef};

use crate::slot::SlotRole;

/// Coarse classification of an [`AssignError`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// The graph or configuration breaks an input contract.
    PreconditionViolation,
    /// The graph is well formed but uses a shape the engine cannot place.
    UnsupportedGraphShape,
}

/// Errors that can occur during memory assignment.
///
/// Every variant names the offending node so a failure can be traced back
/// to the graph without re-running the assignment.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AssignError {
    /// Graph lookup or write-back failed.
    Graph(GraphError),
    /// A slot whose byte size cannot be determined.
    InvalidTensorSize {
        /// Name of the node owning the slot.
        node_name: String,
        /// Role of the slot.
        role: SlotRole,
        /// Slot index within its role.
        index: u32,
        /// What made the size invalid.
        reason: &'static str,
    },
    /// A continuous-input node with an unconnected data input.
    UnresolvedContinuousInput {
        /// Name of the continuous-input node.
        node_name: String,
        /// The unconnected input index.
        input_index: u32,
    },
    /// Continuous constraints that cannot be satisfied by a single ordering.
    AmbiguousContinuousBinding {
        /// Name of the node where the conflict surfaced.
        node_name: String,
        /// The anchor with conflicting neighbours.
        anchor: OutputRef,
        /// Description of the conflict.
        reason: &'static str,
    },
    /// A configuration parameter out of range.
    InvalidConfig {
        /// Description of the problem.
        reason: String,
    },
    /// An internal consistency check failed.
    ContractViolation {
        /// Name of the node being processed.
        node_name: String,
        /// Description of the broken contract.
        reason: String,
    },
}

impl AssignError {
    /// Classify the error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::UnresolvedContinuousInput { .. } | Self::AmbiguousContinuousBinding { .. } => {
                ErrorKind::UnsupportedGraphShape
            }
            Self::Graph(_)
            | Self::InvalidTensorSize { .. }
            | Self::InvalidConfig { .. }
            | Self::ContractViolation { .. } => ErrorKind::PreconditionViolation,
        }
    }
}

impl fmt::Display for AssignError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Graph(e) => write!(f, "graph error: {e}"),
            Self::InvalidTensorSize {
                node_name,
                role,
                index,
                reason,
            } => {
                write!(
                    f,
                    "invalid size for {role} {index} of node '{node_name}': {reason}"
                )
            }
            Self::UnresolvedContinuousInput {
                node_name,
                input_index,
            } => {
                write!(
                    f,
                    "continuous-input node '{node_name}' has no producer on input {input_index}"
                )
            }
            Self::AmbiguousContinuousBinding {
                node_name,
                anchor,
                reason,
            } => {
                write!(
                    f,
                    "ambiguous continuous binding at node '{node_name}' for {anchor}: {reason}"
                )
            }
            Self::InvalidConfig { reason } => write!(f, "invalid config: {reason}"),
            Self::ContractViolation { node_name, reason } => {
                write!(f, "contract violation at node '{node_name}': {reason}")
            }
        }
    }
}

impl Error for AssignError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Graph(e) => Some(e),
            _ => None,
        }
    }
}

impl From<GraphError> for AssignError {
    fn from(e: GraphError) -> Self {
        Self::Graph(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use memblock_graph::NodeId;

    #[test]
    fn continuous_errors_are_unsupported_shapes() {
        let err = AssignError::UnresolvedContinuousInput {
            node_name: "concat".into(),
            input_index: 2,
        };
        assert_eq!(err.kind(), ErrorKind::UnsupportedGraphShape);
        assert!(err.to_string().contains("concat"));
    }

    #[test]
    fn graph_errors_keep_their_source() {
        let err: AssignError = GraphError::UnknownNode { node: NodeId(4) }.into();
        assert_eq!(err.kind(), ErrorKind::PreconditionViolation);
        assert!(err.source().is_some());
    }

    #[test]
    fn size_error_names_slot() {
        let err = AssignError::InvalidTensorSize {
            node_name: "reshape".into(),
            role: SlotRole::Output,
            index: 1,
            reason: "unknown dimension",
        };
        assert_eq!(
            err.to_string(),
            "invalid size for output 1 of node 'reshape': unknown dimension"
        );
    }
}
