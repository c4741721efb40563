//! Write-back abstraction for assigned memory offsets.

use crate::error::GraphError;
use crate::id::{InputRef, NodeId, OutputRef, StreamId};
use crate::tensor::MemoryType;

/// Receives assigned offsets for later code generation.
///
/// Implemented by [`Graph`](crate::Graph), which stores them on each node's
/// [`OpDesc`](crate::OpDesc). Other IRs implement this trait to consume an
/// assignment without converting into a `Graph` first.
pub trait MemOffsetSink {
    /// Record the byte offset and memory type of an output.
    fn set_output_offset(
        &mut self,
        anchor: OutputRef,
        offset: u64,
        memory_type: MemoryType,
    ) -> Result<(), GraphError>;

    /// Record the byte offset and memory type of a workspace.
    fn set_workspace_offset(
        &mut self,
        node: NodeId,
        index: u32,
        offset: u64,
        memory_type: MemoryType,
    ) -> Result<(), GraphError>;

    /// Record the byte offset a data input reads from.
    fn set_input_offset(&mut self, anchor: InputRef, offset: u64) -> Result<(), GraphError>;

    /// Move a node onto a different stream.
    fn set_stream(&mut self, node: NodeId, stream: StreamId) -> Result<(), GraphError>;
}
