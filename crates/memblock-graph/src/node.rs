//! Nodes, node attributes, and the op descriptor that receives offsets.

use indexmap::IndexMap;

use crate::id::{NodeId, StreamId, SubGraphId};
use crate::tensor::{MemoryType, TensorDesc};

/// Well-known operator type names the assignment engine treats specially.
pub mod op_type {
    /// Graph input placeholder. Its outputs carry the `Data` memory attribute.
    pub const DATA: &str = "Data";
    /// Sub-graph input placeholder. Treated like [`DATA`].
    pub const REF_DATA: &str = "RefData";
    /// Graph output collector. Producers feeding it may be zero-copy.
    pub const NET_OUTPUT: &str = "NetOutput";
    /// Call into a partitioned sub-graph.
    pub const PARTITIONED_CALL: &str = "PartitionedCall";
}

/// Memory-relevant attributes of a node.
///
/// Everything here is optional; `NodeAttrs::default()` describes a plain
/// operator with no special memory requirements.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NodeAttrs {
    /// All data inputs must occupy one contiguous range, in input order.
    pub continuous_input: bool,
    /// All outputs must occupy one contiguous range, in output order.
    pub continuous_output: bool,
    /// Ref relations: output index → the input index it writes through.
    ///
    /// A ref output aliases the memory of the producer feeding that input.
    pub ref_outputs: IndexMap<u32, u32>,
    /// Output indices written with atomic accumulation.
    pub atomic_outputs: Vec<u32>,
    /// Workspace indices written with atomic accumulation.
    pub atomic_workspaces: Vec<u32>,
    /// Explicit sub-stream assignment. Highest-precedence stream source.
    pub sub_stream_id: Option<StreamId>,
    /// Stream of the enclosing thread scope, used when no sub-stream is set.
    pub thread_scope_stream_id: Option<StreamId>,
    /// FFTS sub-task slice sizes in bytes, per output index.
    pub ffts_split_sizes: IndexMap<u32, Vec<i64>>,
    /// Output indices whose address must be fixed ahead of other buffers.
    pub fixed_addr_prior_outputs: Vec<u32>,
    /// Dynamic-batch branch label; unlabeled nodes run in every batch.
    pub batch_label: Option<String>,
    /// Sub-graph the node belongs to.
    pub sub_graph_id: SubGraphId,
    /// For `PartitionedCall` nodes: output index → the node inside the
    /// sub-graph that is the real last consumer of that output.
    pub subgraph_output_consumers: IndexMap<u32, NodeId>,
}

/// Per-node descriptor written back by memory assignment.
///
/// All entries start as `None` and are filled by a [`MemOffsetSink`]
/// write-back.
///
/// [`MemOffsetSink`]: crate::MemOffsetSink
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct OpDesc {
    /// Byte offset of each output.
    pub output_offsets: Vec<Option<u64>>,
    /// Memory type of each output.
    pub output_memory_types: Vec<MemoryType>,
    /// Byte offset of each workspace.
    pub workspace_offsets: Vec<Option<u64>>,
    /// Memory type of each workspace.
    pub workspace_memory_types: Vec<MemoryType>,
    /// Byte offset of each data input (its producer's output offset).
    pub input_offsets: Vec<Option<u64>>,
}

/// Definition of a node prior to insertion into a [`Graph`](crate::Graph).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeDef {
    /// Unique human-readable name.
    pub name: String,
    /// Operator type.
    pub op_type: String,
    /// Stream from the node's own descriptor.
    pub stream_id: StreamId,
    /// Number of data input anchors.
    pub input_count: u32,
    /// Output tensors.
    pub outputs: Vec<TensorDesc>,
    /// Workspace sizes in bytes.
    pub workspaces: Vec<i64>,
    /// Memory-relevant attributes.
    pub attrs: NodeAttrs,
}

impl NodeDef {
    /// A node on stream 0 with no anchors.
    pub fn new(name: impl Into<String>, op_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            op_type: op_type.into(),
            stream_id: StreamId(0),
            input_count: 0,
            outputs: Vec::new(),
            workspaces: Vec::new(),
            attrs: NodeAttrs::default(),
        }
    }

    /// Set the descriptor stream.
    pub fn stream(mut self, stream: i64) -> Self {
        self.stream_id = StreamId(stream);
        self
    }

    /// Set the number of data inputs.
    pub fn inputs(mut self, count: u32) -> Self {
        self.input_count = count;
        self
    }

    /// Append an output tensor.
    pub fn output(mut self, desc: TensorDesc) -> Self {
        self.outputs.push(desc);
        self
    }

    /// Append a workspace of the given byte size.
    pub fn workspace(mut self, bytes: i64) -> Self {
        self.workspaces.push(bytes);
        self
    }

    /// Replace the attribute set.
    pub fn attrs(mut self, attrs: NodeAttrs) -> Self {
        self.attrs = attrs;
        self
    }
}

/// A vertex of the compute graph.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Node {
    /// Stable (and topological) id.
    pub id: NodeId,
    /// Unique human-readable name.
    pub name: String,
    /// Operator type.
    pub op_type: String,
    /// Stream from the node's own descriptor.
    pub stream_id: StreamId,
    /// Output tensors.
    pub outputs: Vec<TensorDesc>,
    /// Workspace sizes in bytes.
    pub workspaces: Vec<i64>,
    /// Memory-relevant attributes.
    pub attrs: NodeAttrs,
    /// Write-back target.
    pub desc: OpDesc,
}

impl Node {
    pub(crate) fn from_def(id: NodeId, def: NodeDef) -> Self {
        let desc = OpDesc {
            output_offsets: vec![None; def.outputs.len()],
            output_memory_types: def.outputs.iter().map(|t| t.memory_type).collect(),
            workspace_offsets: vec![None; def.workspaces.len()],
            workspace_memory_types: vec![MemoryType::Hbm; def.workspaces.len()],
            input_offsets: vec![None; def.input_count as usize],
        };
        Self {
            id,
            name: def.name,
            op_type: def.op_type,
            stream_id: def.stream_id,
            outputs: def.outputs,
            workspaces: def.workspaces,
            attrs: def.attrs,
            desc,
        }
    }

    /// Number of output anchors.
    pub fn output_count(&self) -> u32 {
        self.outputs.len() as u32
    }

    /// Whether this node is a graph or sub-graph input placeholder.
    pub fn is_data(&self) -> bool {
        self.op_type == op_type::DATA || self.op_type == op_type::REF_DATA
    }

    /// Whether this node collects the graph outputs.
    pub fn is_net_output(&self) -> bool {
        self.op_type == op_type::NET_OUTPUT
    }

    /// The input index output `index` writes through, if it is a ref output.
    pub fn ref_input_of(&self, index: u32) -> Option<u32> {
        self.attrs.ref_outputs.get(&index).copied()
    }

    /// Whether some output of this node references input `input_index`.
    pub fn is_ref_input(&self, input_index: u32) -> bool {
        self.attrs.ref_outputs.values().any(|&i| i == input_index)
    }
}
