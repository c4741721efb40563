//! Graph fixtures and builders for memblock development.
//!
//! Provides [`GraphBuilder`], a terse wrapper over [`Graph`] that wires
//! data edges as nodes are added, and [`fixtures`] with the standard
//! graph shapes used across the workspace's tests and benchmarks.

#![forbid(unsafe_code)]
#![allow(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

pub mod fixtures;

use memblock_graph::{
    DataType, Graph, GraphError, InputRef, NodeAttrs, NodeDef, NodeId, OutputRef, SymbolTable,
    TensorDesc,
};

/// A one-dimensional byte tensor of `bytes` elements.
pub fn bytes(bytes: i64) -> TensorDesc {
    TensorDesc::new(&[bytes], DataType::Uint8)
}

/// Builds a graph node by node, connecting inputs in order.
///
/// Panics on malformed wiring; fixtures are expected to be well formed.
pub struct GraphBuilder {
    graph: Graph,
}

impl GraphBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            graph: Graph::new(name),
        }
    }

    /// Add a `Data` node with one output of `size` bytes.
    pub fn data(&mut self, name: &str, size: i64) -> NodeId {
        self.graph
            .add_node(NodeDef::new(name, memblock_graph::op_type::DATA).output(bytes(size)))
    }

    /// Add an op with one output of `size` bytes reading `inputs`.
    pub fn op(&mut self, name: &str, inputs: &[OutputRef], size: i64) -> NodeId {
        self.node(NodeDef::new(name, "Op").output(bytes(size)), inputs)
    }

    /// Add an arbitrary node; its first `inputs.len()` inputs are wired.
    pub fn node(&mut self, def: NodeDef, inputs: &[OutputRef]) -> NodeId {
        let needed = inputs.len() as u32;
        let def = if def.input_count < needed {
            def.inputs(needed)
        } else {
            def
        };
        let id = self.graph.add_node(def);
        for (i, &src) in inputs.iter().enumerate() {
            self.graph
                .connect(src, InputRef::new(id, i as u32))
                .unwrap_or_else(|e| panic!("fixture wiring failed: {e}"));
        }
        id
    }

    /// Add a `NetOutput` collector reading `inputs`.
    pub fn net_output(&mut self, inputs: &[OutputRef]) -> NodeId {
        self.node(
            NodeDef::new("net_output", memblock_graph::op_type::NET_OUTPUT),
            inputs,
        )
    }

    pub fn control(&mut self, src: NodeId, dst: NodeId) {
        self.graph
            .add_control_edge(src, dst)
            .unwrap_or_else(|e| panic!("fixture control edge failed: {e}"));
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn build(self) -> Graph {
        self.graph
    }
}

/// Output `index` of `node`.
pub fn out(node: NodeId, index: u32) -> OutputRef {
    OutputRef::new(node, index)
}

/// Attributes with only the stream-relevant fields set.
pub fn on_sub_stream(stream: i64) -> NodeAttrs {
    NodeAttrs {
        sub_stream_id: Some(memblock_graph::StreamId(stream)),
        ..NodeAttrs::default()
    }
}

/// Symbol table derived from the graph's ref relations.
pub fn symbols(graph: &Graph) -> Result<SymbolTable, GraphError> {
    SymbolTable::from_ref_relations(graph)
}

/// One node of a generated DAG.
///
/// `inputs` index earlier nodes of the same spec list; out-of-range or
/// forward references are dropped.
#[derive(Clone, Debug)]
pub struct NodeSpec {
    pub stream: i64,
    pub output_bytes: Vec<i64>,
    pub workspace_bytes: Vec<i64>,
    pub inputs: Vec<(usize, u32)>,
    pub batch_label: Option<String>,
}

/// Build a topologically ordered graph from generated node specs.
pub fn build_dag(specs: &[NodeSpec]) -> Graph {
    let mut graph = Graph::new("generated");
    let mut ids: Vec<NodeId> = Vec::with_capacity(specs.len());
    for (pos, spec) in specs.iter().enumerate() {
        let inputs: Vec<OutputRef> = spec
            .inputs
            .iter()
            .filter(|(src, _)| *src < pos)
            .filter_map(|&(src, index)| {
                let count = specs[src].output_bytes.len() as u32;
                (count > 0).then(|| OutputRef::new(ids[src], index % count))
            })
            .collect();
        let mut def = NodeDef::new(format!("n{pos}"), "Op")
            .stream(spec.stream)
            .inputs(inputs.len() as u32)
            .attrs(NodeAttrs {
                batch_label: spec.batch_label.clone(),
                ..NodeAttrs::default()
            });
        for &b in &spec.output_bytes {
            def = def.output(bytes(b));
        }
        for &w in &spec.workspace_bytes {
            def = def.workspace(w);
        }
        let id = graph.add_node(def);
        for (i, src) in inputs.into_iter().enumerate() {
            graph
                .connect(src, InputRef::new(id, i as u32))
                .unwrap_or_else(|e| panic!("generated wiring failed: {e}"));
        }
        ids.push(id);
    }
    graph
}
