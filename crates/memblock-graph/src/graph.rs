//! Arena-backed compute graph with an adjacency side-table.
//!
//! Nodes live in a `Vec<Node>` indexed by [`NodeId`]. Insertion order is
//! topological order: [`Graph::connect`] and [`Graph::add_control_edge`]
//! reject edges whose source does not precede the destination. Edges are
//! kept in side tables next to the arena rather than inside the nodes, so
//! walks over producers and consumers are plain index lookups.

use crate::error::{AnchorKind, GraphError};
use crate::id::{InputRef, NodeId, OutputRef, StreamId};
use crate::node::{Node, NodeDef};
use crate::tensor::MemoryType;
use crate::traits::MemOffsetSink;

/// A topologically ordered compute graph.
#[derive(Clone, Debug)]
pub struct Graph {
    name: String,
    nodes: Vec<Node>,
    /// `producers[node][input]`: the output feeding each data input.
    producers: Vec<Vec<Option<OutputRef>>>,
    /// `consumers[node][output]`: inputs fed by each output, in edge order.
    consumers: Vec<Vec<Vec<InputRef>>>,
    /// `control_preds[node]`: control-edge predecessors.
    control_preds: Vec<Vec<NodeId>>,
    /// `control_succs[node]`: control-edge successors.
    control_succs: Vec<Vec<NodeId>>,
}

impl Graph {
    /// Create an empty graph.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            nodes: Vec::new(),
            producers: Vec::new(),
            consumers: Vec::new(),
            control_preds: Vec::new(),
            control_succs: Vec::new(),
        }
    }

    /// Graph name (for diagnostics).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Append a node. Its id is its position in topological order.
    pub fn add_node(&mut self, def: NodeDef) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.producers.push(vec![None; def.input_count as usize]);
        self.consumers.push(vec![Vec::new(); def.outputs.len()]);
        self.control_preds.push(Vec::new());
        self.control_succs.push(Vec::new());
        self.nodes.push(Node::from_def(id, def));
        id
    }

    /// Connect output `src` to input `dst`.
    pub fn connect(&mut self, src: OutputRef, dst: InputRef) -> Result<(), GraphError> {
        let src_node = self.node(src.node)?;
        if src.index >= src_node.output_count() {
            return Err(GraphError::InvalidAnchor {
                node_name: src_node.name.clone(),
                kind: AnchorKind::Output,
                index: src.index,
            });
        }
        let dst_node = self.node(dst.node)?;
        let slots = &self.producers[dst.node.index()];
        if dst.index as usize >= slots.len() {
            return Err(GraphError::InvalidAnchor {
                node_name: dst_node.name.clone(),
                kind: AnchorKind::Input,
                index: dst.index,
            });
        }
        if src.node >= dst.node {
            return Err(GraphError::NotTopological {
                src: src_node.name.clone(),
                dst: dst_node.name.clone(),
            });
        }
        if slots[dst.index as usize].is_some() {
            return Err(GraphError::InputAlreadyConnected {
                node_name: dst_node.name.clone(),
                index: dst.index,
            });
        }
        self.producers[dst.node.index()][dst.index as usize] = Some(src);
        self.consumers[src.node.index()][src.index as usize].push(dst);
        Ok(())
    }

    /// Add a control edge `src → dst`.
    pub fn add_control_edge(&mut self, src: NodeId, dst: NodeId) -> Result<(), GraphError> {
        let src_name = &self.node(src)?.name;
        let dst_name = &self.node(dst)?.name;
        if src >= dst {
            return Err(GraphError::NotTopological {
                src: src_name.clone(),
                dst: dst_name.clone(),
            });
        }
        if !self.control_preds[dst.index()].contains(&src) {
            self.control_preds[dst.index()].push(src);
            self.control_succs[src.index()].push(dst);
        }
        Ok(())
    }

    /// Look up a node.
    pub fn node(&self, id: NodeId) -> Result<&Node, GraphError> {
        self.nodes
            .get(id.index())
            .ok_or(GraphError::UnknownNode { node: id })
    }

    /// Look up a node mutably.
    pub fn node_mut(&mut self, id: NodeId) -> Result<&mut Node, GraphError> {
        self.nodes
            .get_mut(id.index())
            .ok_or(GraphError::UnknownNode { node: id })
    }

    /// All nodes in topological order.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter()
    }

    /// Number of nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the graph has no nodes.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Find a node by name.
    pub fn find(&self, name: &str) -> Option<NodeId> {
        self.nodes.iter().find(|n| n.name == name).map(|n| n.id)
    }

    /// Producer of a data input, if connected.
    pub fn producer(&self, input: InputRef) -> Option<OutputRef> {
        self.producers
            .get(input.node.index())?
            .get(input.index as usize)
            .copied()
            .flatten()
    }

    /// All data-input producers of a node, indexed by input.
    pub fn in_data_anchors(&self, node: NodeId) -> &[Option<OutputRef>] {
        self.producers
            .get(node.index())
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Inputs fed by an output, in edge-insertion order.
    pub fn consumers(&self, output: OutputRef) -> &[InputRef] {
        self.consumers
            .get(output.node.index())
            .and_then(|outs| outs.get(output.index as usize))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Control-edge predecessors of a node.
    pub fn control_predecessors(&self, node: NodeId) -> &[NodeId] {
        self.control_preds
            .get(node.index())
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Control-edge successors of a node.
    pub fn control_successors(&self, node: NodeId) -> &[NodeId] {
        self.control_succs
            .get(node.index())
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Distinct nodes consuming any output of `node` through data edges.
    ///
    /// Returned in ascending id order.
    pub fn out_data_nodes(&self, node: NodeId) -> Vec<NodeId> {
        let mut out: Vec<NodeId> = self
            .consumers
            .get(node.index())
            .into_iter()
            .flatten()
            .flatten()
            .map(|input| input.node)
            .collect();
        out.sort_unstable();
        out.dedup();
        out
    }

    /// All output anchors of a node.
    pub fn output_refs(&self, node: NodeId) -> impl Iterator<Item = OutputRef> + '_ {
        let count = self.nodes.get(node.index()).map_or(0, |n| n.output_count());
        (0..count).map(move |index| OutputRef::new(node, index))
    }

    fn output_slot(&mut self, anchor: OutputRef) -> Result<&mut Node, GraphError> {
        let node = self.node_mut(anchor.node)?;
        if anchor.index >= node.output_count() {
            return Err(GraphError::InvalidAnchor {
                node_name: node.name.clone(),
                kind: AnchorKind::Output,
                index: anchor.index,
            });
        }
        Ok(node)
    }
}

impl MemOffsetSink for Graph {
    fn set_output_offset(
        &mut self,
        anchor: OutputRef,
        offset: u64,
        memory_type: MemoryType,
    ) -> Result<(), GraphError> {
        let node = self.output_slot(anchor)?;
        node.desc.output_offsets[anchor.index as usize] = Some(offset);
        node.desc.output_memory_types[anchor.index as usize] = memory_type;
        Ok(())
    }

    fn set_workspace_offset(
        &mut self,
        node: NodeId,
        index: u32,
        offset: u64,
        memory_type: MemoryType,
    ) -> Result<(), GraphError> {
        let node = self.node_mut(node)?;
        let i = index as usize;
        if i >= node.desc.workspace_offsets.len() {
            return Err(GraphError::InvalidAnchor {
                node_name: node.name.clone(),
                kind: AnchorKind::Workspace,
                index,
            });
        }
        node.desc.workspace_offsets[i] = Some(offset);
        node.desc.workspace_memory_types[i] = memory_type;
        Ok(())
    }

    fn set_input_offset(&mut self, anchor: InputRef, offset: u64) -> Result<(), GraphError> {
        let node = self.node_mut(anchor.node)?;
        let i = anchor.index as usize;
        if i >= node.desc.input_offsets.len() {
            return Err(GraphError::InvalidAnchor {
                node_name: node.name.clone(),
                kind: AnchorKind::Input,
                index: anchor.index,
            });
        }
        node.desc.input_offsets[i] = Some(offset);
        Ok(())
    }

    fn set_stream(&mut self, node: NodeId, stream: StreamId) -> Result<(), GraphError> {
        self.node_mut(node)?.stream_id = stream;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::{DataType, TensorDesc};

    fn two_node_graph() -> (Graph, NodeId, NodeId) {
        let mut g = Graph::new("g");
        let a = g.add_node(
            NodeDef::new("a", "Relu").output(TensorDesc::new(&[8], DataType::Float32)),
        );
        let b = g.add_node(
            NodeDef::new("b", "Relu")
                .inputs(1)
                .output(TensorDesc::new(&[8], DataType::Float32)),
        );
        (g, a, b)
    }

    #[test]
    fn connect_populates_both_side_tables() {
        let (mut g, a, b) = two_node_graph();
        g.connect(OutputRef::new(a, 0), InputRef::new(b, 0)).unwrap();
        assert_eq!(g.producer(InputRef::new(b, 0)), Some(OutputRef::new(a, 0)));
        assert_eq!(g.consumers(OutputRef::new(a, 0)), &[InputRef::new(b, 0)]);
        assert_eq!(g.out_data_nodes(a), vec![b]);
    }

    #[test]
    fn backward_edge_rejected() {
        let (mut g, a, b) = two_node_graph();
        let err = g
            .connect(OutputRef::new(b, 0), InputRef::new(a, 0))
            .unwrap_err();
        // `a` has no inputs, so the anchor check fires first.
        assert!(matches!(err, GraphError::InvalidAnchor { .. }));

        let err = g.add_control_edge(b, a).unwrap_err();
        assert!(matches!(err, GraphError::NotTopological { .. }));
    }

    #[test]
    fn double_connect_rejected() {
        let (mut g, a, b) = two_node_graph();
        g.connect(OutputRef::new(a, 0), InputRef::new(b, 0)).unwrap();
        let err = g
            .connect(OutputRef::new(a, 0), InputRef::new(b, 0))
            .unwrap_err();
        assert!(matches!(err, GraphError::InputAlreadyConnected { .. }));
    }

    #[test]
    fn control_edges_deduplicate() {
        let (mut g, a, b) = two_node_graph();
        g.add_control_edge(a, b).unwrap();
        g.add_control_edge(a, b).unwrap();
        assert_eq!(g.control_predecessors(b), &[a]);
        assert_eq!(g.control_successors(a), &[b]);
    }

    #[test]
    fn sink_writes_offsets_onto_desc() {
        let (mut g, a, b) = two_node_graph();
        g.set_output_offset(OutputRef::new(a, 0), 512, MemoryType::Hbm)
            .unwrap();
        g.set_input_offset(InputRef::new(b, 0), 512).unwrap();
        assert_eq!(g.node(a).unwrap().desc.output_offsets[0], Some(512));
        assert_eq!(g.node(b).unwrap().desc.input_offsets[0], Some(512));

        let err = g
            .set_workspace_offset(a, 0, 0, MemoryType::Hbm)
            .unwrap_err();
        assert!(matches!(
            err,
            GraphError::InvalidAnchor {
                kind: AnchorKind::Workspace,
                ..
            }
        ));
    }

    #[test]
    fn unknown_node_lookup_fails() {
        let (g, _, _) = two_node_graph();
        assert!(matches!(
            g.node(NodeId(9)),
            Err(GraphError::UnknownNode { node: NodeId(9) })
        ));
    }
}
