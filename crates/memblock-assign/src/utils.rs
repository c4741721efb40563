//! Size, stream, and ref-chain helpers shared by the assignment passes.

use memblock_graph::{Graph, InputRef, Node, NodeId, OutputRef, StreamId};

use crate::block_type::{BlockTypeList, NodeMemAttr};
use crate::error::AssignError;
use crate::slot::SlotRole;

/// Alignment of every block and of every slot placed inside a block.
pub const MEM_ALIGN_SIZE: u64 = 512;

/// Alignment of a tensor's raw byte size.
pub const TENSOR_ALIGN_SIZE: u64 = 32;

/// Size of the shape descriptor buffer that accompanies a no-tiling output.
///
/// Rank word plus eight dimension words of eight bytes each.
pub const NO_TILING_DESC_SIZE: u64 = 72;

/// Round `size` up to a multiple of `align`. Zero stays zero.
pub fn align_up(size: u64, align: u64) -> u64 {
    size.div_ceil(align) * align
}

/// Round `size` up to [`MEM_ALIGN_SIZE`]. Zero stays zero.
pub fn align_mem_offset(size: u64) -> u64 {
    align_up(size, MEM_ALIGN_SIZE)
}

/// Effective stream of a node.
///
/// An explicit sub-stream wins, then the thread-scope stream, then any
/// override from diff-stream optimization, then the node's own stream.
pub fn resolve_stream_id(node: &Node, stream_override: Option<StreamId>) -> StreamId {
    node.attrs
        .sub_stream_id
        .or(node.attrs.thread_scope_stream_id)
        .or(stream_override)
        .unwrap_or(node.stream_id)
}

fn size_error(node: &Node, role: SlotRole, index: u32, reason: &'static str) -> AssignError {
    AssignError::InvalidTensorSize {
        node_name: node.name.clone(),
        role,
        index,
        reason,
    }
}

/// Byte size of output `index`, rounded up to [`TENSOR_ALIGN_SIZE`].
///
/// FFTS-split outputs are the sum of their aligned slices. No-tiling
/// outputs are sized by their upper-bound shape. Any other output with an
/// unknown dimension is an error.
pub fn tensor_size(node: &Node, index: u32) -> Result<u64, AssignError> {
    let desc = node
        .outputs
        .get(index as usize)
        .ok_or_else(|| size_error(node, SlotRole::Output, index, "no such output"))?;

    if let Some(slices) = node.attrs.ffts_split_sizes.get(&index) {
        let mut total = 0u64;
        for &slice in slices {
            if slice < 0 {
                return Err(size_error(node, SlotRole::Output, index, "negative slice size"));
            }
            total = total
                .checked_add(align_up(slice as u64, TENSOR_ALIGN_SIZE))
                .ok_or_else(|| size_error(node, SlotRole::Output, index, "size overflow"))?;
        }
        return Ok(total);
    }

    let elements = if desc.is_no_tiling() {
        desc.max_element_count().ok_or_else(|| {
            size_error(node, SlotRole::Output, index, "unknown no-tiling bound")
        })?
    } else {
        desc.element_count()
            .ok_or_else(|| size_error(node, SlotRole::Output, index, "unknown dimension"))?
    };
    let bytes = elements
        .checked_mul(desc.dtype.size_bytes())
        .ok_or_else(|| size_error(node, SlotRole::Output, index, "size overflow"))?;
    Ok(align_up(bytes, TENSOR_ALIGN_SIZE))
}

/// Size of the shape descriptor buffer of output `index`, if it needs one.
pub fn output_desc_size(node: &Node, index: u32) -> Option<u64> {
    node.outputs
        .get(index as usize)
        .filter(|desc| desc.is_no_tiling())
        .map(|_| NO_TILING_DESC_SIZE)
}

/// Byte size of workspace `index`.
pub fn workspace_size(node: &Node, index: u32) -> Result<u64, AssignError> {
    match node.workspaces.get(index as usize) {
        Some(&bytes) if bytes >= 0 => Ok(bytes as u64),
        Some(_) => Err(size_error(node, SlotRole::Workspace, index, "negative size")),
        None => Err(size_error(node, SlotRole::Workspace, index, "no such workspace")),
    }
}

/// Walk back through ref outputs to the anchor that actually owns memory.
///
/// A ref output writes through one of its node's inputs; its memory is the
/// memory of whatever feeds that input. An unconnected ref input ends the
/// walk at the ref output itself.
pub fn src_node_through_ref_node(
    graph: &Graph,
    anchor: OutputRef,
) -> Result<OutputRef, AssignError> {
    let mut cur = anchor;
    for _ in 0..=graph.len() {
        let node = graph.node(cur.node)?;
        let Some(in_index) = node.ref_input_of(cur.index) else {
            return Ok(cur);
        };
        match graph.producer(InputRef::new(cur.node, in_index)) {
            Some(src) => cur = src,
            None => return Ok(cur),
        }
    }
    Err(memblock_graph::GraphError::RefCycle {
        node_name: graph.node(cur.node)?.name.clone(),
    }
    .into())
}

/// All real consumers of `anchor`, looking through ref nodes.
///
/// A consumer that writes through the consumed input forwards the memory
/// to its ref output; the walk continues from there. A ref output nobody
/// consumes makes the ref node itself the terminal consumer.
pub fn dst_nodes_through_ref_node(
    graph: &Graph,
    anchor: OutputRef,
) -> Result<Vec<InputRef>, AssignError> {
    let mut result = Vec::new();
    let mut stack = vec![anchor];
    let mut steps = 0usize;
    while let Some(cur) = stack.pop() {
        steps += 1;
        if steps > graph.len().saturating_mul(4).max(16) {
            return Err(memblock_graph::GraphError::RefCycle {
                node_name: graph.node(cur.node)?.name.clone(),
            }
            .into());
        }
        for &input in graph.consumers(cur).iter().rev() {
            let node = graph.node(input.node)?;
            let forwarded: Vec<OutputRef> = node
                .attrs
                .ref_outputs
                .iter()
                .filter(|(_, &i)| i == input.index)
                .map(|(&o, _)| OutputRef::new(input.node, o))
                .collect();
            let terminal = forwarded.iter().all(|o| graph.consumers(*o).is_empty());
            if terminal {
                if !result.contains(&input) {
                    result.push(input);
                }
            } else {
                stack.extend(forwarded.into_iter().rev());
            }
        }
    }
    result.sort_unstable();
    Ok(result)
}

/// Whether output `anchor` is centrally cleaned atomic memory.
///
/// An output is atomic when its node marks it so, or when a consumer
/// writes through it with an atomic ref output. Always false when atomic
/// outputs are cleaned separately.
pub fn is_concentrate_atomic(
    graph: &Graph,
    anchor: OutputRef,
    separate_atomic_clean: bool,
) -> Result<bool, AssignError> {
    if separate_atomic_clean {
        return Ok(false);
    }
    let mut stack = vec![anchor];
    let mut steps = 0usize;
    while let Some(cur) = stack.pop() {
        steps += 1;
        if steps > graph.len().saturating_mul(4).max(16) {
            break;
        }
        let node = graph.node(cur.node)?;
        if node.attrs.atomic_outputs.contains(&cur.index) {
            return Ok(true);
        }
        for &input in graph.consumers(cur) {
            let consumer = graph.node(input.node)?;
            for (&o, &i) in &consumer.attrs.ref_outputs {
                if i == input.index {
                    stack.push(OutputRef::new(input.node, o));
                }
            }
        }
    }
    Ok(false)
}

/// Whether workspace `index` of `node` is centrally cleaned atomic memory.
pub fn is_workspace_concentrate_atomic(
    node: &Node,
    index: u32,
    separate_atomic_clean: bool,
) -> bool {
    !separate_atomic_clean && node.attrs.atomic_workspaces.contains(&index)
}

/// Memory attributes of output `anchor`.
pub fn output_mem_attrs(
    graph: &Graph,
    anchor: OutputRef,
    separate_atomic_clean: bool,
) -> Result<BlockTypeList, AssignError> {
    let mut attrs = BlockTypeList::EMPTY;
    if graph.node(anchor.node)?.is_data() {
        attrs.insert(NodeMemAttr::Data);
    }
    if is_concentrate_atomic(graph, anchor, separate_atomic_clean)? {
        attrs.insert(NodeMemAttr::ConcentrateAtomic);
    }
    Ok(attrs)
}

/// Node ids reachable from `node` through one data or control edge.
pub(crate) fn successors(graph: &Graph, node: NodeId) -> Vec<NodeId> {
    let mut out = graph.out_data_nodes(node);
    out.extend_from_slice(graph.control_successors(node));
    out.sort_unstable();
    out.dedup();
    out
}

/// Node ids feeding `node` through one data or control edge.
pub(crate) fn predecessors(graph: &Graph, node: NodeId) -> Vec<NodeId> {
    let mut out: Vec<NodeId> = graph
        .in_data_anchors(node)
        .iter()
        .flatten()
        .map(|src| src.node)
        .collect();
    out.extend_from_slice(graph.control_predecessors(node));
    out.sort_unstable();
    out.dedup();
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use memblock_graph::{DataType, NodeAttrs, NodeDef, TensorDesc};

    fn t32(n: i64) -> TensorDesc {
        TensorDesc::new(&[n], DataType::Float32)
    }

    #[test]
    fn alignment_rounds_up_and_keeps_zero() {
        assert_eq!(align_mem_offset(0), 0);
        assert_eq!(align_mem_offset(1), 512);
        assert_eq!(align_mem_offset(512), 512);
        assert_eq!(align_mem_offset(513), 1024);
        assert_eq!(align_up(100, TENSOR_ALIGN_SIZE), 128);
    }

    #[test]
    fn stream_precedence() {
        let mut g = Graph::new("s");
        let mut attrs = NodeAttrs::default();
        attrs.thread_scope_stream_id = Some(StreamId(3));
        let a = g.add_node(NodeDef::new("a", "Relu").stream(1).attrs(attrs.clone()));
        attrs.sub_stream_id = Some(StreamId(5));
        let b = g.add_node(NodeDef::new("b", "Relu").stream(1).attrs(attrs));
        let c = g.add_node(NodeDef::new("c", "Relu").stream(1));

        assert_eq!(resolve_stream_id(g.node(a).unwrap(), Some(StreamId(9))), StreamId(3));
        assert_eq!(resolve_stream_id(g.node(b).unwrap(), None), StreamId(5));
        assert_eq!(resolve_stream_id(g.node(c).unwrap(), Some(StreamId(9))), StreamId(9));
        assert_eq!(resolve_stream_id(g.node(c).unwrap(), None), StreamId(1));
    }

    #[test]
    fn tensor_sizes() {
        let mut g = Graph::new("sizes");
        let mut attrs = NodeAttrs::default();
        attrs.ffts_split_sizes.insert(1, vec![10, 40]);
        let n = g.add_node(
            NodeDef::new("n", "Op")
                .output(t32(25))
                .output(t32(999))
                .output(TensorDesc::new(&[-1, 4], DataType::Float16).with_no_tiling(&[8, 4]))
                .output(TensorDesc::new(&[-1], DataType::Float32))
                .workspace(64)
                .workspace(-1)
                .attrs(attrs),
        );
        let node = g.node(n).unwrap();
        assert_eq!(tensor_size(node, 0).unwrap(), 128);
        assert_eq!(tensor_size(node, 1).unwrap(), 32 + 64);
        assert_eq!(tensor_size(node, 2).unwrap(), 64);
        assert_eq!(output_desc_size(node, 2), Some(NO_TILING_DESC_SIZE));
        assert_eq!(output_desc_size(node, 0), None);
        assert!(matches!(
            tensor_size(node, 3),
            Err(AssignError::InvalidTensorSize { index: 3, .. })
        ));
        assert_eq!(workspace_size(node, 0).unwrap(), 64);
        assert!(workspace_size(node, 1).is_err());
    }

    fn ref_chain() -> (Graph, NodeId, NodeId, NodeId) {
        let mut g = Graph::new("refs");
        let var = g.add_node(NodeDef::new("var", "Variable").output(t32(8)));
        let mut attrs = NodeAttrs::default();
        attrs.ref_outputs.insert(0, 0);
        let assign = g.add_node(
            NodeDef::new("assign", "Assign")
                .inputs(1)
                .output(t32(8))
                .attrs(attrs),
        );
        let relu = g.add_node(NodeDef::new("relu", "Relu").inputs(1).output(t32(8)));
        g.connect(OutputRef::new(var, 0), InputRef::new(assign, 0)).unwrap();
        g.connect(OutputRef::new(assign, 0), InputRef::new(relu, 0)).unwrap();
        (g, var, assign, relu)
    }

    #[test]
    fn ref_walks_in_both_directions() {
        let (g, var, assign, relu) = ref_chain();
        assert_eq!(
            src_node_through_ref_node(&g, OutputRef::new(assign, 0)).unwrap(),
            OutputRef::new(var, 0)
        );
        assert_eq!(
            src_node_through_ref_node(&g, OutputRef::new(relu, 0)).unwrap(),
            OutputRef::new(relu, 0)
        );
        assert_eq!(
            dst_nodes_through_ref_node(&g, OutputRef::new(var, 0)).unwrap(),
            vec![InputRef::new(relu, 0)]
        );
    }

    #[test]
    fn atomic_through_ref_consumer() {
        let mut g = Graph::new("atomic");
        let a = g.add_node(NodeDef::new("a", "Op").output(t32(8)));
        let mut attrs = NodeAttrs::default();
        attrs.ref_outputs.insert(0, 0);
        attrs.atomic_outputs.push(0);
        let acc = g.add_node(
            NodeDef::new("acc", "AtomicAdd")
                .inputs(1)
                .output(t32(8))
                .attrs(attrs),
        );
        g.connect(OutputRef::new(a, 0), InputRef::new(acc, 0)).unwrap();

        let anchor = OutputRef::new(a, 0);
        assert!(is_concentrate_atomic(&g, anchor, false).unwrap());
        assert!(!is_concentrate_atomic(&g, anchor, true).unwrap());
        let attrs = output_mem_attrs(&g, anchor, false).unwrap();
        assert!(attrs.contains(NodeMemAttr::ConcentrateAtomic));
        assert!(!attrs.contains(NodeMemAttr::Data));
    }

    #[cfg(not(miri))]
    mod proptests {
        use super::*;
        use proptest::prelude::*;

        /// A root followed by nodes that each read output 0 of an earlier
        /// node; flagged nodes write their output through that input.
        fn ref_forest(links: &[(prop::sample::Index, bool)]) -> Graph {
            let mut g = Graph::new("ref_forest");
            let mut ids = vec![g.add_node(NodeDef::new("root", "Variable").output(t32(8)))];
            for (i, (parent, is_ref)) in links.iter().enumerate() {
                let mut attrs = NodeAttrs::default();
                if *is_ref {
                    attrs.ref_outputs.insert(0, 0);
                }
                let id = g.add_node(
                    NodeDef::new(format!("n{i}"), "Op")
                        .inputs(1)
                        .output(t32(8))
                        .attrs(attrs),
                );
                let src = ids[parent.index(ids.len())];
                g.connect(OutputRef::new(src, 0), InputRef::new(id, 0)).unwrap();
                ids.push(id);
            }
            g
        }

        proptest! {
            #[test]
            fn ref_walks_invert_each_other(
                links in proptest::collection::vec(
                    (any::<prop::sample::Index>(), any::<bool>()),
                    1..16,
                ),
            ) {
                let g = ref_forest(&links);
                for node in g.nodes() {
                    let owner = src_node_through_ref_node(&g, OutputRef::new(node.id, 0)).unwrap();
                    prop_assert!(g.node(owner.node).unwrap().ref_input_of(owner.index).is_none()
                        || g.producer(InputRef::new(owner.node, 0)).is_none());

                    let readers = dst_nodes_through_ref_node(&g, owner).unwrap();
                    for reader in &readers {
                        let src = g.producer(*reader).unwrap();
                        prop_assert_eq!(src_node_through_ref_node(&g, src).unwrap(), owner);
                    }

                    // Every input fed from the owner's memory that does not
                    // forward it further is one of the owner's real readers.
                    for other in g.nodes() {
                        let input = InputRef::new(other.id, 0);
                        let Some(src) = g.producer(input) else { continue };
                        if src_node_through_ref_node(&g, src).unwrap() != owner {
                            continue;
                        }
                        let forwards = other.ref_input_of(0) == Some(0)
                            && !g.consumers(OutputRef::new(other.id, 0)).is_empty();
                        prop_assert_eq!(!forwards, readers.contains(&input), "{}", input);
                    }
                }
            }

            #[test]
            fn alignment_is_the_next_multiple(size in 1u64..1 << 40) {
                let aligned = align_mem_offset(size);
                prop_assert_eq!(aligned % MEM_ALIGN_SIZE, 0);
                prop_assert!(aligned >= size);
                prop_assert!(aligned <= size + MEM_ALIGN_SIZE - 1);
            }
        }
    }
}
