//! The frozen result of an assignment run.
//!
//! [`MemoryAssignment`] is plain data: offsets per slot, totals and
//! diagnostics per memory type, and a snapshot of the final blocks. It is
//! `Send + Sync` and can be shared freely once produced.

use indexmap::IndexMap;

use memblock_graph::{InputRef, MemOffsetSink, MemoryType, NodeId, OutputRef, StreamId};

use crate::block::{BlockId, MemoryBlock};
use crate::continuous::ContinuousMemMng;
use crate::diff_stream::DiffStreamEdgeLife;
use crate::error::AssignError;
use crate::slot::{NodeTypeIndex, LIFE_END_UNKNOWN};
use crate::strategy::RangeStrategy;
use crate::utils::MEM_ALIGN_SIZE;

/// Where one slot ended up.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SlotOffset {
    /// Byte offset from the start of the memory type's pool.
    pub offset: u64,
    /// Byte size of the slot.
    pub size: u64,
    /// Memory pool.
    pub memory_type: MemoryType,
    /// Hosting block; `None` for zero-size slots.
    pub block: Option<BlockId>,
}

/// Diagnostics for one memory type.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MemStats {
    /// Largest footprint of any single node: its outputs, workspaces and
    /// inputs. No assignment can need less.
    pub theory_min_size: u64,
    /// Footprint without any reuse.
    pub theory_size: u64,
    /// Assigned footprint.
    pub total_size: u64,
    /// Distinct streams with slots in this memory type.
    pub stream_count: usize,
    /// Blocks laid out at the top level.
    pub block_count: usize,
    /// Slots placed into a block taken from the reusable pool.
    pub reused_slots: u32,
    /// Blocks nested into another block after its lifetime.
    pub nested_blocks: u32,
}

/// Offsets and diagnostics of one assignment.
#[derive(Clone, Debug)]
pub struct MemoryAssignment {
    pub(crate) strategy: RangeStrategy,
    pub(crate) outputs: IndexMap<OutputRef, SlotOffset>,
    pub(crate) workspaces: IndexMap<(NodeId, u32), SlotOffset>,
    pub(crate) output_descs: IndexMap<OutputRef, SlotOffset>,
    pub(crate) inputs: IndexMap<InputRef, u64>,
    pub(crate) stats: IndexMap<MemoryType, MemStats>,
    pub(crate) stream_reassignments: IndexMap<NodeId, StreamId>,
    pub(crate) blocks: Vec<MemoryBlock>,
    pub(crate) continuous: ContinuousMemMng,
    pub(crate) edges: DiffStreamEdgeLife,
}

impl MemoryAssignment {
    /// The concrete range strategy that produced this result.
    pub fn strategy(&self) -> RangeStrategy {
        self.strategy
    }

    /// Placement of an output.
    pub fn output(&self, anchor: OutputRef) -> Option<&SlotOffset> {
        self.outputs.get(&anchor)
    }

    /// Offset of an output.
    pub fn output_offset(&self, anchor: OutputRef) -> Option<u64> {
        self.output(anchor).map(|s| s.offset)
    }

    /// All output placements, in node order.
    pub fn outputs(&self) -> impl Iterator<Item = (OutputRef, &SlotOffset)> {
        self.outputs.iter().map(|(&a, s)| (a, s))
    }

    /// Placement of a workspace.
    pub fn workspace(&self, node: NodeId, index: u32) -> Option<&SlotOffset> {
        self.workspaces.get(&(node, index))
    }

    /// Offset of a workspace.
    pub fn workspace_offset(&self, node: NodeId, index: u32) -> Option<u64> {
        self.workspace(node, index).map(|s| s.offset)
    }

    /// Offset of the shape descriptor of a no-tiling output.
    pub fn output_desc_offset(&self, anchor: OutputRef) -> Option<u64> {
        self.output_descs.get(&anchor).map(|s| s.offset)
    }

    /// Offset a data input reads from.
    pub fn input_offset(&self, input: InputRef) -> Option<u64> {
        self.inputs.get(&input).copied()
    }

    /// Assigned footprint of a memory type.
    pub fn total_size(&self, memory_type: MemoryType) -> u64 {
        self.stats.get(&memory_type).map_or(0, |s| s.total_size)
    }

    /// Assigned footprint over all memory types.
    pub fn overall_size(&self) -> u64 {
        self.stats.values().map(|s| s.total_size).sum()
    }

    /// Diagnostics of a memory type.
    pub fn stats(&self, memory_type: MemoryType) -> Option<&MemStats> {
        self.stats.get(&memory_type)
    }

    /// Memory types with at least one slot.
    pub fn memory_types(&self) -> impl Iterator<Item = MemoryType> + '_ {
        self.stats.keys().copied()
    }

    /// Nodes moved onto another stream.
    pub fn stream_reassignments(&self) -> &IndexMap<NodeId, StreamId> {
        &self.stream_reassignments
    }

    /// Final blocks, nested ones included.
    pub fn blocks(&self) -> &[MemoryBlock] {
        &self.blocks
    }

    /// The continuous groups the run honoured.
    pub fn continuous(&self) -> &ContinuousMemMng {
        &self.continuous
    }

    /// Write every offset and stream change into `sink`.
    pub fn apply<S: MemOffsetSink>(&self, sink: &mut S) -> Result<(), AssignError> {
        for (&anchor, slot) in &self.outputs {
            sink.set_output_offset(anchor, slot.offset, slot.memory_type)?;
        }
        for (&(node, index), slot) in &self.workspaces {
            sink.set_workspace_offset(node, index, slot.offset, slot.memory_type)?;
        }
        for (&input, &offset) in &self.inputs {
            sink.set_input_offset(input, offset)?;
        }
        for (&node, &stream) in &self.stream_reassignments {
            sink.set_stream(node, stream)?;
        }
        Ok(())
    }

    /// Re-check the placement invariants on the final layout.
    ///
    /// Any two slots of one memory type whose byte ranges intersect must
    /// carry compatible attributes and, unless they belong to different
    /// dynamic-batch branches, one must be provably done before the other
    /// begins. Every recorded read of the earlier slot, on any stream, has
    /// to be ordered before the later slot's writer by stream order or by
    /// a chain of cross-stream edges. Top-level blocks are aligned. Continuous groups are laid
    /// out back to back in group order.
    pub fn check_invariants(&self) -> Result<(), AssignError> {
        let violation = |reason: String| AssignError::ContractViolation {
            node_name: String::new(),
            reason,
        };

        struct Placed<'a> {
            memory_type: MemoryType,
            start: u64,
            end: u64,
            slot: &'a NodeTypeIndex,
            label: Option<&'a str>,
        }

        let mut placed = Vec::new();
        for block in &self.blocks {
            if !block.deleted_block && block.head_offset() % MEM_ALIGN_SIZE != 0 {
                return Err(violation(format!(
                    "{} head {} is unaligned",
                    block.id(),
                    block.head_offset()
                )));
            }
            for (slot, &real) in block.occupants().iter().zip(block.real_sizes()) {
                let start = block.head_offset() + slot.sub_offset;
                placed.push(Placed {
                    memory_type: block.memory_type(),
                    start,
                    end: start + real,
                    slot,
                    label: block.batch_label(),
                });
            }
        }
        placed.sort_by_key(|p| (p.memory_type, p.start));

        for (i, a) in placed.iter().enumerate() {
            for b in placed[i + 1..]
                .iter()
                .take_while(|b| b.memory_type == a.memory_type && b.start < a.end)
            {
                if b.start == b.end || a.start == a.end {
                    continue;
                }
                if a.slot.attrs.is_conflict(&b.slot.attrs) {
                    return Err(violation(format!(
                        "{} and {} share bytes with conflicting attributes",
                        a.slot.key(),
                        b.slot.key()
                    )));
                }
                let exclusive = matches!((a.label, b.label), (Some(x), Some(y)) if x != y);
                let ordered =
                    self.done_before(a.slot, b.slot) || self.done_before(b.slot, a.slot);
                if !exclusive && !ordered {
                    return Err(violation(format!(
                        "{} and {} share bytes while both live",
                        a.slot, b.slot
                    )));
                }
            }
        }

        for group in self.continuous.groups() {
            let mut expected: Option<u64> = None;
            for (member, &size) in group.members().iter().zip(group.aligned_sizes()) {
                let Some(slot) = self.outputs.get(member) else {
                    return Err(violation(format!("continuous member {member} has no offset")));
                };
                if let Some(e) = expected {
                    if size > 0 && slot.offset != e {
                        return Err(violation(format!(
                            "continuous member {member} at {} instead of {e}",
                            slot.offset
                        )));
                    }
                }
                expected = Some(slot.offset + size);
            }
        }
        Ok(())
    }

    /// Whether every read of `first` is ordered before `second` is written.
    fn done_before(&self, first: &NodeTypeIndex, second: &NodeTypeIndex) -> bool {
        let (to, begin) = (second.stream_id(), second.life_begin());
        let own = first.life_end();
        own != LIFE_END_UNKNOWN
            && self.edges.happens_before(first.stream_id(), own, to, begin)
            && first
                .diff_stream_ends()
                .all(|(stream, end)| self.edges.happens_before(stream, end, to, begin))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::slot::SlotRole;
    use memblock_graph::{DataType, Graph, NodeDef, SubGraphId, TensorDesc};

    fn assert_send_sync<T: Send + Sync>() {}

    #[test]
    fn assignment_is_shareable() {
        assert_send_sync::<MemoryAssignment>();
    }

    #[test]
    fn empty_assignment_reports_zero() {
        let plan = MemoryAssignment {
            strategy: RangeStrategy::Binary,
            outputs: IndexMap::new(),
            workspaces: IndexMap::new(),
            output_descs: IndexMap::new(),
            inputs: IndexMap::new(),
            stats: IndexMap::new(),
            stream_reassignments: IndexMap::new(),
            blocks: Vec::new(),
            continuous: ContinuousMemMng::default(),
            edges: DiffStreamEdgeLife::default(),
        };
        assert_eq!(plan.total_size(MemoryType::Hbm), 0);
        assert_eq!(plan.overall_size(), 0);
        assert!(plan.check_invariants().is_ok());
    }

    fn plan_with(blocks: Vec<MemoryBlock>, edges: DiffStreamEdgeLife) -> MemoryAssignment {
        MemoryAssignment {
            strategy: RangeStrategy::Binary,
            outputs: IndexMap::new(),
            workspaces: IndexMap::new(),
            output_descs: IndexMap::new(),
            inputs: IndexMap::new(),
            stats: IndexMap::new(),
            stream_reassignments: IndexMap::new(),
            blocks,
            continuous: ContinuousMemMng::default(),
            edges,
        }
    }

    /// `a` on stream 0 read by `r` on stream 1; `b` on stream 0 reuses
    /// `a`'s bytes.
    fn shared_block() -> MemoryBlock {
        let mut a = NodeTypeIndex::new(NodeId(0), SlotRole::Output, 0, StreamId(0));
        a.record_diff_stream_end(StreamId(1), 1);
        a.mark_released();
        let mut b = NodeTypeIndex::new(NodeId(2), SlotRole::Output, 0, StreamId(0));
        b.mark_released();
        let mut block =
            MemoryBlock::new(BlockId(0), MemoryType::Hbm, StreamId(0), SubGraphId(0), None, 512);
        block.add_node_type_index(a, 512, 512);
        block.add_node_type_index(b, 512, 512);
        block.set_offsets(0);
        block
    }

    #[test]
    fn unordered_read_on_another_stream_is_a_collision() {
        let plan = plan_with(vec![shared_block()], DiffStreamEdgeLife::default());
        assert!(matches!(
            plan.check_invariants(),
            Err(AssignError::ContractViolation { .. })
        ));
    }

    #[test]
    fn read_ordered_by_an_edge_is_not_a_collision() {
        let mut g = Graph::new("ordered");
        let a = g.add_node(
            NodeDef::new("a", "Op").output(TensorDesc::new(&[128], DataType::Float32)),
        );
        let r = g.add_node(
            NodeDef::new("r", "Op")
                .stream(1)
                .inputs(1)
                .output(TensorDesc::new(&[8], DataType::Float32)),
        );
        let b = g.add_node(
            NodeDef::new("b", "Op")
                .inputs(1)
                .output(TensorDesc::new(&[128], DataType::Float32)),
        );
        g.connect(OutputRef::new(a, 0), InputRef::new(r, 0)).unwrap();
        g.connect(OutputRef::new(r, 0), InputRef::new(b, 0)).unwrap();
        let edges = DiffStreamEdgeLife::build(&g, |id| {
            g.node(id).map(|n| n.stream_id).unwrap_or(StreamId(0))
        })
        .unwrap();

        let plan = plan_with(vec![shared_block()], edges);
        assert!(plan.check_invariants().is_ok());
    }
}
