//! Memory blocks: byte ranges shared by slots with disjoint lifetimes.
//!
//! Blocks live in an arena (`Vec<MemoryBlock>`) addressed by [`BlockId`].
//! Nesting is expressed by ids, never by owning pointers: a block nested
//! into another is flagged `deleted_block` and listed in the parent's
//! children with its offset relative to the parent's head.

use std::fmt;

use memblock_graph::{MemoryType, StreamId, SubGraphId};

use crate::block_type::BlockTypeList;
use crate::diff_stream::DiffStreamEdgeLife;
use crate::slot::{NodeTypeIndex, SlotKey, LIFE_END_UNKNOWN};
use crate::utils::align_mem_offset;

/// Hard upper bound on the depth of the nested reuse search.
pub const MAX_DEPTH_NUM: usize = 8;

/// Index of a block in the block arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub u32);

impl BlockId {
    /// Position in the arena.
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "block{}", self.0)
    }
}

/// Why a block is nested inside another.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChildKind {
    /// Placed after the parent's lifetime ended.
    LifeReuse,
    /// Belongs to a mutually exclusive dynamic-batch branch.
    Batch,
}

/// A block nested inside another block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChildBlock {
    /// The nested block.
    pub id: BlockId,
    /// Offset of the child relative to the parent's head.
    pub offset: u64,
    /// Nesting reason.
    pub kind: ChildKind,
}

/// Bounds and context for [`MemoryBlock::add_life_reuse_block`].
#[derive(Clone, Copy, Debug)]
pub struct LifeReuseParams<'a> {
    /// Cross-stream edges used to compare lifetimes across streams.
    pub edges: &'a DiffStreamEdgeLife,
    /// Recursion bound, at most [`MAX_DEPTH_NUM`].
    pub max_depth: usize,
    /// Whether to search inside the parent's existing children.
    pub child_reuse: bool,
}

/// A contiguous byte range hosting one or more slots.
#[derive(Clone, Debug)]
pub struct MemoryBlock {
    id: BlockId,
    memory_type: MemoryType,
    stream_id: StreamId,
    sub_graph: SubGraphId,
    batch_label: Option<String>,
    size: u64,
    node_type_index_list: Vec<NodeTypeIndex>,
    real_size_list: Vec<u64>,
    no_align_size_list: Vec<u64>,
    block_types: BlockTypeList,
    children: Vec<ChildBlock>,
    child_offset: u64,
    head_offset: u64,
    tail_offset: u64,
    /// Pending consumer releases over all occupants.
    pub ref_count: u32,
    /// May enter the reusable pool once released.
    pub reuse_mem: bool,
    /// Every occupant and every consumer runs on the block's stream.
    pub same_stream: bool,
    /// Aliased to the graph's output buffer.
    pub is_zero_copy: bool,
    /// Laid out ahead of all other blocks.
    pub fixed_addr_prior: bool,
    /// Hosts continuous-group members.
    pub continuous_block: bool,
    /// Hosts the first member of a continuous group.
    pub first_continuous_block: bool,
    /// Hosts the last member of a continuous group.
    pub last_continuous_block: bool,
    /// Index of the continuous group laid out through this block.
    pub continuous_group: Option<usize>,
    /// Nested into another block; not laid out on its own.
    pub deleted_block: bool,
    /// Kept reusable although a returning cross-stream chain reads it.
    pub diff_stream_prior: bool,
    /// Number of slots that reused this block from the pool.
    pub reuse_count: u32,
}

impl MemoryBlock {
    /// Create an empty block of at least `size` bytes.
    pub fn new(
        id: BlockId,
        memory_type: MemoryType,
        stream_id: StreamId,
        sub_graph: SubGraphId,
        batch_label: Option<String>,
        size: u64,
    ) -> Self {
        Self {
            id,
            memory_type,
            stream_id,
            sub_graph,
            batch_label,
            size: align_mem_offset(size),
            node_type_index_list: Vec::new(),
            real_size_list: Vec::new(),
            no_align_size_list: Vec::new(),
            block_types: BlockTypeList::EMPTY,
            children: Vec::new(),
            child_offset: 0,
            head_offset: 0,
            tail_offset: 0,
            ref_count: 0,
            reuse_mem: true,
            same_stream: true,
            is_zero_copy: false,
            fixed_addr_prior: false,
            continuous_block: false,
            first_continuous_block: false,
            last_continuous_block: false,
            continuous_group: None,
            deleted_block: false,
            diff_stream_prior: false,
            reuse_count: 0,
        }
    }

    /// Arena index.
    pub fn id(&self) -> BlockId {
        self.id
    }

    /// Memory pool.
    pub fn memory_type(&self) -> MemoryType {
        self.memory_type
    }

    /// Stream of the first occupant.
    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    /// Sub-graph of the first occupant.
    pub fn sub_graph(&self) -> SubGraphId {
        self.sub_graph
    }

    /// Dynamic-batch label, if any.
    pub fn batch_label(&self) -> Option<&str> {
        self.batch_label.as_deref()
    }

    /// Size in bytes. Never shrinks.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Size rounded up to the block alignment.
    pub fn align_size(&self) -> u64 {
        align_mem_offset(self.size)
    }

    /// Union of the occupants' memory attributes.
    pub fn block_types(&self) -> BlockTypeList {
        self.block_types
    }

    /// Occupants in insertion order.
    pub fn occupants(&self) -> &[NodeTypeIndex] {
        &self.node_type_index_list
    }

    /// Aligned size requested by each occupant.
    pub fn real_sizes(&self) -> &[u64] {
        &self.real_size_list
    }

    /// Unaligned byte size of each occupant.
    pub fn no_align_sizes(&self) -> &[u64] {
        &self.no_align_size_list
    }

    /// Nested blocks.
    pub fn children(&self) -> &[ChildBlock] {
        &self.children
    }

    /// First byte, once laid out.
    pub fn head_offset(&self) -> u64 {
        self.head_offset
    }

    /// Last byte, once laid out.
    pub fn tail_offset(&self) -> u64 {
        self.tail_offset
    }

    /// Whether the block has no occupants.
    pub fn is_empty(&self) -> bool {
        self.node_type_index_list.is_empty()
    }

    /// Add an occupant.
    ///
    /// The block grows to cover the occupant's range; a slot on another
    /// stream makes the block cross-stream.
    pub fn add_node_type_index(&mut self, slot: NodeTypeIndex, real_size: u64, no_align_size: u64) {
        if self.node_type_index_list.is_empty() && self.children.is_empty() {
            self.stream_id = slot.stream_id();
        } else if slot.stream_id() != self.stream_id {
            self.same_stream = false;
        }
        self.first_continuous_block |= slot.continuous_first;
        self.last_continuous_block |= slot.continuous_last;
        self.block_types = self.block_types.with_added(slot.attrs);
        self.size = self
            .size
            .max(align_mem_offset(slot.sub_offset + real_size));
        self.node_type_index_list.push(slot);
        self.real_size_list.push(real_size);
        self.no_align_size_list.push(no_align_size);
    }

    /// Look up an occupant.
    pub fn find_slot(&self, key: SlotKey) -> Option<&NodeTypeIndex> {
        self.node_type_index_list.iter().find(|s| s.key() == key)
    }

    /// Look up an occupant mutably.
    pub fn find_slot_mut(&mut self, key: SlotKey) -> Option<&mut NodeTypeIndex> {
        self.node_type_index_list.iter_mut().find(|s| s.key() == key)
    }

    /// Mutable access to every occupant.
    pub fn occupants_mut(&mut self) -> impl Iterator<Item = &mut NodeTypeIndex> {
        self.node_type_index_list.iter_mut()
    }

    /// Whether the block's attributes conflict with another block's.
    pub fn is_block_type_conflict(&self, other: &MemoryBlock) -> bool {
        self.block_types.is_conflict(&other.block_types)
    }

    /// Whether the block's attributes conflict with a slot's.
    pub fn is_block_type_conflict_with_node(&self, slot: &NodeTypeIndex) -> bool {
        self.block_types.is_conflict(&slot.attrs)
    }

    /// Grow to cover every occupant's range.
    pub fn resize(&mut self) {
        let extent = self
            .node_type_index_list
            .iter()
            .zip(&self.real_size_list)
            .map(|(slot, &real)| align_mem_offset(slot.sub_offset + real))
            .max()
            .unwrap_or(0);
        self.size = self.size.max(extent);
    }

    /// Grow to at least `extent` bytes.
    pub fn cover(&mut self, extent: u64) {
        self.size = self.size.max(align_mem_offset(extent));
    }

    /// Place the block at `head`.
    pub fn set_offsets(&mut self, head: u64) {
        self.head_offset = head;
        self.tail_offset = head + self.align_size().saturating_sub(1);
    }

    /// Earliest begin over all occupants.
    pub fn life_begin(&self) -> u32 {
        self.node_type_index_list
            .iter()
            .map(NodeTypeIndex::life_begin)
            .min()
            .unwrap_or(0)
    }

    /// Last point at which any occupant is live, in the id space of `stream`.
    ///
    /// Ends observed on other streams are translated through the edge
    /// table; an end that `stream` never waits for is unknown.
    pub fn life_end(&self, stream: StreamId, edges: &DiffStreamEdgeLife) -> u32 {
        let translate = |from: StreamId, end: u32| {
            if from == stream {
                end
            } else {
                edges
                    .translate_end(self.sub_graph, from, end, stream)
                    .unwrap_or(LIFE_END_UNKNOWN)
            }
        };
        let mut end = 0;
        for slot in &self.node_type_index_list {
            let own = slot.life_end();
            if own == LIFE_END_UNKNOWN {
                return LIFE_END_UNKNOWN;
            }
            end = end.max(translate(slot.stream_id(), own));
            for (s, e) in slot.diff_stream_ends() {
                end = end.max(translate(s, e));
            }
            if end == LIFE_END_UNKNOWN {
                return end;
            }
        }
        end
    }

    fn depend_begin(
        &self,
        begin: u32,
        slot_stream: StreamId,
        stream: StreamId,
        edges: &DiffStreamEdgeLife,
    ) -> u32 {
        if slot_stream == stream {
            return begin;
        }
        edges
            .depend_producer(self.sub_graph, slot_stream, begin, stream)
            .map_or(0, |p| p + 1)
    }

    /// Begin of the block in the id space of `stream`.
    ///
    /// On another stream this is one past the latest node on `stream` that
    /// the block's first occupant waits for, or 0 when it waits for none.
    pub fn depend_life_begin(&self, stream: StreamId, edges: &DiffStreamEdgeLife) -> u32 {
        self.depend_begin(self.life_begin(), self.stream_id, stream, edges)
    }

    fn slot_depend_begin(&self, pos: usize, stream: StreamId, edges: &DiffStreamEdgeLife) -> u32 {
        let slot = &self.node_type_index_list[pos];
        self.depend_begin(slot.life_begin(), slot.stream_id(), stream, edges)
    }

    fn can_host_life_reuse(&self) -> bool {
        !self.continuous_block && !self.is_zero_copy && !self.fixed_addr_prior
    }

    fn can_life_reuse(&self) -> bool {
        !self.deleted_block
            && self.can_host_life_reuse()
            && self.reuse_mem
            && self.same_stream
            && self.children.is_empty()
            && !self.node_type_index_list.is_empty()
    }

    /// Move occupants `at..` into a new block with id `new_id`.
    ///
    /// The new block starts fresh: no children, sized to its occupants.
    /// This block keeps its size and rebuilds its attribute set.
    pub fn split_off(&mut self, at: usize, new_id: BlockId) -> MemoryBlock {
        let mut tail = MemoryBlock::new(
            new_id,
            self.memory_type,
            self.stream_id,
            self.sub_graph,
            self.batch_label.clone(),
            0,
        );
        tail.reuse_mem = self.reuse_mem;
        tail.node_type_index_list = self.node_type_index_list.split_off(at);
        tail.real_size_list = self.real_size_list.split_off(at);
        tail.no_align_size_list = self.no_align_size_list.split_off(at);
        tail.block_types =
            BlockTypeList::with_deleted(tail.node_type_index_list.iter().map(|s| s.attrs));
        tail.resize();
        self.block_types =
            BlockTypeList::with_deleted(self.node_type_index_list.iter().map(|s| s.attrs));
        tail
    }

    fn nest(blocks: &mut [MemoryBlock], parent: BlockId, child: BlockId) {
        let size = blocks[child.index()].align_size();
        let p = &mut blocks[parent.index()];
        let offset = p.child_offset;
        p.children.push(ChildBlock {
            id: child,
            offset,
            kind: ChildKind::LifeReuse,
        });
        p.child_offset += size;
        blocks[child.index()].deleted_block = true;
    }

    /// Nest `child` at offset 0 as a dynamic-batch sibling.
    pub fn add_batch_child(blocks: &mut [MemoryBlock], parent: BlockId, child: BlockId) {
        let size = blocks[child.index()].align_size();
        let p = &mut blocks[parent.index()];
        p.children.push(ChildBlock {
            id: child,
            offset: 0,
            kind: ChildKind::Batch,
        });
        p.cover(size);
        blocks[child.index()].deleted_block = true;
    }

    /// Try to place `candidate` inside `parent` after the parent's lifetime.
    ///
    /// Children are stacked from the parent's head. When the whole
    /// candidate does not start late enough, a top-level call may split off
    /// the suffix of occupants that does and nest that instead; the split
    /// block's id is pushed to `clone_blocks`. With `child_reuse`, the
    /// search recurses into the parent's children up to
    /// `params.max_depth` levels.
    pub fn add_life_reuse_block(
        blocks: &mut Vec<MemoryBlock>,
        parent: BlockId,
        candidate: BlockId,
        clone_blocks: &mut Vec<BlockId>,
        depth: usize,
        params: &LifeReuseParams<'_>,
    ) -> bool {
        if parent == candidate {
            return false;
        }
        if depth >= params.max_depth {
            tracing::debug!(%parent, %candidate, depth, "nested reuse depth bound reached");
            return false;
        }
        let p = &blocks[parent.index()];
        let c = &blocks[candidate.index()];
        if !p.can_host_life_reuse() || !c.can_life_reuse() {
            return false;
        }
        if p.memory_type != c.memory_type
            || p.sub_graph != c.sub_graph
            || p.batch_label != c.batch_label
            || p.is_block_type_conflict(c)
        {
            return false;
        }
        let parent_end = p.life_end(p.stream_id, params.edges);
        if parent_end == LIFE_END_UNKNOWN {
            return false;
        }

        if c.depend_life_begin(p.stream_id, params.edges) > parent_end {
            if p.child_offset + c.align_size() <= p.align_size() {
                tracing::trace!(%parent, %candidate, depth, "nested after parent lifetime");
                Self::nest(blocks, parent, candidate);
                return true;
            }
            if params.child_reuse {
                let children: Vec<BlockId> = p
                    .children
                    .iter()
                    .filter(|ch| ch.kind == ChildKind::LifeReuse)
                    .map(|ch| ch.id)
                    .collect();
                for child in children {
                    if Self::add_life_reuse_block(
                        blocks,
                        child,
                        candidate,
                        clone_blocks,
                        depth + 1,
                        params,
                    ) {
                        return true;
                    }
                }
            }
            return false;
        }

        if depth != 0 || c.node_type_index_list.len() < 2 {
            return false;
        }
        let len = c.node_type_index_list.len();
        let late = |i: usize| c.slot_depend_begin(i, p.stream_id, params.edges) > parent_end;
        let Some(at) = (1..len).find(|&i| late(i)) else {
            return false;
        };
        if !(at..len).all(late) {
            return false;
        }
        let suffix = c.node_type_index_list[at..]
            .iter()
            .zip(&c.real_size_list[at..])
            .map(|(slot, &real)| align_mem_offset(slot.sub_offset + real))
            .max()
            .unwrap_or(0);
        if p.child_offset + suffix > p.align_size() {
            return false;
        }

        let new_id = BlockId(blocks.len() as u32);
        let tail = blocks[candidate.index()].split_off(at, new_id);
        tracing::trace!(%parent, %candidate, split = %new_id, at, "split candidate for nesting");
        blocks.push(tail);
        clone_blocks.push(new_id);
        Self::nest(blocks, parent, new_id);
        true
    }
}
