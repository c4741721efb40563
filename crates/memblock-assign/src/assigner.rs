//! The block memory assigner.
//!
//! One run walks the graph in topological order. At every node it places
//! the node's outputs and workspaces, either in a released block from the
//! reusable pool or in a new block, then releases workspaces and every
//! input whose last consumer this node is. Released blocks return to the
//! pool of their memory type, sub-graph and stream.
//!
//! After the walk, blocks whose lifetime gaps can host later blocks are
//! nested (level-2 reuse), dynamic-batch branches are overlaid, blocks are
//! laid out per memory type, and every slot's offset is resolved.

use indexmap::IndexMap;
use smallvec::SmallVec;

use memblock_graph::{
    Graph, InputRef, MemoryType, Node, OutputRef, StreamId, SubGraphId, SymbolTable,
};

use crate::block::{BlockId, ChildKind, LifeReuseParams, MemoryBlock};
use crate::block_type::{BlockTypeList, NodeMemAttr};
use crate::config::AssignConfig;
use crate::context::{AnchorInfo, AssignContext, ReleaseEntry};
use crate::continuous::ContinuousMem;
use crate::error::AssignError;
use crate::plan::{MemStats, MemoryAssignment, SlotOffset};
use crate::slot::{NodeTypeIndex, SlotKey, SlotRole, SlotState};
use crate::strategy::{block_size_for, RangeStrategy};
use crate::utils::{align_mem_offset, is_workspace_concentrate_atomic, output_mem_attrs};

/// What a slot asks of the pool.
#[derive(Clone, Debug)]
struct Request<'a> {
    memory_type: MemoryType,
    sub_graph: SubGraphId,
    stream: StreamId,
    batch_label: Option<&'a str>,
    size: u64,
    continuous: bool,
}

/// What keeps an output's block out of the pool, or off its stream's pool.
#[derive(Clone, Copy, Debug, Default)]
struct ReuseVetoes {
    fixed: bool,
    zero_copy: bool,
    cross_stream: bool,
    diff_stream_prior: bool,
}

impl ReuseVetoes {
    fn of(fixed: bool, info: &AnchorInfo) -> Self {
        Self {
            fixed,
            zero_copy: info.zero_copy,
            cross_stream: info.cross_stream,
            diff_stream_prior: info.diff_stream_prior,
        }
    }

    fn merge(self, other: Self) -> Self {
        Self {
            fixed: self.fixed || other.fixed,
            zero_copy: self.zero_copy || other.zero_copy,
            cross_stream: self.cross_stream || other.cross_stream,
            diff_stream_prior: self.diff_stream_prior || other.diff_stream_prior,
        }
    }

    /// The block is never taken from or returned to the pool.
    fn pinned(self) -> bool {
        self.fixed || self.zero_copy
    }

    fn apply(self, block: &mut MemoryBlock) {
        if self.pinned() {
            block.reuse_mem = false;
        }
        block.fixed_addr_prior |= self.fixed;
        block.is_zero_copy |= self.zero_copy && !self.fixed;
        if self.cross_stream {
            block.same_stream = false;
        }
        block.diff_stream_prior |= self.diff_stream_prior;
    }
}

/// Assigns offsets to every output and workspace of a graph.
///
/// Holds only shared references and an immutable config; every run builds
/// its own context, so one assigner may run several strategies.
#[derive(Debug)]
pub struct BlockMemAssigner<'g> {
    graph: &'g Graph,
    symbols: &'g SymbolTable,
    config: AssignConfig,
}

impl<'g> BlockMemAssigner<'g> {
    /// Create an assigner after validating `config`.
    pub fn new(
        graph: &'g Graph,
        symbols: &'g SymbolTable,
        config: AssignConfig,
    ) -> Result<Self, AssignError> {
        config.validate()?;
        Ok(Self {
            graph,
            symbols,
            config,
        })
    }

    /// The validated configuration.
    pub fn config(&self) -> &AssignConfig {
        &self.config
    }

    /// Run the configured strategy.
    ///
    /// `Hybrid` runs every concrete strategy and keeps the result with the
    /// smallest overall footprint; ties go to the earlier strategy.
    #[tracing::instrument(skip_all, fields(graph = self.graph.name(), nodes = self.graph.len()))]
    pub fn assign(&self) -> Result<MemoryAssignment, AssignError> {
        self.assign_with(self.config.strategy)
    }

    /// Run a specific strategy.
    pub fn assign_with(&self, strategy: RangeStrategy) -> Result<MemoryAssignment, AssignError> {
        let mut best: Option<MemoryAssignment> = None;
        for &variant in strategy.variants() {
            let plan = self.run(variant)?;
            tracing::debug!(%variant, total = plan.overall_size(), "strategy finished");
            if best.as_ref().map_or(true, |b| plan.overall_size() < b.overall_size()) {
                best = Some(plan);
            }
        }
        best.ok_or_else(|| AssignError::InvalidConfig {
            reason: format!("strategy {strategy} has no concrete variant"),
        })
    }

    fn run(&self, strategy: RangeStrategy) -> Result<MemoryAssignment, AssignError> {
        let mut ctx = AssignContext::new(self.graph, self.symbols, &self.config, strategy)?;
        for node in self.graph.nodes() {
            self.assign_node(&mut ctx, node)?;
        }
        if self.config.level2_reuse && strategy.need_level2_reuse() {
            self.reuse_blocks_by_life_time(&mut ctx);
        }
        self.merge_dynamic_batch_blocks(&mut ctx);
        let totals = self.resize_memory_blocks(&mut ctx);
        self.set_op_mem_offset(ctx, totals)
    }

    // ── main pass ──────────────────────────────────────────────

    fn assign_node(&self, ctx: &mut AssignContext, node: &Node) -> Result<(), AssignError> {
        let stream = ctx.stream_of(node.id);
        for anchor in self.graph.output_refs(node.id) {
            self.assign_output(ctx, node, anchor, stream)?;
        }

        let mut workspaces: SmallVec<[(BlockId, SlotKey); 4]> = SmallVec::new();
        for index in 0..node.workspaces.len() as u32 {
            if let Some(placed) = self.assign_workspace(ctx, node, index, stream)? {
                workspaces.push(placed);
            }
        }
        for (id, key) in workspaces {
            let block = &mut ctx.blocks[id.index()];
            if let Some(slot) = block.find_slot_mut(key) {
                slot.set_same_stream_end(node.id.0);
                slot.mark_released();
                slot.advance(SlotState::Released, &node.name)?;
            }
            self.release_ref(ctx, node, id)?;
        }

        if let Some(entries) = ctx.release_at.shift_remove(&node.id) {
            for entry in entries {
                self.release_anchor(ctx, node, entry)?;
            }
        }
        Ok(())
    }

    fn assign_output(
        &self,
        ctx: &mut AssignContext,
        node: &Node,
        anchor: OutputRef,
        stream: StreamId,
    ) -> Result<(), AssignError> {
        if !self.symbols.is_owner(anchor) {
            return Ok(());
        }
        if ctx.continuous.is_continuous(anchor) {
            return self.assign_continuous_member(ctx, node, anchor);
        }

        let i = anchor.index as usize;
        let memory_type = node.outputs[i].memory_type;
        let size = ctx.sizes[node.id.index()].outputs[i];
        let key = SlotKey::new(node.id, SlotRole::Output, anchor.index);
        if size == 0 {
            ctx.zero_size.push((key, memory_type));
            return Ok(());
        }
        let info = ctx
            .anchors
            .get(&anchor)
            .cloned()
            .ok_or_else(|| contract(node, format!("no release schedule for {anchor}")))?;

        let mut slot = NodeTypeIndex::new(node.id, SlotRole::Output, anchor.index, stream);
        slot.attrs = output_mem_attrs(self.graph, anchor, self.config.separate_atomic_clean)?;
        slot.ref_input = self.symbols.symbol_of(anchor).is_some();
        if let Some(end) = info.boundary_end {
            slot.set_boundary_end(end);
        }
        slot.advance(SlotState::SizeComputed, &node.name)?;

        let fixed = node.attrs.fixed_addr_prior_outputs.contains(&anchor.index);
        let request = Request {
            memory_type,
            sub_graph: node.attrs.sub_graph_id,
            stream,
            batch_label: node.attrs.batch_label.as_deref(),
            size: align_mem_offset(size),
            continuous: false,
        };
        let flags = ReuseVetoes::of(fixed, &info);
        let id = if flags.pinned() {
            slot.advance(SlotState::NewBlock, &node.name)?;
            self.new_block(ctx, &request)
        } else {
            self.apply_memory(ctx, &mut slot, &request, &node.name)?
        };

        let block = &mut ctx.blocks[id.index()];
        flags.apply(block);
        block.add_node_type_index(slot, request.size, size);
        block.ref_count += info.pending;
        let mut placed: SmallVec<[(BlockId, SlotKey); 2]> = SmallVec::new();
        placed.push((id, key));

        if let Some(desc_size) = ctx.sizes[node.id.index()].output_descs[i] {
            let mut desc = NodeTypeIndex::new(node.id, SlotRole::OutputDesc, anchor.index, stream);
            desc.advance(SlotState::SizeComputed, &node.name)?;
            let desc_request = Request {
                size: align_mem_offset(desc_size),
                ..request.clone()
            };
            let desc_id = self.apply_memory(ctx, &mut desc, &desc_request, &node.name)?;
            let block = &mut ctx.blocks[desc_id.index()];
            if info.cross_stream {
                block.same_stream = false;
            }
            block.add_node_type_index(desc, desc_request.size, desc_size);
            block.ref_count += info.pending;
            placed.push((desc_id, SlotKey::new(node.id, SlotRole::OutputDesc, anchor.index)));
        }

        if let Some(info) = ctx.anchors.get_mut(&anchor) {
            info.blocks.extend(placed);
        }
        Ok(())
    }

    fn assign_workspace(
        &self,
        ctx: &mut AssignContext,
        node: &Node,
        index: u32,
        stream: StreamId,
    ) -> Result<Option<(BlockId, SlotKey)>, AssignError> {
        let size = ctx.sizes[node.id.index()].workspaces[index as usize];
        let key = SlotKey::new(node.id, SlotRole::Workspace, index);
        if size == 0 {
            ctx.zero_size.push((key, MemoryType::Hbm));
            return Ok(None);
        }
        let mut slot = NodeTypeIndex::new(node.id, SlotRole::Workspace, index, stream);
        if is_workspace_concentrate_atomic(node, index, self.config.separate_atomic_clean) {
            slot.attrs = BlockTypeList::of(NodeMemAttr::ConcentrateAtomic);
        }
        slot.advance(SlotState::SizeComputed, &node.name)?;
        let request = Request {
            memory_type: MemoryType::Hbm,
            sub_graph: node.attrs.sub_graph_id,
            stream,
            batch_label: node.attrs.batch_label.as_deref(),
            size: align_mem_offset(size),
            continuous: false,
        };
        let id = self.apply_memory(ctx, &mut slot, &request, &node.name)?;
        let block = &mut ctx.blocks[id.index()];
        block.add_node_type_index(slot, request.size, size);
        block.ref_count += 1;
        Ok(Some((id, key)))
    }

    /// Place a continuous-group member.
    ///
    /// A one-block group is allocated in full when its earliest member is
    /// produced; the first member's slot is added then, with its begin
    /// pulled to that node, and one reservation is held for every member
    /// still to come. Members of a separate-block group each get a fresh
    /// block that is never reused.
    fn assign_continuous_member(
        &self,
        ctx: &mut AssignContext,
        node: &Node,
        anchor: OutputRef,
    ) -> Result<(), AssignError> {
        let (gid, group) = ctx
            .continuous
            .group_of(anchor)
            .ok_or_else(|| contract(node, format!("{anchor} is not in a continuous group")))?;
        let group = group.clone();
        let pos = group
            .position(anchor)
            .ok_or_else(|| contract(node, format!("{anchor} missing from its group")))?;
        let key = SlotKey::new(node.id, SlotRole::Output, anchor.index);

        if group.use_one_block() {
            let id = match ctx.group_blocks.get(&gid) {
                Some(&id) => id,
                None => self.allocate_group_block(ctx, node, gid, &group)?,
            };
            if ctx.blocks[id.index()].find_slot(key).is_some() {
                return Ok(());
            }
            let mut slot = self.member_slot(ctx, node, anchor, pos, group.members().len(), &group)?;
            slot.advance(SlotState::NewBlock, &node.name)?;
            let pending = self.pending_of(ctx, node, anchor)?;
            let raw = ctx.sizes[node.id.index()].outputs[anchor.index as usize];
            let block = &mut ctx.blocks[id.index()];
            block.add_node_type_index(slot, group.aligned_sizes()[pos], raw);
            block.ref_count = block.ref_count.saturating_sub(1) + pending;
            self.record_placement(ctx, anchor, id, key);
            return Ok(());
        }

        let mut slot = self.member_slot(ctx, node, anchor, pos, group.members().len(), &group)?;
        slot.sub_offset = 0;
        slot.advance(SlotState::NewBlock, &node.name)?;
        let request = Request {
            memory_type: node.outputs[anchor.index as usize].memory_type,
            sub_graph: node.attrs.sub_graph_id,
            stream: ctx.stream_of(node.id),
            batch_label: node.attrs.batch_label.as_deref(),
            size: group.aligned_sizes()[pos],
            continuous: true,
        };
        let pending = self.pending_of(ctx, node, anchor)?;
        let flags = self.member_vetoes(ctx, anchor)?;
        let raw = ctx.sizes[node.id.index()].outputs[anchor.index as usize];
        let id = self.new_block(ctx, &request);
        let block = &mut ctx.blocks[id.index()];
        flags.apply(block);
        block.continuous_block = true;
        block.reuse_mem = false;
        block.continuous_group = Some(gid);
        block.add_node_type_index(slot, request.size, raw);
        block.ref_count += pending;
        ctx.group_member_blocks.entry(gid).or_default().push((pos, id));
        self.record_placement(ctx, anchor, id, key);
        Ok(())
    }

    fn allocate_group_block(
        &self,
        ctx: &mut AssignContext,
        node: &Node,
        gid: usize,
        group: &ContinuousMem,
    ) -> Result<BlockId, AssignError> {
        let first = group.first();
        let first_node = self.graph.node(first.node)?;
        let mut slot = self.member_slot(ctx, first_node, first, 0, group.members().len(), group)?;
        slot.set_explicit_begin(node.id.0);
        let request = Request {
            memory_type: first_node.outputs[first.index as usize].memory_type,
            sub_graph: node.attrs.sub_graph_id,
            stream: ctx.stream_of(node.id),
            batch_label: node.attrs.batch_label.as_deref(),
            size: align_mem_offset(group.total_size()),
            continuous: true,
        };
        let mut flags = ReuseVetoes::default();
        for &member in group.members() {
            flags = flags.merge(self.member_vetoes(ctx, member)?);
        }
        // A pooled block is only ordered after its last reader on the
        // allocating stream.
        let one_stream = group
            .members()
            .iter()
            .all(|m| ctx.stream_of(m.node) == request.stream);
        let reusable = group.can_reuse() && !flags.pinned();
        let id = if reusable && one_stream {
            self.apply_memory(ctx, &mut slot, &request, &node.name)?
        } else {
            slot.advance(SlotState::NewBlock, &node.name)?;
            self.new_block(ctx, &request)
        };
        let pending = self.pending_of(ctx, first_node, first)?;
        let raw = ctx.sizes[first.node.index()].outputs[first.index as usize];
        let reservations = group.members().len() as u32 - 1;
        let block = &mut ctx.blocks[id.index()];
        flags.apply(block);
        block.continuous_block = true;
        block.reuse_mem = reusable;
        block.continuous_group = Some(gid);
        block.add_node_type_index(slot, group.aligned_sizes()[0], raw);
        block.cover(group.total_size());
        block.ref_count += pending + reservations;
        ctx.group_blocks.insert(gid, id);
        let key = SlotKey::new(first.node, SlotRole::Output, first.index);
        self.record_placement(ctx, first, id, key);
        tracing::trace!(
            group = gid,
            block = %id,
            total = group.total_size(),
            "continuous group block"
        );
        Ok(id)
    }

    fn member_slot(
        &self,
        ctx: &AssignContext,
        node: &Node,
        anchor: OutputRef,
        pos: usize,
        len: usize,
        group: &ContinuousMem,
    ) -> Result<NodeTypeIndex, AssignError> {
        let mut slot =
            NodeTypeIndex::new(node.id, SlotRole::Output, anchor.index, ctx.stream_of(node.id));
        slot.attrs = output_mem_attrs(self.graph, anchor, self.config.separate_atomic_clean)?;
        slot.ref_input = self.symbols.symbol_of(anchor).is_some();
        slot.continuous_first = pos == 0;
        slot.continuous_last = pos + 1 == len;
        slot.sub_offset = group.sub_offset_of(anchor).unwrap_or(0);
        if let Some(end) = ctx.anchors.get(&anchor).and_then(|i| i.boundary_end) {
            slot.set_boundary_end(end);
        }
        slot.advance(SlotState::SizeComputed, &node.name)?;
        Ok(slot)
    }

    fn member_vetoes(
        &self,
        ctx: &AssignContext,
        anchor: OutputRef,
    ) -> Result<ReuseVetoes, AssignError> {
        let node = self.graph.node(anchor.node)?;
        let info = ctx
            .anchors
            .get(&anchor)
            .ok_or_else(|| contract(node, format!("no release schedule for {anchor}")))?;
        let fixed = node.attrs.fixed_addr_prior_outputs.contains(&anchor.index);
        Ok(ReuseVetoes::of(fixed, info))
    }

    fn pending_of(
        &self,
        ctx: &AssignContext,
        node: &Node,
        anchor: OutputRef,
    ) -> Result<u32, AssignError> {
        ctx.anchors
            .get(&anchor)
            .map(|i| i.pending)
            .ok_or_else(|| contract(node, format!("no release schedule for {anchor}")))
    }

    fn record_placement(
        &self,
        ctx: &mut AssignContext,
        anchor: OutputRef,
        id: BlockId,
        key: SlotKey,
    ) {
        if let Some(info) = ctx.anchors.get_mut(&anchor) {
            info.blocks.push((id, key));
        }
    }

    fn new_block(&self, ctx: &mut AssignContext, request: &Request<'_>) -> BlockId {
        let id = BlockId(ctx.blocks.len() as u32);
        let size = if self.config.reuse.use_range {
            let ranges = ctx.ranges.get(&request.memory_type).map(Vec::as_slice).unwrap_or(&[]);
            block_size_for(request.size, ranges)
        } else {
            request.size
        };
        ctx.blocks.push(MemoryBlock::new(
            id,
            request.memory_type,
            request.stream,
            request.sub_graph,
            request.batch_label.map(str::to_string),
            size,
        ));
        tracing::trace!(block = %id, size, stream = %request.stream, "new block");
        id
    }

    /// Take a block from the pool, or create one.
    fn apply_memory(
        &self,
        ctx: &mut AssignContext,
        slot: &mut NodeTypeIndex,
        request: &Request<'_>,
        node_name: &str,
    ) -> Result<BlockId, AssignError> {
        slot.advance(SlotState::ReuseSearched, node_name)?;
        if let Some(id) = self.find_reusable_block(ctx, slot, request) {
            slot.advance(SlotState::ReusedBlock, node_name)?;
            ctx.blocks[id.index()].reuse_count += 1;
            ctx.reused_slots += 1;
            tracing::trace!(block = %id, slot = %slot.key(), "reused block");
            return Ok(id);
        }
        slot.advance(SlotState::NewBlock, node_name)?;
        Ok(self.new_block(ctx, request))
    }

    /// Search the request's pool bucket.
    ///
    /// Blocks that are not reusable, belong to another batch branch,
    /// conflict in attributes or differ in continuity are skipped. With
    /// ranges, a block must already hold the range-rounded request;
    /// without, any block qualifies and grows as needed.
    fn find_reusable_block(
        &self,
        ctx: &mut AssignContext,
        slot: &NodeTypeIndex,
        request: &Request<'_>,
    ) -> Option<BlockId> {
        let reuse = self.config.reuse;
        let needed = if reuse.use_range {
            let ranges = ctx.ranges.get(&request.memory_type).map(Vec::as_slice).unwrap_or(&[]);
            block_size_for(request.size, ranges)
        } else {
            request.size
        };
        let bucket = ctx.pool.bucket(request.memory_type, request.sub_graph, request.stream);
        let order: Vec<usize> = if reuse.reuse_first_release {
            (0..bucket.len()).collect()
        } else {
            (0..bucket.len()).rev().collect()
        };
        let eligible: Vec<(usize, u64)> = order
            .into_iter()
            .filter_map(|pos| {
                let block = &ctx.blocks[bucket[pos].index()];
                if block.is_block_type_conflict_with_node(slot) {
                    tracing::debug!(
                        block = %bucket[pos],
                        slot = %slot.key(),
                        "attribute conflict, not reusing"
                    );
                    return None;
                }
                let ok = block.reuse_mem
                    && block.batch_label() == request.batch_label
                    && block.continuous_block == request.continuous
                    && (!reuse.use_range || block.size() >= needed);
                ok.then_some((pos, block.size()))
            })
            .collect();

        let fits = eligible.iter().filter(|(_, size)| *size >= needed);
        let chosen = if reuse.ascending_sort {
            let best_fit = fits.min_by_key(|(_, size)| *size);
            // `max_by_key` keeps the last maximum; reverse to keep the first.
            best_fit.or_else(|| {
                (!reuse.use_range)
                    .then(|| eligible.iter().rev().max_by_key(|(_, size)| *size))
                    .flatten()
            })
        } else {
            let mut fits = fits;
            fits.next()
                .or_else(|| (!reuse.use_range).then(|| eligible.first()).flatten())
        };
        let &(pos, _) = chosen?;
        ctx.pool.take(request.memory_type, request.sub_graph, request.stream, pos)
    }

    fn release_anchor(
        &self,
        ctx: &mut AssignContext,
        node: &Node,
        entry: ReleaseEntry,
    ) -> Result<(), AssignError> {
        let releaser_stream = ctx.stream_of(node.id);
        let info = ctx
            .anchors
            .get_mut(&entry.anchor)
            .ok_or_else(|| contract(node, format!("release of unknown anchor {}", entry.anchor)))?;
        info.pending = info
            .pending
            .checked_sub(1)
            .ok_or_else(|| contract(node, format!("{} released too often", entry.anchor)))?;
        let done = info.pending == 0;
        let placed = info.blocks.clone();

        for (id, key) in placed {
            if let Some(slot) = ctx.blocks[id.index()].find_slot_mut(key) {
                if slot.stream_id() != releaser_stream {
                    slot.record_diff_stream_end(releaser_stream, node.id.0);
                } else if entry.via_ref {
                    slot.extend_by_ref(node.id.0);
                } else {
                    slot.set_same_stream_end(node.id.0);
                }
                if done {
                    slot.mark_released();
                    slot.advance(SlotState::Released, &node.name)?;
                }
            }
            self.release_ref(ctx, node, id)?;
        }
        Ok(())
    }

    /// Drop one reference; a block without references returns to its pool.
    fn release_ref(
        &self,
        ctx: &mut AssignContext,
        node: &Node,
        id: BlockId,
    ) -> Result<(), AssignError> {
        let block = &mut ctx.blocks[id.index()];
        block.ref_count = block
            .ref_count
            .checked_sub(1)
            .ok_or_else(|| contract(node, format!("{id} released with no references")))?;
        if block.ref_count == 0 && block.same_stream && block.reuse_mem {
            tracing::trace!(block = %id, at = %node.id, "block released to pool");
            let (memory_type, sub_graph, stream) =
                (block.memory_type(), block.sub_graph(), block.stream_id());
            ctx.pool.push(memory_type, sub_graph, stream, id);
        }
        Ok(())
    }

    // ── post passes ────────────────────────────────────────────

    /// Nest later blocks into the lifetime gaps of earlier ones.
    fn reuse_blocks_by_life_time(&self, ctx: &mut AssignContext) {
        let params = LifeReuseParams {
            edges: &ctx.edges,
            max_depth: self.config.max_reuse_depth,
            child_reuse: true,
        };
        let count = ctx.blocks.len();
        let mut clone_blocks = Vec::new();
        for parent in 0..count {
            if ctx.blocks[parent].deleted_block {
                continue;
            }
            for candidate in parent + 1..count {
                if ctx.blocks[candidate].deleted_block {
                    continue;
                }
                if MemoryBlock::add_life_reuse_block(
                    &mut ctx.blocks,
                    BlockId(parent as u32),
                    BlockId(candidate as u32),
                    &mut clone_blocks,
                    0,
                    &params,
                ) {
                    ctx.nested_blocks += 1;
                }
            }
        }
        tracing::debug!(
            nested = ctx.nested_blocks,
            split = clone_blocks.len(),
            "level-2 reuse finished"
        );
    }

    /// Overlay the blocks of mutually exclusive batch branches.
    ///
    /// The branch with the largest footprint keeps its blocks; blocks of
    /// every other branch are nested at offset 0, largest into largest.
    fn merge_dynamic_batch_blocks(&self, ctx: &mut AssignContext) {
        let mut branches: IndexMap<(MemoryType, String), Vec<BlockId>> = IndexMap::new();
        for block in &ctx.blocks {
            let Some(label) = block.batch_label() else {
                continue;
            };
            if block.deleted_block
                || block.continuous_block
                || block.is_zero_copy
                || block.fixed_addr_prior
            {
                continue;
            }
            branches
                .entry((block.memory_type(), label.to_string()))
                .or_default()
                .push(block.id());
        }
        let memory_types: Vec<MemoryType> = {
            let mut v: Vec<MemoryType> = branches.keys().map(|(m, _)| *m).collect();
            v.sort_unstable();
            v.dedup();
            v
        };
        for memory_type in memory_types {
            let mut labels: Vec<(&String, Vec<BlockId>)> = branches
                .iter()
                .filter(|((m, _), _)| *m == memory_type)
                .map(|((_, l), ids)| (l, ids.clone()))
                .collect();
            if labels.len() < 2 {
                continue;
            }
            let footprint = |ids: &[BlockId]| -> u64 {
                ids.iter().map(|id| ctx.blocks[id.index()].align_size()).sum()
            };
            let mut max_pos = 0;
            for (i, (_, ids)) in labels.iter().enumerate() {
                if footprint(ids) > footprint(&labels[max_pos].1) {
                    max_pos = i;
                }
            }
            let (max_label, mut hosts) = labels.remove(max_pos);
            hosts.sort_by_key(|id| std::cmp::Reverse(ctx.blocks[id.index()].align_size()));
            for (label, mut ids) in labels {
                ids.sort_by_key(|id| std::cmp::Reverse(ctx.blocks[id.index()].align_size()));
                for (host, child) in hosts.iter().zip(ids) {
                    MemoryBlock::add_batch_child(&mut ctx.blocks, *host, child);
                }
                tracing::debug!(%label, into = %max_label, "merged batch branch");
            }
        }
    }

    /// Settle block sizes and lay blocks out per memory type.
    ///
    /// Fixed-address blocks go first, then blocks in creation order; the
    /// blocks of a separate-block continuous group are laid out together
    /// in group order. Nested blocks sit at their parent's head plus
    /// their offset.
    fn resize_memory_blocks(&self, ctx: &mut AssignContext) -> IndexMap<MemoryType, u64> {
        for id in 0..ctx.blocks.len() {
            if !ctx.blocks[id].deleted_block {
                settle(&mut ctx.blocks, BlockId(id as u32));
            }
        }

        let mut order: Vec<BlockId> = ctx
            .blocks
            .iter()
            .filter(|b| !b.deleted_block)
            .map(MemoryBlock::id)
            .collect();
        order.sort_by_key(|id| !ctx.blocks[id.index()].fixed_addr_prior);

        let mut totals: IndexMap<MemoryType, u64> = IndexMap::new();
        let mut placed = vec![false; ctx.blocks.len()];
        for id in order {
            if placed[id.index()] {
                continue;
            }
            let run: Vec<BlockId> = match ctx.blocks[id.index()].continuous_group {
                Some(gid) if !ctx.group_blocks.contains_key(&gid) => {
                    let mut members =
                        ctx.group_member_blocks.get(&gid).cloned().unwrap_or_default();
                    members.sort_by_key(|(pos, _)| *pos);
                    members.into_iter().map(|(_, b)| b).collect()
                }
                _ => vec![id],
            };
            for b in run {
                if placed[b.index()] {
                    continue;
                }
                placed[b.index()] = true;
                let block = &mut ctx.blocks[b.index()];
                let total = totals.entry(block.memory_type()).or_insert(0);
                block.set_offsets(*total);
                *total += block.align_size();
                place_children(&mut ctx.blocks, b);
            }
        }
        for (memory_type, total) in &totals {
            tracing::debug!(?memory_type, total, "memory type laid out");
        }
        totals
    }

    /// Resolve every slot's offset and freeze the result.
    fn set_op_mem_offset(
        &self,
        mut ctx: AssignContext,
        totals: IndexMap<MemoryType, u64>,
    ) -> Result<MemoryAssignment, AssignError> {
        let mut outputs: IndexMap<OutputRef, SlotOffset> = IndexMap::new();
        let mut workspaces = IndexMap::new();
        let mut output_descs = IndexMap::new();

        for block in &mut ctx.blocks {
            let (head, memory_type, id) = (block.head_offset(), block.memory_type(), block.id());
            let real: Vec<u64> = block.real_sizes().to_vec();
            for (slot, size) in block.occupants_mut().zip(real) {
                let node_name = self.graph.node(slot.node)?.name.clone();
                slot.advance(SlotState::Resized, &node_name)?;
                slot.advance(SlotState::OffsetWritten, &node_name)?;
                let placed = SlotOffset {
                    offset: head + slot.sub_offset,
                    size,
                    memory_type,
                    block: Some(id),
                };
                match slot.role {
                    SlotRole::Output => {
                        outputs.insert(OutputRef::new(slot.node, slot.index), placed);
                    }
                    SlotRole::Workspace => {
                        workspaces.insert((slot.node, slot.index), placed);
                    }
                    SlotRole::OutputDesc => {
                        output_descs.insert(OutputRef::new(slot.node, slot.index), placed);
                    }
                    SlotRole::Input => {}
                }
            }
        }
        for &(key, memory_type) in &ctx.zero_size {
            let placed = SlotOffset {
                offset: 0,
                size: 0,
                memory_type,
                block: None,
            };
            match key.role {
                SlotRole::Workspace => {
                    workspaces.insert((key.node, key.index), placed);
                }
                _ => {
                    outputs.insert(OutputRef::new(key.node, key.index), placed);
                }
            }
        }

        let mut ordered: IndexMap<OutputRef, SlotOffset> = IndexMap::new();
        let mut inputs = IndexMap::new();
        for node in self.graph.nodes() {
            for anchor in self.graph.output_refs(node.id) {
                let owner = self.symbols.owner_of(anchor);
                let placed = outputs
                    .get(&owner)
                    .copied()
                    .ok_or_else(|| contract(node, format!("{anchor} has no assigned offset")))?;
                ordered.insert(anchor, placed);
            }
            for (i, src) in self.graph.in_data_anchors(node.id).iter().enumerate() {
                if let Some(src) = src {
                    let offset = ordered
                        .get(src)
                        .map(|s| s.offset)
                        .ok_or_else(|| {
                            contract(node, format!("input {i} reads unassigned {src}"))
                        })?;
                    inputs.insert(InputRef::new(node.id, i as u32), offset);
                }
            }
        }
        workspaces.sort_keys();

        let stats = self.collect_stats(&ctx, &totals);
        tracing::debug!(
            strategy = %ctx.strategy,
            reused = ctx.reused_slots,
            nested = ctx.nested_blocks,
            zero_size = ctx.zero_size.len(),
            "offsets resolved"
        );
        Ok(MemoryAssignment {
            strategy: ctx.strategy,
            outputs: ordered,
            workspaces,
            output_descs,
            inputs,
            stats,
            stream_reassignments: std::mem::take(&mut ctx.stream_reassignments),
            blocks: std::mem::take(&mut ctx.blocks),
            continuous: std::mem::take(&mut ctx.continuous),
            edges: std::mem::take(&mut ctx.edges),
        })
    }

    fn collect_stats(
        &self,
        ctx: &AssignContext,
        totals: &IndexMap<MemoryType, u64>,
    ) -> IndexMap<MemoryType, MemStats> {
        let mut stats: IndexMap<MemoryType, MemStats> = IndexMap::new();
        let mut streams: IndexMap<MemoryType, Vec<StreamId>> = IndexMap::new();

        for node in self.graph.nodes() {
            let sizes = &ctx.sizes[node.id.index()];
            let mut footprint: IndexMap<MemoryType, u64> = IndexMap::new();
            for anchor in self.graph.output_refs(node.id) {
                let i = anchor.index as usize;
                let memory_type = node.outputs[i].memory_type;
                let size = align_mem_offset(sizes.outputs[i])
                    + sizes.output_descs[i].map_or(0, align_mem_offset);
                *footprint.entry(memory_type).or_insert(0) += size;
                if self.symbols.is_owner(anchor) {
                    stats.entry(memory_type).or_default().theory_size += size;
                }
            }
            let ws: u64 = sizes.workspaces.iter().map(|&s| align_mem_offset(s)).sum();
            *footprint.entry(MemoryType::Hbm).or_insert(0) += ws;
            stats.entry(MemoryType::Hbm).or_default().theory_size += ws;
            let mut seen: Vec<OutputRef> = Vec::new();
            for src in self.graph.in_data_anchors(node.id).iter().flatten() {
                let owner = self.symbols.owner_of(*src);
                if seen.contains(&owner) {
                    continue;
                }
                seen.push(owner);
                let Ok(producer) = self.graph.node(owner.node) else {
                    continue;
                };
                let i = owner.index as usize;
                let size = align_mem_offset(ctx.sizes[owner.node.index()].outputs[i]);
                *footprint.entry(producer.outputs[i].memory_type).or_insert(0) += size;
            }
            for (memory_type, size) in footprint {
                let entry = stats.entry(memory_type).or_default();
                entry.theory_min_size = entry.theory_min_size.max(size);
            }
        }

        for block in &ctx.blocks {
            let entry = stats.entry(block.memory_type()).or_default();
            if !block.deleted_block {
                entry.block_count += 1;
            }
            entry.reused_slots += block.reuse_count;
            entry.nested_blocks += block
                .children()
                .iter()
                .filter(|c| c.kind == ChildKind::LifeReuse)
                .count() as u32;
            let seen = streams.entry(block.memory_type()).or_default();
            for slot in block.occupants() {
                if !seen.contains(&slot.stream_id()) {
                    seen.push(slot.stream_id());
                }
            }
        }
        for (memory_type, entry) in stats.iter_mut() {
            entry.total_size = totals.get(memory_type).copied().unwrap_or(0);
            entry.stream_count = streams.get(memory_type).map_or(0, Vec::len);
        }
        stats.retain(|_, s| s.theory_size > 0 || s.total_size > 0);
        stats.sort_keys();
        for (memory_type, s) in &stats {
            tracing::debug!(
                ?memory_type,
                theory_min = s.theory_min_size,
                theory = s.theory_size,
                total = s.total_size,
                blocks = s.block_count,
                "memory stats"
            );
        }
        stats
    }
}

/// Grow every block to cover its nested children, deepest first.
fn settle(blocks: &mut [MemoryBlock], id: BlockId) {
    let children = blocks[id.index()].children().to_vec();
    for child in children {
        settle(blocks, child.id);
        let extent = child.offset + blocks[child.id.index()].align_size();
        blocks[id.index()].cover(extent);
    }
    blocks[id.index()].resize();
}

fn place_children(blocks: &mut [MemoryBlock], id: BlockId) {
    let head = blocks[id.index()].head_offset();
    let children = blocks[id.index()].children().to_vec();
    for child in children {
        blocks[child.id.index()].set_offsets(head + child.offset);
        place_children(blocks, child.id);
    }
}

fn contract(node: &Node, reason: String) -> AssignError {
    tracing::warn!(node = %node.name, %reason, "contract violation");
    AssignError::ContractViolation {
        node_name: node.name.clone(),
        reason,
    }
}

/// Assign `graph` and write the offsets back into it.
pub fn assign_graph(
    graph: &mut Graph,
    symbols: &SymbolTable,
    config: AssignConfig,
) -> Result<MemoryAssignment, AssignError> {
    let plan = BlockMemAssigner::new(graph, symbols, config)?.assign()?;
    plan.apply(graph)?;
    Ok(plan)
}
