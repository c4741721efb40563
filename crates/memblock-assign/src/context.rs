//! Per-run mutable state of an assignment.
//!
//! [`AssignContext`] owns everything the passes mutate: the block arena,
//! the reusable pools, the release schedule. It is created fresh for every
//! run and dropped when the run produces its
//! [`MemoryAssignment`](crate::MemoryAssignment). The context is `!Sync`;
//! a run happens on one thread.

use std::cell::Cell;
use std::marker::PhantomData;

use indexmap::IndexMap;
use smallvec::SmallVec;

use memblock_graph::{
    op_type, Graph, MemoryType, NodeId, OutputRef, StreamId, SubGraphId, SymbolTable,
};

use crate::block::{BlockId, MemoryBlock};
use crate::config::AssignConfig;
use crate::continuous::ContinuousMemMng;
use crate::diff_stream::{diff_stream_prior, optimize_diff_stream, DiffStreamEdgeLife};
use crate::error::AssignError;
use crate::slot::SlotKey;
use crate::strategy::RangeStrategy;
use crate::utils::{
    align_mem_offset, output_desc_size, resolve_stream_id, tensor_size, workspace_size,
};

/// Released blocks available for reuse, keyed by memory type, sub-graph
/// and stream. Each bucket is in release order.
#[derive(Debug, Default)]
pub(crate) struct ReusablePool {
    pools: IndexMap<MemoryType, IndexMap<SubGraphId, IndexMap<StreamId, Vec<BlockId>>>>,
}

impl ReusablePool {
    pub(crate) fn push(
        &mut self,
        memory_type: MemoryType,
        sub_graph: SubGraphId,
        stream: StreamId,
        id: BlockId,
    ) {
        self.pools
            .entry(memory_type)
            .or_default()
            .entry(sub_graph)
            .or_default()
            .entry(stream)
            .or_default()
            .push(id);
    }

    pub(crate) fn bucket(
        &self,
        memory_type: MemoryType,
        sub_graph: SubGraphId,
        stream: StreamId,
    ) -> &[BlockId] {
        self.pools
            .get(&memory_type)
            .and_then(|m| m.get(&sub_graph))
            .and_then(|s| s.get(&stream))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub(crate) fn take(
        &mut self,
        memory_type: MemoryType,
        sub_graph: SubGraphId,
        stream: StreamId,
        pos: usize,
    ) -> Option<BlockId> {
        let bucket = self
            .pools
            .get_mut(&memory_type)?
            .get_mut(&sub_graph)?
            .get_mut(&stream)?;
        (pos < bucket.len()).then(|| bucket.remove(pos))
    }
}

/// Byte sizes of one node's slots.
#[derive(Clone, Debug, Default)]
pub(crate) struct NodeSizes {
    pub(crate) outputs: Vec<u64>,
    pub(crate) output_descs: Vec<Option<u64>>,
    pub(crate) workspaces: Vec<u64>,
}

/// Release bookkeeping of one memory-owning output anchor.
#[derive(Clone, Debug, Default)]
pub(crate) struct AnchorInfo {
    /// Release points not reached yet.
    pub(crate) pending: u32,
    /// Blocks holding the anchor's slots.
    pub(crate) blocks: SmallVec<[(BlockId, SlotKey); 2]>,
    /// A consumer on another stream reads the anchor directly.
    pub(crate) cross_stream: bool,
    /// A returning cross-stream chain reads the anchor.
    pub(crate) diff_stream_prior: bool,
    /// Feeds the net-output and gets a dedicated block.
    pub(crate) zero_copy: bool,
    /// Last consumer inside a partitioned sub-graph.
    pub(crate) boundary_end: Option<u32>,
}

/// One scheduled release.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct ReleaseEntry {
    pub(crate) anchor: OutputRef,
    /// The release comes from a consumer of a ref alias.
    pub(crate) via_ref: bool,
}

/// Mutable state of one assignment run.
pub(crate) struct AssignContext {
    pub(crate) strategy: RangeStrategy,
    pub(crate) blocks: Vec<MemoryBlock>,
    pub(crate) pool: ReusablePool,
    pub(crate) streams: Vec<StreamId>,
    pub(crate) stream_reassignments: IndexMap<NodeId, StreamId>,
    pub(crate) edges: DiffStreamEdgeLife,
    pub(crate) continuous: ContinuousMemMng,
    pub(crate) group_blocks: IndexMap<usize, BlockId>,
    pub(crate) group_member_blocks: IndexMap<usize, Vec<(usize, BlockId)>>,
    pub(crate) sizes: Vec<NodeSizes>,
    pub(crate) ranges: IndexMap<MemoryType, Vec<u64>>,
    pub(crate) anchors: IndexMap<OutputRef, AnchorInfo>,
    pub(crate) release_at: IndexMap<NodeId, Vec<ReleaseEntry>>,
    pub(crate) zero_size: Vec<(SlotKey, MemoryType)>,
    pub(crate) reused_slots: u32,
    pub(crate) nested_blocks: u32,
    _single_thread: PhantomData<Cell<()>>,
}

impl AssignContext {
    /// Run every pre-pass that does not depend on block placement.
    pub(crate) fn new(
        graph: &Graph,
        symbols: &SymbolTable,
        config: &AssignConfig,
        strategy: RangeStrategy,
    ) -> Result<Self, AssignError> {
        let (streams, stream_reassignments) = resolve_streams(graph, config)?;
        let stream_of = |id: NodeId| streams.get(id.index()).copied().unwrap_or(StreamId(0));
        let edges = DiffStreamEdgeLife::build(graph, stream_of)?;

        let mut sizes = Vec::with_capacity(graph.len());
        for node in graph.nodes() {
            let outputs = (0..node.output_count())
                .map(|i| tensor_size(node, i))
                .collect::<Result<Vec<_>, _>>()?;
            let output_descs = (0..node.output_count())
                .map(|i| output_desc_size(node, i))
                .collect();
            let workspaces = (0..node.workspaces.len() as u32)
                .map(|i| workspace_size(node, i))
                .collect::<Result<Vec<_>, _>>()?;
            sizes.push(NodeSizes {
                outputs,
                output_descs,
                workspaces,
            });
        }

        let continuous = ContinuousMemMng::init(graph, symbols, config.separate_atomic_clean, |a| {
            sizes
                .get(a.node.index())
                .and_then(|s| s.outputs.get(a.index as usize))
                .copied()
                .ok_or(AssignError::Graph(memblock_graph::GraphError::UnknownNode { node: a.node }))
        })?;

        let mut ctx = Self {
            strategy,
            blocks: Vec::new(),
            pool: ReusablePool::default(),
            streams,
            stream_reassignments,
            edges,
            continuous,
            group_blocks: IndexMap::new(),
            group_member_blocks: IndexMap::new(),
            sizes,
            ranges: IndexMap::new(),
            anchors: IndexMap::new(),
            release_at: IndexMap::new(),
            zero_size: Vec::new(),
            reused_slots: 0,
            nested_blocks: 0,
            _single_thread: PhantomData,
        };
        ctx.build_ranges(graph, symbols, config)?;
        ctx.build_release_schedule(graph, symbols, config)?;
        tracing::debug!(
            graph = graph.name(),
            %strategy,
            cross_stream_edges = ctx.edges.len(),
            continuous_groups = ctx.continuous.len(),
            "assignment context ready"
        );
        Ok(ctx)
    }

    /// Effective stream of a node.
    pub(crate) fn stream_of(&self, id: NodeId) -> StreamId {
        self.streams.get(id.index()).copied().unwrap_or(StreamId(0))
    }

    fn build_ranges(
        &mut self,
        graph: &Graph,
        symbols: &SymbolTable,
        config: &AssignConfig,
    ) -> Result<(), AssignError> {
        let mut requests: IndexMap<MemoryType, Vec<u64>> = IndexMap::new();
        for node in graph.nodes() {
            let sizes = &self.sizes[node.id.index()];
            for anchor in graph.output_refs(node.id) {
                if !symbols.is_owner(anchor) || self.continuous.is_continuous(anchor) {
                    continue;
                }
                let i = anchor.index as usize;
                let memory_type = node.outputs[i].memory_type;
                let entry = requests.entry(memory_type).or_default();
                entry.push(align_mem_offset(sizes.outputs[i]));
                if let Some(desc) = sizes.output_descs[i] {
                    entry.push(align_mem_offset(desc));
                }
            }
            let entry = requests.entry(MemoryType::Hbm).or_default();
            entry.extend(sizes.workspaces.iter().map(|&s| align_mem_offset(s)));
        }
        for (memory_type, sizes) in requests {
            let ranges = self.strategy.memory_ranges(&sizes, config.max_range_count);
            tracing::trace!(?memory_type, ?ranges, "block size ranges");
            self.ranges.insert(memory_type, ranges);
        }
        Ok(())
    }

    /// Decide, for every memory-owning output, at which nodes it is
    /// released and how many releases it waits for.
    ///
    /// Consumers of every alias count. A consumer on another stream that is
    /// part of a returning chain is replaced by the chain's return node.
    /// An output nobody reads is released at its own node.
    fn build_release_schedule(
        &mut self,
        graph: &Graph,
        symbols: &SymbolTable,
        config: &AssignConfig,
    ) -> Result<(), AssignError> {
        for node in graph.nodes() {
            let owner_stream = self.stream_of(node.id);
            let chain = if config.reuse.memory_priority_mode {
                diff_stream_prior(
                    graph,
                    node.id,
                    |id| self.stream_of(id),
                    config.max_diff_stream_chain,
                )
            } else {
                None
            };
            for anchor in graph.output_refs(node.id) {
                if !symbols.is_owner(anchor) {
                    continue;
                }
                let mut info = AnchorInfo::default();
                let mut targets: Vec<(NodeId, bool)> = Vec::new();
                for alias in symbols.aliases_of(anchor) {
                    let via_ref = alias != anchor;
                    for input in graph.consumers(alias) {
                        let consumer = input.node;
                        if config.zero_copy_net_output && graph.node(consumer)?.is_net_output() {
                            info.zero_copy = true;
                        }
                        let target = if self.stream_of(consumer) == owner_stream {
                            consumer
                        } else {
                            match &chain {
                                Some(c) if c.intermediates.contains(&consumer) => {
                                    info.diff_stream_prior = true;
                                    c.return_node
                                }
                                _ => {
                                    info.cross_stream = true;
                                    consumer
                                }
                            }
                        };
                        targets.push((target, via_ref));
                    }
                }
                if node.op_type == op_type::PARTITIONED_CALL {
                    if let Some(&inner) = node.attrs.subgraph_output_consumers.get(&anchor.index) {
                        if inner > node.id {
                            targets.push((inner, false));
                            info.boundary_end = Some(inner.0);
                        }
                    }
                }
                if targets.is_empty() {
                    targets.push((node.id, false));
                }
                // A direct read at a node wins over a read through an alias.
                targets.sort_unstable();
                targets.dedup_by_key(|t| t.0);

                info.pending = targets.len() as u32;
                for (target, via_ref) in targets {
                    self.release_at
                        .entry(target)
                        .or_default()
                        .push(ReleaseEntry { anchor, via_ref });
                }
                self.anchors.insert(anchor, info);
            }
        }
        Ok(())
    }
}

/// Effective stream of every node, with diff-stream reassignments applied.
fn resolve_streams(
    graph: &Graph,
    config: &AssignConfig,
) -> Result<(Vec<StreamId>, IndexMap<NodeId, StreamId>), AssignError> {
    let base: Vec<StreamId> = graph.nodes().map(|n| resolve_stream_id(n, None)).collect();
    let mut overrides: IndexMap<NodeId, StreamId> = IndexMap::new();
    if config.optimize_diff_stream {
        let base_of = |id: NodeId| base.get(id.index()).copied().unwrap_or(StreamId(0));
        for node in graph.nodes() {
            let Some(chain) =
                diff_stream_prior(graph, node.id, base_of, config.max_diff_stream_chain)
            else {
                continue;
            };
            if !optimize_diff_stream(graph, &chain)? {
                continue;
            }
            let target = base_of(node.id);
            for &id in &chain.intermediates {
                if !overrides.contains_key(&id) {
                    tracing::debug!(node = %id, stream = %target, "moving node onto origin stream");
                    overrides.insert(id, target);
                }
            }
        }
    }
    let streams = graph
        .nodes()
        .map(|n| resolve_stream_id(n, overrides.get(&n.id).copied()))
        .collect();
    overrides.retain(|id, s| graph.node(*id).map_or(false, |n| n.stream_id != *s));
    Ok((streams, overrides))
}
