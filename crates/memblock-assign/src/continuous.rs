//! Continuous-memory groups.
//!
//! Some operators need all of their inputs, or all of their outputs, laid
//! out back to back. Such constraints chain: an output list that is
//! continuous and also feeds a continuous input list forms one group whose
//! members must appear in a single order. [`ContinuousMemMng`] resolves
//! the constraints into ordered groups and decides how each group is
//! allocated.

use indexmap::IndexMap;

use memblock_graph::{Graph, InputRef, NodeId, OutputRef, SymbolTable};

use crate::error::AssignError;
use crate::utils::{align_mem_offset, src_node_through_ref_node};

/// Which constraints produced a group.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ContinuousScenario {
    /// Continuous outputs feeding a continuous input list.
    Cascade,
    /// A continuous input list only.
    InputOnly,
    /// A continuous output list only.
    OutputOnly,
}

/// One ordered group of output anchors that must be contiguous.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContinuousMem {
    members: Vec<OutputRef>,
    aligned_sizes: Vec<u64>,
    offsets: Vec<u64>,
    total_size: u64,
    scenario: ContinuousScenario,
    can_reuse: bool,
    use_one_block: bool,
}

impl ContinuousMem {
    /// Members in layout order.
    pub fn members(&self) -> &[OutputRef] {
        &self.members
    }

    /// The first member.
    pub fn first(&self) -> OutputRef {
        self.members[0]
    }

    /// Sum of the members' aligned sizes.
    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    /// Aligned size of each member, in layout order.
    pub fn aligned_sizes(&self) -> &[u64] {
        &self.aligned_sizes
    }

    /// How the group arose.
    pub fn scenario(&self) -> ContinuousScenario {
        self.scenario
    }

    /// Whether the group's memory may be reused once released.
    pub fn can_reuse(&self) -> bool {
        self.can_reuse
    }

    /// Whether the group is one block with members at sub-offsets.
    pub fn use_one_block(&self) -> bool {
        self.use_one_block
    }

    /// Position of `anchor` in the group.
    pub fn position(&self, anchor: OutputRef) -> Option<usize> {
        self.members.iter().position(|m| *m == anchor)
    }

    /// Offset of `anchor` from the group's start.
    pub fn sub_offset_of(&self, anchor: OutputRef) -> Option<u64> {
        self.position(anchor).map(|i| self.offsets[i])
    }

    /// Node that produces the earliest member.
    pub fn earliest_node(&self) -> NodeId {
        self.members
            .iter()
            .map(|m| m.node)
            .min()
            .unwrap_or(self.members[0].node)
    }
}

/// All continuous groups of a graph.
#[derive(Clone, Debug, Default)]
pub struct ContinuousMemMng {
    groups: Vec<ContinuousMem>,
    index: IndexMap<OutputRef, usize>,
}

#[derive(Default)]
struct Links {
    succ: IndexMap<OutputRef, OutputRef>,
    pred: IndexMap<OutputRef, OutputRef>,
}

impl Links {
    fn add(
        &mut self,
        graph: &Graph,
        a: OutputRef,
        b: OutputRef,
        at: NodeId,
    ) -> Result<(), AssignError> {
        let ambiguous = |anchor, reason| -> Result<(), AssignError> {
            Err(AssignError::AmbiguousContinuousBinding {
                node_name: graph.node(at)?.name.clone(),
                anchor,
                reason,
            })
        };
        if a == b {
            return ambiguous(a, "anchor appears twice in one continuous list");
        }
        match self.succ.get(&a) {
            Some(&s) if s != b => return ambiguous(a, "two different successors"),
            _ => {}
        }
        match self.pred.get(&b) {
            Some(&p) if p != a => return ambiguous(b, "two different predecessors"),
            _ => {}
        }
        self.succ.insert(a, b);
        self.pred.insert(b, a);
        Ok(())
    }

    fn find_first_node(
        &self,
        graph: &Graph,
        anchor: OutputRef,
        at: NodeId,
    ) -> Result<OutputRef, AssignError> {
        let mut cur = anchor;
        for _ in 0..=self.pred.len() {
            match self.pred.get(&cur) {
                Some(&p) => cur = p,
                None => return Ok(cur),
            }
        }
        Err(AssignError::AmbiguousContinuousBinding {
            node_name: graph.node(at)?.name.clone(),
            anchor,
            reason: "continuous constraints form a cycle",
        })
    }

    fn save_node_out_in_order(&self, first: OutputRef) -> Vec<OutputRef> {
        let mut out = vec![first];
        let mut cur = first;
        while let Some(&next) = self.succ.get(&cur) {
            if out.contains(&next) {
                break;
            }
            out.push(next);
            cur = next;
        }
        out
    }
}

impl ContinuousMemMng {
    /// Resolve every continuous constraint in the graph into ordered groups.
    ///
    /// Inputs are resolved through ref chains and symbols to the anchor
    /// that owns the memory. `size_of` returns the byte size of an owner.
    pub fn init<F>(
        graph: &Graph,
        symbols: &SymbolTable,
        separate_atomic_clean: bool,
        size_of: F,
    ) -> Result<Self, AssignError>
    where
        F: Fn(OutputRef) -> Result<u64, AssignError>,
    {
        let mut links = Links::default();
        let mut input_lists: Vec<(NodeId, Vec<OutputRef>)> = Vec::new();
        let mut output_lists: Vec<(NodeId, Vec<OutputRef>)> = Vec::new();

        for node in graph.nodes() {
            if node.attrs.continuous_input {
                let mut anchors = Vec::new();
                for (i, src) in graph.in_data_anchors(node.id).iter().enumerate() {
                    let Some(src) = *src else {
                        return Err(AssignError::UnresolvedContinuousInput {
                            node_name: node.name.clone(),
                            input_index: i as u32,
                        });
                    };
                    let real = symbols.owner_of(src_node_through_ref_node(graph, src)?);
                    anchors.push(real);
                }
                for pair in anchors.windows(2) {
                    links.add(graph, pair[0], pair[1], node.id)?;
                }
                if !anchors.is_empty() {
                    input_lists.push((node.id, anchors));
                }
            }
            if node.attrs.continuous_output && node.output_count() > 0 {
                let anchors: Vec<OutputRef> = graph.output_refs(node.id).collect();
                for pair in anchors.windows(2) {
                    links.add(graph, pair[0], pair[1], node.id)?;
                }
                output_lists.push((node.id, anchors));
            }
        }

        let mut mng = Self::default();
        let cascade_nodes: Vec<NodeId> = output_lists.iter().map(|(n, _)| *n).collect();

        for (at, anchors) in &input_lists {
            if mng.index.contains_key(&anchors[0]) {
                continue;
            }
            let first = links.find_first_node(graph, anchors[0], *at)?;
            let members = links.save_node_out_in_order(first);
            let scenario = if members.iter().any(|m| cascade_nodes.contains(&m.node)) {
                ContinuousScenario::Cascade
            } else {
                ContinuousScenario::InputOnly
            };
            mng.push_group(members, scenario, separate_atomic_clean, &size_of)?;
        }
        for (at, anchors) in &output_lists {
            if mng.index.contains_key(&anchors[0]) {
                continue;
            }
            let first = links.find_first_node(graph, anchors[0], *at)?;
            let members = links.save_node_out_in_order(first);
            mng.push_group(
                members,
                ContinuousScenario::OutputOnly,
                separate_atomic_clean,
                &size_of,
            )?;
        }
        Ok(mng)
    }

    fn push_group<F>(
        &mut self,
        members: Vec<OutputRef>,
        scenario: ContinuousScenario,
        separate_atomic_clean: bool,
        size_of: &F,
    ) -> Result<(), AssignError>
    where
        F: Fn(OutputRef) -> Result<u64, AssignError>,
    {
        let (use_one_block, can_reuse) = match scenario {
            ContinuousScenario::Cascade => (true, separate_atomic_clean),
            ContinuousScenario::InputOnly => (separate_atomic_clean, true),
            ContinuousScenario::OutputOnly => (true, true),
        };
        let mut aligned_sizes = Vec::with_capacity(members.len());
        let mut offsets = Vec::with_capacity(members.len());
        let mut total = 0u64;
        for &m in &members {
            let size = align_mem_offset(size_of(m)?);
            offsets.push(total);
            aligned_sizes.push(size);
            total += size;
        }
        let id = self.groups.len();
        for &m in &members {
            self.index.insert(m, id);
        }
        tracing::debug!(
            group = id,
            members = members.len(),
            total,
            ?scenario,
            use_one_block,
            can_reuse,
            "continuous group"
        );
        self.groups.push(ContinuousMem {
            members,
            aligned_sizes,
            offsets,
            total_size: total,
            scenario,
            can_reuse,
            use_one_block,
        });
        Ok(())
    }

    /// All groups, in discovery order.
    pub fn groups(&self) -> &[ContinuousMem] {
        &self.groups
    }

    /// A group by index.
    pub fn group(&self, id: usize) -> Option<&ContinuousMem> {
        self.groups.get(id)
    }

    /// Group containing `anchor`, with its index.
    pub fn group_of(&self, anchor: OutputRef) -> Option<(usize, &ContinuousMem)> {
        let &id = self.index.get(&anchor)?;
        Some((id, &self.groups[id]))
    }

    /// Whether `anchor` belongs to any group.
    pub fn is_continuous(&self, anchor: OutputRef) -> bool {
        self.index.contains_key(&anchor)
    }

    /// Whether `anchor` must create the memory it lives in.
    ///
    /// False only for non-first members of one-block groups, which live
    /// inside the first member's allocation.
    pub fn is_need_assign_memory(&self, anchor: OutputRef) -> bool {
        match self.group_of(anchor) {
            Some((_, group)) => !group.use_one_block || group.first() == anchor,
            None => true,
        }
    }

    /// Whether the continuous input of `input` belongs to a group.
    pub fn is_continuous_input(
        &self,
        graph: &Graph,
        symbols: &SymbolTable,
        input: InputRef,
    ) -> Result<bool, AssignError> {
        let Some(src) = graph.producer(input) else {
            return Ok(false);
        };
        let real = symbols.owner_of(src_node_through_ref_node(graph, src)?);
        Ok(self.is_continuous(real))
    }

    /// Number of groups.
    pub fn len(&self) -> usize {
        self.groups.len()
    }

    /// Whether there are no groups.
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}
