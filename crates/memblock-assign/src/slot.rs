//! Slots: the unit of memory demand and its liveness interval.
//!
//! A [`NodeTypeIndex`] names one output, workspace, shape descriptor or
//! input of one node, and tracks the interval of topological ids during
//! which its bytes must stay intact. Intervals are measured on the slot's
//! own stream; releases observed on other streams are kept per stream so
//! that blocks can translate them through cross-stream edges.

use std::fmt;

use smallvec::SmallVec;

use memblock_graph::{NodeId, StreamId};

use crate::block_type::BlockTypeList;
use crate::error::AssignError;

/// Sentinel end of a slot that has not been released yet.
pub const LIFE_END_UNKNOWN: u32 = u32::MAX;

/// Which anchor of a node a slot describes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SlotRole {
    /// A data output.
    Output,
    /// A scratch workspace.
    Workspace,
    /// The shape descriptor of a no-tiling output.
    OutputDesc,
    /// A data input.
    Input,
}

impl fmt::Display for SlotRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Output => write!(f, "output"),
            Self::Workspace => write!(f, "workspace"),
            Self::OutputDesc => write!(f, "output_desc"),
            Self::Input => write!(f, "input"),
        }
    }
}

/// Key identifying a slot across passes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotKey {
    /// Owning node.
    pub node: NodeId,
    /// Anchor kind.
    pub role: SlotRole,
    /// Index within the role.
    pub index: u32,
}

impl SlotKey {
    /// Create a key.
    pub fn new(node: NodeId, role: SlotRole, index: u32) -> Self {
        Self { node, role, index }
    }
}

impl fmt::Display for SlotKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}{}", self.node, self.role, self.index)
    }
}

/// Assignment progress of a slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum SlotState {
    /// Created, nothing computed.
    NotStarted,
    /// Byte size known.
    SizeComputed,
    /// The reusable pool has been searched.
    ReuseSearched,
    /// Placed in a freshly created block.
    NewBlock,
    /// Placed in a block taken from the reusable pool.
    ReusedBlock,
    /// All consumers have run.
    Released,
    /// The hosting block has its final size.
    Resized,
    /// The final offset has been written.
    OffsetWritten,
}

impl SlotState {
    fn can_advance_to(self, next: SlotState) -> bool {
        use SlotState::*;
        matches!(
            (self, next),
            (NotStarted, SizeComputed)
                | (SizeComputed, ReuseSearched)
                | (SizeComputed, NewBlock)
                | (ReuseSearched, NewBlock)
                | (ReuseSearched, ReusedBlock)
                | (NewBlock, Released)
                | (ReusedBlock, Released)
                | (NewBlock, Resized)
                | (ReusedBlock, Resized)
                | (Released, Resized)
                | (Resized, OffsetWritten)
        )
    }
}

/// One slot and its liveness interval.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeTypeIndex {
    /// Owning node.
    pub node: NodeId,
    /// Anchor kind.
    pub role: SlotRole,
    /// Index within the role.
    pub index: u32,
    stream_id: StreamId,
    topo_id: u32,
    explicit_begin: Option<u32>,
    released: bool,
    same_stream_end: u32,
    diff_stream_ends: SmallVec<[(StreamId, u32); 2]>,
    ref_extension: Option<u32>,
    boundary_end: Option<u32>,
    state: SlotState,
    /// The slot's memory is written through by a ref chain.
    pub ref_input: bool,
    /// First member of a continuous group.
    pub continuous_first: bool,
    /// Last member of a continuous group.
    pub continuous_last: bool,
    /// Byte offset inside the hosting block.
    pub sub_offset: u64,
    /// Memory attributes.
    pub attrs: BlockTypeList,
}

impl NodeTypeIndex {
    /// A slot on `stream_id` that begins at its node's topological id.
    pub fn new(node: NodeId, role: SlotRole, index: u32, stream_id: StreamId) -> Self {
        Self {
            node,
            role,
            index,
            stream_id,
            topo_id: node.0,
            explicit_begin: None,
            released: false,
            same_stream_end: node.0,
            diff_stream_ends: SmallVec::new(),
            ref_extension: None,
            boundary_end: None,
            state: SlotState::NotStarted,
            ref_input: false,
            continuous_first: false,
            continuous_last: false,
            sub_offset: 0,
            attrs: BlockTypeList::EMPTY,
        }
    }

    /// Key of this slot.
    pub fn key(&self) -> SlotKey {
        SlotKey::new(self.node, self.role, self.index)
    }

    /// Stream the slot's interval is measured on.
    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    /// Topological id of the owning node.
    pub fn topo_id(&self) -> u32 {
        self.topo_id
    }

    /// Pull the interval start earlier. Later values are ignored.
    pub fn set_explicit_begin(&mut self, begin: u32) {
        self.explicit_begin = Some(self.explicit_begin.map_or(begin, |b| b.min(begin)));
    }

    /// First topological id at which the slot's bytes are live.
    pub fn life_begin(&self) -> u32 {
        self.explicit_begin.map_or(self.topo_id, |b| b.min(self.topo_id))
    }

    /// Record a release observed on the slot's own stream.
    pub fn set_same_stream_end(&mut self, end: u32) {
        self.same_stream_end = self.same_stream_end.max(end);
    }

    /// Record a release observed on another stream.
    pub fn record_diff_stream_end(&mut self, stream: StreamId, end: u32) {
        match self.diff_stream_ends.iter_mut().find(|(s, _)| *s == stream) {
            Some((_, e)) => *e = (*e).max(end),
            None => self.diff_stream_ends.push((stream, end)),
        }
    }

    /// Extend the interval to a release seen through a ref alias.
    pub fn extend_by_ref(&mut self, end: u32) {
        self.ref_extension = Some(self.ref_extension.map_or(end, |e| e.max(end)));
    }

    /// Extend the interval to the real consumer inside a sub-graph.
    pub fn set_boundary_end(&mut self, end: u32) {
        self.boundary_end = Some(self.boundary_end.map_or(end, |e| e.max(end)));
    }

    /// Mark that every consumer has run.
    pub fn mark_released(&mut self) {
        self.released = true;
    }

    /// Whether every consumer has run.
    pub fn is_released(&self) -> bool {
        self.released
    }

    /// End of the interval on the slot's own stream.
    ///
    /// [`LIFE_END_UNKNOWN`] until the slot is released.
    pub fn life_end(&self) -> u32 {
        if !self.released {
            return LIFE_END_UNKNOWN;
        }
        let mut end = self.same_stream_end;
        if let Some(e) = self.ref_extension {
            end = end.max(e);
        }
        if let Some(e) = self.boundary_end {
            end = end.max(e);
        }
        end
    }

    /// Releases recorded on other streams.
    pub fn diff_stream_ends(&self) -> impl Iterator<Item = (StreamId, u32)> + '_ {
        self.diff_stream_ends.iter().copied()
    }

    /// Release recorded on `stream`, if any.
    pub fn diff_stream_end(&self, stream: StreamId) -> Option<u32> {
        self.diff_stream_ends
            .iter()
            .find(|(s, _)| *s == stream)
            .map(|&(_, e)| e)
    }

    /// Whether two same-stream intervals intersect.
    pub fn overlaps(&self, other: &NodeTypeIndex) -> bool {
        self.life_begin() <= other.life_end() && other.life_begin() <= self.life_end()
    }

    /// Current progress.
    pub fn state(&self) -> SlotState {
        self.state
    }

    /// Move to the next state. Illegal transitions are a contract violation.
    pub fn advance(&mut self, next: SlotState, node_name: &str) -> Result<(), AssignError> {
        if !self.state.can_advance_to(next) {
            return Err(AssignError::ContractViolation {
                node_name: node_name.to_string(),
                reason: format!(
                    "slot {} cannot move from {:?} to {:?}",
                    self.key(),
                    self.state,
                    next
                ),
            });
        }
        self.state = next;
        Ok(())
    }
}

impl fmt::Display for NodeTypeIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let end = self.life_end();
        if end == LIFE_END_UNKNOWN {
            write!(f, "{}[{}, ?]", self.key(), self.life_begin())
        } else {
            write!(f, "{}[{}, {}]", self.key(), self.life_begin(), end)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slot(node: u32) -> NodeTypeIndex {
        NodeTypeIndex::new(NodeId(node), SlotRole::Output, 0, StreamId(0))
    }

    #[test]
    fn unreleased_end_is_unknown() {
        let mut s = slot(3);
        s.set_same_stream_end(7);
        assert_eq!(s.life_end(), LIFE_END_UNKNOWN);
        s.mark_released();
        assert_eq!(s.life_end(), 7);
    }

    #[test]
    fn explicit_begin_only_moves_earlier() {
        let mut s = slot(5);
        assert_eq!(s.life_begin(), 5);
        s.set_explicit_begin(2);
        s.set_explicit_begin(4);
        assert_eq!(s.life_begin(), 2);
        s.set_explicit_begin(9);
        assert_eq!(s.life_begin(), 2);
    }

    #[test]
    fn end_takes_max_of_sources() {
        let mut s = slot(1);
        s.set_same_stream_end(4);
        s.extend_by_ref(6);
        s.set_boundary_end(5);
        s.record_diff_stream_end(StreamId(2), 9);
        s.record_diff_stream_end(StreamId(2), 3);
        s.mark_released();
        assert_eq!(s.life_end(), 6);
        assert_eq!(s.diff_stream_end(StreamId(2)), Some(9));
        assert_eq!(s.diff_stream_end(StreamId(1)), None);
    }

    #[test]
    fn overlap_is_inclusive() {
        let mut a = slot(1);
        a.set_same_stream_end(3);
        a.mark_released();
        let mut b = slot(3);
        b.mark_released();
        let mut c = slot(4);
        c.mark_released();
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c));
    }

    #[test]
    fn state_transitions_are_checked() {
        let mut s = slot(0);
        s.advance(SlotState::SizeComputed, "n").unwrap();
        s.advance(SlotState::ReuseSearched, "n").unwrap();
        s.advance(SlotState::ReusedBlock, "n").unwrap();
        let err = s.advance(SlotState::OffsetWritten, "n").unwrap_err();
        assert!(matches!(err, AssignError::ContractViolation { .. }));
        s.advance(SlotState::Released, "n").unwrap();
        s.advance(SlotState::Resized, "n").unwrap();
        s.advance(SlotState::OffsetWritten, "n").unwrap();
    }
}
