//! Memory attributes and the conflict lattice between them.
//!
//! Every slot carries a set of [`NodeMemAttr`]s. A block records the union
//! of its occupants' attributes as a [`BlockTypeList`]; two slots may only
//! share a block when no attribute of one conflicts with an attribute of
//! the other. The conflict relation is a compile-time table.

use std::fmt;

/// Memory attribute of a slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum NodeMemAttr {
    /// Output of a graph input placeholder.
    Data = 0,
    /// Atomic output cleaned by the centralized atomic clean.
    ConcentrateAtomic = 1,
}

impl NodeMemAttr {
    /// All attributes, in bit order.
    pub const ALL: [NodeMemAttr; 2] = [NodeMemAttr::Data, NodeMemAttr::ConcentrateAtomic];

    const fn bit(self) -> u8 {
        1 << (self as u8)
    }
}

impl fmt::Display for NodeMemAttr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Data => write!(f, "data"),
            Self::ConcentrateAtomic => write!(f, "concentrate_atomic"),
        }
    }
}

/// `CONFLICT_TABLE[a][b]`: attributes `a` and `b` cannot share a block.
///
/// Symmetric. A centrally cleaned atomic buffer is zeroed before the graph
/// runs, which would clobber a graph input living in the same block.
pub const CONFLICT_TABLE: [[bool; 2]; 2] = [
    // Data   ConcentrateAtomic
    [false, true], // Data
    [true, false], // ConcentrateAtomic
];

/// Whether two attributes conflict.
pub const fn is_conflict(a: NodeMemAttr, b: NodeMemAttr) -> bool {
    CONFLICT_TABLE[a as usize][b as usize]
}

/// Set of [`NodeMemAttr`]s.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct BlockTypeList {
    bits: u8,
}

impl BlockTypeList {
    /// The empty set.
    pub const EMPTY: Self = Self { bits: 0 };

    /// A set holding one attribute.
    pub const fn of(attr: NodeMemAttr) -> Self {
        Self { bits: attr.bit() }
    }

    /// Whether `attr` is in the set.
    pub fn contains(&self, attr: NodeMemAttr) -> bool {
        self.bits & attr.bit() != 0
    }

    /// Whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.bits == 0
    }

    /// Add an attribute in place.
    pub fn insert(&mut self, attr: NodeMemAttr) {
        self.bits |= attr.bit();
    }

    /// Union with another set.
    pub fn with_added(self, other: BlockTypeList) -> Self {
        Self {
            bits: self.bits | other.bits,
        }
    }

    /// Rebuild a set from the occupants that remain after a removal.
    ///
    /// Attributes are not reference counted, so removal recomputes the
    /// union instead of clearing bits that another occupant may still hold.
    pub fn with_deleted<I>(remaining: I) -> Self
    where
        I: IntoIterator<Item = BlockTypeList>,
    {
        remaining
            .into_iter()
            .fold(Self::EMPTY, |acc, t| acc.with_added(t))
    }

    /// Iterate the attributes in the set.
    pub fn iter(&self) -> impl Iterator<Item = NodeMemAttr> + '_ {
        NodeMemAttr::ALL.into_iter().filter(|a| self.contains(*a))
    }

    /// Whether any attribute in `self` conflicts with any in `other`.
    pub fn is_conflict(&self, other: &BlockTypeList) -> bool {
        self.iter()
            .any(|a| other.iter().any(|b| is_conflict(a, b)))
    }
}

impl fmt::Debug for BlockTypeList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_is_symmetric_and_irreflexive() {
        for a in NodeMemAttr::ALL {
            assert!(!is_conflict(a, a));
            for b in NodeMemAttr::ALL {
                assert_eq!(is_conflict(a, b), is_conflict(b, a));
            }
        }
    }

    #[test]
    fn data_conflicts_with_concentrate_atomic() {
        let data = BlockTypeList::of(NodeMemAttr::Data);
        let atomic = BlockTypeList::of(NodeMemAttr::ConcentrateAtomic);
        assert!(data.is_conflict(&atomic));
        assert!(atomic.is_conflict(&data));
        assert!(!data.is_conflict(&data));
        assert!(!BlockTypeList::EMPTY.is_conflict(&atomic));
    }

    #[test]
    fn deleted_rebuilds_from_remaining() {
        let data = BlockTypeList::of(NodeMemAttr::Data);
        let both = data.with_added(BlockTypeList::of(NodeMemAttr::ConcentrateAtomic));
        assert!(both.contains(NodeMemAttr::ConcentrateAtomic));
        let rebuilt = BlockTypeList::with_deleted([data, BlockTypeList::EMPTY]);
        assert_eq!(rebuilt, data);
        assert!(BlockTypeList::with_deleted([]).is_empty());
    }
}
