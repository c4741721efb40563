//! Alias symbols: equivalence classes of output anchors sharing memory.
//!
//! Two output anchors in the same symbol refer to the same bytes. The
//! symbol's *owner* is the member with the smallest `(node, index)`; only
//! the owner gets memory assigned, every other member reports the owner's
//! offset. Anchors that appear in no symbol are their own owner.

use indexmap::IndexMap;

use crate::error::GraphError;
use crate::graph::Graph;
use crate::id::{InputRef, OutputRef, SymbolId};

/// Partition of output anchors into alias symbols.
#[derive(Clone, Debug, Default)]
pub struct SymbolTable {
    anchor_to_symbol: IndexMap<OutputRef, SymbolId>,
    /// Members of each symbol, kept sorted so `members[0]` is the owner.
    symbols: IndexMap<SymbolId, Vec<OutputRef>>,
}

impl SymbolTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an anchor to a symbol, creating the symbol on first use.
    pub fn insert(&mut self, symbol: SymbolId, anchor: OutputRef) -> Result<(), GraphError> {
        if let Some(&existing) = self.anchor_to_symbol.get(&anchor) {
            if existing == symbol {
                return Ok(());
            }
            return Err(GraphError::DuplicateSymbolMember {
                anchor,
                existing,
                requested: symbol,
            });
        }
        self.anchor_to_symbol.insert(anchor, symbol);
        let members = self.symbols.entry(symbol).or_default();
        let pos = members.partition_point(|m| *m < anchor);
        members.insert(pos, anchor);
        Ok(())
    }

    /// Derive symbols from the graph's ref relations.
    ///
    /// Every ref output joins the symbol of the producer feeding the input
    /// it writes through. Walking nodes in topological order guarantees the
    /// producer's symbol exists before its ref consumers are visited.
    pub fn from_ref_relations(graph: &Graph) -> Result<Self, GraphError> {
        let mut table = Self::new();
        let mut next = 0u32;
        for node in graph.nodes() {
            for (&out_index, &in_index) in &node.attrs.ref_outputs {
                let Some(src) = graph.producer(InputRef::new(node.id, in_index)) else {
                    continue;
                };
                let symbol = match table.symbol_of(src) {
                    Some(symbol) => symbol,
                    None => {
                        let symbol = SymbolId(next);
                        next += 1;
                        table.insert(symbol, src)?;
                        symbol
                    }
                };
                table.insert(symbol, OutputRef::new(node.id, out_index))?;
            }
        }
        Ok(table)
    }

    /// The symbol an anchor belongs to, if any.
    pub fn symbol_of(&self, anchor: OutputRef) -> Option<SymbolId> {
        self.anchor_to_symbol.get(&anchor).copied()
    }

    /// Members of a symbol, owner first.
    pub fn members(&self, symbol: SymbolId) -> &[OutputRef] {
        self.symbols.get(&symbol).map(Vec::as_slice).unwrap_or(&[])
    }

    /// All anchors aliasing `anchor`, including itself, owner first.
    pub fn aliases_of(&self, anchor: OutputRef) -> Vec<OutputRef> {
        match self.symbol_of(anchor) {
            Some(symbol) => self.members(symbol).to_vec(),
            None => vec![anchor],
        }
    }

    /// The anchor that owns the memory `anchor` refers to.
    pub fn owner_of(&self, anchor: OutputRef) -> OutputRef {
        self.symbol_of(anchor)
            .and_then(|s| self.members(s).first().copied())
            .unwrap_or(anchor)
    }

    /// Whether `anchor` owns its memory.
    pub fn is_owner(&self, anchor: OutputRef) -> bool {
        self.owner_of(anchor) == anchor
    }

    /// Iterate over `(symbol, members)` in registration order.
    pub fn iter(&self) -> impl Iterator<Item = (SymbolId, &[OutputRef])> {
        self.symbols.iter().map(|(&s, m)| (s, m.as_slice()))
    }

    /// Number of symbols.
    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    /// Whether no symbols are registered.
    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::NodeId;
    use crate::node::{NodeAttrs, NodeDef};
    use crate::tensor::{DataType, TensorDesc};

    fn out(node: u32, index: u32) -> OutputRef {
        OutputRef::new(NodeId(node), index)
    }

    #[test]
    fn owner_is_smallest_member() {
        let mut t = SymbolTable::new();
        t.insert(SymbolId(0), out(5, 0)).unwrap();
        t.insert(SymbolId(0), out(2, 1)).unwrap();
        t.insert(SymbolId(0), out(7, 0)).unwrap();
        assert_eq!(t.owner_of(out(7, 0)), out(2, 1));
        assert!(t.is_owner(out(2, 1)));
        assert!(!t.is_owner(out(5, 0)));
        assert_eq!(t.members(SymbolId(0)), &[out(2, 1), out(5, 0), out(7, 0)]);
    }

    #[test]
    fn untracked_anchor_owns_itself() {
        let t = SymbolTable::new();
        assert_eq!(t.owner_of(out(3, 0)), out(3, 0));
        assert_eq!(t.aliases_of(out(3, 0)), vec![out(3, 0)]);
    }

    #[test]
    fn duplicate_membership_rejected() {
        let mut t = SymbolTable::new();
        t.insert(SymbolId(0), out(1, 0)).unwrap();
        t.insert(SymbolId(0), out(1, 0)).unwrap();
        let err = t.insert(SymbolId(1), out(1, 0)).unwrap_err();
        assert!(matches!(err, GraphError::DuplicateSymbolMember { .. }));
    }

    #[test]
    fn ref_chain_collapses_into_one_symbol() {
        let t32 = || TensorDesc::new(&[16], DataType::Float32);
        let mut g = Graph::new("refs");
        let var = g.add_node(NodeDef::new("var", "Variable").output(t32()));
        let mut ref_attrs = NodeAttrs::default();
        ref_attrs.ref_outputs.insert(0, 0);
        let assign1 = g.add_node(
            NodeDef::new("assign1", "Assign")
                .inputs(1)
                .output(t32())
                .attrs(ref_attrs.clone()),
        );
        let assign2 = g.add_node(
            NodeDef::new("assign2", "Assign")
                .inputs(1)
                .output(t32())
                .attrs(ref_attrs),
        );
        g.connect(OutputRef::new(var, 0), InputRef::new(assign1, 0))
            .unwrap();
        g.connect(OutputRef::new(assign1, 0), InputRef::new(assign2, 0))
            .unwrap();

        let t = SymbolTable::from_ref_relations(&g).unwrap();
        assert_eq!(t.len(), 1);
        assert_eq!(t.owner_of(OutputRef::new(assign2, 0)), OutputRef::new(var, 0));
        assert_eq!(t.aliases_of(OutputRef::new(assign1, 0)).len(), 3);
    }
}
