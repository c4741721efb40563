//! memblock: liveness-driven device memory assignment for tensor-program
//! compilers.
//!
//! This is the top-level facade crate that re-exports the public API of the
//! memblock sub-crates. For most users, adding `memblock` as a single
//! dependency is sufficient.
//!
//! # Quick start
//!
//! ```rust
//! use memblock::prelude::*;
//!
//! let mut g = Graph::new("quick");
//! let a = g.add_node(
//!     NodeDef::new("a", "MatMul").output(TensorDesc::new(&[64, 64], DataType::Float32)),
//! );
//! let b = g.add_node(
//!     NodeDef::new("b", "Relu")
//!         .inputs(1)
//!         .output(TensorDesc::new(&[64, 64], DataType::Float32))
//!         .workspace(2048),
//! );
//! g.connect(OutputRef::new(a, 0), InputRef::new(b, 0)).unwrap();
//!
//! let symbols = SymbolTable::from_ref_relations(&g).unwrap();
//! let plan = assign_graph(&mut g, &symbols, AssignConfig::new()).unwrap();
//!
//! assert_eq!(g.node(b).unwrap().desc.input_offsets[0], plan.output_offset(OutputRef::new(a, 0)));
//! // `a` and `b` are live together; the workspace needs its own block.
//! assert_eq!(plan.total_size(MemoryType::Hbm), 2 * 16384 + 2048);
//! ```
//!
//! # Modules
//!
//! | Module | Sub-crate | Contents |
//! |--------|-----------|----------|
//! | [`graph`] | `memblock-graph` | Graph model, ids, tensors, symbols, the offset sink |
//! | [`assign`] | `memblock-assign` | Blocks, liveness, strategies, the assigner |

#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]
#![forbid(unsafe_code)]

/// Compute-graph model (`memblock-graph`).
///
/// The [`graph::MemOffsetSink`] trait is how assigned offsets reach a
/// graph representation other than [`graph::Graph`].
pub use memblock_graph as graph;

/// Block assignment (`memblock-assign`).
///
/// Entry points are [`assign::BlockMemAssigner`] and
/// [`assign::assign_graph`].
pub use memblock_assign as assign;

/// Common imports for typical memblock usage.
///
/// ```rust
/// use memblock::prelude::*;
/// ```
pub mod prelude {
    // Graph model
    pub use memblock_graph::{
        DataType, Graph, InputRef, MemOffsetSink, MemoryType, NodeAttrs, NodeDef, NodeId, OutputRef,
        StreamId, SymbolTable, TensorDesc,
    };

    // Assignment
    pub use memblock_assign::{
        assign_graph, AssignConfig, BlockMemAssigner, MemStats, MemoryAssignment, RangeStrategy,
        ReuseStrategy,
    };

    // Errors
    pub use memblock_assign::{AssignError, ErrorKind};
    pub use memblock_graph::GraphError;
}
