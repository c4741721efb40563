//! Liveness-driven memory block assignment for tensor-program compilers.
//!
//! Given a topologically ordered [`Graph`](memblock_graph::Graph), the
//! assigner gives every output tensor and workspace an offset inside one
//! pool per memory type, so that buffers whose lifetimes do not overlap
//! share bytes. The pass honours:
//!
//! - per-stream lifetimes, with cross-stream reads translated through the
//!   diff-stream edge table,
//! - continuous groups (collective inputs and outputs laid out back to
//!   back),
//! - ref aliases (an output that writes into one of its inputs),
//! - attribute conflicts between plain data and atomically cleaned
//!   buffers,
//! - dynamic-batch branches that never run together.
//!
//! # Usage
//!
//! ```rust
//! use memblock_assign::{AssignConfig, BlockMemAssigner};
//! use memblock_graph::{DataType, Graph, InputRef, NodeDef, OutputRef, SymbolTable, TensorDesc};
//!
//! let mut g = Graph::new("chain");
//! let f32x256 = || TensorDesc::new(&[256], DataType::Float32);
//! let a = g.add_node(NodeDef::new("a", "Relu").output(f32x256()));
//! let b = g.add_node(NodeDef::new("b", "Relu").inputs(1).output(f32x256()));
//! let c = g.add_node(NodeDef::new("c", "Relu").inputs(1).output(f32x256()));
//! g.connect(OutputRef::new(a, 0), InputRef::new(b, 0)).unwrap();
//! g.connect(OutputRef::new(b, 0), InputRef::new(c, 0)).unwrap();
//!
//! let symbols = SymbolTable::from_ref_relations(&g).unwrap();
//! let plan = BlockMemAssigner::new(&g, &symbols, AssignConfig::new())
//!     .unwrap()
//!     .assign()
//!     .unwrap();
//!
//! // `c` reuses the block `a` released once `b` consumed it.
//! assert_eq!(plan.output_offset(OutputRef::new(a, 0)), plan.output_offset(OutputRef::new(c, 0)));
//! plan.check_invariants().unwrap();
//! ```

#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]
#![forbid(unsafe_code)]

pub mod assigner;
pub mod block;
pub mod block_type;
pub mod config;
mod context;
pub mod continuous;
pub mod diff_stream;
pub mod error;
pub mod plan;
pub mod slot;
pub mod strategy;
pub mod utils;

pub use assigner::{assign_graph, BlockMemAssigner};
pub use block::{BlockId, ChildBlock, ChildKind, MemoryBlock, MAX_DEPTH_NUM};
pub use block_type::{BlockTypeList, NodeMemAttr};
pub use config::{AssignConfig, ReuseStrategy};
pub use continuous::{ContinuousMem, ContinuousMemMng, ContinuousScenario};
pub use diff_stream::{DiffStreamChain, DiffStreamEdge, DiffStreamEdgeLife};
pub use error::{AssignError, ErrorKind};
pub use plan::{MemStats, MemoryAssignment, SlotOffset};
pub use slot::{NodeTypeIndex, SlotKey, SlotRole, SlotState, LIFE_END_UNKNOWN};
pub use strategy::RangeStrategy;
