//! Compute-graph interface model for the memblock assignment engine.
//!
//! This is the leaf crate with zero internal dependencies. It models the
//! boundary the assignment engine consumes: a topologically ordered arena
//! of nodes addressed by stable integer ids, an adjacency side-table for
//! data and control edges, tensor descriptors, alias symbols, and the
//! [`MemOffsetSink`] trait through which assigned offsets are written back.
//!
//! Graph construction proper (parsing, shape inference, attribute storage)
//! lives outside this workspace; [`Graph`] only carries what memory
//! assignment needs to read.

#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]
#![forbid(unsafe_code)]

pub mod error;
pub mod graph;
pub mod id;
pub mod node;
pub mod symbol;
pub mod tensor;
pub mod traits;

pub use error::GraphError;
pub use graph::Graph;
pub use id::{InputRef, NodeId, OutputRef, StreamId, SubGraphId, SymbolId};
pub use node::{op_type, Node, NodeAttrs, NodeDef, OpDesc};
pub use symbol::SymbolTable;
pub use tensor::{DataType, MemoryType, Shape, TensorDesc};
pub use traits::MemOffsetSink;
