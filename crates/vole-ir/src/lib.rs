//! # vole-ir
//!
//! The graph the vole pipeline compiles: operator nodes connected by tensor
//! edges, with the per-edge format/type slot that negotiation fills in.
//!
//! - [`Graph`]: id-stable node/edge storage with the structural edits the
//!   pipeline needs (bridge insertion, fusion folding, bypass)
//! - [`OpKind`]: operator kinds and their shape arithmetic
//! - [`GraphBuilder`]: construction by tensor name

pub mod builder;
pub mod graph;
pub mod op;

pub use builder::GraphBuilder;
pub use graph::{Consumer, Edge, EdgeId, EdgeKind, Graph, Node, NodeId, TensorDesc};
pub use op::{Conv2dAttrs, FuseFlags, OpKind, Pool2dAttrs, ReduceAttrs, ReduceKind};
