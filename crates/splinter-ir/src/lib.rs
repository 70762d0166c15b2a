#![forbid(unsafe_code)]
//! splinter-ir: the owned, typed IR graph for query compilation.
//!
//! Design:
//! - Nodes live in an arena keyed by dense `NodeId`s; every cross-node
//!   reference is an id looked up through the owning `Graph`, never a pointer.
//! - The node model is one closed sum type (`NodeKind`), so the walker, the
//!   wire encoding, and the planner all match on it exhaustively.
//! - Construction is a distinct phase: the front-end mutates a `Graph`,
//!   then hands it to the planner by shared reference.

pub mod dag;
pub mod graph;
pub mod node;
pub mod proto;
pub mod walker;

pub use dag::Dag;
pub use graph::Graph;
pub use node::{
    ColumnExpr, ExprKind, ExprTag, IrNode, JoinType, NodeKind, OpKind, OpNode, OpTag,
    UdtfExecutor, Upid,
};
pub use walker::IrWalker;
