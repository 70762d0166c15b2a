#![forbid(unsafe_code)]
//! splinter-planner: fragments one compiled IR graph into per-instance
//! physical plans for a heterogeneous fleet.
//!
//! Inputs: the annotated IR graph (relations resolved) and an immutable
//! `DistributedState` snapshot describing the fleet. Output: a
//! `DistributedPlan` holding one independent IR subgraph per participating
//! instance, stitched together by GRPC sink/source boundary pairs. Planning
//! is pure and synchronous; it never mutates the input graph and holds no
//! state across calls.

pub mod plan;
pub mod planner;
pub mod state;

pub use plan::{DistributedPlan, PlannedInstance};
pub use planner::DistributedPlanner;
pub use state::{DistributedState, InstanceSpec, TableSpec};
