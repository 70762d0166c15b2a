//! Topological walker over the operator nodes of a graph.
//!
//! Callers register callbacks keyed by operator kind and opt into only the
//! kinds they care about; unregistered kinds are skipped on purpose. The
//! first callback failure aborts the walk. Expression nodes are never
//! dispatched.

use crate::graph::Graph;
use crate::node::{OpNode, OpTag};
use splinter_core::error::Result;
use splinter_core::id::NodeId;
use std::collections::BTreeMap;

pub type WalkFn<'a> = Box<dyn FnMut(NodeId, &OpNode) -> Result<()> + 'a>;

#[derive(Default)]
pub struct IrWalker<'a> {
    callbacks: BTreeMap<OpTag, WalkFn<'a>>,
}

impl<'a> IrWalker<'a> {
    pub fn new() -> Self {
        Self {
            callbacks: BTreeMap::new(),
        }
    }

    /// Register a callback for one operator kind, replacing any previous one.
    /// Returns self to allow chaining.
    pub fn register(mut self, tag: OpTag, f: impl FnMut(NodeId, &OpNode) -> Result<()> + 'a) -> Self {
        self.callbacks.insert(tag, Box::new(f));
        self
    }

    pub fn on_memory_source(self, f: impl FnMut(NodeId, &OpNode) -> Result<()> + 'a) -> Self {
        self.register(OpTag::MemorySource, f)
    }

    pub fn on_memory_sink(self, f: impl FnMut(NodeId, &OpNode) -> Result<()> + 'a) -> Self {
        self.register(OpTag::MemorySink, f)
    }

    pub fn on_map(self, f: impl FnMut(NodeId, &OpNode) -> Result<()> + 'a) -> Self {
        self.register(OpTag::Map, f)
    }

    pub fn on_blocking_agg(self, f: impl FnMut(NodeId, &OpNode) -> Result<()> + 'a) -> Self {
        self.register(OpTag::BlockingAgg, f)
    }

    pub fn on_udtf_source(self, f: impl FnMut(NodeId, &OpNode) -> Result<()> + 'a) -> Self {
        self.register(OpTag::UdtfSource, f)
    }

    /// Visit operators in dependency order, dispatching per kind.
    pub fn walk(&mut self, graph: &Graph) -> Result<()> {
        for id in graph.topological_sort()? {
            let node = graph.get(id)?;
            let Some(op) = node.as_op() else {
                continue; // expressions are not dispatched
            };
            match self.callbacks.get_mut(&op.kind.tag()) {
                Some(f) => f(id, op)?,
                // Explicit no-op: the caller opted out of this kind.
                None => {}
            }
        }
        Ok(())
    }
}
