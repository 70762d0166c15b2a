//! The owning graph store: an arena of nodes plus the dependency DAG.
//!
//! Ids are dense, monotonic, and never reused within one graph. The node
//! table and the DAG always cover the identical id space. A node that
//! references a missing id is a compiler defect, reported as internal.

use crate::dag::Dag;
use crate::node::{
    ColumnExpr, ExprKind, IrNode, JoinType, NodeKind, OpKind, OpNode, OpTag, UdtfExecutor,
};
use serde::{Deserialize, Serialize};
use splinter_core::error::{Error, Result};
use splinter_core::id::{InstanceId, NodeId};
use splinter_core::pos::SourcePos;
use splinter_core::relation::Relation;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Graph {
    nodes: BTreeMap<NodeId, IrNode>,
    dag: Dag<NodeId>,
    next_id: u64,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn dag(&self) -> &Dag<NodeId> {
        &self.dag
    }

    pub fn node_ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes.keys().copied()
    }

    /// Validates and registers a node, allocating the next id.
    pub fn create_node(&mut self, kind: NodeKind) -> Result<NodeId> {
        self.create_node_at(kind, None)
    }

    pub fn create_node_at(&mut self, kind: NodeKind, pos: Option<SourcePos>) -> Result<NodeId> {
        kind.validate().map_err(|msg| Error::construction(msg, pos))?;
        let id = NodeId::new(self.next_id);
        self.next_id += 1;
        self.dag.add_node(id);
        // Ownership edges let traversals reach an operator's expression trees.
        let owned = match &kind {
            NodeKind::Op(op) => op.kind.owned_exprs(),
            NodeKind::Expr(e) => e.child_ids(),
        };
        self.nodes.insert(id, IrNode::new(id, pos, kind));
        for expr in owned {
            self.add_edge(id, expr)?;
        }
        tracing::trace!(node = id.get(), "created IR node");
        Ok(id)
    }

    pub fn get(&self, id: NodeId) -> Result<&IrNode> {
        self.nodes
            .get(&id)
            .ok_or_else(|| Error::internal(format!("{id} is not in the graph")))
    }

    pub fn get_mut(&mut self, id: NodeId) -> Result<&mut IrNode> {
        self.nodes
            .get_mut(&id)
            .ok_or_else(|| Error::internal(format!("{id} is not in the graph")))
    }

    pub fn get_op(&self, id: NodeId) -> Result<&OpNode> {
        self.get(id)?
            .as_op()
            .ok_or_else(|| Error::internal(format!("{id} is not an operator")))
    }

    pub fn get_op_mut(&mut self, id: NodeId) -> Result<&mut OpNode> {
        self.get_mut(id)?
            .as_op_mut()
            .ok_or_else(|| Error::internal(format!("{id} is not an operator")))
    }

    pub fn get_expr(&self, id: NodeId) -> Result<&ExprKind> {
        self.get(id)?
            .as_expr()
            .ok_or_else(|| Error::internal(format!("{id} is not an expression")))
    }

    /// Records a dependency edge. Fails with invalid-argument when either id
    /// is unregistered.
    pub fn add_edge(&mut self, from: NodeId, to: NodeId) -> Result<()> {
        self.dag.add_edge(from, to)
    }

    pub fn delete_edge(&mut self, from: NodeId, to: NodeId) {
        self.dag.delete_edge(from, to);
    }

    /// Removes a node from the table and the DAG. Callers own edge-cleanup
    /// ordering; stale references elsewhere surface in later validation.
    pub fn delete_node(&mut self, id: NodeId) {
        self.nodes.remove(&id);
        self.dag.delete_node(id);
    }

    pub fn topological_sort(&self) -> Result<Vec<NodeId>> {
        self.dag.topological_sort()
    }

    /// The single terminal memory sink. A graph with several sinks violates
    /// this accessor's precondition; it returns the first in topological
    /// order without trying to disambiguate.
    pub fn get_sink(&self) -> Result<NodeId> {
        for id in self.topological_sort()? {
            if let Some(op) = self.get(id)?.as_op() {
                if op.kind.tag() == OpTag::MemorySink {
                    return Ok(id);
                }
            }
        }
        Err(Error::NotFound("no sink node found for this graph".into()))
    }

    pub fn find_nodes_of_kind(&self, tag: OpTag) -> Vec<NodeId> {
        self.nodes
            .values()
            .filter(|n| n.as_op().map(|op| op.kind.tag() == tag).unwrap_or(false))
            .map(|n| n.id())
            .collect()
    }

    pub fn operators(&self) -> impl Iterator<Item = (NodeId, &OpNode)> {
        self.nodes
            .values()
            .filter_map(|n| n.as_op().map(|op| (n.id(), op)))
    }

    pub fn set_relation(&mut self, id: NodeId, relation: Relation) -> Result<()> {
        self.get_op_mut(id)?.set_relation(relation)
    }

    /// Wires `parent` as the next ordered parent of `child` and records the
    /// dependency edge.
    pub fn connect(&mut self, parent: NodeId, child: NodeId) -> Result<()> {
        if !self.get(parent)?.is_op() {
            return Err(Error::invalid_argument(format!(
                "{parent} cannot be a parent: not an operator"
            )));
        }
        self.get_op_mut(child)?.parents.push(parent);
        self.add_edge(parent, child)
    }

    // ---- expression builders ----

    pub fn add_column(&mut self, name: impl Into<String>) -> Result<NodeId> {
        self.create_node(NodeKind::expr(ExprKind::Column {
            name: name.into(),
            index: None,
            ty: None,
        }))
    }

    pub fn add_string(&mut self, v: impl Into<String>) -> Result<NodeId> {
        self.create_node(NodeKind::expr(ExprKind::String(v.into())))
    }

    pub fn add_int(&mut self, v: i64) -> Result<NodeId> {
        self.create_node(NodeKind::expr(ExprKind::Int(v)))
    }

    pub fn add_float(&mut self, v: f64) -> Result<NodeId> {
        self.create_node(NodeKind::expr(ExprKind::Float(v)))
    }

    pub fn add_bool(&mut self, v: bool) -> Result<NodeId> {
        self.create_node(NodeKind::expr(ExprKind::Bool(v)))
    }

    pub fn add_time(&mut self, ns: i64) -> Result<NodeId> {
        self.create_node(NodeKind::expr(ExprKind::Time(ns)))
    }

    pub fn add_func(&mut self, name: impl Into<String>, args: Vec<NodeId>) -> Result<NodeId> {
        self.create_node(NodeKind::expr(ExprKind::Func {
            name: name.into(),
            args,
        }))
    }

    pub fn add_list(&mut self, items: Vec<NodeId>) -> Result<NodeId> {
        self.create_node(NodeKind::expr(ExprKind::List { items }))
    }

    pub fn add_lambda(
        &mut self,
        expected_columns: Vec<String>,
        exprs: Vec<ColumnExpr>,
    ) -> Result<NodeId> {
        self.create_node(NodeKind::expr(ExprKind::Lambda {
            expected_columns,
            exprs,
        }))
    }

    pub fn add_metadata_ref(&mut self, property: impl Into<String>) -> Result<NodeId> {
        self.create_node(NodeKind::expr(ExprKind::MetadataRef {
            property: property.into(),
        }))
    }

    // ---- operator builders (wire parent edges in one step) ----

    pub fn create_mem_source(
        &mut self,
        table: impl Into<String>,
        select: Vec<String>,
    ) -> Result<NodeId> {
        self.create_node(NodeKind::op(OpKind::MemorySource {
            table: table.into(),
            select,
            time_start_ns: None,
            time_stop_ns: None,
        }))
    }

    /// Restricts a memory source to a time window.
    pub fn set_time_range(&mut self, source: NodeId, start_ns: i64, stop_ns: i64) -> Result<()> {
        match &mut self.get_op_mut(source)?.kind {
            OpKind::MemorySource {
                time_start_ns,
                time_stop_ns,
                ..
            } => {
                *time_start_ns = Some(start_ns);
                *time_stop_ns = Some(stop_ns);
                Ok(())
            }
            other => Err(Error::invalid_argument(format!(
                "cannot set a time range on a {} operator",
                other.tag()
            ))),
        }
    }

    pub fn create_mem_sink(&mut self, parent: NodeId, name: impl Into<String>) -> Result<NodeId> {
        let id = self.create_node(NodeKind::op(OpKind::MemorySink { name: name.into() }))?;
        self.connect(parent, id)?;
        Ok(id)
    }

    pub fn create_range(&mut self, parent: NodeId, time_expr: NodeId) -> Result<NodeId> {
        let id = self.create_node(NodeKind::op(OpKind::Range { time_expr }))?;
        self.connect(parent, id)?;
        Ok(id)
    }

    pub fn create_map(&mut self, parent: NodeId, exprs: Vec<ColumnExpr>) -> Result<NodeId> {
        let id = self.create_node(NodeKind::op(OpKind::Map { exprs }))?;
        self.connect(parent, id)?;
        Ok(id)
    }

    pub fn create_filter(&mut self, parent: NodeId, predicate: NodeId) -> Result<NodeId> {
        let id = self.create_node(NodeKind::op(OpKind::Filter { predicate }))?;
        self.connect(parent, id)?;
        Ok(id)
    }

    pub fn create_limit(&mut self, parent: NodeId, n: u64) -> Result<NodeId> {
        let id = self.create_node(NodeKind::op(OpKind::Limit { n }))?;
        self.connect(parent, id)?;
        Ok(id)
    }

    pub fn create_blocking_agg(
        &mut self,
        parent: NodeId,
        groups: Vec<NodeId>,
        aggs: Vec<ColumnExpr>,
    ) -> Result<NodeId> {
        let id = self.create_node(NodeKind::op(OpKind::BlockingAgg { groups, aggs }))?;
        self.connect(parent, id)?;
        Ok(id)
    }

    pub fn create_group_by(&mut self, parent: NodeId, groups: Vec<NodeId>) -> Result<NodeId> {
        let id = self.create_node(NodeKind::op(OpKind::GroupBy { groups }))?;
        self.connect(parent, id)?;
        Ok(id)
    }

    pub fn create_drop(&mut self, parent: NodeId, columns: Vec<String>) -> Result<NodeId> {
        let id = self.create_node(NodeKind::op(OpKind::Drop { columns }))?;
        self.connect(parent, id)?;
        Ok(id)
    }

    pub fn create_union(&mut self, parents: Vec<NodeId>) -> Result<NodeId> {
        let id = self.create_node(NodeKind::op(OpKind::Union))?;
        for p in parents {
            self.connect(p, id)?;
        }
        Ok(id)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn create_join(
        &mut self,
        left: NodeId,
        right: NodeId,
        join_type: JoinType,
        left_on: Vec<NodeId>,
        right_on: Vec<NodeId>,
        suffixes: (String, String),
    ) -> Result<NodeId> {
        let id = self.create_node(NodeKind::op(OpKind::Join {
            join_type,
            left_on,
            right_on,
            suffixes,
        }))?;
        self.connect(left, id)?;
        self.connect(right, id)?;
        Ok(id)
    }

    pub fn create_udtf_source(
        &mut self,
        name: impl Into<String>,
        executor: UdtfExecutor,
    ) -> Result<NodeId> {
        self.create_node(NodeKind::op(OpKind::UdtfSource {
            name: name.into(),
            executor,
        }))
    }

    pub fn create_grpc_source(&mut self, relation: Option<Relation>) -> Result<NodeId> {
        let id = self.create_node(NodeKind::op(OpKind::GrpcSource))?;
        if let Some(rel) = relation {
            self.set_relation(id, rel)?;
        }
        Ok(id)
    }

    pub fn create_grpc_sink(
        &mut self,
        parent: NodeId,
        destinations: BTreeMap<InstanceId, NodeId>,
    ) -> Result<NodeId> {
        let id = self.create_node(NodeKind::op(OpKind::GrpcSink { destinations }))?;
        self.connect(parent, id)?;
        Ok(id)
    }

    // ---- cross-graph copying (used by the distributed planner) ----

    /// Deep-copies an expression tree from `src` into this graph, returning
    /// the new root id.
    pub fn import_expr(&mut self, src: &Graph, expr_id: NodeId) -> Result<NodeId> {
        let kind = src.get_expr(expr_id)?.clone();
        let pos = src.get(expr_id)?.pos();
        let remapped = match kind {
            ExprKind::Func { name, args } => {
                let mut new_args = Vec::with_capacity(args.len());
                for a in args {
                    new_args.push(self.import_expr(src, a)?);
                }
                ExprKind::Func {
                    name,
                    args: new_args,
                }
            }
            ExprKind::List { items } => {
                let mut new_items = Vec::with_capacity(items.len());
                for i in items {
                    new_items.push(self.import_expr(src, i)?);
                }
                ExprKind::List { items: new_items }
            }
            ExprKind::Lambda {
                expected_columns,
                exprs,
            } => {
                let mut new_exprs = Vec::with_capacity(exprs.len());
                for c in exprs {
                    new_exprs.push(ColumnExpr::new(c.name, self.import_expr(src, c.expr)?));
                }
                ExprKind::Lambda {
                    expected_columns,
                    exprs: new_exprs,
                }
            }
            leaf => leaf,
        };
        self.create_node_at(NodeKind::expr(remapped), pos)
    }

    /// Copies an operator (with its owned expression trees) from `src` into
    /// this graph. Parents are cleared; the caller rewires them in the new
    /// id space. The resolved relation and source position carry over.
    pub fn import_op(&mut self, src: &Graph, op_id: NodeId) -> Result<NodeId> {
        let op = src.get_op(op_id)?;
        let pos = src.get(op_id)?.pos();
        let relation = op.relation().cloned();
        let kind = match op.kind.clone() {
            OpKind::Range { time_expr } => OpKind::Range {
                time_expr: self.import_expr(src, time_expr)?,
            },
            OpKind::Map { exprs } => {
                let mut new_exprs = Vec::with_capacity(exprs.len());
                for c in exprs {
                    new_exprs.push(ColumnExpr::new(c.name, self.import_expr(src, c.expr)?));
                }
                OpKind::Map { exprs: new_exprs }
            }
            OpKind::Filter { predicate } => OpKind::Filter {
                predicate: self.import_expr(src, predicate)?,
            },
            OpKind::BlockingAgg { groups, aggs } => {
                let mut new_groups = Vec::with_capacity(groups.len());
                for g in groups {
                    new_groups.push(self.import_expr(src, g)?);
                }
                let mut new_aggs = Vec::with_capacity(aggs.len());
                for c in aggs {
                    new_aggs.push(ColumnExpr::new(c.name, self.import_expr(src, c.expr)?));
                }
                OpKind::BlockingAgg {
                    groups: new_groups,
                    aggs: new_aggs,
                }
            }
            OpKind::GroupBy { groups } => {
                let mut new_groups = Vec::with_capacity(groups.len());
                for g in groups {
                    new_groups.push(self.import_expr(src, g)?);
                }
                OpKind::GroupBy { groups: new_groups }
            }
            OpKind::Join {
                join_type,
                left_on,
                right_on,
                suffixes,
            } => {
                let mut new_left = Vec::with_capacity(left_on.len());
                for c in left_on {
                    new_left.push(self.import_expr(src, c)?);
                }
                let mut new_right = Vec::with_capacity(right_on.len());
                for c in right_on {
                    new_right.push(self.import_expr(src, c)?);
                }
                OpKind::Join {
                    join_type,
                    left_on: new_left,
                    right_on: new_right,
                    suffixes,
                }
            }
            // No owned expressions to remap.
            leaf => leaf,
        };
        let id = self.create_node_at(NodeKind::op(kind), pos)?;
        if let Some(rel) = relation {
            self.set_relation(id, rel)?;
        }
        Ok(id)
    }

    // ---- debug rendering ----

    /// Indentation-aware rendering of the whole graph, operators in
    /// topological order with their expression trees nested beneath.
    pub fn debug_string(&self) -> String {
        let mut out = String::new();
        let order = match self.topological_sort() {
            Ok(o) => o,
            Err(_) => self.node_ids().collect(),
        };
        for id in order {
            let node = match self.get(id) {
                Ok(n) => n,
                Err(_) => continue,
            };
            if let Some(op) = node.as_op() {
                out.push_str(&format!(
                    "[{}] {} parents={:?}\n",
                    id.get(),
                    node.label(),
                    op.parents.iter().map(|p| p.get()).collect::<Vec<_>>()
                ));
                for expr in op.kind.owned_exprs() {
                    self.render_expr(expr, 1, &mut out);
                }
            }
        }
        out
    }

    fn render_expr(&self, id: NodeId, depth: usize, out: &mut String) {
        let indent = "  ".repeat(depth);
        match self.get(id) {
            Ok(node) => {
                out.push_str(&format!("{indent}[{}] {}\n", id.get(), node.label()));
                if let Some(e) = node.as_expr() {
                    for child in e.child_ids() {
                        self.render_expr(child, depth + 1, out);
                    }
                }
            }
            Err(_) => out.push_str(&format!("{indent}[{}] <dangling>\n", id.get())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use splinter_core::relation::ColumnSpec;
    use splinter_core::types::DataType;

    fn rel() -> Relation {
        Relation::new(vec![
            ColumnSpec::new("time_", DataType::Time64Ns),
            ColumnSpec::new("cpu_cycles", DataType::Int64),
        ])
    }

    #[test]
    fn ids_are_dense_and_monotonic() {
        let mut g = Graph::new();
        let a = g.add_int(1).unwrap();
        let b = g.add_int(2).unwrap();
        assert_eq!(a.get(), 0);
        assert_eq!(b.get(), 1);
        assert_eq!(g.len(), 2);
    }

    #[test]
    fn builders_wire_parents_and_edges() {
        let mut g = Graph::new();
        let src = g.create_mem_source("table", vec![]).unwrap();
        let sink = g.create_mem_sink(src, "out").unwrap();
        assert_eq!(g.get_op(sink).unwrap().parents, vec![src]);
        let order = g.topological_sort().unwrap();
        let pos = |id: NodeId| order.iter().position(|&x| x == id).unwrap();
        assert!(pos(src) < pos(sink));
    }

    #[test]
    fn get_sink_finds_the_single_sink() {
        let mut g = Graph::new();
        let src = g.create_mem_source("table", vec![]).unwrap();
        assert!(matches!(g.get_sink(), Err(Error::NotFound(_))));
        let sink = g.create_mem_sink(src, "out").unwrap();
        assert_eq!(g.get_sink().unwrap(), sink);
    }

    #[test]
    fn construction_errors_carry_position() {
        let mut g = Graph::new();
        let err = g
            .create_node_at(
                NodeKind::expr(ExprKind::Float(f64::INFINITY)),
                Some(SourcePos::new(2, 7)),
            )
            .unwrap_err();
        assert!(err.to_string().contains("2:7"));
        // The failed node must not occupy an id.
        assert_eq!(g.len(), 0);
        let next = g.add_int(0).unwrap();
        assert_eq!(next.get(), 0);
    }

    #[test]
    fn import_op_remaps_expression_trees() {
        let mut src = Graph::new();
        let mem = src.create_mem_source("t", vec![]).unwrap();
        src.set_relation(mem, rel()).unwrap();
        let col = src.add_column("cpu_cycles").unwrap();
        let two = src.add_int(2).unwrap();
        let func = src.add_func("multiply", vec![col, two]).unwrap();
        let map = src
            .create_map(mem, vec![ColumnExpr::new("doubled", func)])
            .unwrap();
        src.set_relation(map, Relation::new(vec![ColumnSpec::new("doubled", DataType::Int64)]))
            .unwrap();

        let mut dst = Graph::new();
        let copied = dst.import_op(&src, map).unwrap();
        let op = dst.get_op(copied).unwrap();
        assert!(op.parents.is_empty());
        assert_eq!(op.relation().unwrap().names(), vec!["doubled"]);
        match &op.kind {
            OpKind::Map { exprs } => {
                assert_eq!(exprs.len(), 1);
                // The copied tree must live in dst's id space.
                let root = dst.get_expr(exprs[0].expr).unwrap();
                match root {
                    ExprKind::Func { name, args } => {
                        assert_eq!(name, "multiply");
                        assert_eq!(args.len(), 2);
                        assert!(dst.get_expr(args[0]).is_ok());
                    }
                    other => panic!("expected func, got {:?}", other.tag()),
                }
            }
            other => panic!("expected map, got {:?}", other.tag()),
        }
    }

    #[test]
    fn lowering_stage_shapes_construct_and_render() {
        let mut g = Graph::new();
        let src = g.create_mem_source("t", vec![]).unwrap();
        g.set_relation(src, rel()).unwrap();

        let start = g.add_time(100).unwrap();
        let stop = g.add_time(200).unwrap();
        let window = g.add_list(vec![start, stop]).unwrap();
        let range = g.create_range(src, window).unwrap();

        let group = g.add_column("cpu_cycles").unwrap();
        let grouped = g.create_group_by(range, vec![group]).unwrap();
        let dropped = g
            .create_drop(grouped, vec!["time_".into()])
            .unwrap();

        let svc = g.add_metadata_ref("service").unwrap();
        let lambda = g
            .add_lambda(vec!["cpu_cycles".into()], vec![ColumnExpr::new("svc", svc)])
            .unwrap();
        let mapped = g
            .create_map(dropped, vec![ColumnExpr::new("svc", lambda)])
            .unwrap();
        g.create_mem_sink(mapped, "out").unwrap();

        let rendered = g.debug_string();
        assert!(rendered.contains("Range"));
        assert!(rendered.contains("GroupBy"));
        assert!(rendered.contains("Drop[time_]"));
        assert!(rendered.contains("MetadataRef[service]"));
        assert!(rendered.contains("Time[100ns]"));
        g.topological_sort().unwrap();
    }

    #[test]
    fn delete_node_leaves_an_internal_error_on_lookup() {
        let mut g = Graph::new();
        let id = g.add_int(3).unwrap();
        g.delete_node(id);
        assert!(g.get(id).unwrap_err().is_internal());
    }

    #[test]
    fn graph_round_trips_through_serde() {
        let mut g = Graph::new();
        let src = g.create_mem_source("table", vec!["cpu_cycles".into()]).unwrap();
        g.set_relation(src, rel()).unwrap();
        g.create_mem_sink(src, "out").unwrap();

        let json = serde_json::to_string(&g).unwrap();
        let back: Graph = serde_json::from_str(&json).unwrap();
        assert_eq!(back.len(), g.len());
        assert_eq!(back.topological_sort().unwrap(), g.topological_sort().unwrap());
        assert_eq!(back.get_sink().unwrap(), g.get_sink().unwrap());
    }
}
