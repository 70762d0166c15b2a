//! Wire-format plan messages produced for the execution engine.
//!
//! These serde shapes stand in for the executor's plan protobufs: every
//! field is fully resolved, with column indices instead of names wherever
//! an index suffices, concrete data types, and operator ids for linkage.
//! Encoding fails with a resolution error when an upstream pass has not
//! resolved a relation or a referenced column.

use crate::graph::Graph;
use crate::node::{ExprKind, JoinType, OpKind, OpNode};
use serde::{Deserialize, Serialize};
use splinter_core::error::{Error, Result};
use splinter_core::id::NodeId;
use splinter_core::pos::SourcePos;
use splinter_core::relation::Relation;
use splinter_core::types::{DataType, ScalarValue};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnRefPb {
    pub index: usize,
    pub ty: DataType,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "expr")]
pub enum ScalarExpressionPb {
    Constant { value: ScalarValue },
    Column { index: usize, ty: DataType },
    Func { name: String, args: Vec<ScalarExpressionPb> },
}

/// One aggregate: a named function applied to exactly one input column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateExpressionPb {
    pub func: String,
    pub arg: ColumnRefPb,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op")]
pub enum OperatorPb {
    MemorySource {
        name: String,
        column_idxs: Vec<usize>,
        column_names: Vec<String>,
        column_types: Vec<DataType>,
        start_time_ns: Option<i64>,
        stop_time_ns: Option<i64>,
    },
    MemorySink {
        name: String,
        column_names: Vec<String>,
        column_types: Vec<DataType>,
    },
    Map {
        column_names: Vec<String>,
        expressions: Vec<ScalarExpressionPb>,
    },
    BlockingAgg {
        group_names: Vec<String>,
        groups: Vec<ColumnRefPb>,
        value_names: Vec<String>,
        values: Vec<AggregateExpressionPb>,
    },
    Filter {
        expression: ScalarExpressionPb,
    },
    Limit {
        limit: u64,
    },
    Union {
        column_names: Vec<String>,
    },
    Join {
        join_type: JoinType,
        /// Pairs of (left column index, right column index).
        equality_conditions: Vec<(usize, usize)>,
        column_names: Vec<String>,
    },
    UdtfSource {
        name: String,
    },
    GrpcSource {
        column_types: Vec<DataType>,
    },
    GrpcSink {
        /// Producing instance id -> destination GrpcSource node id.
        destinations: BTreeMap<u64, u64>,
    },
}

/// One encoded operator with its resolved parent linkage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanNodePb {
    pub id: u64,
    pub parents: Vec<u64>,
    pub op: OperatorPb,
}

/// A whole per-instance plan fragment, operators in topological order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanFragmentPb {
    pub nodes: Vec<PlanNodePb>,
}

/// Encodes every operator of `graph` in topological order.
pub fn graph_to_proto(graph: &Graph) -> Result<PlanFragmentPb> {
    let mut nodes = Vec::new();
    for id in graph.topological_sort()? {
        let node = graph.get(id)?;
        let Some(op) = node.as_op() else { continue };
        nodes.push(PlanNodePb {
            id: id.get(),
            parents: op.parents.iter().map(|p| p.get()).collect(),
            op: op_to_proto(graph, id)?,
        });
    }
    Ok(PlanFragmentPb { nodes })
}

/// Encodes one operator, resolving names to indices against the relevant
/// relation.
pub fn op_to_proto(graph: &Graph, id: NodeId) -> Result<OperatorPb> {
    let node = graph.get(id)?;
    let pos = node.pos();
    let op = node
        .as_op()
        .ok_or_else(|| Error::internal(format!("{id} is not an operator")))?;

    match &op.kind {
        OpKind::MemorySource {
            table,
            select,
            time_start_ns,
            time_stop_ns,
        } => {
            let rel = own_relation(op, "memory source", pos)?;
            let names = if select.is_empty() {
                rel.names()
            } else {
                select.clone()
            };
            let mut idxs = Vec::with_capacity(names.len());
            let mut types = Vec::with_capacity(names.len());
            for n in &names {
                let idx = rel.index_of(n).ok_or_else(|| {
                    Error::resolution(
                        format!("column '{n}' is not part of table '{table}'"),
                        pos,
                    )
                })?;
                idxs.push(idx);
                types.push(rel.column(idx).map(|c| c.ty).unwrap_or(DataType::String));
            }
            Ok(OperatorPb::MemorySource {
                name: table.clone(),
                column_idxs: idxs,
                column_names: names,
                column_types: types,
                start_time_ns: *time_start_ns,
                stop_time_ns: *time_stop_ns,
            })
        }
        OpKind::MemorySink { name } => {
            let rel = sink_relation(graph, op, pos)?;
            Ok(OperatorPb::MemorySink {
                name: name.clone(),
                column_names: rel.names(),
                column_types: rel.types(),
            })
        }
        OpKind::Map { exprs } => {
            let rel = parent_relation(graph, op, 0, pos)?;
            let mut names = Vec::with_capacity(exprs.len());
            let mut expressions = Vec::with_capacity(exprs.len());
            for c in exprs {
                names.push(c.name.clone());
                expressions.push(eval_scalar(graph, c.expr, &rel)?);
            }
            Ok(OperatorPb::Map {
                column_names: names,
                expressions,
            })
        }
        OpKind::BlockingAgg { groups, aggs } => {
            let rel = parent_relation(graph, op, 0, pos)?;
            let mut group_names = Vec::with_capacity(groups.len());
            let mut group_refs = Vec::with_capacity(groups.len());
            for g in groups {
                let (name, col) = column_ref(graph, *g, &rel)?;
                group_names.push(name);
                group_refs.push(col);
            }
            let mut value_names = Vec::with_capacity(aggs.len());
            let mut values = Vec::with_capacity(aggs.len());
            for c in aggs {
                value_names.push(c.name.clone());
                values.push(eval_aggregate(graph, c.expr, &rel)?);
            }
            Ok(OperatorPb::BlockingAgg {
                group_names,
                groups: group_refs,
                value_names,
                values,
            })
        }
        OpKind::Filter { predicate } => {
            let rel = parent_relation(graph, op, 0, pos)?;
            Ok(OperatorPb::Filter {
                expression: eval_scalar(graph, *predicate, &rel)?,
            })
        }
        OpKind::Limit { n } => Ok(OperatorPb::Limit { limit: *n }),
        OpKind::Union => {
            let rel = sink_relation(graph, op, pos)?;
            Ok(OperatorPb::Union {
                column_names: rel.names(),
            })
        }
        OpKind::Join {
            join_type,
            left_on,
            right_on,
            ..
        } => {
            let left_rel = parent_relation(graph, op, 0, pos)?;
            let right_rel = parent_relation(graph, op, 1, pos)?;
            let mut conditions = Vec::with_capacity(left_on.len());
            for (l, r) in left_on.iter().zip(right_on.iter()) {
                let (_, lref) = column_ref(graph, *l, &left_rel)?;
                let (_, rref) = column_ref(graph, *r, &right_rel)?;
                conditions.push((lref.index, rref.index));
            }
            let out = own_relation(op, "join", pos)?;
            Ok(OperatorPb::Join {
                join_type: *join_type,
                equality_conditions: conditions,
                column_names: out.names(),
            })
        }
        OpKind::UdtfSource { name, .. } => Ok(OperatorPb::UdtfSource { name: name.clone() }),
        OpKind::GrpcSource => {
            let rel = own_relation(op, "GRPC source", pos)?;
            Ok(OperatorPb::GrpcSource {
                column_types: rel.types(),
            })
        }
        OpKind::GrpcSink { destinations } => Ok(OperatorPb::GrpcSink {
            destinations: destinations
                .iter()
                .map(|(i, d)| (i.get(), d.get()))
                .collect(),
        }),
        // These kinds are consumed by earlier passes (Range folds into its
        // source, GroupBy into the downstream aggregate, Drop into a Map).
        // Reaching encoding with one still present is a compiler defect.
        OpKind::Range { .. } | OpKind::GroupBy { .. } | OpKind::Drop { .. } => {
            Err(Error::internal(format!(
                "{} has no wire representation; it must be lowered before encoding",
                op.kind.tag()
            )))
        }
    }
}

fn own_relation(op: &OpNode, what: &str, pos: Option<SourcePos>) -> Result<Relation> {
    op.relation().cloned().ok_or_else(|| {
        Error::resolution(format!("{what} relation has not been resolved"), pos)
    })
}

/// Relation of the `idx`-th parent operator; encoding cannot proceed
/// without it.
fn parent_relation(
    graph: &Graph,
    op: &OpNode,
    idx: usize,
    pos: Option<SourcePos>,
) -> Result<Relation> {
    let parent = op.parents.get(idx).copied().ok_or_else(|| {
        Error::internal(format!(
            "{} operator is missing parent {idx}",
            op.kind.tag()
        ))
    })?;
    graph.get_op(parent)?.relation().cloned().ok_or_else(|| {
        Error::resolution("parent relation has not been resolved", pos)
    })
}

/// A sink-like operator takes its own relation when set, else its parent's.
fn sink_relation(graph: &Graph, op: &OpNode, pos: Option<SourcePos>) -> Result<Relation> {
    if let Some(rel) = op.relation() {
        return Ok(rel.clone());
    }
    parent_relation(graph, op, 0, pos)
}

fn column_ref(graph: &Graph, id: NodeId, rel: &Relation) -> Result<(String, ColumnRefPb)> {
    let pos = graph.get(id)?.pos();
    match graph.get_expr(id)? {
        ExprKind::Column { name, index, ty } => {
            let idx = match index {
                Some(i) => *i,
                None => rel.index_of(name).ok_or_else(|| {
                    Error::resolution(format!("column '{name}' not found in relation"), pos)
                })?,
            };
            let ty = match ty {
                Some(t) => *t,
                None => {
                    rel.column(idx)
                        .map(|c| c.ty)
                        .ok_or_else(|| {
                            Error::resolution(
                                format!("column index {idx} out of range"),
                                pos,
                            )
                        })?
                }
            };
            Ok((name.clone(), ColumnRefPb { index: idx, ty }))
        }
        other => Err(Error::resolution(
            format!("expected a column reference, got {}", other.tag()),
            pos,
        )),
    }
}

fn eval_scalar(graph: &Graph, id: NodeId, rel: &Relation) -> Result<ScalarExpressionPb> {
    let pos = graph.get(id)?.pos();
    match graph.get_expr(id)? {
        ExprKind::Column { .. } => {
            let (_, col) = column_ref(graph, id, rel)?;
            Ok(ScalarExpressionPb::Column {
                index: col.index,
                ty: col.ty,
            })
        }
        ExprKind::String(s) => Ok(ScalarExpressionPb::Constant {
            value: ScalarValue::String(s.clone()),
        }),
        ExprKind::Int(v) => Ok(ScalarExpressionPb::Constant {
            value: ScalarValue::Int(*v),
        }),
        ExprKind::Float(v) => Ok(ScalarExpressionPb::Constant {
            value: ScalarValue::Float(*v),
        }),
        ExprKind::Bool(v) => Ok(ScalarExpressionPb::Constant {
            value: ScalarValue::Bool(*v),
        }),
        ExprKind::Time(v) => Ok(ScalarExpressionPb::Constant {
            value: ScalarValue::Time(*v),
        }),
        ExprKind::Func { name, args } => {
            let mut encoded = Vec::with_capacity(args.len());
            for a in args {
                encoded.push(eval_scalar(graph, *a, rel)?);
            }
            Ok(ScalarExpressionPb::Func {
                name: name.clone(),
                args: encoded,
            })
        }
        other @ (ExprKind::List { .. } | ExprKind::Lambda { .. } | ExprKind::MetadataRef { .. }) => {
            Err(Error::resolution(
                format!("{} cannot appear in an encoded scalar expression", other.tag()),
                pos,
            ))
        }
    }
}

/// Aggregate expressions are restricted: exactly one function call over
/// exactly one column reference. Nested or multi-argument forms are rejected.
fn eval_aggregate(graph: &Graph, id: NodeId, rel: &Relation) -> Result<AggregateExpressionPb> {
    let pos = graph.get(id)?.pos();
    match graph.get_expr(id)? {
        ExprKind::Func { name, args } => {
            if args.len() != 1 {
                return Err(Error::resolution(
                    format!(
                        "aggregate '{name}' must take exactly one column, got {} arguments",
                        args.len()
                    ),
                    pos,
                ));
            }
            let (_, arg) = column_ref(graph, args[0], rel)?;
            Ok(AggregateExpressionPb {
                func: name.clone(),
                arg,
            })
        }
        other => Err(Error::resolution(
            format!("aggregate expression must be a function call, got {}", other.tag()),
            pos,
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::ColumnExpr;
    use splinter_core::relation::ColumnSpec;

    fn rel() -> Relation {
        Relation::new(vec![
            ColumnSpec::new("time_", DataType::Time64Ns),
            ColumnSpec::new("cpu_cycles", DataType::Int64),
            ColumnSpec::new("service", DataType::String),
        ])
    }

    #[test]
    fn map_resolves_columns_by_index() {
        let mut g = Graph::new();
        let src = g.create_mem_source("t", vec![]).unwrap();
        g.set_relation(src, rel()).unwrap();
        let col = g.add_column("cpu_cycles").unwrap();
        let two = g.add_int(2).unwrap();
        let func = g.add_func("multiply", vec![col, two]).unwrap();
        let map = g
            .create_map(src, vec![ColumnExpr::new("doubled", func)])
            .unwrap();

        let pb = op_to_proto(&g, map).unwrap();
        match pb {
            OperatorPb::Map {
                column_names,
                expressions,
            } => {
                assert_eq!(column_names, vec!["doubled"]);
                match &expressions[0] {
                    ScalarExpressionPb::Func { name, args } => {
                        assert_eq!(name, "multiply");
                        assert_eq!(
                            args[0],
                            ScalarExpressionPb::Column {
                                index: 1,
                                ty: DataType::Int64
                            }
                        );
                        assert_eq!(
                            args[1],
                            ScalarExpressionPb::Constant {
                                value: ScalarValue::Int(2)
                            }
                        );
                    }
                    other => panic!("expected func, got {other:?}"),
                }
            }
            other => panic!("expected map, got {other:?}"),
        }
    }

    #[test]
    fn unknown_column_is_a_resolution_error() {
        let mut g = Graph::new();
        let src = g.create_mem_source("t", vec![]).unwrap();
        g.set_relation(src, rel()).unwrap();
        let col = g.add_column("nope").unwrap();
        let map = g
            .create_map(src, vec![ColumnExpr::new("out", col)])
            .unwrap();
        let err = op_to_proto(&g, map).unwrap_err();
        assert!(err.to_string().contains("'nope'"));
        assert!(!err.is_internal());
    }

    #[test]
    fn unresolved_relation_fails_encoding() {
        let mut g = Graph::new();
        let src = g.create_mem_source("t", vec![]).unwrap();
        // relation never set
        assert!(op_to_proto(&g, src).is_err());
    }

    #[test]
    fn aggregate_shape_is_enforced() {
        let mut g = Graph::new();
        let src = g.create_mem_source("t", vec![]).unwrap();
        g.set_relation(src, rel()).unwrap();

        let group = g.add_column("service").unwrap();
        let arg_a = g.add_column("cpu_cycles").unwrap();
        let arg_b = g.add_column("time_").unwrap();
        let bad = g.add_func("mean", vec![arg_a, arg_b]).unwrap();
        let agg = g
            .create_blocking_agg(src, vec![group], vec![ColumnExpr::new("m", bad)])
            .unwrap();
        let err = op_to_proto(&g, agg).unwrap_err();
        assert!(err.to_string().contains("exactly one column"));

        let mut g2 = Graph::new();
        let src2 = g2.create_mem_source("t", vec![]).unwrap();
        g2.set_relation(src2, rel()).unwrap();
        let group2 = g2.add_column("service").unwrap();
        let arg = g2.add_column("cpu_cycles").unwrap();
        let mean = g2.add_func("mean", vec![arg]).unwrap();
        let agg2 = g2
            .create_blocking_agg(src2, vec![group2], vec![ColumnExpr::new("m", mean)])
            .unwrap();
        match op_to_proto(&g2, agg2).unwrap() {
            OperatorPb::BlockingAgg {
                group_names,
                groups,
                value_names,
                values,
            } => {
                assert_eq!(group_names, vec!["service"]);
                assert_eq!(groups[0].index, 2);
                assert_eq!(value_names, vec!["m"]);
                assert_eq!(values[0].func, "mean");
                assert_eq!(values[0].arg.index, 1);
            }
            other => panic!("expected agg, got {other:?}"),
        }
    }

    #[test]
    fn memory_source_encodes_select_subset_and_time_range() {
        let mut g = Graph::new();
        let src = g
            .create_mem_source("t", vec!["service".into(), "time_".into()])
            .unwrap();
        g.set_relation(src, rel()).unwrap();
        g.set_time_range(src, 100, 200).unwrap();
        match op_to_proto(&g, src).unwrap() {
            OperatorPb::MemorySource {
                name,
                column_idxs,
                column_types,
                start_time_ns,
                stop_time_ns,
                ..
            } => {
                assert_eq!(name, "t");
                assert_eq!(column_idxs, vec![2, 0]);
                assert_eq!(column_types, vec![DataType::String, DataType::Time64Ns]);
                assert_eq!(start_time_ns, Some(100));
                assert_eq!(stop_time_ns, Some(200));
            }
            other => panic!("expected source, got {other:?}"),
        }
    }

    #[test]
    fn lowered_away_kinds_refuse_encoding() {
        let mut g = Graph::new();
        let src = g.create_mem_source("t", vec![]).unwrap();
        g.set_relation(src, rel()).unwrap();
        let drop_op = g.create_drop(src, vec!["service".into()]).unwrap();
        assert!(op_to_proto(&g, drop_op).unwrap_err().is_internal());
    }

    #[test]
    fn grpc_sink_encodes_its_destination_map() {
        use splinter_core::id::InstanceId;

        let mut g = Graph::new();
        let src = g.create_mem_source("t", vec![]).unwrap();
        g.set_relation(src, rel()).unwrap();
        // Destination ids live in the consumer's id space, not this graph's.
        let sink = g
            .create_grpc_sink(src, BTreeMap::from([(InstanceId::new(3), NodeId::new(7))]))
            .unwrap();
        match op_to_proto(&g, sink).unwrap() {
            OperatorPb::GrpcSink { destinations } => {
                assert_eq!(destinations, BTreeMap::from([(3u64, 7u64)]));
            }
            other => panic!("expected GRPC sink, got {other:?}"),
        }
    }

    #[test]
    fn grpc_source_requires_a_resolved_relation() {
        let mut g = Graph::new();
        let resolved = g.create_grpc_source(Some(rel())).unwrap();
        match op_to_proto(&g, resolved).unwrap() {
            OperatorPb::GrpcSource { column_types } => {
                assert_eq!(column_types, rel().types());
            }
            other => panic!("expected GRPC source, got {other:?}"),
        }

        let unresolved = g.create_grpc_source(None).unwrap();
        let err = op_to_proto(&g, unresolved).unwrap_err();
        assert!(err.to_string().contains("relation"));
        assert!(!err.is_internal());
    }

    #[test]
    fn fragment_encoding_follows_topological_order() {
        let mut g = Graph::new();
        let src = g.create_mem_source("t", vec![]).unwrap();
        g.set_relation(src, rel()).unwrap();
        let limit = g.create_limit(src, 5).unwrap();
        g.set_relation(limit, rel()).unwrap();
        let sink = g.create_mem_sink(limit, "out").unwrap();

        let frag = graph_to_proto(&g).unwrap();
        assert_eq!(frag.nodes.len(), 3);
        assert_eq!(frag.nodes[0].id, src.get());
        assert_eq!(frag.nodes[2].id, sink.get());
        assert_eq!(frag.nodes[2].parents, vec![limit.get()]);
    }
}
