//! The closed node model: operators and expressions.
//!
//! Operators participate in the dependency DAG and carry an optional resolved
//! output relation. Expressions form trees rooted at operator fields (a map's
//! output columns, a filter's predicate) and never appear as operator
//! parents. Adding a variant here forces every consumer (walker, wire
//! encoding, planner) to handle it, by exhaustive match.

use serde::{Deserialize, Serialize};
use splinter_core::error::{Error, Result};
use splinter_core::id::{InstanceId, NodeId};
use splinter_core::pos::SourcePos;
use splinter_core::relation::Relation;
use splinter_core::types::DataType;
use std::collections::BTreeMap;
use std::fmt;

/// One named output column backed by an expression tree root.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnExpr {
    pub name: String,
    pub expr: NodeId,
}

impl ColumnExpr {
    pub fn new(name: impl Into<String>, expr: NodeId) -> Self {
        Self {
            name: name.into(),
            expr,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JoinType {
    Inner,
    Left,
    Right,
    Outer,
}

/// Process identifier embedding the agent (ASID) it lives on. Used to pin a
/// UDTF to the one agent that hosts the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Upid {
    pub asid: u32,
    pub pid: u32,
    pub start_ticks: u64,
}

impl Upid {
    pub fn new(asid: u32, pid: u32, start_ticks: u64) -> Self {
        Self {
            asid,
            pid,
            start_ticks,
        }
    }
}

impl fmt::Display for Upid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.asid, self.pid, self.start_ticks)
    }
}

/// Placement policy for a user-defined table function source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UdtfExecutor {
    /// Run on every instance that processes data.
    AllAgents,
    /// Run only on producer-class instances (local data store).
    AllPems,
    /// Run only on aggregator-class instances (no local data store).
    AllKelvins,
    /// Run on the single producer hosting this process.
    SubsetPem(Upid),
}

/// Operator payloads. Parent references live on `OpNode`, not here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OpKind {
    MemorySource {
        table: String,
        /// Column subset to read; empty means the whole relation.
        select: Vec<String>,
        time_start_ns: Option<i64>,
        time_stop_ns: Option<i64>,
    },
    MemorySink {
        name: String,
    },
    /// Time-range restriction; merged into its source before encoding.
    Range {
        time_expr: NodeId,
    },
    Map {
        exprs: Vec<ColumnExpr>,
    },
    Filter {
        predicate: NodeId,
    },
    Limit {
        n: u64,
    },
    BlockingAgg {
        /// Group columns (column-reference expression ids).
        groups: Vec<NodeId>,
        /// Named aggregate expressions; each must be one function call over
        /// one column reference.
        aggs: Vec<ColumnExpr>,
    },
    /// Standalone grouping; consumed by a downstream BlockingAgg before
    /// encoding.
    GroupBy {
        groups: Vec<NodeId>,
    },
    Drop {
        columns: Vec<String>,
    },
    Union,
    Join {
        join_type: JoinType,
        left_on: Vec<NodeId>,
        right_on: Vec<NodeId>,
        suffixes: (String, String),
    },
    UdtfSource {
        name: String,
        executor: UdtfExecutor,
    },
    /// Network injection point. Owns no outbound state; producer sinks route
    /// to it by its node id.
    GrpcSource,
    /// Network egress. Maps each producing instance to the id of the
    /// GrpcSource (in the consumer's graph) that receives its stream.
    GrpcSink {
        destinations: BTreeMap<InstanceId, NodeId>,
    },
}

/// Fieldless operator discriminant, used for walker dispatch and diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum OpTag {
    MemorySource,
    MemorySink,
    Range,
    Map,
    Filter,
    Limit,
    BlockingAgg,
    GroupBy,
    Drop,
    Union,
    Join,
    UdtfSource,
    GrpcSource,
    GrpcSink,
}

impl fmt::Display for OpTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OpTag::MemorySource => "MemorySource",
            OpTag::MemorySink => "MemorySink",
            OpTag::Range => "Range",
            OpTag::Map => "Map",
            OpTag::Filter => "Filter",
            OpTag::Limit => "Limit",
            OpTag::BlockingAgg => "BlockingAgg",
            OpTag::GroupBy => "GroupBy",
            OpTag::Drop => "Drop",
            OpTag::Union => "Union",
            OpTag::Join => "Join",
            OpTag::UdtfSource => "UDTFSource",
            OpTag::GrpcSource => "GRPCSource",
            OpTag::GrpcSink => "GRPCSink",
        };
        f.write_str(s)
    }
}

impl OpKind {
    pub fn tag(&self) -> OpTag {
        match self {
            OpKind::MemorySource { .. } => OpTag::MemorySource,
            OpKind::MemorySink { .. } => OpTag::MemorySink,
            OpKind::Range { .. } => OpTag::Range,
            OpKind::Map { .. } => OpTag::Map,
            OpKind::Filter { .. } => OpTag::Filter,
            OpKind::Limit { .. } => OpTag::Limit,
            OpKind::BlockingAgg { .. } => OpTag::BlockingAgg,
            OpKind::GroupBy { .. } => OpTag::GroupBy,
            OpKind::Drop { .. } => OpTag::Drop,
            OpKind::Union => OpTag::Union,
            OpKind::Join { .. } => OpTag::Join,
            OpKind::UdtfSource { .. } => OpTag::UdtfSource,
            OpKind::GrpcSource => OpTag::GrpcSource,
            OpKind::GrpcSink { .. } => OpTag::GrpcSink,
        }
    }

    /// Sources originate data and have no parent operator.
    pub fn is_source(&self) -> bool {
        matches!(
            self.tag(),
            OpTag::MemorySource | OpTag::UdtfSource | OpTag::GrpcSource
        )
    }

    pub fn is_sink(&self) -> bool {
        matches!(self.tag(), OpTag::MemorySink | OpTag::GrpcSink)
    }

    /// Operators that must see the whole stream on a single instance before
    /// producing output (they require network fan-in once their input is
    /// replicated across producers).
    pub fn is_blocking(&self) -> bool {
        matches!(
            self.tag(),
            OpTag::MemorySink | OpTag::BlockingAgg | OpTag::Union | OpTag::Join
        )
    }

    /// Expression tree roots owned by this operator's fields, in field order.
    pub fn owned_exprs(&self) -> Vec<NodeId> {
        match self {
            OpKind::Range { time_expr } => vec![*time_expr],
            OpKind::Map { exprs } => exprs.iter().map(|c| c.expr).collect(),
            OpKind::Filter { predicate } => vec![*predicate],
            OpKind::BlockingAgg { groups, aggs } => groups
                .iter()
                .copied()
                .chain(aggs.iter().map(|c| c.expr))
                .collect(),
            OpKind::GroupBy { groups } => groups.clone(),
            OpKind::Join {
                left_on, right_on, ..
            } => left_on.iter().chain(right_on.iter()).copied().collect(),
            OpKind::MemorySource { .. }
            | OpKind::MemorySink { .. }
            | OpKind::Limit { .. }
            | OpKind::Drop { .. }
            | OpKind::Union
            | OpKind::UdtfSource { .. }
            | OpKind::GrpcSource
            | OpKind::GrpcSink { .. } => vec![],
        }
    }
}

/// Expression payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ExprKind {
    Column {
        name: String,
        /// Resolved index/type in the enclosing operator's parent relation.
        index: Option<usize>,
        ty: Option<DataType>,
    },
    String(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    /// Nanoseconds since the epoch.
    Time(i64),
    Func {
        name: String,
        args: Vec<NodeId>,
    },
    List {
        items: Vec<NodeId>,
    },
    Lambda {
        expected_columns: Vec<String>,
        exprs: Vec<ColumnExpr>,
    },
    /// Reference to execution-context metadata (e.g. "service"); resolved to
    /// a concrete column by passes outside this crate.
    MetadataRef {
        property: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ExprTag {
    Column,
    String,
    Int,
    Float,
    Bool,
    Time,
    Func,
    List,
    Lambda,
    MetadataRef,
}

impl fmt::Display for ExprTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExprTag::Column => "Column",
            ExprTag::String => "String",
            ExprTag::Int => "Int",
            ExprTag::Float => "Float",
            ExprTag::Bool => "Bool",
            ExprTag::Time => "Time",
            ExprTag::Func => "Func",
            ExprTag::List => "List",
            ExprTag::Lambda => "Lambda",
            ExprTag::MetadataRef => "MetadataRef",
        };
        f.write_str(s)
    }
}

impl ExprKind {
    pub fn tag(&self) -> ExprTag {
        match self {
            ExprKind::Column { .. } => ExprTag::Column,
            ExprKind::String(_) => ExprTag::String,
            ExprKind::Int(_) => ExprTag::Int,
            ExprKind::Float(_) => ExprTag::Float,
            ExprKind::Bool(_) => ExprTag::Bool,
            ExprKind::Time(_) => ExprTag::Time,
            ExprKind::Func { .. } => ExprTag::Func,
            ExprKind::List { .. } => ExprTag::List,
            ExprKind::Lambda { .. } => ExprTag::Lambda,
            ExprKind::MetadataRef { .. } => ExprTag::MetadataRef,
        }
    }

    pub fn child_ids(&self) -> Vec<NodeId> {
        match self {
            ExprKind::Func { args, .. } => args.clone(),
            ExprKind::List { items } => items.clone(),
            ExprKind::Lambda { exprs, .. } => exprs.iter().map(|c| c.expr).collect(),
            _ => vec![],
        }
    }
}

/// Common operator state: output relation (set once) plus ordered parents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpNode {
    relation: Option<Relation>,
    pub parents: Vec<NodeId>,
    pub kind: OpKind,
}

impl OpNode {
    pub fn new(kind: OpKind) -> Self {
        Self {
            relation: None,
            parents: vec![],
            kind,
        }
    }

    pub fn relation(&self) -> Option<&Relation> {
        self.relation.as_ref()
    }

    pub fn is_relation_set(&self) -> bool {
        self.relation.is_some()
    }

    /// Sets the resolved output relation. The relation participates in edge
    /// type-checking, so it is immutable once set.
    pub fn set_relation(&mut self, relation: Relation) -> Result<()> {
        if self.relation.is_some() {
            return Err(Error::invalid_argument(format!(
                "relation already set on {} operator",
                self.kind.tag()
            )));
        }
        self.relation = Some(relation);
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum NodeKind {
    Op(OpNode),
    Expr(ExprKind),
}

impl NodeKind {
    pub fn op(kind: OpKind) -> Self {
        NodeKind::Op(OpNode::new(kind))
    }

    pub fn expr(kind: ExprKind) -> Self {
        NodeKind::Expr(kind)
    }

    /// Constructor-level validation, run before a node enters the graph.
    pub fn validate(&self) -> std::result::Result<(), String> {
        match self {
            NodeKind::Op(op) => match &op.kind {
                OpKind::MemorySource { table, .. } if table.is_empty() => {
                    Err("memory source requires a non-empty table name".into())
                }
                OpKind::MemorySink { name } if name.is_empty() => {
                    Err("memory sink requires a non-empty name".into())
                }
                OpKind::Join {
                    left_on, right_on, ..
                } if left_on.len() != right_on.len() || left_on.is_empty() => {
                    Err("join requires matching, non-empty equality column lists".into())
                }
                OpKind::UdtfSource { name, .. } if name.is_empty() => {
                    Err("UDTF source requires a non-empty function name".into())
                }
                _ => Ok(()),
            },
            NodeKind::Expr(e) => match e {
                ExprKind::Column { name, .. } if name.is_empty() => {
                    Err("column reference requires a non-empty name".into())
                }
                ExprKind::Func { name, .. } if name.is_empty() => {
                    Err("function call requires a non-empty name".into())
                }
                ExprKind::Float(v) if !v.is_finite() => {
                    Err(format!("malformed float literal: {v}"))
                }
                ExprKind::Time(v) if *v < 0 => {
                    Err(format!("malformed time literal: {v}ns is negative"))
                }
                ExprKind::MetadataRef { property } if property.is_empty() => {
                    Err("metadata reference requires a non-empty property".into())
                }
                _ => Ok(()),
            },
        }
    }
}

/// One IR node: identity, source position, payload. Owned by its graph;
/// everything it references is a `NodeId` in the same graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IrNode {
    id: NodeId,
    pos: Option<SourcePos>,
    pub kind: NodeKind,
}

impl IrNode {
    pub(crate) fn new(id: NodeId, pos: Option<SourcePos>, kind: NodeKind) -> Self {
        Self { id, pos, kind }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn pos(&self) -> Option<SourcePos> {
        self.pos
    }

    pub fn is_op(&self) -> bool {
        matches!(self.kind, NodeKind::Op(_))
    }

    pub fn as_op(&self) -> Option<&OpNode> {
        match &self.kind {
            NodeKind::Op(op) => Some(op),
            NodeKind::Expr(_) => None,
        }
    }

    pub fn as_op_mut(&mut self) -> Option<&mut OpNode> {
        match &mut self.kind {
            NodeKind::Op(op) => Some(op),
            NodeKind::Expr(_) => None,
        }
    }

    pub fn as_expr(&self) -> Option<&ExprKind> {
        match &self.kind {
            NodeKind::Op(_) => None,
            NodeKind::Expr(e) => Some(e),
        }
    }

    /// Short label for debug rendering; nested expression trees are rendered
    /// by `Graph::debug_string`, which can follow ids.
    pub fn label(&self) -> String {
        match &self.kind {
            NodeKind::Op(op) => match &op.kind {
                OpKind::MemorySource { table, .. } => format!("MemorySource[{table}]"),
                OpKind::MemorySink { name } => format!("MemorySink[{name}]"),
                OpKind::UdtfSource { name, .. } => format!("UDTFSource[{name}]"),
                OpKind::Limit { n } => format!("Limit[{n}]"),
                OpKind::Drop { columns } => format!("Drop[{}]", columns.join(",")),
                OpKind::GrpcSink { destinations } => {
                    let routes: Vec<String> = destinations
                        .iter()
                        .map(|(i, d)| format!("{}->{}", i.get(), d.get()))
                        .collect();
                    format!("GRPCSink[{}]", routes.join(","))
                }
                other => other.tag().to_string(),
            },
            NodeKind::Expr(e) => match e {
                ExprKind::Column { name, .. } => format!("Column[{name}]"),
                ExprKind::String(s) => format!("String[{s:?}]"),
                ExprKind::Int(v) => format!("Int[{v}]"),
                ExprKind::Float(v) => format!("Float[{v}]"),
                ExprKind::Bool(v) => format!("Bool[{v}]"),
                ExprKind::Time(v) => format!("Time[{v}ns]"),
                ExprKind::Func { name, .. } => format!("Func[{name}]"),
                ExprKind::List { .. } => "List".into(),
                ExprKind::Lambda { .. } => "Lambda".into(),
                ExprKind::MetadataRef { property } => format!("MetadataRef[{property}]"),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_rejects_malformed_nodes() {
        assert!(NodeKind::expr(ExprKind::Column {
            name: String::new(),
            index: None,
            ty: None
        })
        .validate()
        .is_err());
        assert!(NodeKind::expr(ExprKind::Float(f64::NAN)).validate().is_err());
        assert!(NodeKind::expr(ExprKind::Time(-5)).validate().is_err());
        assert!(NodeKind::op(OpKind::MemorySource {
            table: String::new(),
            select: vec![],
            time_start_ns: None,
            time_stop_ns: None
        })
        .validate()
        .is_err());
        assert!(NodeKind::expr(ExprKind::Int(42)).validate().is_ok());
    }

    #[test]
    fn relation_is_immutable_once_set() {
        let mut op = OpNode::new(OpKind::Union);
        op.set_relation(Relation::empty()).unwrap();
        assert!(op.set_relation(Relation::empty()).is_err());
    }

    #[test]
    fn blocking_classification() {
        assert!(OpKind::Union.is_blocking());
        assert!(OpKind::MemorySink { name: "out".into() }.is_blocking());
        assert!(!OpKind::Limit { n: 10 }.is_blocking());
        assert!(OpKind::GrpcSource.is_source());
    }
}
