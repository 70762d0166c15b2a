//! The distributed planning algorithm.
//!
//! Four steps: (1) place every operator on a set of candidate instances,
//! (2) split the graph into a producer region and a merge region, inserting
//! a GRPC sink/source boundary pair across every region-crossing edge,
//! (3) materialize one independent subgraph per participating instance,
//! (4) assemble the instance-level DAG from the routing pairs. Instances
//! that receive no operators are dropped. Planning either returns a complete
//! plan or one error, never a partial result.

use crate::plan::{DistributedPlan, PlannedInstance};
use crate::state::DistributedState;
use splinter_core::error::{Error, Result};
use splinter_core::id::{InstanceId, NodeId};
use splinter_core::pos::SourcePos;
use splinter_ir::node::{OpKind, OpNode, UdtfExecutor};
use splinter_ir::Graph;
use std::collections::{BTreeMap, BTreeSet};

/// Where one operator runs: a set of instances, plus whether the operator
/// already sits in the merge region (at or past a blocking operator). The
/// boundary between the two regions always gets a sink/source pair, even
/// when both sides land on the same instance.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Placement {
    instances: BTreeSet<InstanceId>,
    merged: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DistributedPlanner;

impl DistributedPlanner {
    pub fn new() -> Self {
        Self
    }

    /// Fragments `graph` across the fleet described by `state`.
    pub fn plan(&self, graph: &Graph, state: &DistributedState) -> Result<DistributedPlan> {
        let run = PlannerRun {
            graph,
            state,
            placements: BTreeMap::new(),
            instances: BTreeMap::new(),
            copies: BTreeMap::new(),
            routes: Vec::new(),
        };
        run.execute()
    }
}

struct PlannerRun<'a> {
    graph: &'a Graph,
    state: &'a DistributedState,
    placements: BTreeMap<NodeId, Placement>,
    /// Lazily created per-instance outputs, keyed by instance id.
    instances: BTreeMap<InstanceId, PlannedInstance>,
    /// (source-graph op, instance) -> node id in that instance's subgraph.
    copies: BTreeMap<(NodeId, InstanceId), NodeId>,
    routes: Vec<(InstanceId, InstanceId)>,
}

impl<'a> PlannerRun<'a> {
    fn execute(mut self) -> Result<DistributedPlan> {
        let order = self.graph.topological_sort()?;

        // Step 1: placement. Topological order guarantees parents are
        // placed before their children.
        for &id in &order {
            if !self.graph.get(id)?.is_op() {
                continue;
            }
            let placement = self.place(id)?;
            tracing::debug!(
                node = id.get(),
                instances = ?placement.instances.iter().map(|i| i.get()).collect::<Vec<_>>(),
                merged = placement.merged,
                "placed operator"
            );
            self.placements.insert(id, placement);
        }

        // Steps 2 + 3: copy operators into per-instance subgraphs and wire
        // edges, inserting boundary pairs where placements differ.
        for &id in &order {
            if self.placements.contains_key(&id) {
                self.materialize(id)?;
            }
        }

        // Step 4: assemble the instance DAG from the recorded routes.
        let mut plan = DistributedPlan::new();
        for (_, inst) in std::mem::take(&mut self.instances) {
            plan.insert(inst);
        }
        for (from, to) in self.routes.drain(..) {
            plan.add_route(from, to)?;
        }
        // An aggregator streaming back into a producer would show up here.
        plan.topological_order()
            .map_err(|_| Error::internal("distributed plan contains a cycle"))?;

        if plan.is_empty() {
            return Err(Error::resolution(
                "query has no runnable source for this fleet",
                None,
            ));
        }
        Ok(plan)
    }

    // ---- step 1: placement ----

    fn place(&self, id: NodeId) -> Result<Placement> {
        let op = self.graph.get_op(id)?;
        let pos = self.graph.get(id)?.pos();
        match &op.kind {
            OpKind::GrpcSource | OpKind::GrpcSink { .. } => Err(Error::internal(format!(
                "{} may not appear in an input graph",
                op.kind.tag()
            ))),
            kind if kind.is_source() => Ok(Placement {
                instances: self.source_candidates(op, pos)?,
                merged: false,
            }),
            kind if kind.is_blocking() => {
                let target = self.aggregator_instance(pos)?;
                Ok(Placement {
                    instances: BTreeSet::from([target]),
                    merged: true,
                })
            }
            _ => {
                // Single-parent pass-through: replicate wherever the parent
                // runs, in the parent's region.
                let parent = op.parents.first().copied().ok_or_else(|| {
                    Error::internal(format!(
                        "{} operator {id} has no parent",
                        op.kind.tag()
                    ))
                })?;
                self.placements
                    .get(&parent)
                    .cloned()
                    .ok_or_else(|| Error::internal(format!("parent {parent} was not placed")))
            }
        }
    }

    fn source_candidates(
        &self,
        op: &OpNode,
        pos: Option<SourcePos>,
    ) -> Result<BTreeSet<InstanceId>> {
        match &op.kind {
            OpKind::MemorySource { table, .. } => {
                let spec = self.state.table(table).ok_or_else(|| {
                    Error::resolution(format!("table '{table}' not found"), pos)
                })?;
                let mut out = BTreeSet::new();
                for agent in &spec.agent_ids {
                    if let Some(idx) = self.state.instance_by_agent(*agent) {
                        // Only producer-class instances can serve table scans.
                        if self.state.instances[idx].is_pem() {
                            out.insert(InstanceId::new(idx as u64));
                        }
                    }
                }
                if out.is_empty() {
                    return Err(Error::resolution(
                        format!("table '{table}' has no owning instance able to serve it"),
                        pos,
                    ));
                }
                Ok(out)
            }
            OpKind::UdtfSource { name, executor } => {
                let mut out = BTreeSet::new();
                match executor {
                    UdtfExecutor::AllAgents => {
                        for (idx, inst) in self.state.instances.iter().enumerate() {
                            if inst.processes_data {
                                out.insert(InstanceId::new(idx as u64));
                            }
                        }
                    }
                    UdtfExecutor::AllPems => {
                        for (idx, inst) in self.state.instances.iter().enumerate() {
                            if inst.is_pem() {
                                out.insert(InstanceId::new(idx as u64));
                            }
                        }
                    }
                    UdtfExecutor::AllKelvins => {
                        for (idx, inst) in self.state.instances.iter().enumerate() {
                            if inst.is_kelvin() {
                                out.insert(InstanceId::new(idx as u64));
                            }
                        }
                    }
                    UdtfExecutor::SubsetPem(upid) => {
                        match self.state.instance_by_asid(upid.asid) {
                            Some(idx) if self.state.instances[idx].is_pem() => {
                                out.insert(InstanceId::new(idx as u64));
                            }
                            _ => {
                                return Err(Error::resolution(
                                    format!(
                                        "UDTF '{name}': no producer agent matches UPID {upid}"
                                    ),
                                    pos,
                                ))
                            }
                        }
                    }
                }
                if out.is_empty() {
                    return Err(Error::resolution(
                        format!("UDTF '{name}' has no eligible instance in this fleet"),
                        pos,
                    ));
                }
                Ok(out)
            }
            other => Err(Error::internal(format!(
                "{} is not a source operator",
                other.tag()
            ))),
        }
    }

    /// The instance that merges and finishes the query: the first one that
    /// processes data and accepts remote streams.
    fn aggregator_instance(&self, pos: Option<SourcePos>) -> Result<InstanceId> {
        self.state
            .instances
            .iter()
            .position(|i| i.processes_data && i.accepts_remote_sources)
            .map(|idx| InstanceId::new(idx as u64))
            .ok_or_else(|| {
                Error::resolution("no instance in the fleet accepts remote streams", pos)
            })
    }

    // ---- steps 2 + 3: materialization and boundary insertion ----

    fn materialize(&mut self, id: NodeId) -> Result<()> {
        let placement = self
            .placements
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::internal(format!("{id} was not placed")))?;

        let src = self.graph;
        for &inst in &placement.instances {
            self.ensure_instance(inst)?;
            let local = self.instance_graph(inst)?.import_op(src, id)?;
            self.copies.insert((id, inst), local);
        }

        let parents = self.graph.get_op(id)?.parents.clone();
        for parent in parents {
            let parent_placement = self
                .placements
                .get(&parent)
                .cloned()
                .ok_or_else(|| Error::internal(format!("parent {parent} was not placed")))?;

            if parent_placement == placement {
                // Same instances, same region: plain local edges.
                for &inst in &placement.instances {
                    let p = self.copy_of(parent, inst)?;
                    let c = self.copy_of(id, inst)?;
                    self.instance_graph(inst)?.connect(p, c)?;
                }
            } else {
                self.insert_boundary(parent, &parent_placement, id, &placement)?;
            }
        }
        Ok(())
    }

    /// Replaces a region- or instance-crossing edge with GRPC boundary
    /// operators: one sink per producing instance, one source per producer
    /// on the consuming side, and a union when more than one stream fans in.
    fn insert_boundary(
        &mut self,
        parent: NodeId,
        parent_placement: &Placement,
        child: NodeId,
        child_placement: &Placement,
    ) -> Result<()> {
        let mut consumers = child_placement.instances.iter();
        let consumer = match (consumers.next(), consumers.next()) {
            (Some(&c), None) => c,
            _ => {
                return Err(Error::internal(format!(
                    "boundary consumer {child} must be pinned to one instance, got {}",
                    child_placement.instances.len()
                )))
            }
        };
        let relation = self.graph.get_op(parent)?.relation().cloned();

        let mut source_ids = Vec::new();
        for &producer in &parent_placement.instances {
            // Injection point in the consumer's subgraph; the producer's
            // sink routes to it by id.
            let source_id = self
                .instance_graph(consumer)?
                .create_grpc_source(relation.clone())?;
            source_ids.push(source_id);

            let producer_local = self.copy_of(parent, producer)?;
            let destinations = BTreeMap::from([(producer, source_id)]);
            self.instance_graph(producer)?
                .create_grpc_sink(producer_local, destinations)?;

            tracing::debug!(
                producer = producer.get(),
                consumer = consumer.get(),
                destination = source_id.get(),
                "inserted GRPC boundary"
            );
            self.routes.push((producer, consumer));
        }

        let feeder = if source_ids.len() == 1 {
            source_ids[0]
        } else {
            // Several producers fan into one consumer: merge the streams.
            // Batches are schema-identical; no cross-producer ordering is
            // implied.
            let union = self.instance_graph(consumer)?.create_union(source_ids)?;
            if let Some(rel) = relation {
                self.instance_graph(consumer)?.set_relation(union, rel)?;
            }
            union
        };
        let child_local = self.copy_of(child, consumer)?;
        self.instance_graph(consumer)?.connect(feeder, child_local)
    }

    // ---- bookkeeping ----

    fn ensure_instance(&mut self, id: InstanceId) -> Result<()> {
        if self.instances.contains_key(&id) {
            return Ok(());
        }
        let spec = self
            .state
            .instances
            .get(id.get() as usize)
            .cloned()
            .ok_or_else(|| Error::internal(format!("{id} is not in the distributed state")))?;
        self.instances.insert(
            id,
            PlannedInstance {
                id,
                spec,
                graph: Graph::new(),
            },
        );
        Ok(())
    }

    fn instance_graph(&mut self, id: InstanceId) -> Result<&mut Graph> {
        self.ensure_instance(id)?;
        self.instances
            .get_mut(&id)
            .map(|i| &mut i.graph)
            .ok_or_else(|| Error::internal(format!("{id} vanished after creation")))
    }

    fn copy_of(&self, node: NodeId, inst: InstanceId) -> Result<NodeId> {
        self.copies.get(&(node, inst)).copied().ok_or_else(|| {
            Error::internal(format!("{node} has no copy on {inst}"))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use splinter_core::relation::{ColumnSpec, Relation};
    use splinter_core::types::DataType;
    use crate::state::{InstanceSpec, TableSpec};
    use uuid::Uuid;

    fn agent(n: u128) -> Uuid {
        Uuid::from_u128(n)
    }

    fn pem(addr: &str, id: u128, asid: u32) -> InstanceSpec {
        InstanceSpec {
            query_broker_address: addr.into(),
            agent_id: agent(id),
            asid,
            grpc_address: String::new(),
            has_grpc_server: false,
            has_data_store: true,
            processes_data: true,
            accepts_remote_sources: false,
        }
    }

    fn kelvin(addr: &str, id: u128) -> InstanceSpec {
        InstanceSpec {
            query_broker_address: addr.into(),
            agent_id: agent(id),
            asid: 0,
            grpc_address: "1111".into(),
            has_grpc_server: true,
            has_data_store: false,
            processes_data: true,
            accepts_remote_sources: true,
        }
    }

    fn rel() -> Relation {
        Relation::new(vec![
            ColumnSpec::new("time_", DataType::Time64Ns),
            ColumnSpec::new("cpu_cycles", DataType::Int64),
        ])
    }

    fn one_pem_one_kelvin() -> DistributedState {
        DistributedState {
            instances: vec![pem("pem", 1, 123), kelvin("kelvin", 2)],
            tables: vec![TableSpec {
                name: "table".into(),
                relation: rel(),
                // The aggregator is listed as an owner too; it must still be
                // excluded because it has no data store.
                agent_ids: vec![agent(1), agent(2)],
            }],
        }
    }

    fn scan_query() -> Graph {
        let mut g = Graph::new();
        let src = g.create_mem_source("table", vec![]).unwrap();
        g.set_relation(src, rel()).unwrap();
        let sink = g.create_mem_sink(src, "out").unwrap();
        g.set_relation(sink, rel()).unwrap();
        g
    }

    #[test]
    fn unknown_table_fails_resolution() {
        let mut g = Graph::new();
        let src = g.create_mem_source("nope", vec![]).unwrap();
        g.set_relation(src, rel()).unwrap();
        g.create_mem_sink(src, "out").unwrap();
        let err = DistributedPlanner::new()
            .plan(&g, &one_pem_one_kelvin())
            .unwrap_err();
        assert!(err.to_string().contains("'nope'"));
        assert!(!err.is_internal());
    }

    #[test]
    fn scan_splits_across_pem_and_kelvin() {
        let plan = DistributedPlanner::new()
            .plan(&scan_query(), &one_pem_one_kelvin())
            .unwrap();
        assert_eq!(plan.len(), 2);
        let order = plan.topological_order().unwrap();
        // Producer streams into the aggregator.
        assert_eq!(order, vec![InstanceId::new(0), InstanceId::new(1)]);
    }

    #[test]
    fn planning_twice_gives_the_same_fingerprint() {
        let planner = DistributedPlanner::new();
        let state = one_pem_one_kelvin();
        let a = planner.plan(&scan_query(), &state).unwrap();
        let b = planner.plan(&scan_query(), &state).unwrap();
        assert_eq!(a.fingerprint().unwrap(), b.fingerprint().unwrap());
    }
}
