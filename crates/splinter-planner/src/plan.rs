//! The distributed plan: a DAG of physical instances, each holding its own
//! IR subgraph with an independent id space. Immutable once planning
//! returns.

use crate::state::InstanceSpec;
use serde::{Deserialize, Serialize};
use splinter_core::error::{Error, Result};
use splinter_core::hash::{hash_serde, Hash256};
use splinter_core::id::InstanceId;
use splinter_ir::{Dag, Graph};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannedInstance {
    pub id: InstanceId,
    pub spec: InstanceSpec,
    pub graph: Graph,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DistributedPlan {
    instances: BTreeMap<InstanceId, PlannedInstance>,
    dag: Dag<InstanceId>,
}

impl DistributedPlan {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&mut self, instance: PlannedInstance) {
        self.dag.add_node(instance.id);
        self.instances.insert(instance.id, instance);
    }

    /// Records a routing edge producer -> consumer. Derived from GRPC
    /// sink/source pairs; same-instance routes are not plan-level edges.
    pub(crate) fn add_route(&mut self, from: InstanceId, to: InstanceId) -> Result<()> {
        if from == to {
            return Ok(());
        }
        self.dag.add_edge(from, to)
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    pub fn has_instance(&self, id: InstanceId) -> bool {
        self.instances.contains_key(&id)
    }

    pub fn get(&self, id: InstanceId) -> Result<&PlannedInstance> {
        self.instances
            .get(&id)
            .ok_or_else(|| Error::internal(format!("{id} is not in the plan")))
    }

    pub fn instance_ids(&self) -> impl Iterator<Item = InstanceId> + '_ {
        self.instances.keys().copied()
    }

    pub fn instances(&self) -> impl Iterator<Item = &PlannedInstance> {
        self.instances.values()
    }

    pub fn dag(&self) -> &Dag<InstanceId> {
        &self.dag
    }

    /// Producer-before-consumer order over instance ids.
    pub fn topological_order(&self) -> Result<Vec<InstanceId>> {
        self.dag.topological_sort()
    }

    /// Structural fingerprint: stable across planning runs on the same
    /// inputs, independent of raw id allocation. Hashes each instance's
    /// broker address, its operator-kind counts, and the shape of the
    /// routing edges.
    pub fn fingerprint(&self) -> Result<Hash256> {
        #[derive(Serialize)]
        struct InstanceSummary {
            broker: String,
            op_counts: BTreeMap<String, usize>,
        }
        #[derive(Serialize)]
        struct PlanSummary {
            instances: Vec<InstanceSummary>,
            routes: Vec<(String, String)>,
        }

        let mut instances = Vec::new();
        for inst in self.instances.values() {
            let mut op_counts: BTreeMap<String, usize> = BTreeMap::new();
            for (_, op) in inst.graph.operators() {
                *op_counts.entry(op.kind.tag().to_string()).or_default() += 1;
            }
            instances.push(InstanceSummary {
                broker: inst.spec.query_broker_address.clone(),
                op_counts,
            });
        }
        instances.sort_by(|a, b| a.broker.cmp(&b.broker));

        let mut routes = Vec::new();
        for from in self.dag.nodes() {
            for to in self.dag.children_of(from) {
                routes.push((
                    self.get(from)?.spec.query_broker_address.clone(),
                    self.get(to)?.spec.query_broker_address.clone(),
                ));
            }
        }
        routes.sort();

        hash_serde(&PlanSummary { instances, routes })
    }

    /// Human-readable rendering: instances in topological order with their
    /// subgraphs nested beneath.
    pub fn debug_string(&self) -> String {
        let mut out = String::new();
        let order = match self.topological_order() {
            Ok(o) => o,
            Err(_) => self.instance_ids().collect(),
        };
        for id in order {
            if let Ok(inst) = self.get(id) {
                out.push_str(&format!(
                    "instance {} ({}):\n",
                    id.get(),
                    inst.spec.query_broker_address
                ));
                for line in inst.graph.debug_string().lines() {
                    out.push_str("  ");
                    out.push_str(line);
                    out.push('\n');
                }
            }
        }
        out
    }
}
