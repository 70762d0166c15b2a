//! Read-only snapshot of the fleet at planning time.
//!
//! Supplied by the control plane; the planner only reads it. Concurrent
//! planning calls each take their own snapshot.

use serde::{Deserialize, Serialize};
use splinter_core::relation::Relation;
use uuid::Uuid;

/// Capabilities and identity of one physical instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceSpec {
    pub query_broker_address: String,
    pub agent_id: Uuid,
    /// Short agent system id; UDTF subset placement matches against it.
    #[serde(default)]
    pub asid: u32,
    #[serde(default)]
    pub grpc_address: String,
    #[serde(default)]
    pub has_grpc_server: bool,
    #[serde(default)]
    pub has_data_store: bool,
    #[serde(default)]
    pub processes_data: bool,
    #[serde(default)]
    pub accepts_remote_sources: bool,
}

impl InstanceSpec {
    /// Producer-class: owns a local data store that originates table data.
    pub fn is_pem(&self) -> bool {
        self.has_data_store && self.processes_data
    }

    /// Aggregator-class: no local store; merges and finishes queries.
    pub fn is_kelvin(&self) -> bool {
        !self.has_data_store && self.processes_data
    }
}

/// One table known to the fleet: its relation and which agents own data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableSpec {
    pub name: String,
    pub relation: Relation,
    pub agent_ids: Vec<Uuid>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DistributedState {
    pub instances: Vec<InstanceSpec>,
    pub tables: Vec<TableSpec>,
}

impl DistributedState {
    pub fn table(&self, name: &str) -> Option<&TableSpec> {
        self.tables.iter().find(|t| t.name == name)
    }

    /// Index of the instance owned by `agent_id`, in state order. Instance
    /// ids are these indices.
    pub fn instance_by_agent(&self, agent_id: Uuid) -> Option<usize> {
        self.instances.iter().position(|i| i.agent_id == agent_id)
    }

    pub fn instance_by_asid(&self, asid: u32) -> Option<usize> {
        self.instances.iter().position(|i| i.asid == asid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use splinter_core::relation::ColumnSpec;
    use splinter_core::types::DataType;

    #[test]
    fn state_deserializes_from_json() {
        let json = r#"{
            "instances": [
                {
                    "query_broker_address": "pem",
                    "agent_id": "00000001-0000-0000-0000-000000000001",
                    "asid": 123,
                    "has_data_store": true,
                    "processes_data": true
                },
                {
                    "query_broker_address": "kelvin",
                    "agent_id": "00000001-0000-0000-0000-000000000002",
                    "grpc_address": "1111",
                    "has_grpc_server": true,
                    "processes_data": true,
                    "accepts_remote_sources": true
                }
            ],
            "tables": [
                {
                    "name": "table",
                    "relation": { "columns": [
                        { "name": "time_", "ty": "Time64Ns" },
                        { "name": "cpu_cycles", "ty": "Int64" }
                    ]},
                    "agent_ids": ["00000001-0000-0000-0000-000000000001"]
                }
            ]
        }"#;
        let state: DistributedState = serde_json::from_str(json).unwrap();
        assert_eq!(state.instances.len(), 2);
        assert!(state.instances[0].is_pem());
        assert!(state.instances[1].is_kelvin());
        let t = state.table("table").unwrap();
        assert_eq!(
            t.relation,
            Relation::new(vec![
                ColumnSpec::new("time_", DataType::Time64Ns),
                ColumnSpec::new("cpu_cycles", DataType::Int64),
            ])
        );
        assert_eq!(state.instance_by_asid(123), Some(0));
        assert!(state.table("missing").is_none());
    }
}
