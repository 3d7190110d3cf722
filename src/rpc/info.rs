use std::net::SocketAddr;

use super::{MaintenanceTask, Rpc};
use crate::common::Id;

/// Information and statistics about this [crate::Dht] node.
#[derive(Debug, Clone)]
pub struct Info {
    id: Id,
    local_addr: SocketAddr,
    routing_table_size: usize,
    stored_records: usize,
    inflight_requests: usize,
    scheduled: Vec<MaintenanceTask>,
}

impl Info {
    /// This Node's [Id]
    pub fn id(&self) -> &Id {
        &self.id
    }
    /// Address that this node is listening on.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
    /// Number of contacts in the routing table.
    pub fn routing_table_size(&self) -> usize {
        self.routing_table_size
    }
    /// Number of records in the local store, expired or not.
    pub fn stored_records(&self) -> usize {
        self.stored_records
    }
    /// Requests still waiting for a response.
    pub fn inflight_requests(&self) -> usize {
        self.inflight_requests
    }
    /// Maintenance tasks that were not cancelled.
    pub fn scheduled(&self) -> &[MaintenanceTask] {
        &self.scheduled
    }
}

impl From<&Rpc> for Info {
    fn from(rpc: &Rpc) -> Self {
        Self {
            id: rpc.id().clone(),
            local_addr: rpc.local_addr(),
            routing_table_size: rpc.routing_table().size(),
            stored_records: rpc.store().len(),
            inflight_requests: rpc.inbox.len(),
            scheduled: MaintenanceTask::ALL
                .into_iter()
                .filter(|task| rpc.is_scheduled(*task))
                .collect(),
        }
    }
}
