//! Desired-state events delivered to managers.
//!
//! Events are immutable once emitted. The orchestrator owns each event and
//! lends it to every registered manager in turn.

use dpa_types::{IpAddress, IpPrefix, Ipv4Address};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// What an IP set's members look like, and who owns the set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IpSetKind {
    Ip,
    Net,
    IpAndPort,
    /// Gateway pool for egress routing. Owned by the egress manager,
    /// never rendered as a kernel IP set.
    EgressIp,
}

/// Identity of a workload endpoint. Orders by orchestrator, then workload,
/// then endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkloadEndpointId {
    pub orchestrator_id: String,
    pub workload_id: String,
    pub endpoint_id: String,
}

impl WorkloadEndpointId {
    pub fn new(
        orchestrator_id: impl Into<String>,
        workload_id: impl Into<String>,
        endpoint_id: impl Into<String>,
    ) -> Self {
        WorkloadEndpointId {
            orchestrator_id: orchestrator_id.into(),
            workload_id: workload_id.into(),
            endpoint_id: endpoint_id.into(),
        }
    }
}

impl fmt::Display for WorkloadEndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.orchestrator_id, self.workload_id, self.endpoint_id
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct WorkloadEndpoint {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub ipv4_nets: Vec<IpPrefix>,
    #[serde(default)]
    pub ipv6_nets: Vec<IpPrefix>,
    /// Egress gateway pool this endpoint routes through, if any.
    #[serde(default)]
    pub egress_ip_set_id: Option<String>,
}

impl WorkloadEndpoint {
    /// The egress set id, treating an empty string as unset.
    pub fn egress_set(&self) -> Option<&str> {
        self.egress_ip_set_id.as_deref().filter(|id| !id.is_empty())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IfaceState {
    Up,
    Down,
    Unknown,
}

impl fmt::Display for IfaceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            IfaceState::Up => "up",
            IfaceState::Down => "down",
            IfaceState::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// One desired-state update. Managers match on this exhaustively and ignore
/// the variants they do not own.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DataplaneEvent {
    IpSetUpdate {
        id: String,
        kind: IpSetKind,
        members: Vec<String>,
    },
    IpSetDeltaUpdate {
        id: String,
        #[serde(default)]
        added: Vec<String>,
        #[serde(default)]
        removed: Vec<String>,
    },
    IpSetRemove {
        id: String,
    },
    WorkloadEndpointUpdate {
        id: WorkloadEndpointId,
        endpoint: WorkloadEndpoint,
    },
    WorkloadEndpointRemove {
        id: WorkloadEndpointId,
    },
    HostMetadataUpdate {
        hostname: String,
        ipv4_addr: Ipv4Address,
    },
    InterfaceStateUpdate {
        name: String,
        state: IfaceState,
        index: u32,
    },
    /// `addrs` is `None` when the interface has gone away.
    InterfaceAddrsUpdate {
        name: String,
        addrs: Option<BTreeSet<IpAddress>>,
    },
    /// The upstream feed has delivered a complete snapshot.
    InSync,
}

impl DataplaneEvent {
    /// Short label used for logging and metrics.
    pub const fn kind(&self) -> &'static str {
        match self {
            DataplaneEvent::IpSetUpdate { .. } => "ipset_update",
            DataplaneEvent::IpSetDeltaUpdate { .. } => "ipset_delta_update",
            DataplaneEvent::IpSetRemove { .. } => "ipset_remove",
            DataplaneEvent::WorkloadEndpointUpdate { .. } => "workload_endpoint_update",
            DataplaneEvent::WorkloadEndpointRemove { .. } => "workload_endpoint_remove",
            DataplaneEvent::HostMetadataUpdate { .. } => "host_metadata_update",
            DataplaneEvent::InterfaceStateUpdate { .. } => "interface_state_update",
            DataplaneEvent::InterfaceAddrsUpdate { .. } => "interface_addrs_update",
            DataplaneEvent::InSync => "in_sync",
        }
    }
}
