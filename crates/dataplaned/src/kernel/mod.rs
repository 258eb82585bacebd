//! Kernel shims.
//!
//! Resource syncers never talk to the kernel directly; they go through these
//! traits so that the same syncer logic runs against netlink in production
//! and against [`SimulatedKernel`] in tests and simulation mode.

mod sim;

pub use sim::SimulatedKernel;

use dpa_manager_common::{IpSetKind, SyncResult};
use dpa_types::{IpAddress, IpPrefix, Ipv4Address, L2Target, Rule, Target};
use std::collections::BTreeSet;

/// A route as read back from a kernel table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelRoute {
    pub iface: String,
    pub target: Target,
}

pub trait RouteDataplane: Send + Sync {
    /// Adds or replaces the route for `target.cidr` in `table`.
    fn route_replace(&self, table: u32, iface: &str, target: &Target) -> SyncResult<()>;

    fn route_del(&self, table: u32, iface: &str, cidr: &IpPrefix) -> SyncResult<()>;

    /// Installs the ARP and FDB entries for a remote VTEP. `table` names the
    /// route table that wants the entry; the kernel keeps it while any table
    /// still does.
    fn neigh_set(&self, table: u32, iface: &str, l2: &L2Target) -> SyncResult<()>;

    fn neigh_del(&self, table: u32, iface: &str, l2: &L2Target) -> SyncResult<()>;

    fn list_routes(&self, table: u32) -> SyncResult<Vec<KernelRoute>>;
}

pub trait RuleDataplane: Send + Sync {
    fn rule_add(&self, rule: &Rule) -> SyncResult<()>;

    fn rule_del(&self, rule: &Rule) -> SyncResult<()>;

    /// Every rule installed at `priority`.
    fn list_rules(&self, priority: u32) -> SyncResult<Vec<Rule>>;
}

pub trait IpSetDataplane: Send + Sync {
    /// Creates the set if missing and rewrites its members.
    fn ensure_set(&self, name: &str, kind: IpSetKind, members: &BTreeSet<String>) -> SyncResult<()>;

    fn delete_set(&self, name: &str) -> SyncResult<()>;

    fn list_sets(&self) -> SyncResult<Vec<String>>;
}

/// VXLAN attributes compared when deciding whether a device must be recreated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VxlanAttrs {
    pub vni: u32,
    pub port: u16,
    pub parent_index: u32,
    pub src_addr: Ipv4Address,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkInfo {
    pub name: String,
    pub index: u32,
    pub mtu: u32,
    pub up: bool,
    pub addrs: Vec<IpAddress>,
    pub vxlan: Option<VxlanAttrs>,
}

pub trait LinkDataplane: Send + Sync {
    fn link_list(&self) -> SyncResult<Vec<LinkInfo>>;

    fn link_by_name(&self, name: &str) -> SyncResult<Option<LinkInfo>>;

    fn vxlan_add(&self, name: &str, attrs: &VxlanAttrs) -> SyncResult<()>;

    fn link_del(&self, name: &str) -> SyncResult<()>;

    fn link_set_mtu(&self, name: &str, mtu: u32) -> SyncResult<()>;

    fn link_set_up(&self, name: &str) -> SyncResult<()>;
}
