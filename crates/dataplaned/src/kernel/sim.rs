//! In-memory kernel used by tests and by the binary's simulation mode.

use super::{
    IpSetDataplane, KernelRoute, LinkDataplane, LinkInfo, RouteDataplane, RuleDataplane,
    VxlanAttrs,
};
use dpa_manager_common::{IpSetKind, SyncError, SyncResult};
use dpa_types::{IpAddress, IpPrefix, L2Target, Rule, RuleKey, Target};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use tracing::trace;

const DEFAULT_MTU: u32 = 1500;

#[derive(Debug, Default)]
struct KernelState {
    /// table -> destination -> route. One route per destination per table,
    /// whichever interface it was installed on.
    routes: BTreeMap<u32, BTreeMap<IpPrefix, KernelRoute>>,
    /// (iface, overlay ip) -> entry and the tables that asked for it.
    neighs: BTreeMap<(String, IpAddress), (L2Target, BTreeSet<u32>)>,
    rules: BTreeMap<(u32, RuleKey), Rule>,
    sets: BTreeMap<String, (IpSetKind, BTreeSet<String>)>,
    links: BTreeMap<String, LinkInfo>,
    next_link_index: u32,

    failing_tables: BTreeSet<u32>,
    fail_rules: bool,
    fail_ipsets: bool,
    fail_links: bool,

    ops: Vec<String>,
}

impl KernelState {
    fn record(&mut self, op: String) {
        trace!(op = %op, "Simulated kernel mutation");
        self.ops.push(op);
    }

    fn check_table(&self, op: &str, table: u32) -> SyncResult<()> {
        if self.failing_tables.contains(&table) {
            return Err(SyncError::kernel(op, format!("table {} unavailable", table)));
        }
        Ok(())
    }
}

/// A kernel that keeps routes, rules, neighbours, IP sets and links in memory.
///
/// Every successful mutation is appended to an operation log, so tests can
/// assert both on the resulting state and on the order of operations.
/// Failures can be injected per route table, or for all rules, IP sets or
/// link operations.
#[derive(Debug)]
pub struct SimulatedKernel {
    state: Mutex<KernelState>,
}

impl SimulatedKernel {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(KernelState {
                next_link_index: 1,
                ..Default::default()
            }),
        }
    }

    /// Adds a plain link carrying `addrs` and returns its index.
    pub fn add_link(&self, name: &str, addrs: Vec<IpAddress>) -> u32 {
        let mut state = self.state.lock();
        let index = state.next_link_index;
        state.next_link_index += 1;
        state.links.insert(
            name.to_string(),
            LinkInfo {
                name: name.to_string(),
                index,
                mtu: DEFAULT_MTU,
                up: true,
                addrs,
                vxlan: None,
            },
        );
        index
    }

    pub fn set_table_failing(&self, table: u32, failing: bool) {
        let mut state = self.state.lock();
        if failing {
            state.failing_tables.insert(table);
        } else {
            state.failing_tables.remove(&table);
        }
    }

    pub fn set_rules_failing(&self, failing: bool) {
        self.state.lock().fail_rules = failing;
    }

    pub fn set_ipsets_failing(&self, failing: bool) {
        self.state.lock().fail_ipsets = failing;
    }

    pub fn set_links_failing(&self, failing: bool) {
        self.state.lock().fail_links = failing;
    }

    /// Total successful mutations since creation.
    pub fn mutation_count(&self) -> usize {
        self.state.lock().ops.len()
    }

    /// The mutation log, oldest first.
    pub fn ops(&self) -> Vec<String> {
        self.state.lock().ops.clone()
    }

    /// Routes in `table`, ordered by destination.
    pub fn routes(&self, table: u32) -> Vec<KernelRoute> {
        self.state
            .lock()
            .routes
            .get(&table)
            .map(|routes| routes.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn neighbours(&self, iface: &str) -> Vec<L2Target> {
        self.state
            .lock()
            .neighs
            .iter()
            .filter(|((name, _), _)| name == iface)
            .map(|(_, (l2, _))| *l2)
            .collect()
    }

    pub fn rules(&self) -> Vec<Rule> {
        self.state.lock().rules.values().copied().collect()
    }

    /// Installs a rule without recording it, as if another agent had.
    pub fn inject_rule(&self, rule: Rule) {
        self.state
            .lock()
            .rules
            .insert((rule.priority, rule.key()), rule);
    }

    /// Installs a route without recording it, as if another agent had.
    pub fn inject_route(&self, table: u32, iface: &str, target: Target) {
        self.state.lock().routes.entry(table).or_default().insert(
            target.cidr,
            KernelRoute {
                iface: iface.to_string(),
                target,
            },
        );
    }

    pub fn ip_set(&self, name: &str) -> Option<BTreeSet<String>> {
        self.state.lock().sets.get(name).map(|(_, m)| m.clone())
    }

    pub fn link(&self, name: &str) -> Option<LinkInfo> {
        self.state.lock().links.get(name).cloned()
    }
}

impl Default for SimulatedKernel {
    fn default() -> Self {
        Self::new()
    }
}

impl RouteDataplane for SimulatedKernel {
    fn route_replace(&self, table: u32, iface: &str, target: &Target) -> SyncResult<()> {
        let mut state = self.state.lock();
        state.check_table("route_replace", table)?;
        let routes = state.routes.entry(table).or_default();
        if let Some(existing) = routes.get(&target.cidr) {
            if existing.iface != iface {
                return Err(SyncError::kernel(
                    "route_replace",
                    format!("{} in table {}: file exists", target.cidr, table),
                ));
            }
        }
        routes.insert(
            target.cidr,
            KernelRoute {
                iface: iface.to_string(),
                target: target.clone(),
            },
        );
        state.record(format!("route_replace {} {} {}", table, iface, target));
        Ok(())
    }

    fn route_del(&self, table: u32, iface: &str, cidr: &IpPrefix) -> SyncResult<()> {
        let mut state = self.state.lock();
        state.check_table("route_del", table)?;
        if let Some(routes) = state.routes.get_mut(&table) {
            if routes.get(cidr).is_some_and(|r| r.iface == iface) {
                routes.remove(cidr);
            }
        }
        state.record(format!("route_del {} {} {}", table, iface, cidr));
        Ok(())
    }

    fn neigh_set(&self, table: u32, iface: &str, l2: &L2Target) -> SyncResult<()> {
        let mut state = self.state.lock();
        state.check_table("neigh_set", table)?;
        if !state.links.contains_key(iface) {
            return Err(SyncError::interface_missing(iface));
        }
        let entry = state
            .neighs
            .entry((iface.to_string(), l2.ip))
            .or_insert_with(|| (*l2, BTreeSet::new()));
        entry.0 = *l2;
        entry.1.insert(table);
        state.record(format!("neigh_set {} {} {} {}", table, iface, l2.ip, l2.vtep_mac));
        Ok(())
    }

    fn neigh_del(&self, table: u32, iface: &str, l2: &L2Target) -> SyncResult<()> {
        let mut state = self.state.lock();
        state.check_table("neigh_del", table)?;
        let key = (iface.to_string(), l2.ip);
        if let Some((_, owners)) = state.neighs.get_mut(&key) {
            owners.remove(&table);
            if owners.is_empty() {
                state.neighs.remove(&key);
            }
        }
        state.record(format!("neigh_del {} {} {}", table, iface, l2.ip));
        Ok(())
    }

    fn list_routes(&self, table: u32) -> SyncResult<Vec<KernelRoute>> {
        let state = self.state.lock();
        state.check_table("list_routes", table)?;
        Ok(state
            .routes
            .get(&table)
            .map(|routes| routes.values().cloned().collect())
            .unwrap_or_default())
    }
}

impl RuleDataplane for SimulatedKernel {
    fn rule_add(&self, rule: &Rule) -> SyncResult<()> {
        let mut state = self.state.lock();
        if state.fail_rules {
            return Err(SyncError::kernel("rule_add", "operation not permitted"));
        }
        state.rules.insert((rule.priority, rule.key()), *rule);
        state.record(format!("rule_add {}", rule));
        Ok(())
    }

    fn rule_del(&self, rule: &Rule) -> SyncResult<()> {
        let mut state = self.state.lock();
        if state.fail_rules {
            return Err(SyncError::kernel("rule_del", "operation not permitted"));
        }
        state.rules.remove(&(rule.priority, rule.key()));
        state.record(format!("rule_del {}", rule));
        Ok(())
    }

    fn list_rules(&self, priority: u32) -> SyncResult<Vec<Rule>> {
        let state = self.state.lock();
        if state.fail_rules {
            return Err(SyncError::kernel("list_rules", "operation not permitted"));
        }
        Ok(state
            .rules
            .iter()
            .filter(|((p, _), _)| *p == priority)
            .map(|(_, r)| *r)
            .collect())
    }
}

impl IpSetDataplane for SimulatedKernel {
    fn ensure_set(&self, name: &str, kind: IpSetKind, members: &BTreeSet<String>) -> SyncResult<()> {
        let mut state = self.state.lock();
        if state.fail_ipsets {
            return Err(SyncError::kernel("ipset_restore", "set busy"));
        }
        state.sets.insert(name.to_string(), (kind, members.clone()));
        state.record(format!("ipset_ensure {} ({} members)", name, members.len()));
        Ok(())
    }

    fn delete_set(&self, name: &str) -> SyncResult<()> {
        let mut state = self.state.lock();
        if state.fail_ipsets {
            return Err(SyncError::kernel("ipset_destroy", "set in use"));
        }
        state.sets.remove(name);
        state.record(format!("ipset_delete {}", name));
        Ok(())
    }

    fn list_sets(&self) -> SyncResult<Vec<String>> {
        let state = self.state.lock();
        if state.fail_ipsets {
            return Err(SyncError::kernel("ipset_list", "set busy"));
        }
        Ok(state.sets.keys().cloned().collect())
    }
}

impl LinkDataplane for SimulatedKernel {
    fn link_list(&self) -> SyncResult<Vec<LinkInfo>> {
        let state = self.state.lock();
        if state.fail_links {
            return Err(SyncError::kernel("link_list", "netlink socket closed"));
        }
        Ok(state.links.values().cloned().collect())
    }

    fn link_by_name(&self, name: &str) -> SyncResult<Option<LinkInfo>> {
        let state = self.state.lock();
        if state.fail_links {
            return Err(SyncError::kernel("link_by_name", "netlink socket closed"));
        }
        Ok(state.links.get(name).cloned())
    }

    fn vxlan_add(&self, name: &str, attrs: &VxlanAttrs) -> SyncResult<()> {
        let mut state = self.state.lock();
        if state.fail_links {
            return Err(SyncError::kernel("link_add", "netlink socket closed"));
        }
        if state.links.contains_key(name) {
            return Err(SyncError::kernel("link_add", format!("{}: file exists", name)));
        }
        let index = state.next_link_index;
        state.next_link_index += 1;
        state.links.insert(
            name.to_string(),
            LinkInfo {
                name: name.to_string(),
                index,
                mtu: DEFAULT_MTU,
                up: false,
                addrs: Vec::new(),
                vxlan: Some(*attrs),
            },
        );
        state.record(format!("link_add {} vni {} index {}", name, attrs.vni, index));
        Ok(())
    }

    fn link_del(&self, name: &str) -> SyncResult<()> {
        let mut state = self.state.lock();
        if state.fail_links {
            return Err(SyncError::kernel("link_del", "netlink socket closed"));
        }
        if state.links.remove(name).is_none() {
            return Err(SyncError::interface_missing(name));
        }
        state.neighs.retain(|(iface, _), _| iface != name);
        state.record(format!("link_del {}", name));
        Ok(())
    }

    fn link_set_mtu(&self, name: &str, mtu: u32) -> SyncResult<()> {
        let mut state = self.state.lock();
        if state.fail_links {
            return Err(SyncError::kernel("link_set_mtu", "netlink socket closed"));
        }
        let link = state
            .links
            .get_mut(name)
            .ok_or_else(|| SyncError::interface_missing(name))?;
        link.mtu = mtu;
        state.record(format!("link_set_mtu {} {}", name, mtu));
        Ok(())
    }

    fn link_set_up(&self, name: &str) -> SyncResult<()> {
        let mut state = self.state.lock();
        if state.fail_links {
            return Err(SyncError::kernel("link_set_up", "netlink socket closed"));
        }
        let link = state
            .links
            .get_mut(name)
            .ok_or_else(|| SyncError::interface_missing(name))?;
        if link.up {
            return Ok(());
        }
        link.up = true;
        state.record(format!("link_set_up {}", name));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dpa_types::{Ipv4Address, MacAddress, INTERFACE_NONE};
    use pretty_assertions::assert_eq;

    fn default_route() -> IpPrefix {
        IpPrefix::default_v4()
    }

    #[test]
    fn test_conflicting_interface_rejected() {
        let kernel = SimulatedKernel::new();
        kernel
            .route_replace(3, INTERFACE_NONE, &Target::unreachable(default_route()))
            .unwrap();

        let single = Target::vxlan_single(default_route(), "10.0.0.1".parse().unwrap());
        assert!(kernel.route_replace(3, "egress.calico", &single).is_err());

        kernel.route_del(3, INTERFACE_NONE, &default_route()).unwrap();
        kernel.route_replace(3, "egress.calico", &single).unwrap();
        assert_eq!(kernel.routes(3).len(), 1);
        assert_eq!(kernel.mutation_count(), 3);
    }

    #[test]
    fn test_failing_table() {
        let kernel = SimulatedKernel::new();
        kernel.set_table_failing(5, true);
        assert!(kernel
            .route_replace(5, INTERFACE_NONE, &Target::unreachable(default_route()))
            .is_err());
        assert!(kernel
            .route_replace(6, INTERFACE_NONE, &Target::unreachable(default_route()))
            .is_ok());
        kernel.set_table_failing(5, false);
        assert!(kernel.list_routes(5).unwrap().is_empty());
    }

    #[test]
    fn test_shared_neighbour_kept_until_last_owner() {
        let kernel = SimulatedKernel::new();
        kernel.add_link("egress.calico", Vec::new());
        let gw = Ipv4Address::new(10, 0, 0, 1);
        let l2 = L2Target {
            vtep_mac: MacAddress::vtep_for(gw),
            gw: gw.into(),
            ip: gw.into(),
        };
        kernel.neigh_set(1, "egress.calico", &l2).unwrap();
        kernel.neigh_set(2, "egress.calico", &l2).unwrap();
        kernel.neigh_del(1, "egress.calico", &l2).unwrap();
        assert_eq!(kernel.neighbours("egress.calico"), vec![l2]);
        kernel.neigh_del(2, "egress.calico", &l2).unwrap();
        assert!(kernel.neighbours("egress.calico").is_empty());
    }

    #[test]
    fn test_list_rules_by_priority() {
        let kernel = SimulatedKernel::new();
        kernel.rule_add(&Rule::new(100).match_fwmark(0x200).go_to_table(1)).unwrap();
        kernel.rule_add(&Rule::new(101).match_fwmark(0x200).go_to_table(2)).unwrap();
        let rules = kernel.list_rules(100).unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].table, 1);
    }

    #[test]
    fn test_link_set_up_only_records_change() {
        let kernel = SimulatedKernel::new();
        kernel.add_link("eth0", vec!["192.168.0.5".parse().unwrap()]);
        kernel.link_set_up("eth0").unwrap();
        assert_eq!(kernel.mutation_count(), 0);
        assert!(kernel.link_set_up("missing").is_err());
    }
}
