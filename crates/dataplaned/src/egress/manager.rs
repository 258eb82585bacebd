use async_trait::async_trait;
use dpa_manager_common::{
    BindingTable, DataplaneEvent, IndexAllocator, IpSetKind, Manager, ManagerError, ManagerResult,
    SharedRouteRules, SharedRouteTable, WorkloadEndpoint, WorkloadEndpointId,
};
use dpa_types::{
    IpAddress, IpPrefix, Ipv4Address, L2Target, MacAddress, NextHop, Rule, RuleKey, Target,
    INTERFACE_NONE,
};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::vxlan::SharedVxlanState;
use crate::config::EgressConfig;
use crate::metrics::Metrics;
use crate::routetable::RouteTableFactory;

/// An endpoint whose rules are installed.
#[derive(Debug, Clone)]
struct ActiveEndpoint {
    endpoint: WorkloadEndpoint,
    group: String,
    rules: BTreeSet<RuleKey>,
}

/// Programs one routing table per egress gateway group and steers each
/// workload's marked traffic into its group's table.
///
/// Groups move from unbound to bound the first time they are reconciled with
/// at least one member. A bound group keeps its table until the group itself
/// is removed; an empty bound group gets an unreachable default route.
/// Endpoints that reference a group without a table wait in `pending` and
/// are retried on every pass.
pub struct EgressIpManager {
    config: EgressConfig,
    hostname: String,

    rules: SharedRouteRules,
    factory: Box<dyn RouteTableFactory>,
    allocator: IndexAllocator,
    /// Every table ever created, so that drained tables keep being flushed.
    tables: BTreeMap<u32, SharedRouteTable>,
    bindings: BindingTable<String>,

    groups: BTreeMap<String, BTreeSet<String>>,
    dirty_groups: BTreeSet<String>,

    active: BTreeMap<WorkloadEndpointId, ActiveEndpoint>,
    /// `None` means the endpoint was removed.
    pending: BTreeMap<WorkloadEndpointId, Option<WorkloadEndpoint>>,

    vxlan: SharedVxlanState,
    last_link_index: Option<u32>,
    metrics: Arc<Metrics>,
}

impl EgressIpManager {
    pub fn new(
        config: EgressConfig,
        hostname: impl Into<String>,
        rules: SharedRouteRules,
        factory: Box<dyn RouteTableFactory>,
        vxlan: SharedVxlanState,
        metrics: Arc<Metrics>,
    ) -> Self {
        let allocator = IndexAllocator::from_indices(config.table_indices());
        Self {
            config,
            hostname: hostname.into(),
            rules,
            factory,
            allocator,
            tables: BTreeMap::new(),
            bindings: BindingTable::new(),
            groups: BTreeMap::new(),
            dirty_groups: BTreeSet::new(),
            active: BTreeMap::new(),
            pending: BTreeMap::new(),
            vxlan,
            last_link_index: None,
            metrics,
        }
    }

    /// Table index leased to `group`, if any.
    pub fn table_for(&self, group: &str) -> Option<u32> {
        self.bindings.index_of(&group.to_string())
    }

    pub fn table(&self, index: u32) -> Option<SharedRouteTable> {
        self.tables.get(&index).cloned()
    }

    pub fn is_pending(&self, id: &WorkloadEndpointId) -> bool {
        self.pending.contains_key(id)
    }

    pub fn allocator(&self) -> &IndexAllocator {
        &self.allocator
    }

    fn default_route() -> IpPrefix {
        IpPrefix::default_v4()
    }

    /// Gateway addresses of a group. Members may carry a prefix length;
    /// anything that is not an IPv4 address is skipped.
    fn gateways(group: &str, members: &BTreeSet<String>) -> BTreeSet<Ipv4Address> {
        members
            .iter()
            .filter_map(|member| {
                let addr = member.split('/').next().unwrap_or(member);
                match addr.parse::<Ipv4Address>() {
                    Ok(ip) => Some(ip),
                    Err(_) => {
                        warn!(group, member = %member, "Skipping unparseable egress gateway");
                        None
                    }
                }
            })
            .collect()
    }

    fn endpoint_rules(&self, endpoint: &WorkloadEndpoint, table: u32) -> BTreeMap<RuleKey, Rule> {
        endpoint
            .ipv4_nets
            .iter()
            .map(|net| {
                let rule = Rule::new(self.config.rule_priority)
                    .match_src(*net)
                    .match_fwmark(self.config.fwmark)
                    .go_to_table(table);
                (rule.key(), rule)
            })
            .collect()
    }

    fn rule_from_key(&self, key: RuleKey) -> Rule {
        Rule {
            priority: self.config.rule_priority,
            src: key.src,
            fwmark: key.fwmark,
            table: key.table,
        }
    }

    fn set_group_members(&mut self, id: &str, members: BTreeSet<String>) {
        self.groups.insert(id.to_string(), members);
        self.dirty_groups.insert(id.to_string());
    }

    fn table_or_create(&mut self, index: u32) -> SharedRouteTable {
        if let Some(table) = self.tables.get(&index) {
            return Arc::clone(table);
        }
        info!(table = index, "EgressIpManager: creating route table");
        let table = self.factory.new_route_table(index);
        self.tables.insert(index, Arc::clone(&table));
        table
    }

    /// Programs the default route and VTEP neighbours for a bound group.
    async fn program_group(
        &self,
        group: &str,
        table: &SharedRouteTable,
        gateways: &BTreeSet<Ipv4Address>,
        link_index: u32,
    ) {
        let device = self.config.vxlan_device.as_str();
        let default = Self::default_route();
        let mut rt = table.lock().await;
        let index = rt.index();

        match gateways.len() {
            0 => {
                info!(group, table = index, "EgressIpManager: no gateways, installing unreachable route");
                rt.route_remove(device, default);
                rt.set_routes(INTERFACE_NONE, vec![Target::unreachable(default)]);
            }
            1 => {
                let gw = gateways.iter().next().copied().map(IpAddress::from);
                if let Some(gw) = gw {
                    info!(group, table = index, gateway = %gw, "EgressIpManager: single path route");
                    rt.route_remove(INTERFACE_NONE, default);
                    rt.set_routes(device, vec![Target::vxlan_single(default, gw)]);
                }
            }
            n => {
                let hops = gateways.iter().map(|gw| NextHop {
                    gw: IpAddress::from(*gw),
                    link_index: Some(link_index),
                });
                info!(group, table = index, gateways = n, "EgressIpManager: ECMP route");
                rt.route_remove(device, default);
                rt.set_routes(INTERFACE_NONE, vec![Target::vxlan_multipath(default, hops)]);
            }
        }

        let l2: Vec<L2Target> = gateways
            .iter()
            .map(|gw| L2Target {
                vtep_mac: MacAddress::vtep_for(*gw),
                gw: IpAddress::from(*gw),
                ip: IpAddress::from(*gw),
            })
            .collect();
        rt.set_l2_routes(device, l2);
    }

    /// Flushes a removed group's routes, returns its index to the pool and
    /// sends its endpoints back to pending. The flush is queued on the table
    /// before the index is released.
    async fn drain_group(&mut self, group: &str) -> ManagerResult<()> {
        let Some(index) = self.bindings.index_of(&group.to_string()) else {
            debug!(group, "EgressIpManager: removed group was never bound");
            return Ok(());
        };

        let device = self.config.vxlan_device.clone();
        match self.tables.get(&index) {
            Some(table) => {
                let mut rt = table.lock().await;
                rt.route_remove(INTERFACE_NONE, Self::default_route());
                rt.route_remove(&device, Self::default_route());
                rt.set_l2_routes(&device, Vec::new());
            }
            None => {
                return Err(ManagerError::fatal(format!(
                    "group {} bound to table {} that was never created",
                    group, index
                )));
            }
        }

        let affected: Vec<WorkloadEndpointId> = self
            .active
            .iter()
            .filter(|(_, ep)| ep.group == group)
            .map(|(id, _)| id.clone())
            .collect();
        if !affected.is_empty() {
            let mut rules = self.rules.lock().await;
            for id in affected {
                if let Some(ep) = self.active.remove(&id) {
                    for key in &ep.rules {
                        rules.remove_rule(self.rule_from_key(*key));
                    }
                    debug!(endpoint = %id, group, "EgressIpManager: endpoint back to pending");
                    self.pending.entry(id).or_insert(Some(ep.endpoint));
                }
            }
        }

        self.bindings.unbind(&group.to_string())?;
        self.allocator.release(index);
        info!(group, table = index, "EgressIpManager: released route table");
        Ok(())
    }

    async fn reconcile_groups(&mut self, link_index: u32) -> ManagerResult<()> {
        let dirty: Vec<String> = std::mem::take(&mut self.dirty_groups).into_iter().collect();
        for group in dirty {
            let Some(members) = self.groups.get(&group) else {
                self.drain_group(&group).await?;
                continue;
            };
            let gateways = Self::gateways(&group, members);

            let index = match self.bindings.index_of(&group) {
                Some(index) => index,
                None if gateways.is_empty() => {
                    debug!(group = %group, "EgressIpManager: group has no gateways yet");
                    continue;
                }
                None => {
                    let index = self.allocator.claim()?;
                    self.bindings.bind(group.clone(), index)?;
                    info!(group = %group, table = index, "EgressIpManager: leased route table");
                    index
                }
            };

            let table = self.table_or_create(index);
            self.program_group(&group, &table, &gateways, link_index).await;
        }
        Ok(())
    }

    async fn reconcile_endpoints(&mut self) -> ManagerResult<()> {
        let pending = std::mem::take(&mut self.pending);
        let mut rules = self.rules.lock().await;

        for (id, update) in pending {
            let wanted = update.as_ref().and_then(|ep| {
                ep.egress_set()
                    .map(|group| (ep, group.to_string(), self.bindings.index_of(&group.to_string())))
            });

            match wanted {
                Some((_, group, None)) => {
                    debug!(endpoint = %id, group = %group, "EgressIpManager: waiting for group table");
                    if let Some(old) = self.active.get(&id) {
                        if old.group != group {
                            for key in &old.rules {
                                rules.remove_rule(self.rule_from_key(*key));
                            }
                            self.active.remove(&id);
                        }
                    }
                    self.pending.insert(id, update);
                }
                Some((endpoint, group, Some(table))) => {
                    let new_rules = self.endpoint_rules(endpoint, table);
                    if let Some(old) = self.active.get(&id) {
                        for key in old.rules.iter().filter(|k| !new_rules.contains_key(k)) {
                            rules.remove_rule(self.rule_from_key(*key));
                        }
                    }
                    for rule in new_rules.values() {
                        rules.set_rule(*rule);
                    }
                    debug!(endpoint = %id, group = %group, table, "EgressIpManager: endpoint bound");
                    let endpoint = endpoint.clone();
                    self.active.insert(
                        id,
                        ActiveEndpoint {
                            endpoint,
                            group,
                            rules: new_rules.into_keys().collect(),
                        },
                    );
                }
                None => {
                    if let Some(old) = self.active.remove(&id) {
                        debug!(endpoint = %id, "EgressIpManager: removing endpoint rules");
                        for key in &old.rules {
                            rules.remove_rule(self.rule_from_key(*key));
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Manager for EgressIpManager {
    fn name(&self) -> &str {
        "EgressIpManager"
    }

    fn on_update(&mut self, event: &DataplaneEvent) {
        match event {
            DataplaneEvent::IpSetUpdate { id, kind, members } => {
                if *kind == IpSetKind::EgressIp {
                    debug!(group = %id, members = members.len(), "Egress IP set update");
                    self.set_group_members(id, members.iter().cloned().collect());
                }
            }
            DataplaneEvent::IpSetDeltaUpdate { id, added, removed } => {
                if let Some(members) = self.groups.get_mut(id) {
                    debug!(group = %id, added = added.len(), removed = removed.len(), "Egress IP set delta");
                    members.extend(added.iter().cloned());
                    for m in removed {
                        members.remove(m);
                    }
                    self.dirty_groups.insert(id.clone());
                }
            }
            DataplaneEvent::IpSetRemove { id } => {
                if self.groups.remove(id).is_some() {
                    debug!(group = %id, "Egress IP set removed");
                    self.dirty_groups.insert(id.clone());
                }
            }
            DataplaneEvent::WorkloadEndpointUpdate { id, endpoint } => {
                if endpoint.egress_set().is_some() || self.active.contains_key(id) {
                    self.pending.insert(id.clone(), Some(endpoint.clone()));
                } else {
                    self.pending.remove(id);
                }
            }
            DataplaneEvent::WorkloadEndpointRemove { id } => {
                if self.active.contains_key(id) {
                    self.pending.insert(id.clone(), None);
                } else {
                    self.pending.remove(id);
                }
            }
            DataplaneEvent::HostMetadataUpdate {
                hostname,
                ipv4_addr,
            } => {
                if *hostname == self.hostname {
                    debug!(node_ip = %ipv4_addr, "Local host metadata update");
                    self.vxlan.lock().node_ip = Some(*ipv4_addr);
                }
            }
            DataplaneEvent::InterfaceStateUpdate { .. }
            | DataplaneEvent::InterfaceAddrsUpdate { .. }
            | DataplaneEvent::InSync => {}
        }
    }

    async fn complete_deferred_work(&mut self) -> ManagerResult<()> {
        let link_index = self.vxlan.lock().link_index;
        if link_index != self.last_link_index && link_index.is_some() {
            // Multi-path hops carry the device index.
            if self.last_link_index.is_some() {
                info!(?link_index, "EgressIpManager: VXLAN device changed, reprogramming groups");
            }
            let bound: Vec<String> = self.bindings.iter().map(|(g, _)| g.clone()).collect();
            self.dirty_groups.extend(bound);
            self.last_link_index = link_index;
        }

        if self.dirty_groups.is_empty() && self.pending.is_empty() {
            return Ok(());
        }
        // Dirty state stays buffered; the device keeper wakes the loop once
        // the device exists.
        let Some(link_index) = link_index else {
            debug!(device = %self.config.vxlan_device, "EgressIpManager: waiting for VXLAN device");
            return Ok(());
        };

        let result = match self.reconcile_groups(link_index).await {
            Ok(()) => self.reconcile_endpoints().await,
            Err(e) => Err(e),
        };

        self.metrics
            .egress_tables_in_use
            .set(self.bindings.len() as i64);
        self.metrics
            .egress_pending_endpoints
            .set(self.pending.len() as i64);
        result
    }

    fn route_table_syncers(&self) -> Vec<SharedRouteTable> {
        self.tables.values().cloned().collect()
    }

    fn route_rule_syncers(&self) -> Vec<SharedRouteRules> {
        vec![Arc::clone(&self.rules)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::{RouteDataplane, RuleDataplane, SimulatedKernel};
    use crate::routerule::RouteRules;
    use crate::routetable::KernelRouteTableFactory;
    use pretty_assertions::assert_eq;
    use tokio::sync::Mutex;

    struct Harness {
        kernel: Arc<SimulatedKernel>,
        mgr: EgressIpManager,
    }

    fn harness(last_table: u32) -> Harness {
        let kernel = Arc::new(SimulatedKernel::new());
        kernel.add_link("egress.calico", Vec::new());
        let config = EgressConfig {
            first_table_index: 1,
            last_table_index: last_table,
            ..Default::default()
        };
        let rules: SharedRouteRules = Arc::new(Mutex::new(RouteRules::new(
            config.rule_priority,
            config.table_indices(),
            Arc::clone(&kernel) as Arc<dyn RuleDataplane>,
        )));
        let factory = Box::new(KernelRouteTableFactory::new(
            Arc::clone(&kernel) as Arc<dyn RouteDataplane>
        ));
        let vxlan = SharedVxlanState::default();
        vxlan.lock().link_index = Some(9);
        let mgr = EgressIpManager::new(
            config,
            "node-1",
            rules,
            factory,
            vxlan,
            Arc::new(Metrics::new().unwrap()),
        );
        Harness { kernel, mgr }
    }

    fn group(id: &str, members: &[&str]) -> DataplaneEvent {
        DataplaneEvent::IpSetUpdate {
            id: id.to_string(),
            kind: IpSetKind::EgressIp,
            members: members.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn endpoint(name: &str, group: &str, net: &str) -> (WorkloadEndpointId, DataplaneEvent) {
        let id = WorkloadEndpointId::new("k8s", name, "eth0");
        let ev = DataplaneEvent::WorkloadEndpointUpdate {
            id: id.clone(),
            endpoint: WorkloadEndpoint {
                name: name.to_string(),
                ipv4_nets: vec![net.parse().unwrap()],
                egress_ip_set_id: Some(group.to_string()),
                ..Default::default()
            },
        };
        (id, ev)
    }

    async fn apply_all(mgr: &EgressIpManager) {
        for rt in mgr.route_table_syncers() {
            rt.lock().await.apply().await.unwrap();
        }
        for rr in mgr.route_rule_syncers() {
            rr.lock().await.apply().await.unwrap();
        }
    }

    fn gw(s: &str) -> IpAddress {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn test_empty_group_is_not_leased() {
        let mut h = harness(3);
        h.mgr.on_update(&group("g1", &[]));
        h.mgr.complete_deferred_work().await.unwrap();
        assert_eq!(h.mgr.table_for("g1"), None);
        assert!(h.mgr.route_table_syncers().is_empty());
    }

    #[tokio::test]
    async fn test_deferred_binding() {
        let mut h = harness(3);
        let (id, ev) = endpoint("w1", "g1", "10.0.240.0/24");
        h.mgr.on_update(&ev);
        h.mgr.complete_deferred_work().await.unwrap();
        assert!(h.mgr.is_pending(&id));

        h.mgr.on_update(&group("g1", &["10.0.0.1"]));
        h.mgr.complete_deferred_work().await.unwrap();
        assert!(!h.mgr.is_pending(&id));
        assert_eq!(h.mgr.table_for("g1"), Some(3));

        apply_all(&h.mgr).await;
        assert_eq!(
            h.kernel.rules(),
            vec![Rule::new(100)
                .match_src("10.0.240.0/24".parse().unwrap())
                .match_fwmark(0x200)
                .go_to_table(3)]
        );
    }

    #[tokio::test]
    async fn test_exhaustion_is_fatal() {
        let mut h = harness(1);
        h.mgr.on_update(&group("g1", &["10.0.0.1"]));
        h.mgr.on_update(&group("g2", &["10.0.0.2"]));
        let err = h.mgr.complete_deferred_work().await.unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_remove_unbound_group_is_noop() {
        let mut h = harness(3);
        h.mgr.on_update(&group("g1", &[]));
        h.mgr.on_update(&DataplaneEvent::IpSetRemove { id: "g1".to_string() });
        h.mgr.complete_deferred_work().await.unwrap();
        assert_eq!(h.mgr.allocator().peek(), Some(3));
    }

    #[tokio::test]
    async fn test_waits_for_vxlan_device() {
        let mut h = harness(3);
        h.mgr.vxlan.lock().link_index = None;
        h.mgr.on_update(&group("g1", &["10.0.0.1"]));
        h.mgr.complete_deferred_work().await.unwrap();
        assert_eq!(h.mgr.table_for("g1"), None);

        h.mgr.vxlan.lock().link_index = Some(4);
        h.mgr.complete_deferred_work().await.unwrap();
        assert_eq!(h.mgr.table_for("g1"), Some(3));
    }

    #[tokio::test]
    async fn test_local_host_metadata_sets_node_ip() {
        let mut h = harness(3);
        h.mgr.on_update(&DataplaneEvent::HostMetadataUpdate {
            hostname: "other".to_string(),
            ipv4_addr: Ipv4Address::new(10, 9, 9, 9),
        });
        assert_eq!(h.mgr.vxlan.lock().node_ip, None);
        h.mgr.on_update(&DataplaneEvent::HostMetadataUpdate {
            hostname: "node-1".to_string(),
            ipv4_addr: Ipv4Address::new(192, 168, 0, 10),
        });
        assert_eq!(h.mgr.vxlan.lock().node_ip, Some(Ipv4Address::new(192, 168, 0, 10)));
    }

    #[tokio::test]
    async fn test_route_shapes() {
        let mut h = harness(3);
        let default = IpPrefix::default_v4();
        h.mgr.on_update(&group("g1", &["10.0.0.1/32"]));
        h.mgr.complete_deferred_work().await.unwrap();
        apply_all(&h.mgr).await;
        let routes = h.kernel.routes(3);
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].iface, "egress.calico");
        assert_eq!(routes[0].target, Target::vxlan_single(default, gw("10.0.0.1")));

        h.mgr.on_update(&DataplaneEvent::IpSetDeltaUpdate {
            id: "g1".to_string(),
            added: vec!["10.0.0.2".to_string()],
            removed: Vec::new(),
        });
        h.mgr.complete_deferred_work().await.unwrap();
        apply_all(&h.mgr).await;
        let routes = h.kernel.routes(3);
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].iface, INTERFACE_NONE);
        assert_eq!(
            routes[0].target,
            Target::vxlan_multipath(
                default,
                vec![
                    NextHop { gw: gw("10.0.0.1"), link_index: Some(9) },
                    NextHop { gw: gw("10.0.0.2"), link_index: Some(9) },
                ]
            )
        );

        h.mgr.on_update(&DataplaneEvent::IpSetDeltaUpdate {
            id: "g1".to_string(),
            added: Vec::new(),
            removed: vec!["10.0.0.1/32".to_string(), "10.0.0.2".to_string()],
        });
        h.mgr.complete_deferred_work().await.unwrap();
        apply_all(&h.mgr).await;
        let routes = h.kernel.routes(3);
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].target, Target::unreachable(default));
        assert_eq!(h.mgr.table_for("g1"), Some(3));
    }

    #[tokio::test]
    async fn test_unparseable_members_skipped() {
        let mut h = harness(3);
        h.mgr.on_update(&group("g1", &["not-an-ip", "fd00::1", "10.0.0.7"]));
        h.mgr.complete_deferred_work().await.unwrap();
        apply_all(&h.mgr).await;
        let routes = h.kernel.routes(3);
        assert_eq!(routes[0].target, Target::vxlan_single(IpPrefix::default_v4(), gw("10.0.0.7")));
    }

    #[tokio::test]
    async fn test_group_removal_returns_endpoints_to_pending() {
        let mut h = harness(3);
        let (id, ev) = endpoint("w1", "g1", "10.0.240.0/24");
        h.mgr.on_update(&group("g1", &["10.0.0.1", "10.0.0.2"]));
        h.mgr.on_update(&ev);
        h.mgr.complete_deferred_work().await.unwrap();
        apply_all(&h.mgr).await;
        assert_eq!(h.kernel.rules().len(), 1);

        h.mgr.on_update(&DataplaneEvent::IpSetRemove { id: "g1".to_string() });
        h.mgr.complete_deferred_work().await.unwrap();
        apply_all(&h.mgr).await;
        assert!(h.kernel.routes(3).is_empty());
        assert!(h.kernel.rules().is_empty());
        assert!(h.mgr.is_pending(&id));
        assert_eq!(h.mgr.allocator().peek(), Some(3));

        h.mgr.on_update(&group("g1", &["10.0.0.3"]));
        h.mgr.complete_deferred_work().await.unwrap();
        assert!(!h.mgr.is_pending(&id));
        assert_eq!(h.mgr.table_for("g1"), Some(3));
    }

    #[tokio::test]
    async fn test_endpoint_group_change_moves_rule() {
        let mut h = harness(3);
        h.mgr.on_update(&group("g1", &["10.0.0.1"]));
        h.mgr.on_update(&group("g2", &["10.0.0.2"]));
        let (_, ev) = endpoint("w1", "g1", "10.0.240.0/24");
        h.mgr.on_update(&ev);
        h.mgr.complete_deferred_work().await.unwrap();
        apply_all(&h.mgr).await;
        assert_eq!(h.kernel.rules()[0].table, 3);

        let (_, ev) = endpoint("w1", "g2", "10.0.240.0/24");
        h.mgr.on_update(&ev);
        h.mgr.complete_deferred_work().await.unwrap();
        apply_all(&h.mgr).await;
        let rules = h.kernel.rules();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].table, 2);
    }

    #[tokio::test]
    async fn test_endpoint_removal_removes_rules() {
        let mut h = harness(3);
        h.mgr.on_update(&group("g1", &["10.0.0.1"]));
        let (id, ev) = endpoint("w1", "g1", "10.0.240.0/24");
        h.mgr.on_update(&ev);
        h.mgr.complete_deferred_work().await.unwrap();
        apply_all(&h.mgr).await;

        h.mgr.on_update(&DataplaneEvent::WorkloadEndpointRemove { id: id.clone() });
        h.mgr.complete_deferred_work().await.unwrap();
        apply_all(&h.mgr).await;
        assert!(h.kernel.rules().is_empty());
        assert!(!h.mgr.is_pending(&id));
    }

    #[tokio::test]
    async fn test_device_change_reprograms_multipath() {
        let mut h = harness(3);
        h.mgr.on_update(&group("g1", &["10.0.0.1", "10.0.0.2"]));
        h.mgr.complete_deferred_work().await.unwrap();
        apply_all(&h.mgr).await;

        h.mgr.vxlan.lock().link_index = Some(12);
        h.mgr.complete_deferred_work().await.unwrap();
        apply_all(&h.mgr).await;
        let routes = h.kernel.routes(3);
        assert!(routes[0].target.multipath.iter().all(|hop| hop.link_index == Some(12)));
    }

    #[tokio::test]
    async fn test_released_table_flushed_before_reuse() {
        let mut h = harness(3);
        h.mgr.on_update(&group("g1", &["10.0.0.1", "10.0.0.2"]));
        h.mgr.on_update(&group("g2", &["10.0.0.5"]));
        h.mgr.complete_deferred_work().await.unwrap();
        apply_all(&h.mgr).await;
        assert_eq!(h.mgr.table_for("g1"), Some(3));
        let before = h.kernel.ops().len();

        h.mgr.on_update(&DataplaneEvent::IpSetRemove { id: "g1".to_string() });
        h.mgr.on_update(&group("g3", &["10.0.0.3"]));
        h.mgr.complete_deferred_work().await.unwrap();
        assert_eq!(h.mgr.table_for("g3"), Some(3));
        apply_all(&h.mgr).await;

        let ops: Vec<String> = h.kernel.ops().split_off(before);
        let del = ops
            .iter()
            .position(|op| op == "route_del 3 *NoOIF* 0.0.0.0/0")
            .unwrap();
        let replace = ops
            .iter()
            .position(|op| op.starts_with("route_replace 3 egress.calico"))
            .unwrap();
        assert!(del < replace, "ops out of order: {:?}", ops);
        assert_eq!(
            h.kernel.routes(3)[0].target,
            Target::vxlan_single(IpPrefix::default_v4(), gw("10.0.0.3"))
        );
    }

    #[tokio::test]
    async fn test_plain_endpoint_not_tracked() {
        let mut h = harness(3);
        h.mgr.vxlan.lock().link_index = None;
        let id = WorkloadEndpointId::new("k8s", "ns/plain", "eth0");
        h.mgr.on_update(&DataplaneEvent::WorkloadEndpointUpdate {
            id: id.clone(),
            endpoint: WorkloadEndpoint {
                ipv4_nets: vec!["10.0.241.0/24".parse().unwrap()],
                ..Default::default()
            },
        });
        assert!(!h.mgr.is_pending(&id));
        h.mgr.complete_deferred_work().await.unwrap();

        h.mgr.on_update(&DataplaneEvent::WorkloadEndpointRemove { id: id.clone() });
        assert!(!h.mgr.is_pending(&id));
    }

    #[tokio::test]
    async fn test_delta_member_both_added_and_removed_is_dropped() {
        let mut h = harness(3);
        h.mgr.on_update(&group("g1", &["10.0.0.1"]));
        h.mgr.on_update(&DataplaneEvent::IpSetDeltaUpdate {
            id: "g1".to_string(),
            added: vec!["10.0.0.2".to_string()],
            removed: vec!["10.0.0.2".to_string()],
        });
        h.mgr.complete_deferred_work().await.unwrap();
        apply_all(&h.mgr).await;
        assert_eq!(
            h.kernel.routes(3)[0].target,
            Target::vxlan_single(IpPrefix::default_v4(), gw("10.0.0.1"))
        );
    }
}
