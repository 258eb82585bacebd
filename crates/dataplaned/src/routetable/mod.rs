//! Route table syncer.
//!
//! One [`RouteTable`] owns one kernel routing table. Desired routes are keyed
//! by interface and then destination; only interfaces marked dirty are
//! reconciled on `apply()`.

use async_trait::async_trait;
use dpa_manager_common::{
    IfaceState, RouteTableSyncer, SharedRouteTable, SyncError, SyncResult,
};
use dpa_types::{IpPrefix, L2Target, Target, INTERFACE_NONE};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::kernel::RouteDataplane;

type RoutesByIface = BTreeMap<String, BTreeMap<IpPrefix, Target>>;

/// Creates route table syncers on demand.
pub trait RouteTableFactory: Send + Sync {
    fn new_route_table(&mut self, index: u32) -> SharedRouteTable;
}

/// Factory for tables backed by a [`RouteDataplane`].
pub struct KernelRouteTableFactory {
    dataplane: Arc<dyn RouteDataplane>,
}

impl KernelRouteTableFactory {
    pub fn new(dataplane: Arc<dyn RouteDataplane>) -> Self {
        Self { dataplane }
    }
}

impl RouteTableFactory for KernelRouteTableFactory {
    fn new_route_table(&mut self, index: u32) -> SharedRouteTable {
        Arc::new(Mutex::new(RouteTable::new(index, Arc::clone(&self.dataplane))))
    }
}

pub struct RouteTable {
    index: u32,
    dataplane: Arc<dyn RouteDataplane>,

    desired: RoutesByIface,
    programmed: RoutesByIface,
    desired_l2: BTreeMap<String, BTreeSet<L2Target>>,
    programmed_l2: BTreeMap<String, BTreeSet<L2Target>>,

    dirty: BTreeSet<String>,
    down: BTreeSet<String>,
    resync_pending: bool,
}

impl RouteTable {
    pub fn new(index: u32, dataplane: Arc<dyn RouteDataplane>) -> Self {
        Self {
            index,
            dataplane,
            desired: BTreeMap::new(),
            programmed: BTreeMap::new(),
            desired_l2: BTreeMap::new(),
            programmed_l2: BTreeMap::new(),
            dirty: BTreeSet::new(),
            down: BTreeSet::new(),
            resync_pending: false,
        }
    }

    /// Desired routes for `iface`.
    pub fn routes(&self, iface: &str) -> Vec<Target> {
        self.desired
            .get(iface)
            .map(|routes| routes.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn is_dirty(&self) -> bool {
        !self.dirty.is_empty() || self.resync_pending
    }

    fn deferred(&self, iface: &str) -> bool {
        iface != INTERFACE_NONE && self.down.contains(iface)
    }

    /// Rebuilds the programmed cache from the kernel and marks every
    /// interface we know about dirty.
    fn resync(&mut self) -> SyncResult<()> {
        let routes = self
            .dataplane
            .list_routes(self.index)
            .map_err(|e| SyncError::resync(format!("table {}: {}", self.index, e)))?;

        let mut programmed = RoutesByIface::new();
        for route in routes {
            programmed
                .entry(route.iface)
                .or_default()
                .insert(route.target.cidr, route.target);
        }
        self.programmed = programmed;

        // Neighbours cannot be read back per table. Anything desired is
        // reissued; anything else we programmed is still removed.
        for (iface, entries) in self.programmed_l2.iter_mut() {
            if let Some(wanted) = self.desired_l2.get(iface) {
                entries.retain(|l2| !wanted.contains(l2));
            }
        }

        self.dirty.extend(self.desired.keys().cloned());
        self.dirty.extend(self.programmed.keys().cloned());
        self.dirty.extend(self.desired_l2.keys().cloned());
        self.dirty.extend(self.programmed_l2.keys().cloned());
        self.resync_pending = false;
        debug!(table = self.index, dirty = self.dirty.len(), "RouteTable: resynced from kernel");
        Ok(())
    }
}

#[async_trait]
impl RouteTableSyncer for RouteTable {
    fn index(&self) -> u32 {
        self.index
    }

    fn set_routes(&mut self, iface: &str, targets: Vec<Target>) {
        let routes: BTreeMap<IpPrefix, Target> =
            targets.into_iter().map(|t| (t.cidr, t)).collect();
        if routes.is_empty() {
            self.desired.remove(iface);
        } else {
            self.desired.insert(iface.to_string(), routes);
        }
        self.dirty.insert(iface.to_string());
    }

    fn route_remove(&mut self, iface: &str, cidr: IpPrefix) {
        if let Some(routes) = self.desired.get_mut(iface) {
            routes.remove(&cidr);
            if routes.is_empty() {
                self.desired.remove(iface);
            }
        }
        self.dirty.insert(iface.to_string());
    }

    fn set_l2_routes(&mut self, iface: &str, targets: Vec<L2Target>) {
        let entries: BTreeSet<L2Target> = targets.into_iter().collect();
        if entries.is_empty() {
            self.desired_l2.remove(iface);
        } else {
            self.desired_l2.insert(iface.to_string(), entries);
        }
        self.dirty.insert(iface.to_string());
    }

    fn on_iface_state_changed(&mut self, iface: &str, state: IfaceState) {
        match state {
            IfaceState::Down => {
                self.down.insert(iface.to_string());
            }
            IfaceState::Up | IfaceState::Unknown => {
                if self.down.remove(iface) {
                    debug!(table = self.index, iface, "RouteTable: interface back, resuming");
                    self.dirty.insert(iface.to_string());
                }
            }
        }
    }

    fn queue_resync(&mut self) {
        self.resync_pending = true;
    }

    async fn apply(&mut self) -> SyncResult<()> {
        if self.resync_pending {
            self.resync()?;
        }
        if self.dirty.is_empty() {
            return Ok(());
        }

        let dataplane = Arc::clone(&self.dataplane);
        let index = self.index;
        let ifaces: Vec<String> = self
            .dirty
            .iter()
            .filter(|iface| !self.deferred(iface))
            .cloned()
            .collect();

        let mut failed: BTreeSet<String> = BTreeSet::new();
        let mut first_err: Option<SyncError> = None;
        let mut record = |iface: &str, err: SyncError, failed: &mut BTreeSet<String>| {
            warn!(table = index, iface, error = %err, "RouteTable: kernel update failed");
            failed.insert(iface.to_string());
            if first_err.is_none() {
                first_err = Some(err);
            }
        };

        // Deletions across every interface first, so that a destination
        // moving between interfaces never collides with its old entry.
        for iface in &ifaces {
            let Some(programmed) = self.programmed.get_mut(iface) else {
                continue;
            };
            let wanted = self.desired.get(iface);
            let stale: Vec<IpPrefix> = programmed
                .keys()
                .filter(|cidr| !wanted.is_some_and(|w| w.contains_key(cidr)))
                .copied()
                .collect();
            for cidr in stale {
                match dataplane.route_del(index, iface, &cidr) {
                    Ok(()) => {
                        programmed.remove(&cidr);
                    }
                    Err(e) => record(iface, e, &mut failed),
                }
            }
        }

        for iface in &ifaces {
            let Some(wanted) = self.desired.get(iface) else {
                continue;
            };
            let programmed = self.programmed.entry(iface.clone()).or_default();
            for (cidr, target) in wanted {
                if programmed.get(cidr) == Some(target) {
                    continue;
                }
                match dataplane.route_replace(index, iface, target) {
                    Ok(()) => {
                        programmed.insert(*cidr, target.clone());
                    }
                    Err(e) => record(iface, e, &mut failed),
                }
            }
        }

        for iface in &ifaces {
            let empty = BTreeSet::new();
            let wanted = self.desired_l2.get(iface).unwrap_or(&empty);
            let programmed = self.programmed_l2.entry(iface.clone()).or_default();
            let stale: Vec<L2Target> = programmed.difference(wanted).copied().collect();
            for l2 in stale {
                match dataplane.neigh_del(index, iface, &l2) {
                    Ok(()) => {
                        programmed.remove(&l2);
                    }
                    Err(e) => record(iface, e, &mut failed),
                }
            }
            let missing: Vec<L2Target> = wanted.difference(programmed).copied().collect();
            for l2 in missing {
                match dataplane.neigh_set(index, iface, &l2) {
                    Ok(()) => {
                        programmed.insert(l2);
                    }
                    Err(e) => record(iface, e, &mut failed),
                }
            }
        }

        self.programmed.retain(|_, routes| !routes.is_empty());
        self.programmed_l2.retain(|_, entries| !entries.is_empty());
        for iface in &ifaces {
            if !failed.contains(iface) {
                self.dirty.remove(iface);
            }
        }

        match first_err {
            Some(err) => Err(err),
            None => {
                if !ifaces.is_empty() {
                    info!(table = index, ifaces = ifaces.len(), "RouteTable: applied");
                }
                Ok(())
            }
        }
    }
}
