use async_trait::async_trait;
use dpa_manager_common::{
    DataplaneEvent, IpSetKind, IpSetsSyncer, Manager, ManagerResult, SharedIpSets,
};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

use super::IpSets;

#[derive(Debug, Clone, PartialEq, Eq)]
enum PendingOp {
    Replace {
        id: String,
        kind: IpSetKind,
        members: BTreeSet<String>,
    },
    Delta {
        id: String,
        added: Vec<String>,
        removed: Vec<String>,
    },
    Remove {
        id: String,
    },
}

/// Mirrors the policy IP sets into an [`IpSets`] syncer.
///
/// Egress gateway sets are owned by the egress manager and skipped here.
/// Updates are buffered in `on_update` and handed to the syncer in
/// `complete_deferred_work`, so the syncer lock is only taken once per batch.
pub struct IpSetsManager {
    ipsets: Arc<Mutex<IpSets>>,
    /// Ids of sets this manager mirrors.
    known: BTreeSet<String>,
    pending: Vec<PendingOp>,
}

impl IpSetsManager {
    pub fn new(ipsets: IpSets) -> Self {
        Self {
            ipsets: Arc::new(Mutex::new(ipsets)),
            known: BTreeSet::new(),
            pending: Vec::new(),
        }
    }

    pub fn ipsets(&self) -> Arc<Mutex<IpSets>> {
        Arc::clone(&self.ipsets)
    }
}

#[async_trait]
impl Manager for IpSetsManager {
    fn name(&self) -> &str {
        "IpSetsManager"
    }

    fn on_update(&mut self, event: &DataplaneEvent) {
        match event {
            DataplaneEvent::IpSetUpdate { id, kind, members } => {
                if *kind == IpSetKind::EgressIp {
                    return;
                }
                self.known.insert(id.clone());
                self.pending.push(PendingOp::Replace {
                    id: id.clone(),
                    kind: *kind,
                    members: members.iter().cloned().collect(),
                });
            }
            DataplaneEvent::IpSetDeltaUpdate { id, added, removed } => {
                if !self.known.contains(id) {
                    return;
                }
                self.pending.push(PendingOp::Delta {
                    id: id.clone(),
                    added: added.clone(),
                    removed: removed.clone(),
                });
            }
            DataplaneEvent::IpSetRemove { id } => {
                if self.known.remove(id) {
                    self.pending.push(PendingOp::Remove { id: id.clone() });
                }
            }
            DataplaneEvent::WorkloadEndpointUpdate { .. }
            | DataplaneEvent::WorkloadEndpointRemove { .. }
            | DataplaneEvent::HostMetadataUpdate { .. }
            | DataplaneEvent::InterfaceStateUpdate { .. }
            | DataplaneEvent::InterfaceAddrsUpdate { .. }
            | DataplaneEvent::InSync => {}
        }
    }

    async fn complete_deferred_work(&mut self) -> ManagerResult<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let ops = std::mem::take(&mut self.pending);
        debug!(ops = ops.len(), "IpSetsManager: flushing set updates");
        let mut ipsets = self.ipsets.lock().await;
        for op in ops {
            match op {
                PendingOp::Replace { id, kind, members } => {
                    ipsets.add_or_replace(&id, kind, members)
                }
                PendingOp::Delta { id, added, removed } => {
                    ipsets.add_members(&id, &added);
                    ipsets.remove_members(&id, &removed);
                }
                PendingOp::Remove { id } => ipsets.remove(&id),
            }
        }
        Ok(())
    }

    fn ip_sets_syncers(&self) -> Vec<SharedIpSets> {
        let shared: SharedIpSets = self.ipsets.clone();
        vec![shared]
    }
}
