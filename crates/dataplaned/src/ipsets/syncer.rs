use async_trait::async_trait;
use dpa_manager_common::{IpSetKind, IpSetsSyncer, SyncError, SyncResult};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::kernel::IpSetDataplane;

type SetContent = (IpSetKind, BTreeSet<String>);

/// One family of kernel IP sets, named `<prefix><id>`.
///
/// Updates and deletions are applied separately: a set is only destroyed by
/// `apply_deletions()`, after whatever referenced it has been rewritten.
pub struct IpSets {
    prefix: String,
    dataplane: Arc<dyn IpSetDataplane>,
    desired: BTreeMap<String, SetContent>,
    programmed: BTreeMap<String, SetContent>,
    /// Ids known to exist in the kernel, including ones found on resync.
    in_kernel: BTreeSet<String>,
    dirty: BTreeSet<String>,
    pending_deletion: BTreeSet<String>,
    resync_pending: bool,
}

impl IpSets {
    pub fn new(prefix: impl Into<String>, dataplane: Arc<dyn IpSetDataplane>) -> Self {
        Self {
            prefix: prefix.into(),
            dataplane,
            desired: BTreeMap::new(),
            programmed: BTreeMap::new(),
            in_kernel: BTreeSet::new(),
            dirty: BTreeSet::new(),
            pending_deletion: BTreeSet::new(),
            resync_pending: true,
        }
    }

    pub fn kernel_name(&self, id: &str) -> String {
        format!("{}{}", self.prefix, id)
    }

    pub fn members(&self, id: &str) -> Option<&BTreeSet<String>> {
        self.desired.get(id).map(|(_, m)| m)
    }

    pub fn pending_deletions(&self) -> usize {
        self.pending_deletion.len()
    }

    fn resync(&mut self) -> SyncResult<()> {
        let names = self
            .dataplane
            .list_sets()
            .map_err(|e| SyncError::resync(format!("ipsets {}: {}", self.prefix, e)))?;
        self.programmed.clear();
        self.in_kernel = names
            .iter()
            .filter_map(|name| name.strip_prefix(self.prefix.as_str()))
            .map(str::to_string)
            .collect();
        for id in &self.in_kernel {
            if !self.desired.contains_key(id) {
                self.pending_deletion.insert(id.clone());
            }
        }
        self.dirty.extend(self.desired.keys().cloned());
        self.resync_pending = false;
        debug!(
            prefix = %self.prefix,
            found = self.in_kernel.len(),
            "IpSets: resynced from kernel"
        );
        Ok(())
    }
}

#[async_trait]
impl IpSetsSyncer for IpSets {
    fn add_or_replace(&mut self, id: &str, kind: IpSetKind, members: BTreeSet<String>) {
        self.pending_deletion.remove(id);
        self.desired.insert(id.to_string(), (kind, members));
        self.dirty.insert(id.to_string());
    }

    fn add_members(&mut self, id: &str, members: &[String]) {
        let Some((_, current)) = self.desired.get_mut(id) else {
            warn!(set = id, "IpSets: delta for unknown set ignored");
            return;
        };
        current.extend(members.iter().cloned());
        self.dirty.insert(id.to_string());
    }

    fn remove_members(&mut self, id: &str, members: &[String]) {
        let Some((_, current)) = self.desired.get_mut(id) else {
            warn!(set = id, "IpSets: delta for unknown set ignored");
            return;
        };
        for member in members {
            current.remove(member);
        }
        self.dirty.insert(id.to_string());
    }

    fn remove(&mut self, id: &str) {
        self.desired.remove(id);
        self.dirty.remove(id);
        self.pending_deletion.insert(id.to_string());
    }

    fn queue_resync(&mut self) {
        self.resync_pending = true;
    }

    async fn apply_updates(&mut self) -> SyncResult<()> {
        if self.resync_pending {
            self.resync()?;
        }

        let mut first_err = None;
        let dirty: Vec<String> = self.dirty.iter().cloned().collect();
        for id in dirty {
            let Some(content) = self.desired.get(&id) else {
                self.dirty.remove(&id);
                continue;
            };
            if self.programmed.get(&id) == Some(content) {
                self.dirty.remove(&id);
                continue;
            }
            let name = self.kernel_name(&id);
            match self.dataplane.ensure_set(&name, content.0, &content.1) {
                Ok(()) => {
                    self.programmed.insert(id.clone(), content.clone());
                    self.in_kernel.insert(id.clone());
                    self.dirty.remove(&id);
                }
                Err(e) => {
                    warn!(set = %name, error = %e, "IpSets: failed to write set");
                    first_err.get_or_insert(e);
                }
            }
        }

        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn apply_deletions(&mut self) -> SyncResult<()> {
        let mut first_err = None;
        let pending: Vec<String> = self.pending_deletion.iter().cloned().collect();
        for id in pending {
            if !self.in_kernel.contains(&id) {
                self.pending_deletion.remove(&id);
                continue;
            }
            let name = self.kernel_name(&id);
            match self.dataplane.delete_set(&name) {
                Ok(()) => {
                    self.in_kernel.remove(&id);
                    self.programmed.remove(&id);
                    self.pending_deletion.remove(&id);
                }
                Err(e) => {
                    warn!(set = %name, error = %e, "IpSets: failed to delete set");
                    first_err.get_or_insert(e);
                }
            }
        }

        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
