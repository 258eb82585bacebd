//! VXLAN device keeper.
//!
//! Runs as its own task. It is the only code outside the orchestrator task
//! that touches egress state, and it does so through [`SharedVxlanState`].

use dpa_manager_common::{IfaceState, SyncError};
use dpa_types::{IpAddress, Ipv4Address};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::EgressConfig;
use crate::daemon::IfaceUpdate;
use crate::kernel::{LinkDataplane, LinkInfo, VxlanAttrs};

const RETRY_DELAY: Duration = Duration::from_secs(1);
const FALLBACK_AFTER_FAILURES: u32 = 3;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VxlanError {
    #[error("node IP not known yet")]
    NodeIpUnknown,

    #[error("no interface carries node address {0}")]
    NoParent(Ipv4Address),

    #[error("{0} missing after create")]
    Vanished(String),

    #[error(transparent)]
    Link(#[from] SyncError),
}

/// Node address and device index shared between the egress manager and the
/// device keeper.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct VxlanState {
    pub node_ip: Option<Ipv4Address>,
    pub link_index: Option<u32>,
}

pub type SharedVxlanState = Arc<Mutex<VxlanState>>;

pub struct VxlanDeviceKeeper {
    config: EgressConfig,
    links: Arc<dyn LinkDataplane>,
    state: SharedVxlanState,
    failures: u32,
    notify: Option<mpsc::Sender<IfaceUpdate>>,
}

impl VxlanDeviceKeeper {
    pub fn new(config: EgressConfig, links: Arc<dyn LinkDataplane>, state: SharedVxlanState) -> Self {
        Self {
            config,
            links,
            state,
            failures: 0,
            notify: None,
        }
    }

    /// Reports the device as an interface update whenever its index
    /// changes, so the dataplane reprograms without waiting for a tick.
    pub fn with_notifier(mut self, notify: mpsc::Sender<IfaceUpdate>) -> Self {
        self.notify = Some(notify);
        self
    }

    fn announce(&self, index: u32) {
        let Some(notify) = &self.notify else {
            return;
        };
        let update = IfaceUpdate {
            name: self.config.vxlan_device.clone(),
            state: IfaceState::Up,
            index,
        };
        // A full channel already has the loop awake.
        if let Err(mpsc::error::TrySendError::Closed(_)) = notify.try_send(update) {
            debug!("Dataplane gone, dropping VXLAN device notification");
        }
    }

    fn node_ip(&self) -> Result<Ipv4Address, VxlanError> {
        if let Some(ip) = self.state.lock().node_ip {
            return Ok(ip);
        }
        match self.config.fallback_node_ip {
            Some(ip) if self.failures >= FALLBACK_AFTER_FAILURES => {
                debug!(node_ip = %ip, "Using fallback node IP for egress VXLAN device");
                Ok(ip)
            }
            _ => Err(VxlanError::NodeIpUnknown),
        }
    }

    fn parent_for(&self, node_ip: Ipv4Address) -> Result<LinkInfo, VxlanError> {
        let wanted = IpAddress::from(node_ip);
        self.links
            .link_list()?
            .into_iter()
            .find(|link| link.addrs.contains(&wanted))
            .ok_or(VxlanError::NoParent(node_ip))
    }

    fn requery(&self) -> Result<LinkInfo, VxlanError> {
        self.links
            .link_by_name(&self.config.vxlan_device)?
            .ok_or_else(|| VxlanError::Vanished(self.config.vxlan_device.clone()))
    }

    /// Makes sure the device exists with the right attributes, MTU and
    /// state, and records its index. Returns the index.
    pub fn configure_once(&mut self) -> Result<u32, VxlanError> {
        let name = self.config.vxlan_device.as_str();
        let node_ip = self.node_ip()?;
        let parent = self.parent_for(node_ip)?;
        let attrs = VxlanAttrs {
            vni: self.config.vxlan_vni,
            port: self.config.vxlan_port,
            parent_index: parent.index,
            src_addr: node_ip,
        };

        let mut link = match self.links.link_by_name(name)? {
            Some(link) => link,
            None => {
                info!(device = name, parent = %parent.name, "Creating egress VXLAN device");
                self.links.vxlan_add(name, &attrs)?;
                self.requery()?
            }
        };

        if link.vxlan != Some(attrs) {
            warn!(
                device = name,
                existing = ?link.vxlan,
                wanted = ?attrs,
                "Egress VXLAN device has incompatible configuration, recreating"
            );
            self.links.link_del(name)?;
            self.links.vxlan_add(name, &attrs)?;
            link = self.requery()?;
        }

        if link.mtu != self.config.vxlan_mtu {
            info!(device = name, old = link.mtu, new = self.config.vxlan_mtu, "Updating VXLAN device MTU");
            if let Err(e) = self.links.link_set_mtu(name, self.config.vxlan_mtu) {
                warn!(device = name, error = %e, "Failed to set VXLAN device MTU");
            }
        }

        self.links.link_set_up(name)?;

        let changed = {
            let mut state = self.state.lock();
            let changed = state.link_index != Some(link.index);
            state.link_index = Some(link.index);
            changed
        };
        if changed {
            info!(device = name, index = link.index, "Egress VXLAN device ready");
            self.announce(link.index);
        }
        Ok(link.index)
    }

    /// Re-checks the device every `device_sync_interval` until cancelled;
    /// retries after a second on failure.
    pub async fn run(mut self, cancel: CancellationToken) {
        info!(device = %self.config.vxlan_device, "Egress VXLAN device keeper started");
        loop {
            let wait = match self.configure_once() {
                Ok(_) => {
                    self.failures = 0;
                    self.config.device_sync_interval()
                }
                Err(e) => {
                    self.failures += 1;
                    warn!(error = %e, failures = self.failures, "Failed to configure egress VXLAN device, retrying");
                    RETRY_DELAY
                }
            };
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }
        }
        debug!("Egress VXLAN device keeper stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::SimulatedKernel;
    use pretty_assertions::assert_eq;

    const NODE_IP: Ipv4Address = Ipv4Address::new(192, 168, 0, 10);

    fn keeper(kernel: &Arc<SimulatedKernel>, state: &SharedVxlanState) -> VxlanDeviceKeeper {
        VxlanDeviceKeeper::new(
            EgressConfig::default(),
            Arc::clone(kernel) as Arc<dyn LinkDataplane>,
            Arc::clone(state),
        )
    }

    #[test]
    fn test_creates_device_on_parent() {
        let kernel = Arc::new(SimulatedKernel::new());
        let parent = kernel.add_link("eth0", vec![NODE_IP.into()]);
        let state = SharedVxlanState::default();
        state.lock().node_ip = Some(NODE_IP);

        let index = keeper(&kernel, &state).configure_once().unwrap();
        let link = kernel.link("egress.calico").unwrap();
        assert_eq!(link.index, index);
        assert_eq!(link.mtu, 1410);
        assert!(link.up);
        assert_eq!(
            link.vxlan,
            Some(VxlanAttrs {
                vni: 4097,
                port: 4790,
                parent_index: parent,
                src_addr: NODE_IP,
            })
        );
        assert_eq!(state.lock().link_index, Some(index));
    }

    #[test]
    fn test_second_pass_changes_nothing() {
        let kernel = Arc::new(SimulatedKernel::new());
        kernel.add_link("eth0", vec![NODE_IP.into()]);
        let state = SharedVxlanState::default();
        state.lock().node_ip = Some(NODE_IP);
        let mut keeper = keeper(&kernel, &state);

        keeper.configure_once().unwrap();
        let count = kernel.mutation_count();
        keeper.configure_once().unwrap();
        assert_eq!(kernel.mutation_count(), count);
    }

    #[test]
    fn test_recreates_incompatible_device() {
        let kernel = Arc::new(SimulatedKernel::new());
        let parent = kernel.add_link("eth0", vec![NODE_IP.into()]);
        kernel
            .vxlan_add(
                "egress.calico",
                &VxlanAttrs {
                    vni: 1,
                    port: 4789,
                    parent_index: parent,
                    src_addr: NODE_IP,
                },
            )
            .unwrap();
        let old = kernel.link("egress.calico").unwrap().index;

        let state = SharedVxlanState::default();
        state.lock().node_ip = Some(NODE_IP);
        let index = keeper(&kernel, &state).configure_once().unwrap();
        assert_ne!(index, old);
        assert_eq!(kernel.link("egress.calico").unwrap().vxlan.map(|v| v.vni), Some(4097));
    }

    #[test]
    fn test_fallback_node_ip_after_failures() {
        let kernel = Arc::new(SimulatedKernel::new());
        kernel.add_link("eth0", vec![NODE_IP.into()]);
        let state = SharedVxlanState::default();
        let mut keeper = VxlanDeviceKeeper::new(
            EgressConfig {
                fallback_node_ip: Some(NODE_IP),
                ..Default::default()
            },
            Arc::clone(&kernel) as Arc<dyn LinkDataplane>,
            Arc::clone(&state),
        );

        assert_eq!(keeper.configure_once(), Err(VxlanError::NodeIpUnknown));
        keeper.failures = FALLBACK_AFTER_FAILURES;
        assert!(keeper.configure_once().is_ok());
    }

    #[test]
    fn test_missing_parent() {
        let kernel = Arc::new(SimulatedKernel::new());
        let state = SharedVxlanState::default();
        state.lock().node_ip = Some(NODE_IP);
        assert_eq!(
            keeper(&kernel, &state).configure_once(),
            Err(VxlanError::NoParent(NODE_IP))
        );
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let kernel = Arc::new(SimulatedKernel::new());
        kernel.add_link("eth0", vec![NODE_IP.into()]);
        let state = SharedVxlanState::default();
        state.lock().node_ip = Some(NODE_IP);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(keeper(&kernel, &state).run(cancel.clone()));

        for _ in 0..50 {
            if state.lock().link_index.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        cancel.cancel();
        task.await.unwrap();
        assert!(state.lock().link_index.is_some());
    }

    #[test]
    fn test_index_change_is_announced_once() {
        let kernel = Arc::new(SimulatedKernel::new());
        kernel.add_link("eth0", vec![NODE_IP.into()]);
        let state = SharedVxlanState::default();
        state.lock().node_ip = Some(NODE_IP);
        let (tx, mut rx) = mpsc::channel(4);
        let mut keeper = keeper(&kernel, &state).with_notifier(tx);

        let index = keeper.configure_once().unwrap();
        keeper.configure_once().unwrap();

        let update = rx.try_recv().unwrap();
        assert_eq!(update.name, "egress.calico");
        assert_eq!(update.state, IfaceState::Up);
        assert_eq!(update.index, index);
        assert!(rx.try_recv().is_err());
    }
}
