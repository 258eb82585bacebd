//! Wires managers, syncers and the device keeper into one dataplane.

use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::DataplaneConfig;
use crate::daemon::{DataplaneHandles, InternalDataplane};
use crate::egress::{EgressIpManager, SharedVxlanState, VxlanDeviceKeeper};
use crate::ipsets::{IpSets, IpSetsManager};
use crate::kernel::{IpSetDataplane, LinkDataplane, RouteDataplane, RuleDataplane};
use crate::metrics::Metrics;
use crate::routerule::RouteRules;
use crate::routetable::KernelRouteTableFactory;

/// Prefix for kernel IP set names owned by this agent.
pub const IPSET_PREFIX: &str = "cali40";

/// A kernel that can back every syncer.
pub trait AgentKernel: RouteDataplane + RuleDataplane + IpSetDataplane + LinkDataplane {}

impl<T> AgentKernel for T where T: RouteDataplane + RuleDataplane + IpSetDataplane + LinkDataplane {}

/// An assembled, not yet running, agent.
pub struct Agent {
    pub dataplane: InternalDataplane,
    pub handles: DataplaneHandles,
    /// `None` when egress routing is disabled.
    pub vxlan_keeper: Option<VxlanDeviceKeeper>,
    pub vxlan_state: SharedVxlanState,
}

impl Agent {
    /// Builds the dataplane and registers managers in their fixed order:
    /// IP sets first, then egress routing.
    pub fn assemble<K>(
        config: &DataplaneConfig,
        hostname: &str,
        kernel: Arc<K>,
        metrics: Arc<Metrics>,
        cancel: CancellationToken,
    ) -> Self
    where
        K: AgentKernel + 'static,
    {
        let mut loop_config = config.dataplane.clone();
        loop_config.hostname = hostname.to_string();
        let (mut dataplane, handles) = InternalDataplane::new(loop_config, Arc::clone(&metrics), cancel);

        let ipsets = IpSets::new(IPSET_PREFIX, Arc::clone(&kernel) as Arc<dyn IpSetDataplane>);
        dataplane.register_manager(Box::new(IpSetsManager::new(ipsets)));

        let vxlan_state = SharedVxlanState::default();
        let mut vxlan_keeper = None;
        let egress = &config.egress;
        if egress.enabled {
            let rules = Arc::new(Mutex::new(RouteRules::new(
                egress.rule_priority,
                egress.table_indices(),
                Arc::clone(&kernel) as Arc<dyn RuleDataplane>,
            )));
            let factory = KernelRouteTableFactory::new(Arc::clone(&kernel) as Arc<dyn RouteDataplane>);
            dataplane.register_manager(Box::new(EgressIpManager::new(
                egress.clone(),
                hostname,
                rules,
                Box::new(factory),
                Arc::clone(&vxlan_state),
                metrics,
            )));
            vxlan_keeper = Some(
                VxlanDeviceKeeper::new(
                    egress.clone(),
                    kernel as Arc<dyn LinkDataplane>,
                    Arc::clone(&vxlan_state),
                )
                .with_notifier(handles.iface_updates.clone()),
            );
        } else {
            info!("Egress routing disabled");
        }

        Self {
            dataplane,
            handles,
            vxlan_keeper,
            vxlan_state,
        }
    }
}
