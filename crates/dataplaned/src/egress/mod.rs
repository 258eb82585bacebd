//! Egress gateway routing.
//!
//! Every egress gateway group gets its own routing table holding a default
//! route towards the group's gateways over a VXLAN device. Workloads that use
//! a group get one policy rule per source network sending marked traffic to
//! that table.

mod manager;
mod vxlan;

pub use manager::EgressIpManager;
pub use vxlan::{SharedVxlanState, VxlanDeviceKeeper, VxlanError, VxlanState};
