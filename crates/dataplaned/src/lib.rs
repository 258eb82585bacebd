//! Per-host dataplane agent.
//!
//! Consumes a stream of desired-state events and reconciles them into kernel
//! routing tables, policy rules, IP sets and a VXLAN device.
//!
//! # Architecture
//!
//! ```text
//! [event feed] ──> [InternalDataplane] ──> managers ──> syncers ──> [kernel]
//!                        │
//!                        ↓
//!               [health / status]
//! ```
//!
//! # Key Components
//!
//! - [`daemon::InternalDataplane`]: event loop, throttle and apply ordering
//! - [`egress::EgressIpManager`]: per-gateway-group tables and policy rules
//! - [`ipsets::IpSetsManager`]: mirrors policy IP sets into the kernel
//! - [`routetable`], [`routerule`]: route and rule syncers
//! - [`kernel`]: the kernel shim traits and an in-memory kernel

pub mod agent;
pub mod config;
pub mod daemon;
pub mod egress;
pub mod health;
pub mod ipsets;
pub mod kernel;
pub mod metrics;
pub mod routerule;
pub mod routetable;

pub use agent::{Agent, AgentKernel};
pub use config::{ConfigError, DataplaneConfig};
pub use daemon::{DataplaneError, DataplaneHandles, InternalDataplane};
pub use metrics::Metrics;
