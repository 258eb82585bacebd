//! Common reconciliation abstractions for the dataplane agent.
//!
//! - [`Manager`]: a unit of reconciliation logic owning one slice of desired state
//! - [`DataplaneEvent`]: the closed set of desired-state updates fanned out to managers
//! - [`IndexAllocator`]: LIFO pool of routing-table indices
//! - [`BindingTable`]: one-to-one name/index map that never auto-creates entries
//! - [`RouteTableSyncer`], [`RouteRuleSyncer`], [`IpSetsSyncer`], [`ChainTable`]:
//!   resource syncers that buffer mutations and flush them on `apply`
//!
//! # Architecture
//!
//! 1. The orchestrator receives events and hands each one to every manager's
//!    [`Manager::on_update`], which only records state and marks it dirty.
//! 2. At a batch boundary the orchestrator calls
//!    [`Manager::complete_deferred_work`], which resolves dirty state and pushes
//!    mutations into syncers.
//! 3. The orchestrator then flushes every syncer in dependency order.
//!
//! # Example
//!
//! ```ignore
//! use dpa_manager_common::{DataplaneEvent, Manager, ManagerResult};
//!
//! struct MyManager {
//!     dirty: bool,
//! }
//!
//! #[async_trait]
//! impl Manager for MyManager {
//!     fn name(&self) -> &str { "my-manager" }
//!
//!     fn on_update(&mut self, event: &DataplaneEvent) {
//!         if let DataplaneEvent::InSync = event {
//!             self.dirty = true;
//!         }
//!     }
//!
//!     async fn complete_deferred_work(&mut self) -> ManagerResult<()> {
//!         self.dirty = false;
//!         Ok(())
//!     }
//! }
//! ```

mod binding;
mod error;
mod event;
mod idalloc;
mod manager;
mod syncer;

pub use binding::{BindingError, BindingTable};
pub use error::{ManagerError, ManagerResult, SyncError, SyncResult};
pub use event::{
    DataplaneEvent, IfaceState, IpSetKind, WorkloadEndpoint, WorkloadEndpointId,
};
pub use idalloc::{AllocError, IndexAllocator};
pub use manager::Manager;
pub use syncer::{
    ChainTable, IpSetsSyncer, RouteRuleSyncer, RouteTableSyncer, SharedChainTable, SharedIpSets,
    SharedRouteRules, SharedRouteTable,
};
