//! The `Manager` trait.

use crate::error::ManagerResult;
use crate::event::DataplaneEvent;
use crate::syncer::{SharedIpSets, SharedRouteRules, SharedRouteTable};
use async_trait::async_trait;

/// A unit of reconciliation logic owning one slice of desired state.
///
/// # Lifecycle
///
/// 1. Construction: created once at startup with its syncers
/// 2. Registration: handed to the orchestrator, which owns it from then on
/// 3. `on_update()` for every event, many times per batch
/// 4. `complete_deferred_work()` at most once per batch, after the batch's events
/// 5. The orchestrator applies every syncer returned by the capability methods
///
/// # Concurrency
///
/// The orchestrator calls these methods from a single task, one at a time.
/// Implementations need no locking of their own unless they share state with
/// a background task.
#[async_trait]
pub trait Manager: Send {
    /// Returns the name of this manager (for logging and metrics).
    fn name(&self) -> &str;

    /// Records the event in the manager's working set and marks whatever it
    /// touches dirty. Must be cheap and must not block.
    fn on_update(&mut self, event: &DataplaneEvent);

    /// Resolves dirty state and pushes the result into resource syncers.
    ///
    /// An error asks for another pass; whatever was already resolved is kept.
    /// A fatal error stops the dataplane.
    async fn complete_deferred_work(&mut self) -> ManagerResult<()>;

    /// Route tables this manager programs. Applied in parallel with the
    /// IP-set and chain phases.
    fn route_table_syncers(&self) -> Vec<SharedRouteTable> {
        Vec::new()
    }

    fn route_rule_syncers(&self) -> Vec<SharedRouteRules> {
        Vec::new()
    }

    /// IP-set families this manager feeds. Updates are applied before chain
    /// tables; deletions after.
    fn ip_sets_syncers(&self) -> Vec<SharedIpSets> {
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ManagerError;

    struct CountingManager {
        name: String,
        seen: usize,
        passes: usize,
        fail_next: bool,
    }

    #[async_trait]
    impl Manager for CountingManager {
        fn name(&self) -> &str {
            &self.name
        }

        fn on_update(&mut self, _event: &DataplaneEvent) {
            self.seen += 1;
        }

        async fn complete_deferred_work(&mut self) -> ManagerResult<()> {
            self.passes += 1;
            if std::mem::take(&mut self.fail_next) {
                return Err(ManagerError::transient("injected"));
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_manager_trait() {
        let mut mgr = CountingManager {
            name: "test".to_string(),
            seen: 0,
            passes: 0,
            fail_next: true,
        };

        assert_eq!(mgr.name(), "test");
        mgr.on_update(&DataplaneEvent::InSync);
        mgr.on_update(&DataplaneEvent::InSync);
        assert_eq!(mgr.seen, 2);

        assert!(mgr.complete_deferred_work().await.is_err());
        assert!(mgr.complete_deferred_work().await.is_ok());
        assert_eq!(mgr.passes, 2);
    }

    #[test]
    fn test_default_capabilities_are_empty() {
        let mgr = CountingManager {
            name: "test".to_string(),
            seen: 0,
            passes: 0,
            fail_next: false,
        };
        assert!(mgr.route_table_syncers().is_empty());
        assert!(mgr.route_rule_syncers().is_empty());
        assert!(mgr.ip_sets_syncers().is_empty());
    }
}
