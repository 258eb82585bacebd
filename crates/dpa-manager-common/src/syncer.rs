//! Resource-syncer contracts.
//!
//! A syncer accepts desired-state mutations immediately and in memory, and
//! only touches the kernel when `apply` is called. Every `apply` must be a
//! no-op when the desired state has not changed since the last successful one.
//!
//! Syncers are shared between the manager that mutates them and the
//! orchestrator that flushes them, so they are handed around as
//! `Arc<tokio::sync::Mutex<dyn ...>>`. The orchestrator never holds a lock
//! while a manager runs.

use crate::error::SyncResult;
use crate::event::{IfaceState, IpSetKind};
use async_trait::async_trait;
use dpa_types::{IpPrefix, L2Target, Rule, Target};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// A single kernel routing table.
#[async_trait]
pub trait RouteTableSyncer: Send {
    /// The kernel table index this syncer programs.
    fn index(&self) -> u32;

    /// Replaces every route for `iface` with `targets`.
    fn set_routes(&mut self, iface: &str, targets: Vec<Target>);

    /// Removes the route for `cidr` on `iface`, if any.
    fn route_remove(&mut self, iface: &str, cidr: IpPrefix);

    /// Replaces every L2 (neighbour/FDB) entry for `iface`.
    fn set_l2_routes(&mut self, iface: &str, targets: Vec<L2Target>);

    fn on_iface_state_changed(&mut self, iface: &str, state: IfaceState);

    /// Re-read kernel state on the next `apply`.
    fn queue_resync(&mut self);

    async fn apply(&mut self) -> SyncResult<()>;
}

/// Policy routing rules at one priority.
#[async_trait]
pub trait RouteRuleSyncer: Send {
    fn set_rule(&mut self, rule: Rule);

    /// Removes the rule matching `rule`'s key. The table may be left unset
    /// when only the match conditions are known.
    fn remove_rule(&mut self, rule: Rule);

    fn queue_resync(&mut self);

    async fn apply(&mut self) -> SyncResult<()>;
}

/// One family of kernel IP sets.
#[async_trait]
pub trait IpSetsSyncer: Send {
    fn add_or_replace(&mut self, id: &str, kind: IpSetKind, members: BTreeSet<String>);

    fn add_members(&mut self, id: &str, members: &[String]);

    fn remove_members(&mut self, id: &str, members: &[String]);

    /// Schedules the set for deletion. The kernel set is only destroyed by
    /// `apply_deletions`.
    fn remove(&mut self, id: &str);

    fn queue_resync(&mut self);

    /// Creates and rewrites sets. Never deletes.
    async fn apply_updates(&mut self) -> SyncResult<()>;

    /// Deletes sets that are no longer wanted. Only safe once every chain
    /// that could reference them has been rewritten.
    async fn apply_deletions(&mut self) -> SyncResult<()>;
}

/// A firewall table. Rendering is owned by the implementation; the
/// orchestrator only needs to know when to flush it.
#[async_trait]
pub trait ChainTable: Send {
    fn name(&self) -> &str;

    /// Flushes pending changes. Returns a delay after which the table wants
    /// to be applied again, if any.
    async fn apply(&mut self) -> Option<Duration>;
}

pub type SharedRouteTable = Arc<Mutex<dyn RouteTableSyncer>>;
pub type SharedRouteRules = Arc<Mutex<dyn RouteRuleSyncer>>;
pub type SharedIpSets = Arc<Mutex<dyn IpSetsSyncer>>;
pub type SharedChainTable = Arc<Mutex<dyn ChainTable>>;
