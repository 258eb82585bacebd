//! Policy routing rule syncer.

use async_trait::async_trait;
use dpa_manager_common::{RouteRuleSyncer, SyncError, SyncResult};
use dpa_types::{Rule, RuleKey};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::kernel::RuleDataplane;

/// Rules at a single priority pointing at a set of managed tables.
///
/// Rules are identified by [`RuleKey`]; a rule that is both desired and
/// programmed is never touched again. The first `apply()` reads the kernel so
/// that rules left behind by a previous run are adopted or removed.
pub struct RouteRules {
    priority: u32,
    managed_tables: BTreeSet<u32>,
    dataplane: Arc<dyn RuleDataplane>,
    desired: BTreeMap<RuleKey, Rule>,
    programmed: BTreeMap<RuleKey, Rule>,
    resync_pending: bool,
}

impl RouteRules {
    pub fn new(
        priority: u32,
        managed_tables: impl IntoIterator<Item = u32>,
        dataplane: Arc<dyn RuleDataplane>,
    ) -> Self {
        Self {
            priority,
            managed_tables: managed_tables.into_iter().collect(),
            dataplane,
            desired: BTreeMap::new(),
            programmed: BTreeMap::new(),
            resync_pending: true,
        }
    }

    pub fn desired_rules(&self) -> Vec<Rule> {
        self.desired.values().copied().collect()
    }

    fn resync(&mut self) -> SyncResult<()> {
        let rules = self
            .dataplane
            .list_rules(self.priority)
            .map_err(|e| SyncError::resync(format!("rules at {}: {}", self.priority, e)))?;
        self.programmed = rules
            .into_iter()
            .filter(|r| self.managed_tables.contains(&r.table))
            .map(|r| (r.key(), r))
            .collect();
        self.resync_pending = false;
        debug!(
            priority = self.priority,
            found = self.programmed.len(),
            "RouteRules: resynced from kernel"
        );
        Ok(())
    }
}

#[async_trait]
impl RouteRuleSyncer for RouteRules {
    fn set_rule(&mut self, rule: Rule) {
        let rule = Rule {
            priority: self.priority,
            ..rule
        };
        self.desired.insert(rule.key(), rule);
    }

    fn remove_rule(&mut self, rule: Rule) {
        if rule.table != 0 {
            self.desired.remove(&rule.key());
            return;
        }
        self.desired
            .retain(|key, _| !(key.src == rule.src && key.fwmark == rule.fwmark));
    }

    fn queue_resync(&mut self) {
        self.resync_pending = true;
    }

    async fn apply(&mut self) -> SyncResult<()> {
        if self.resync_pending {
            self.resync()?;
        }

        let mut first_err = None;
        let stale: Vec<Rule> = self
            .programmed
            .iter()
            .filter(|(key, _)| !self.desired.contains_key(key))
            .map(|(_, rule)| *rule)
            .collect();
        for rule in stale {
            match self.dataplane.rule_del(&rule) {
                Ok(()) => {
                    self.programmed.remove(&rule.key());
                }
                Err(e) => {
                    warn!(rule = %rule, error = %e, "RouteRules: failed to remove rule");
                    first_err.get_or_insert(e);
                }
            }
        }

        let missing: Vec<Rule> = self
            .desired
            .iter()
            .filter(|(key, _)| !self.programmed.contains_key(key))
            .map(|(_, rule)| *rule)
            .collect();
        for rule in missing {
            match self.dataplane.rule_add(&rule) {
                Ok(()) => {
                    self.programmed.insert(rule.key(), rule);
                }
                Err(e) => {
                    warn!(rule = %rule, error = %e, "RouteRules: failed to add rule");
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::SimulatedKernel;
    use pretty_assertions::assert_eq;

    fn rules(kernel: &Arc<SimulatedKernel>) -> RouteRules {
        RouteRules::new(100, 1..=3, Arc::clone(kernel) as Arc<dyn RuleDataplane>)
    }

    fn rule(src: &str, table: u32) -> Rule {
        Rule::new(100)
            .match_src(src.parse().unwrap())
            .match_fwmark(0x200)
            .go_to_table(table)
    }

    #[tokio::test]
    async fn test_apply_only_issues_difference() {
        let kernel = Arc::new(SimulatedKernel::new());
        let mut rr = rules(&kernel);
        rr.set_rule(rule("10.0.240.0/24", 3));
        rr.apply().await.unwrap();
        assert_eq!(kernel.rules(), vec![rule("10.0.240.0/24", 3)]);

        rr.set_rule(rule("10.0.240.0/24", 3));
        rr.apply().await.unwrap();
        assert_eq!(kernel.mutation_count(), 1);

        rr.remove_rule(rule("10.0.240.0/24", 3));
        rr.set_rule(rule("10.0.240.0/24", 2));
        rr.apply().await.unwrap();
        assert_eq!(kernel.rules(), vec![rule("10.0.240.0/24", 2)]);
    }

    #[tokio::test]
    async fn test_remove_without_table_matches_conditions() {
        let kernel = Arc::new(SimulatedKernel::new());
        let mut rr = rules(&kernel);
        rr.set_rule(rule("10.0.240.0/24", 3));
        rr.set_rule(rule("10.0.241.0/24", 3));
        rr.remove_rule(
            Rule::new(100)
                .match_src("10.0.240.0/24".parse().unwrap())
                .match_fwmark(0x200),
        );
        assert_eq!(rr.desired_rules(), vec![rule("10.0.241.0/24", 3)]);
    }

    #[tokio::test]
    async fn test_first_apply_removes_strays_in_managed_tables() {
        let kernel = Arc::new(SimulatedKernel::new());
        kernel.inject_rule(rule("10.9.0.0/16", 2));
        kernel.inject_rule(rule("10.8.0.0/16", 42));

        let mut rr = rules(&kernel);
        rr.apply().await.unwrap();
        assert_eq!(kernel.rules(), vec![rule("10.8.0.0/16", 42)]);
    }

    #[tokio::test]
    async fn test_failed_rule_retried() {
        let kernel = Arc::new(SimulatedKernel::new());
        let mut rr = rules(&kernel);
        rr.apply().await.unwrap();

        kernel.set_rules_failing(true);
        rr.set_rule(rule("10.0.240.0/24", 3));
        assert!(rr.apply().await.is_err());

        kernel.set_rules_failing(false);
        rr.apply().await.unwrap();
        assert_eq!(kernel.rules().len(), 1);
    }
}
