//! InternalDataplane implementation.
//!
//! The dataplane is the single owner of every registered manager. It runs
//! one select loop that:
//! - drains the desired-state and interface channels in batches
//! - refreshes the apply throttle and the optional resync timers
//! - runs an apply pass whenever the dataplane is in sync, dirty and the
//!   throttle admits it
//!
//! An apply pass resolves every manager's deferred work, then flushes the
//! resource syncers in dependency order: IP-set updates, then chain tables,
//! then IP-set deletions, with routes and rules flushed alongside.

use dpa_manager_common::{
    DataplaneEvent, IfaceState, Manager, ManagerError, SharedChainTable, SharedIpSets,
    SharedRouteRules, SharedRouteTable,
};
use dpa_types::IpAddress;
use rand::Rng;
use std::collections::BTreeSet;
use std::future::pending;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::{interval, sleep, Instant, Interval, MissedTickBehavior, Sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::throttle::Throttle;
use crate::config::LoopConfig;
use crate::health::{DataplaneStatus, HealthReport, ProcessStatus};
use crate::metrics::Metrics;

const THROTTLE_JITTER: Duration = Duration::from_millis(10);
const STATUS_CHANNEL_CAPACITY: usize = 100;

#[derive(Debug, Error)]
pub enum DataplaneError {
    #[error("{manager} failed: {source}")]
    Manager {
        manager: String,
        #[source]
        source: ManagerError,
    },
}

/// Link state change reported by the interface monitor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IfaceUpdate {
    pub name: String,
    pub state: IfaceState,
    pub index: u32,
}

/// Address change reported by the interface monitor. `addrs` is `None`
/// once the interface is gone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IfaceAddrsUpdate {
    pub name: String,
    pub addrs: Option<BTreeSet<IpAddress>>,
}

/// The channel ends used to drive a dataplane and observe it.
pub struct DataplaneHandles {
    pub to_dataplane: mpsc::Sender<DataplaneEvent>,
    pub iface_updates: mpsc::Sender<IfaceUpdate>,
    pub iface_addr_updates: mpsc::Sender<IfaceAddrsUpdate>,
    pub from_dataplane: mpsc::Receiver<DataplaneStatus>,
    pub health: watch::Receiver<HealthReport>,
}

enum Wake {
    Stop,
    Event(Option<DataplaneEvent>),
    Iface(Option<IfaceUpdate>),
    Addrs(Option<IfaceAddrsUpdate>),
    IpSetsRefresh,
    RouteRefresh,
    Reschedule,
    ThrottleRefill,
    HealthTick,
    Retry,
}

pub struct InternalDataplane {
    config: LoopConfig,
    metrics: Arc<Metrics>,
    cancel: CancellationToken,

    managers: Vec<Box<dyn Manager>>,
    chain_tables: Vec<SharedChainTable>,

    to_dataplane: mpsc::Receiver<DataplaneEvent>,
    iface_updates: mpsc::Receiver<IfaceUpdate>,
    iface_addr_updates: mpsc::Receiver<IfaceAddrsUpdate>,
    from_dataplane: mpsc::Sender<DataplaneStatus>,
    health: watch::Sender<HealthReport>,

    throttle: Throttle,
    in_sync: bool,
    needs_sync: bool,
    done_first_apply: bool,
    force_ipsets_refresh: bool,
    force_route_refresh: bool,
    resched: Option<Pin<Box<Sleep>>>,
    started: std::time::Instant,
}

impl InternalDataplane {
    pub fn new(
        config: LoopConfig,
        metrics: Arc<Metrics>,
        cancel: CancellationToken,
    ) -> (Self, DataplaneHandles) {
        let capacity = config.peek_limit.max(1);
        let (to_tx, to_rx) = mpsc::channel(capacity);
        let (iface_tx, iface_rx) = mpsc::channel(capacity);
        let (addr_tx, addr_rx) = mpsc::channel(capacity);
        let (status_tx, status_rx) = mpsc::channel(STATUS_CHANNEL_CAPACITY);
        let (health_tx, health_rx) = watch::channel(HealthReport::default());

        let mut throttle = Throttle::new(config.throttle_bucket);
        // Allow the first apply immediately.
        throttle.refill();

        let dataplane = Self {
            config,
            metrics,
            cancel,
            managers: Vec::new(),
            chain_tables: Vec::new(),
            to_dataplane: to_rx,
            iface_updates: iface_rx,
            iface_addr_updates: addr_rx,
            from_dataplane: status_tx,
            health: health_tx,
            throttle,
            in_sync: false,
            needs_sync: false,
            done_first_apply: false,
            force_ipsets_refresh: false,
            force_route_refresh: false,
            resched: None,
            started: std::time::Instant::now(),
        };
        let handles = DataplaneHandles {
            to_dataplane: to_tx,
            iface_updates: iface_tx,
            iface_addr_updates: addr_tx,
            from_dataplane: status_rx,
            health: health_rx,
        };
        (dataplane, handles)
    }

    /// Registers a manager. Deferred work runs in registration order.
    pub fn register_manager(&mut self, manager: Box<dyn Manager>) {
        info!("Registering {}", manager.name());
        self.managers.push(manager);
    }

    pub fn register_chain_table(&mut self, table: SharedChainTable) {
        self.chain_tables.push(table);
    }

    fn report_health(&self) {
        self.health.send_replace(HealthReport {
            live: true,
            ready: self.done_first_apply,
        });
    }

    fn next_refill(&self) -> Duration {
        let jitter_ms = THROTTLE_JITTER.as_millis() as u64;
        let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms));
        self.config.throttle_refill() + jitter
    }

    fn process_event(&mut self, event: DataplaneEvent) {
        debug!(kind = event.kind(), "Received update from calculation graph");
        self.metrics
            .messages_total
            .with_label_values(&[event.kind()])
            .inc();
        for mgr in self.managers.iter_mut() {
            mgr.on_update(&event);
        }
        if event == DataplaneEvent::InSync && !self.in_sync {
            info!(
                secs_since_start = self.started.elapsed().as_secs_f64(),
                "Datastore in sync, flushing the dataplane for the first time"
            );
            self.in_sync = true;
        }
    }

    async fn process_iface_update(&mut self, update: IfaceUpdate) {
        info!(iface = %update.name, state = %update.state, index = update.index, "Received interface update");
        let event = DataplaneEvent::InterfaceStateUpdate {
            name: update.name.clone(),
            state: update.state,
            index: update.index,
        };
        for mgr in self.managers.iter_mut() {
            mgr.on_update(&event);
        }
        let tables: Vec<SharedRouteTable> = self
            .managers
            .iter()
            .flat_map(|m| m.route_table_syncers())
            .collect();
        for table in tables {
            table
                .lock()
                .await
                .on_iface_state_changed(&update.name, update.state);
        }
    }

    fn process_addrs_update(&mut self, update: IfaceAddrsUpdate) {
        info!(iface = %update.name, addrs = ?update.addrs, "Received interface addresses update");
        let event = DataplaneEvent::InterfaceAddrsUpdate {
            name: update.name,
            addrs: update.addrs,
        };
        for mgr in self.managers.iter_mut() {
            mgr.on_update(&event);
        }
    }

    /// Runs one apply pass. Only a fatal manager error is returned; anything
    /// else leaves `needs_sync` set for another pass.
    async fn apply(&mut self) -> Result<(), DataplaneError> {
        self.needs_sync = false;

        for mgr in self.managers.iter_mut() {
            if let Err(e) = mgr.complete_deferred_work().await {
                if e.is_fatal() {
                    error!(manager = mgr.name(), error = %e, "Manager hit a fatal error");
                    return Err(DataplaneError::Manager {
                        manager: mgr.name().to_string(),
                        source: e,
                    });
                }
                warn!(manager = mgr.name(), error = %e, "Failed to complete deferred work, will retry");
                self.needs_sync = true;
            }
        }

        let route_tables: Vec<SharedRouteTable> = self
            .managers
            .iter()
            .flat_map(|m| m.route_table_syncers())
            .collect();
        let route_rules: Vec<SharedRouteRules> = self
            .managers
            .iter()
            .flat_map(|m| m.route_rule_syncers())
            .collect();
        let ip_sets: Vec<SharedIpSets> = self
            .managers
            .iter()
            .flat_map(|m| m.ip_sets_syncers())
            .collect();

        if std::mem::take(&mut self.force_route_refresh) {
            for table in &route_tables {
                table.lock().await.queue_resync();
            }
            for rules in &route_rules {
                rules.lock().await.queue_resync();
            }
        }
        if std::mem::take(&mut self.force_ipsets_refresh) {
            for sets in &ip_sets {
                sets.lock().await.queue_resync();
            }
        }

        let mut ipset_updates = JoinSet::new();
        for sets in ip_sets.iter().cloned() {
            ipset_updates.spawn(async move { sets.lock().await.apply_updates().await });
        }

        let mut routing = JoinSet::new();
        for table in route_tables {
            routing.spawn(async move {
                let mut table = table.lock().await;
                let index = table.index();
                table.apply().await.map_err(|e| (format!("route table {}", index), e))
            });
        }
        for rules in route_rules {
            routing.spawn(async move {
                rules
                    .lock()
                    .await
                    .apply()
                    .await
                    .map_err(|e| ("route rules".to_string(), e))
            });
        }

        while let Some(result) = ipset_updates.join_next().await {
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(error = %e, "Failed to update IP sets");
                    self.needs_sync = true;
                }
                Err(e) => {
                    error!(error = %e, "IP set update task failed");
                    self.needs_sync = true;
                }
            }
        }

        let mut chains = JoinSet::new();
        for table in self.chain_tables.iter().cloned() {
            chains.spawn(async move { table.lock().await.apply().await });
        }
        let mut resched_delay: Option<Duration> = None;
        while let Some(result) = chains.join_next().await {
            match result {
                Ok(Some(delay)) => {
                    resched_delay = Some(resched_delay.map_or(delay, |d| d.min(delay)));
                }
                Ok(None) => {}
                Err(e) => {
                    error!(error = %e, "Chain table apply task failed");
                    self.needs_sync = true;
                }
            }
        }

        for sets in &ip_sets {
            if let Err(e) = sets.lock().await.apply_deletions().await {
                warn!(error = %e, "Failed to delete IP sets");
                self.needs_sync = true;
            }
        }

        while let Some(result) = routing.join_next().await {
            match result {
                Ok(Ok(())) => {}
                Ok(Err((what, e))) => {
                    warn!(syncer = %what, error = %e, "Failed to sync routing, will retry");
                    self.needs_sync = true;
                }
                Err(e) => {
                    error!(error = %e, "Routing apply task failed");
                    self.needs_sync = true;
                }
            }
        }

        self.resched = resched_delay.map(|delay| {
            debug!(?delay, "Arming reschedule timer");
            Box::pin(sleep(delay))
        });
        Ok(())
    }

    async fn wait(&mut self, throttle: &mut Pin<Box<Sleep>>, ticks: &mut Ticks) -> Wake {
        tokio::select! {
            _ = self.cancel.cancelled() => Wake::Stop,
            msg = self.to_dataplane.recv(), if ticks.feed_open => Wake::Event(msg),
            msg = self.iface_updates.recv(), if ticks.iface_open => Wake::Iface(msg),
            msg = self.iface_addr_updates.recv(), if ticks.addrs_open => Wake::Addrs(msg),
            _ = tick_opt(&mut ticks.ipsets_refresh) => Wake::IpSetsRefresh,
            _ = tick_opt(&mut ticks.route_refresh) => Wake::RouteRefresh,
            _ = sleep_opt(&mut self.resched) => Wake::Reschedule,
            _ = throttle.as_mut() => Wake::ThrottleRefill,
            _ = ticks.health.tick() => Wake::HealthTick,
            _ = ticks.retry.tick() => Wake::Retry,
        }
    }

    /// Runs until cancelled or until a manager reports a fatal error.
    pub async fn run(mut self) -> Result<(), DataplaneError> {
        info!(managers = self.managers.len(), "Starting dataplane loop");
        let status = tokio::spawn(report_status(
            self.config.status_reporting_interval(),
            self.started,
            self.from_dataplane.clone(),
            self.cancel.clone(),
        ));

        let result = self.run_loop().await;
        if let Err(e) = &result {
            error!(error = %e, "Dataplane loop failed");
        }
        self.cancel.cancel();
        if let Err(e) = status.await {
            warn!(error = %e, "Status reporter task failed");
        }
        info!("Dataplane loop stopped");
        result
    }

    async fn run_loop(&mut self) -> Result<(), DataplaneError> {
        let mut throttle_timer = Box::pin(sleep(self.next_refill()));
        let mut ticks = Ticks::new(&self.config);
        let mut being_throttled = false;
        let peek_limit = self.config.peek_limit;

        loop {
            match self.wait(&mut throttle_timer, &mut ticks).await {
                Wake::Stop => return Ok(()),
                Wake::Event(None) => {
                    info!("Desired-state feed closed");
                    ticks.feed_open = false;
                }
                Wake::Event(Some(event)) => {
                    let mut batch = 1;
                    self.process_event(event);
                    for _ in 1..peek_limit {
                        match self.to_dataplane.try_recv() {
                            Ok(event) => {
                                self.process_event(event);
                                batch += 1;
                            }
                            Err(_) => break,
                        }
                    }
                    self.needs_sync = true;
                    self.observe_batch("to_dataplane", batch);
                }
                Wake::Iface(None) => ticks.iface_open = false,
                Wake::Iface(Some(update)) => {
                    let mut batch = 1;
                    self.process_iface_update(update).await;
                    for _ in 1..peek_limit {
                        match self.iface_updates.try_recv() {
                            Ok(update) => {
                                self.process_iface_update(update).await;
                                batch += 1;
                            }
                            Err(_) => break,
                        }
                    }
                    self.needs_sync = true;
                    self.observe_batch("iface", batch);
                }
                Wake::Addrs(None) => ticks.addrs_open = false,
                Wake::Addrs(Some(update)) => {
                    let mut batch = 1;
                    self.process_addrs_update(update);
                    for _ in 1..peek_limit {
                        match self.iface_addr_updates.try_recv() {
                            Ok(update) => {
                                self.process_addrs_update(update);
                                batch += 1;
                            }
                            Err(_) => break,
                        }
                    }
                    self.needs_sync = true;
                    self.observe_batch("iface_addrs", batch);
                }
                Wake::IpSetsRefresh => {
                    debug!("Refreshing IP sets state");
                    self.force_ipsets_refresh = true;
                    self.needs_sync = true;
                }
                Wake::RouteRefresh => {
                    debug!("Refreshing routes");
                    self.force_route_refresh = true;
                    self.needs_sync = true;
                }
                Wake::Reschedule => {
                    debug!("Reschedule kick received");
                    self.resched = None;
                    self.needs_sync = true;
                }
                Wake::ThrottleRefill => {
                    self.throttle.refill();
                    let next = self.next_refill();
                    throttle_timer.as_mut().reset(Instant::now() + next);
                }
                Wake::HealthTick => self.report_health(),
                Wake::Retry => {}
            }

            if !(self.in_sync && self.needs_sync) {
                continue;
            }
            if !self.throttle.admit() {
                if !being_throttled {
                    info!("Dataplane updates throttled");
                    being_throttled = true;
                }
                continue;
            }
            if being_throttled && self.throttle.would_admit() {
                info!("Dataplane updates no longer throttled");
                being_throttled = false;
            }

            debug!("Applying dataplane updates");
            let start = Instant::now();
            self.apply().await?;
            self.metrics
                .apply_duration_seconds
                .observe(start.elapsed().as_secs_f64());
            self.metrics.applies_total.inc();

            if self.needs_sync {
                self.metrics.sync_errors_total.inc();
            } else if !self.done_first_apply {
                info!(
                    secs_since_start = self.started.elapsed().as_secs_f64(),
                    "Completed first update to dataplane"
                );
                self.done_first_apply = true;
            }
            self.report_health();
        }
    }

    fn observe_batch(&self, source: &str, size: usize) {
        self.metrics
            .batch_size
            .with_label_values(&[source])
            .observe(size as f64);
    }
}

/// Loop timers other than the throttle, plus which inbound channels are
/// still open.
struct Ticks {
    health: Interval,
    retry: Interval,
    ipsets_refresh: Option<Interval>,
    route_refresh: Option<Interval>,
    feed_open: bool,
    iface_open: bool,
    addrs_open: bool,
}

impl Ticks {
    fn new(config: &LoopConfig) -> Self {
        let ticker = |period: Duration| {
            let mut i = interval(period);
            i.set_missed_tick_behavior(MissedTickBehavior::Delay);
            i
        };
        Self {
            health: ticker(config.health_interval()),
            retry: ticker(config.retry_interval()),
            ipsets_refresh: config.ipsets_refresh_interval().map(ticker),
            route_refresh: config.route_refresh_interval().map(ticker),
            feed_open: true,
            iface_open: true,
            addrs_open: true,
        }
    }
}

async fn tick_opt(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => pending::<()>().await,
    }
}

async fn sleep_opt(timer: &mut Option<Pin<Box<Sleep>>>) {
    match timer {
        Some(timer) => timer.as_mut().await,
        None => pending::<()>().await,
    }
}

/// Sends a [`ProcessStatus`] every `every` until cancelled. Returns at once
/// when reporting is disabled.
async fn report_status(
    every: Option<Duration>,
    started: std::time::Instant,
    tx: mpsc::Sender<DataplaneStatus>,
    cancel: CancellationToken,
) {
    let Some(every) = every else {
        return;
    };
    let mut ticker = interval(every);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }
        let status = DataplaneStatus::ProcessStatus(ProcessStatus::now(started));
        tokio::select! {
            _ = cancel.cancelled() => return,
            sent = tx.send(status) => {
                if sent.is_err() {
                    debug!("Status receiver gone, stopping status reports");
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use dpa_manager_common::ManagerResult;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
        passes: Mutex<usize>,
    }

    struct FakeManager {
        name: String,
        recorder: Arc<Recorder>,
        fail: Option<ManagerError>,
    }

    #[async_trait]
    impl Manager for FakeManager {
        fn name(&self) -> &str {
            &self.name
        }

        fn on_update(&mut self, event: &DataplaneEvent) {
            self.recorder
                .events
                .lock()
                .push(format!("{}:{}", self.name, event.kind()));
        }

        async fn complete_deferred_work(&mut self) -> ManagerResult<()> {
            *self.recorder.passes.lock() += 1;
            match self.fail.take() {
                Some(e) => Err(e),
                None => Ok(()),
            }
        }
    }

    fn setup(
        fail: Option<ManagerError>,
    ) -> (InternalDataplane, DataplaneHandles, Arc<Recorder>, CancellationToken) {
        let cancel = CancellationToken::new();
        let metrics = Arc::new(Metrics::new().unwrap());
        let (mut dp, handles) = InternalDataplane::new(LoopConfig::default(), metrics, cancel.clone());
        let recorder = Arc::new(Recorder::default());
        dp.register_manager(Box::new(FakeManager {
            name: "m1".to_string(),
            recorder: Arc::clone(&recorder),
            fail,
        }));
        (dp, handles, recorder, cancel)
    }

    #[tokio::test]
    async fn test_no_apply_before_in_sync() {
        let (dp, handles, recorder, cancel) = setup(None);
        let task = tokio::spawn(dp.run());

        handles
            .to_dataplane
            .send(DataplaneEvent::IpSetRemove { id: "s".to_string() })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(*recorder.passes.lock(), 0);
        assert_eq!(recorder.events.lock().clone(), vec!["m1:ipset_remove".to_string()]);

        handles.to_dataplane.send(DataplaneEvent::InSync).await.unwrap();
        let mut health = handles.health.clone();
        health.wait_for(|h| h.ready).await.unwrap();
        assert_eq!(*recorder.passes.lock(), 1);

        cancel.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_fatal_error_stops_loop() {
        let (dp, handles, _recorder, _cancel) = setup(Some(ManagerError::fatal("pool empty")));
        let task = tokio::spawn(dp.run());
        handles.to_dataplane.send(DataplaneEvent::InSync).await.unwrap();

        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, DataplaneError::Manager { ref manager, .. } if manager == "m1"));
        assert!(!handles.health.borrow().ready);
    }

    #[tokio::test]
    async fn test_transient_error_retried_and_delays_readiness() {
        let (dp, handles, recorder, cancel) = setup(Some(ManagerError::transient("link gone")));
        let task = tokio::spawn(dp.run());
        handles.to_dataplane.send(DataplaneEvent::InSync).await.unwrap();

        let mut health = handles.health.clone();
        health.wait_for(|h| h.ready).await.unwrap();
        assert_eq!(*recorder.passes.lock(), 2);

        cancel.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_status_reports_sent() {
        let cancel = CancellationToken::new();
        let metrics = Arc::new(Metrics::new().unwrap());
        let config = LoopConfig {
            status_reporting_interval_secs: 1,
            ..Default::default()
        };
        let (dp, mut handles) = InternalDataplane::new(config, metrics, cancel.clone());
        let task = tokio::spawn(dp.run());

        let status = handles.from_dataplane.recv().await.unwrap();
        let DataplaneStatus::ProcessStatus(status) = status;
        assert!(status.uptime_secs >= 0.0);

        cancel.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_status_disabled_returns_immediately() {
        let (tx, _rx) = mpsc::channel(1);
        report_status(None, std::time::Instant::now(), tx, CancellationToken::new()).await;
    }

    struct HintOnce {
        applies: Arc<Mutex<usize>>,
        hint: Option<Duration>,
    }

    #[async_trait]
    impl dpa_manager_common::ChainTable for HintOnce {
        fn name(&self) -> &str {
            "filter"
        }

        async fn apply(&mut self) -> Option<Duration> {
            *self.applies.lock() += 1;
            self.hint.take()
        }
    }

    #[tokio::test]
    async fn test_reschedule_cleared_when_no_hint() {
        let (mut dp, handles, _recorder, cancel) = setup(None);
        let applies = Arc::new(Mutex::new(0));
        dp.register_chain_table(Arc::new(tokio::sync::Mutex::new(HintOnce {
            applies: Arc::clone(&applies),
            hint: Some(Duration::from_millis(400)),
        })));
        let task = tokio::spawn(dp.run());

        handles.to_dataplane.send(DataplaneEvent::InSync).await.unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(*applies.lock(), 1);

        // The second pass gives no hint, so the first pass's timer must not
        // trigger a third.
        handles.to_dataplane.send(DataplaneEvent::InSync).await.unwrap();
        tokio::time::sleep(Duration::from_millis(800)).await;
        assert_eq!(*applies.lock(), 2);

        cancel.cancel();
        task.await.unwrap().unwrap();
    }
}
