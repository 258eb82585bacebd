//! Prometheus metrics for dataplaned
//!
//! One [`Metrics`] is built at startup and shared by `Arc` with the
//! orchestrator and the managers.

use prometheus::{
    Encoder, Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts,
    Registry, TextEncoder,
};

#[derive(Clone)]
pub struct Metrics {
    // Counters
    pub messages_total: IntCounterVec,
    pub applies_total: IntCounter,
    pub sync_errors_total: IntCounter,

    // Gauges
    pub egress_tables_in_use: IntGauge,
    pub egress_pending_endpoints: IntGauge,

    // Histograms
    pub batch_size: HistogramVec,
    pub apply_duration_seconds: Histogram,

    pub registry: Registry,
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let messages_total = IntCounterVec::new(
            Opts::new(
                "dataplaned_messages_total",
                "Desired-state messages received, by type",
            ),
            &["type"],
        )?;
        registry.register(Box::new(messages_total.clone()))?;

        let applies_total = IntCounter::with_opts(Opts::new(
            "dataplaned_applies_total",
            "Apply passes run",
        ))?;
        registry.register(Box::new(applies_total.clone()))?;

        let sync_errors_total = IntCounter::with_opts(Opts::new(
            "dataplaned_sync_errors_total",
            "Apply passes that left the dataplane out of sync",
        ))?;
        registry.register(Box::new(sync_errors_total.clone()))?;

        let egress_tables_in_use = IntGauge::with_opts(Opts::new(
            "dataplaned_egress_tables_in_use",
            "Routing table indices currently leased to egress gateway groups",
        ))?;
        registry.register(Box::new(egress_tables_in_use.clone()))?;

        let egress_pending_endpoints = IntGauge::with_opts(Opts::new(
            "dataplaned_egress_pending_endpoints",
            "Workload endpoints waiting for their egress group to get a table",
        ))?;
        registry.register(Box::new(egress_pending_endpoints.clone()))?;

        let batch_size = HistogramVec::new(
            HistogramOpts::new(
                "dataplaned_batch_size",
                "Messages drained from one source in a single loop iteration",
            )
            .buckets(vec![1.0, 2.0, 5.0, 10.0, 20.0, 50.0, 100.0]),
            &["source"],
        )?;
        registry.register(Box::new(batch_size.clone()))?;

        let apply_duration_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "dataplaned_apply_duration_seconds",
                "Time taken by one apply pass",
            )
            .buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 5.0]),
        )?;
        registry.register(Box::new(apply_duration_seconds.clone()))?;

        Ok(Self {
            messages_total,
            applies_total,
            sync_errors_total,
            egress_tables_in_use,
            egress_pending_endpoints,
            batch_size,
            apply_duration_seconds,
            registry,
        })
    }

    /// Renders every registered metric in the Prometheus text format.
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let mut buf = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buf)?;
        String::from_utf8(buf).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}
