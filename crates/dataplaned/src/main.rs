//! dataplaned entry point.
//!
//! Runs the dataplane agent against the in-memory kernel, fed by a file or
//! stdin of JSON-lines desired-state events.

use anyhow::{Context, Result};
use clap::Parser;
use dpa_dataplaned::config::{DataplaneConfig, DEFAULT_CONFIG_PATH};
use dpa_dataplaned::kernel::SimulatedKernel;
use dpa_dataplaned::{Agent, Metrics};
use dpa_manager_common::DataplaneEvent;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

/// Per-host dataplane agent
#[derive(Parser, Debug)]
#[command(name = "dataplaned")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file
    #[arg(short = 'c', long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, default_value = "info")]
    log_level: String,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,

    /// JSON-lines event feed; "-" reads stdin
    #[arg(short = 'e', long)]
    events: Option<String>,

    /// Hostname used to pick this node's host metadata
    #[arg(long)]
    hostname: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(&args.log_level, args.json_logs);

    info!("--- Starting dataplaned ---");
    match run(args).await {
        Ok(()) => {
            info!("dataplaned: exiting normally");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %format!("{:#}", e), "dataplaned: exiting with error");
            ExitCode::FAILURE
        }
    }
}

fn init_logging(level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true);
    if json {
        builder.json().init();
    } else {
        builder.compact().init();
    }
}

fn resolve_hostname(flag: Option<String>, configured: &str) -> String {
    if let Some(name) = flag.filter(|n| !n.is_empty()) {
        return name;
    }
    if !configured.is_empty() {
        return configured.to_string();
    }
    std::env::var("HOSTNAME")
        .ok()
        .filter(|n| !n.is_empty())
        .or_else(|| {
            std::fs::read_to_string("/etc/hostname")
                .ok()
                .map(|n| n.trim().to_string())
        })
        .unwrap_or_else(|| "localhost".to_string())
}

async fn run(args: Args) -> Result<()> {
    let config = DataplaneConfig::load_or_default(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    config.validate().context("invalid configuration")?;

    let hostname = resolve_hostname(args.hostname, &config.dataplane.hostname);
    info!(hostname = %hostname, config = %args.config.display(), "Configuration loaded");

    let kernel = Arc::new(SimulatedKernel::new());
    kernel.add_link(
        &config.simulation.parent_iface,
        vec![config.simulation.parent_addr.into()],
    );

    let metrics = Arc::new(Metrics::new().context("registering metrics")?);
    let cancel = CancellationToken::new();
    let agent = Agent::assemble(&config, &hostname, kernel, Arc::clone(&metrics), cancel.clone());
    let Agent {
        dataplane,
        handles,
        vxlan_keeper,
        ..
    } = agent;

    let mut tasks = tokio::task::JoinSet::new();
    if let Some(keeper) = vxlan_keeper {
        tasks.spawn(keeper.run(cancel.clone()));
    }
    if let Some(source) = args.events {
        let tx = handles.to_dataplane.clone();
        let cancel = cancel.clone();
        tasks.spawn(async move {
            if let Err(e) = feed_events(&source, tx, cancel).await {
                error!(error = %format!("{:#}", e), "Event feed failed");
            }
        });
    }

    let mut status_rx = handles.from_dataplane;
    let mut health_rx = handles.health;
    {
        let cancel = cancel.clone();
        tasks.spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    status = status_rx.recv() => match status {
                        Some(status) => match serde_json::to_string(&status) {
                            Ok(json) => info!(status = %json, "Dataplane status"),
                            Err(e) => warn!(error = %e, "Failed to encode status"),
                        },
                        None => return,
                    },
                    changed = health_rx.changed() => {
                        if changed.is_err() {
                            return;
                        }
                        let health = *health_rx.borrow_and_update();
                        debug!(live = health.live, ready = health.ready, "Health report");
                    }
                }
            }
        });
    }

    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    warn!("Received SIGINT, shutting down gracefully...");
                    cancel.cancel();
                }
                Err(e) => error!(error = %e, "Failed to listen for ctrl-c"),
            }
        });
    }

    let result = dataplane.run().await;
    cancel.cancel();
    while tasks.join_next().await.is_some() {}

    match metrics.encode() {
        Ok(text) => debug!(metrics = %text, "Final metrics"),
        Err(e) => warn!(error = %e, "Failed to encode metrics"),
    }
    result.context("dataplane stopped")
}

async fn feed_events(
    source: &str,
    tx: mpsc::Sender<DataplaneEvent>,
    cancel: CancellationToken,
) -> Result<()> {
    let reader: Box<dyn AsyncRead + Unpin + Send> = if source == "-" {
        Box::new(tokio::io::stdin())
    } else {
        Box::new(
            tokio::fs::File::open(source)
                .await
                .with_context(|| format!("opening event feed {}", source))?,
        )
    };
    let mut lines = BufReader::new(reader).lines();
    let mut line_no = 0usize;

    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            line = lines.next_line() => line.context("reading event feed")?,
        };
        let Some(line) = line else {
            info!(lines = line_no, "Event feed finished");
            return Ok(());
        };
        line_no += 1;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        match serde_json::from_str::<DataplaneEvent>(line) {
            Ok(event) => {
                if tx.send(event).await.is_err() {
                    return Ok(());
                }
            }
            Err(e) => warn!(line = line_no, error = %e, "Skipping malformed event"),
        }
    }
}
