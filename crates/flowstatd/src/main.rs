//! Flow Statistics Daemon
//!
//! Loads the engine configuration, replays pcap captures through the engine
//! and writes exported flow records to stdout as JSON lines.

use anyhow::{Context, Result};
use clap::Parser;
use flowstatd::{Engine, FlowstatConfig, JsonLinesSink, MetricSink, PcapDriver};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "flowstatd", version, about = "Flow capture and aggregation daemon")]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long, value_name = "PATH")]
    config: PathBuf,

    /// Capture file to replay on a port, as PORT=FILE (repeatable)
    #[arg(long = "pcap", value_name = "PORT=FILE", value_parser = parse_pcap_mapping)]
    pcap: Vec<(u8, PathBuf)>,

    /// Log filter used when RUST_LOG is not set
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Print the Prometheus text exposition to stderr on exit
    #[arg(long)]
    metrics: bool,

    /// Stop after this many seconds instead of waiting for SIGINT
    #[arg(long, value_name = "SECS")]
    duration: Option<u64>,
}

fn parse_pcap_mapping(arg: &str) -> std::result::Result<(u8, PathBuf), String> {
    let (port, file) = arg
        .split_once('=')
        .ok_or_else(|| format!("expected PORT=FILE, got {:?}", arg))?;
    let port = port
        .trim()
        .parse::<u8>()
        .map_err(|e| format!("invalid port index {:?}: {}", port, e))?;
    if file.is_empty() {
        return Err("capture file path is empty".to_string());
    }
    Ok((port, PathBuf::from(file)))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level)?;

    info!("flowstatd: Starting flow statistics daemon");

    match run_daemon(args).await {
        Ok(()) => {
            info!("flowstatd: Daemon exiting normally");
            Ok(())
        }
        Err(e) => {
            error!(error = %format!("{:#}", e), "flowstatd: Daemon exiting with error");
            Err(e)
        }
    }
}

/// Logs go to stderr; stdout carries the exported records.
fn init_logging(level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .with_context(|| format!("invalid log level {:?}", level))?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_names(true)
        .compact()
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to set logger: {}", e))?;

    Ok(())
}

async fn run_daemon(args: Args) -> Result<()> {
    let config = FlowstatConfig::from_file(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    let mut engine = Engine::init(&config).context("initializing engine")?;

    let driver = PcapDriver::new(args.pcap.into_iter().collect::<HashMap<_, _>>());
    let sink: Arc<dyn MetricSink> = Arc::new(JsonLinesSink::new(std::io::stdout()));
    engine
        .start(&driver, sink)
        .context("starting engine")?;
    info!(
        cores = engine.config().cores.len(),
        "flowstatd: Capturing, press Ctrl-C to stop"
    );

    tokio::select! {
        result = signal::ctrl_c() => {
            result.context("waiting for SIGINT")?;
            info!("flowstatd: Received SIGINT");
        }
        _ = run_for(args.duration.map(Duration::from_secs)) => {
            info!("flowstatd: Run duration elapsed");
        }
    }

    engine.stop();
    engine.wait().await;

    let stats = engine.stats();
    info!(
        rx_packets = stats.rx_packets,
        records_exported = stats.records_exported,
        "flowstatd: Graceful shutdown complete"
    );

    if args.metrics {
        if let Some(text) = engine.metrics_text() {
            eprint!("{}", text);
        }
    }
    Ok(())
}

async fn run_for(duration: Option<Duration>) {
    match duration {
        Some(duration) => tokio::time::sleep(duration).await,
        None => std::future::pending().await,
    }
}
