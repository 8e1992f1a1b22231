//! Engine-wide counters and the periodic stats report.

use crate::aggregator::Aggregator;
use crate::metrics::MetricsCollector;
use crate::source::PortStats;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Counters shared by capture workers and the exporter.
#[derive(Debug, Default)]
pub struct EngineStats {
    pub rx_packets: AtomicU64,
    pub rx_bytes: AtomicU64,
    pub vlan_filtered: AtomicU64,
    pub flow_overflow: AtomicU64,
    pub records_exported: AtomicU64,
}

impl EngineStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        let rx_packets = self.rx_packets.load(Ordering::Acquire);
        StatsSnapshot {
            rx_packets,
            rx_bytes: self.rx_bytes.load(Ordering::Relaxed),
            vlan_filtered: self.vlan_filtered.load(Ordering::Relaxed),
            flow_overflow: self.flow_overflow.load(Ordering::Relaxed),
            records_exported: self.records_exported.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`EngineStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    pub rx_packets: u64,
    pub rx_bytes: u64,
    pub vlan_filtered: u64,
    pub flow_overflow: u64,
    pub records_exported: u64,
}

impl StatsSnapshot {
    /// Counter increase since `earlier`.
    pub fn since(&self, earlier: &StatsSnapshot) -> StatsSnapshot {
        StatsSnapshot {
            rx_packets: self.rx_packets.saturating_sub(earlier.rx_packets),
            rx_bytes: self.rx_bytes.saturating_sub(earlier.rx_bytes),
            vlan_filtered: self.vlan_filtered.saturating_sub(earlier.vlan_filtered),
            flow_overflow: self.flow_overflow.saturating_sub(earlier.flow_overflow),
            records_exported: self.records_exported.saturating_sub(earlier.records_exported),
        }
    }
}

/// Latest receive counters of one port, published by its capture worker.
pub type PortStatsCell = Arc<Mutex<PortStats>>;

/// Builds the periodic report from the shared counters.
pub(crate) struct StatsReporter {
    stats: Arc<EngineStats>,
    ports: Vec<(u8, PortStatsCell)>,
    aggregators: Vec<Arc<Aggregator>>,
    metrics: MetricsCollector,
    last: StatsSnapshot,
    last_ports: HashMap<u8, PortStats>,
}

impl StatsReporter {
    pub(crate) fn new(
        stats: Arc<EngineStats>,
        ports: Vec<(u8, PortStatsCell)>,
        aggregators: Vec<Arc<Aggregator>>,
        metrics: MetricsCollector,
    ) -> Self {
        StatsReporter {
            stats,
            ports,
            aggregators,
            metrics,
            last: StatsSnapshot::default(),
            last_ports: HashMap::new(),
        }
    }

    /// Logs and publishes the change since the previous report.
    pub(crate) fn report(&mut self) -> StatsSnapshot {
        let now = self.stats.snapshot();
        let delta = now.since(&self.last);
        self.last = now;

        let live_flows: usize = self.aggregators.iter().map(|a| a.len()).sum();

        self.metrics.add_received(delta.rx_packets, delta.rx_bytes);
        self.metrics.add_vlan_filtered(delta.vlan_filtered);
        self.metrics.add_flow_overflow(delta.flow_overflow);
        self.metrics.add_records_exported(delta.records_exported);
        self.metrics.set_live_flows(live_flows);

        info!(
            rx_packets = delta.rx_packets,
            rx_bytes = delta.rx_bytes,
            records_exported = delta.records_exported,
            flow_overflow = delta.flow_overflow,
            vlan_filtered = delta.vlan_filtered,
            live_flows,
            "stats"
        );

        for (port, cell) in &self.ports {
            let current = *cell.lock();
            let previous = self.last_ports.insert(*port, current).unwrap_or_default();
            let missed = current.missed.saturating_sub(previous.missed);
            let no_buffer = current.no_buffer.saturating_sub(previous.no_buffer);
            self.metrics.add_port_drops(*port, missed, no_buffer);
            info!(port, missed, no_buffer, "port stats");
        }

        delta
    }
}

/// Reports every `period` until cancelled.
pub(crate) async fn run_stats_task(
    reporter: Arc<Mutex<StatsReporter>>,
    period: Duration,
    shutdown: CancellationToken,
) {
    let start = tokio::time::Instant::now() + period;
    let mut tick = tokio::time::interval_at(start, period);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tick.tick() => {
                reporter.lock().report();
            }
        }
    }
    debug!("stats task stopped");
}
