//! Prometheus metrics for the capture engine's own operation.

use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use std::sync::Arc;

/// Operational counters of a running engine, exposed in Prometheus text
/// format.
#[derive(Clone)]
pub struct MetricsCollector {
    // Counters
    packets_received: IntCounter,
    bytes_received: IntCounter,
    vlan_filtered: IntCounter,
    flow_overflow: IntCounter,
    records_exported: IntCounter,
    port_missed: IntCounterVec,
    port_no_buffer: IntCounterVec,
    table_reloads: IntCounterVec,

    // Gauges
    live_flows: IntGauge,

    // Histograms
    export_duration_seconds: Histogram,

    registry: Arc<Registry>,
}

impl MetricsCollector {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let packets_received = IntCounter::new(
            "flowstat_packets_received_total",
            "Packets received across all ports",
        )?;
        registry.register(Box::new(packets_received.clone()))?;

        let bytes_received = IntCounter::new(
            "flowstat_bytes_received_total",
            "Wire bytes received across all ports",
        )?;
        registry.register(Box::new(bytes_received.clone()))?;

        let vlan_filtered = IntCounter::new(
            "flowstat_vlan_filtered_total",
            "Tagged packets dropped for a VLAN not carried by their port",
        )?;
        registry.register(Box::new(vlan_filtered.clone()))?;

        let flow_overflow = IntCounter::new(
            "flowstat_flow_overflow_total",
            "Packets not counted because their core's flow table was full",
        )?;
        registry.register(Box::new(flow_overflow.clone()))?;

        let records_exported = IntCounter::new(
            "flowstat_records_exported_total",
            "Flow records emitted to the metric sink",
        )?;
        registry.register(Box::new(records_exported.clone()))?;

        let port_missed = IntCounterVec::new(
            Opts::new(
                "flowstat_port_missed_total",
                "Packets dropped by the receiver before being polled",
            ),
            &["port"],
        )?;
        registry.register(Box::new(port_missed.clone()))?;

        let port_no_buffer = IntCounterVec::new(
            Opts::new(
                "flowstat_port_no_buffer_total",
                "Receive failures for lack of buffers",
            ),
            &["port"],
        )?;
        registry.register(Box::new(port_no_buffer.clone()))?;

        let table_reloads = IntCounterVec::new(
            Opts::new("flowstat_table_reloads_total", "Lookup table rebuilds"),
            &["table", "result"],
        )?;
        registry.register(Box::new(table_reloads.clone()))?;

        let live_flows = IntGauge::new(
            "flowstat_live_flows",
            "Flows currently held in the per-core tables",
        )?;
        registry.register(Box::new(live_flows.clone()))?;

        let export_duration_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "flowstat_export_duration_seconds",
                "Time to drain and emit all flow tables",
            )
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
        )?;
        registry.register(Box::new(export_duration_seconds.clone()))?;

        Ok(Self {
            packets_received,
            bytes_received,
            vlan_filtered,
            flow_overflow,
            records_exported,
            port_missed,
            port_no_buffer,
            table_reloads,
            live_flows,
            export_duration_seconds,
            registry: Arc::new(registry),
        })
    }

    pub fn add_received(&self, packets: u64, bytes: u64) {
        self.packets_received.inc_by(packets);
        self.bytes_received.inc_by(bytes);
    }

    pub fn add_vlan_filtered(&self, packets: u64) {
        self.vlan_filtered.inc_by(packets);
    }

    pub fn add_flow_overflow(&self, packets: u64) {
        self.flow_overflow.inc_by(packets);
    }

    pub fn add_records_exported(&self, records: u64) {
        self.records_exported.inc_by(records);
    }

    pub fn add_port_drops(&self, port: u8, missed: u64, no_buffer: u64) {
        let port = port.to_string();
        self.port_missed.with_label_values(&[&port]).inc_by(missed);
        self.port_no_buffer.with_label_values(&[&port]).inc_by(no_buffer);
    }

    /// Counts a table rebuild attempt.
    pub fn record_reload(&self, table: &str, success: bool) {
        let result = if success { "ok" } else { "error" };
        self.table_reloads
            .with_label_values(&[table, result])
            .inc();
    }

    pub fn set_live_flows(&self, flows: usize) {
        self.live_flows.set(flows as i64);
    }

    /// Starts timing one export pass.
    pub fn start_export_timer(&self) -> prometheus::HistogramTimer {
        self.export_duration_seconds.start_timer()
    }

    /// Gather metrics in Prometheus text format
    pub fn gather_metrics(&self) -> String {
        let encoder = TextEncoder::new();
        let mut buf = vec![];
        encoder.encode(&self.registry.gather(), &mut buf).ok();
        String::from_utf8(buf).unwrap_or_else(|_| String::from("# Error encoding metrics\n"))
    }
}
