//! Periodic drain of the flow tables into the metric sink.

use crate::aggregator::Aggregator;
use crate::app_table::AppTable;
use crate::flow::FlowRecord;
use crate::metrics::MetricsCollector;
use crate::reload::SharedTable;
use crate::sink::{FlowMetric, FlowTags, MetricSink, MEASUREMENT};
use crate::stats::EngineStats;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fmt::Display;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

const UNKNOWN: &str = "unknown";
const MASKED: &str = "-1";

fn or_masked<T: Display>(value: Option<T>) -> String {
    value.map_or_else(|| MASKED.to_string(), |v| v.to_string())
}

/// Renders one drained record as an emitted metric.
///
/// `ports` maps port index to description; `apps` resolves application ids.
pub fn render(
    record: &FlowRecord,
    ports: &HashMap<u8, String>,
    apps: &AppTable,
    timestamp: DateTime<Utc>,
) -> FlowMetric {
    let key = &record.key;
    let iface = key
        .port
        .and_then(|index| ports.get(&index))
        .cloned()
        .unwrap_or_else(|| UNKNOWN.to_string());
    let af = key.af.map_or(UNKNOWN, |af| af.as_str());
    let app_desc = key.app.map_or_else(String::new, |app| apps.describe(app));

    FlowMetric {
        measurement: MEASUREMENT,
        tags: FlowTags {
            iface,
            direction: key.direction.as_str().to_string(),
            af: af.to_string(),
            proto: key.proto.to_string(),
            vlan: or_masked(key.vlan),
            src_host: key.src_host.to_string(),
            dst_host: key.dst_host.to_string(),
            src_as: or_masked(key.src_as),
            dst_as: or_masked(key.dst_as),
            src_port: or_masked(key.src_port),
            dst_port: or_masked(key.dst_port),
            app: format!("{:08x}", key.app.unwrap_or(0)),
            app_desc,
        },
        packets: record.packets,
        bytes: record.bytes,
        timestamp,
    }
}

/// Drains every core's aggregator and emits one metric per flow.
pub(crate) struct Exporter {
    aggregators: Vec<Arc<Aggregator>>,
    ports: HashMap<u8, String>,
    apps: Arc<SharedTable<AppTable>>,
    sink: Arc<dyn MetricSink>,
    stats: Arc<EngineStats>,
    metrics: MetricsCollector,
}

impl Exporter {
    pub(crate) fn new(
        aggregators: Vec<Arc<Aggregator>>,
        ports: HashMap<u8, String>,
        apps: Arc<SharedTable<AppTable>>,
        sink: Arc<dyn MetricSink>,
        stats: Arc<EngineStats>,
        metrics: MetricsCollector,
    ) -> Self {
        Exporter {
            aggregators,
            ports,
            apps,
            sink,
            stats,
            metrics,
        }
    }

    /// Returns the number of records emitted.
    pub(crate) fn export(&self) -> usize {
        let _timer = self.metrics.start_export_timer();
        let apps = self.apps.load();
        let timestamp = Utc::now();

        let mut emitted = 0;
        for aggregator in &self.aggregators {
            let records = aggregator.drain();
            debug!(core = aggregator.core(), records = records.len(), "drained flow table");
            for record in &records {
                self.sink
                    .emit(render(record, &self.ports, &apps, timestamp));
            }
            emitted += records.len();
        }

        self.stats
            .records_exported
            .fetch_add(emitted as u64, Ordering::Relaxed);
        emitted
    }
}

/// Exports every `period` until cancelled.
///
/// The shutdown drain is left to [`crate::Engine::wait`], which runs it once
/// the capture workers have stopped writing.
pub(crate) async fn run_export_task(
    exporter: Arc<Exporter>,
    period: Duration,
    shutdown: CancellationToken,
) {
    let start = tokio::time::Instant::now() + period;
    let mut tick = tokio::time::interval_at(start, period);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tick.tick() => {
                let records = exporter.export();
                debug!(records, "export tick");
            }
        }
    }
    debug!("export task stopped");
}
