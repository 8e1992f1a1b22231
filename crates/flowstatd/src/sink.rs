//! Emitted flow metrics and the sinks that receive them.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::io::Write;
use tokio::sync::mpsc;
use tracing::warn;

/// Measurement name of every emitted record.
pub const MEASUREMENT: &str = "flowstat";

/// Tag set of one flow record, rendered as text.
///
/// Masked fields carry their wildcard rendering: `unknown` for `iface` and
/// `af`, `0` for `proto`, `-1` for `vlan`, AS numbers and ports, `0.0.0.0`
/// for hosts, `00000000` for `app` with an empty `app_desc`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FlowTags {
    pub iface: String,
    pub direction: String,
    pub af: String,
    pub proto: String,
    pub vlan: String,
    pub src_host: String,
    pub dst_host: String,
    pub src_as: String,
    pub dst_as: String,
    pub src_port: String,
    pub dst_port: String,
    pub app: String,
    pub app_desc: String,
}

impl FlowTags {
    /// Tag name and value pairs, in a fixed order.
    pub fn pairs(&self) -> [(&'static str, &str); 13] {
        [
            ("iface", self.iface.as_str()),
            ("direction", self.direction.as_str()),
            ("af", self.af.as_str()),
            ("proto", self.proto.as_str()),
            ("vlan", self.vlan.as_str()),
            ("src_host", self.src_host.as_str()),
            ("dst_host", self.dst_host.as_str()),
            ("src_as", self.src_as.as_str()),
            ("dst_as", self.dst_as.as_str()),
            ("src_port", self.src_port.as_str()),
            ("dst_port", self.dst_port.as_str()),
            ("app", self.app.as_str()),
            ("app_desc", self.app_desc.as_str()),
        ]
    }
}

/// One flow's totals for an export interval, as a gauge sample.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FlowMetric {
    pub measurement: &'static str,
    pub tags: FlowTags,
    pub packets: u64,
    pub bytes: u64,
    pub timestamp: DateTime<Utc>,
}

/// Receives flow metrics, once per flow per export tick.
pub trait MetricSink: Send + Sync {
    fn emit(&self, metric: FlowMetric);
}

/// Forwards metrics to a closure.
pub struct FnSink<F>(F);

impl<F> FnSink<F>
where
    F: Fn(FlowMetric) + Send + Sync,
{
    pub fn new(f: F) -> Self {
        FnSink(f)
    }
}

impl<F> MetricSink for FnSink<F>
where
    F: Fn(FlowMetric) + Send + Sync,
{
    fn emit(&self, metric: FlowMetric) {
        (self.0)(metric)
    }
}

/// Forwards metrics into an unbounded channel. Metrics emitted after the
/// receiver is dropped are discarded.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<FlowMetric>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<FlowMetric>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ChannelSink { tx }, rx)
    }
}

impl MetricSink for ChannelSink {
    fn emit(&self, metric: FlowMetric) {
        let _ = self.tx.send(metric);
    }
}

/// Writes each metric as one JSON object per line.
pub struct JsonLinesSink<W> {
    writer: Mutex<W>,
}

impl<W: Write + Send> JsonLinesSink<W> {
    pub fn new(writer: W) -> Self {
        JsonLinesSink {
            writer: Mutex::new(writer),
        }
    }

    pub fn into_inner(self) -> W {
        self.writer.into_inner()
    }
}

impl<W: Write + Send> MetricSink for JsonLinesSink<W> {
    fn emit(&self, metric: FlowMetric) {
        let mut writer = self.writer.lock();
        if let Err(e) = write_line(&mut *writer, &metric) {
            warn!(error = %e, "failed to write flow metric");
        }
    }
}

fn write_line<W: Write>(writer: &mut W, metric: &FlowMetric) -> std::io::Result<()> {
    serde_json::to_writer(&mut *writer, metric)?;
    writer.write_all(b"\n")?;
    writer.flush()
}
