//! Capture workers: one polling thread per configured core.

use crate::aggregator::Aggregator;
use crate::config::{CoreSpec, PortSpec};
use crate::flow::{app_id, AggregateFlags, AggregationSpec, Direction, FlowKey};
use crate::local_nets::LocalNetworks;
use crate::packet::{parse_frame, Frame};
use crate::reload::SharedTable;
use crate::rib::AsTable;
use crate::source::{Packet, PacketSource};
use crate::stats::{EngineStats, PortStatsCell};
use flowstat_types::HostAddr;
use std::io;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Most packets taken from one port per poll.
pub const BURST_SIZE: usize = 32;

/// What became of one received packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Reduced flow key and byte count to record
    Flow(FlowKey, u32),
    /// Dropped for a VLAN its port does not carry
    VlanFiltered(u16),
}

/// Turns received frames into reduced flow keys.
#[derive(Debug, Clone)]
pub struct FlowClassifier {
    local_networks: LocalNetworks,
    aggregation: AggregationSpec,
}

impl FlowClassifier {
    pub fn new(local_networks: LocalNetworks, aggregation: AggregationSpec) -> Self {
        FlowClassifier {
            local_networks,
            aggregation,
        }
    }

    pub fn classify(&self, packet: &Packet, port: &PortSpec, as_table: &AsTable) -> Outcome {
        let parsed = match parse_frame(&packet.data, packet.wire_len, port) {
            Frame::Accepted(parsed) => parsed,
            Frame::VlanFiltered(vid) => return Outcome::VlanFiltered(vid),
        };

        let Some(ip) = parsed.ip else {
            return Outcome::Flow(FlowKey::wildcard(Direction::Unknown), parsed.bytes);
        };

        let direction = self.local_networks.classify(ip.src, ip.dst);
        let mask = self.aggregation.mask_for(direction);
        // lookups are the costly part of the packet path; skip unselected ones
        let src_as = mask
            .contains(AggregateFlags::SRC_AS)
            .then(|| as_table.lookup(ip.src));
        let dst_as = mask
            .contains(AggregateFlags::DST_AS)
            .then(|| as_table.lookup(ip.dst));

        let key = FlowKey {
            direction,
            port: Some(port.index),
            af: Some(ip.af),
            proto: ip.proto,
            vlan: Some(parsed.vlan),
            src_host: HostAddr::from(ip.src),
            dst_host: HostAddr::from(ip.dst),
            src_as,
            dst_as,
            src_port: ip.src_port,
            dst_port: ip.dst_port,
            app: Some(app_id(
                ip.proto,
                ip.src_port.unwrap_or(0),
                ip.dst_port.unwrap_or(0),
            )),
        };
        Outcome::Flow(key.masked(mask), parsed.bytes)
    }
}

/// A port's receive queue together with its published counters.
pub(crate) struct PortQueue {
    pub(crate) spec: PortSpec,
    pub(crate) source: Box<dyn PacketSource>,
    pub(crate) stats: PortStatsCell,
}

/// Packet path state shared by every port of one core.
struct Pipeline {
    classifier: Arc<FlowClassifier>,
    aggregator: Arc<Aggregator>,
    as_table: Arc<SharedTable<AsTable>>,
    stats: Arc<EngineStats>,
}

impl Pipeline {
    fn process(&self, port: &PortSpec, burst: &[Packet], as_table: &AsTable) {
        let mut rx_bytes = 0u64;
        let mut filtered = 0u64;
        let mut overflow = 0u64;

        {
            let mut table = self.aggregator.lock();
            for packet in burst {
                rx_bytes += u64::from(packet.wire_len);
                match self.classifier.classify(packet, port, as_table) {
                    Outcome::Flow(key, bytes) => {
                        if !table.record(key, bytes) {
                            overflow += 1;
                        }
                    }
                    Outcome::VlanFiltered(vid) => {
                        trace!(port = port.index, vlan = vid, "dropped packet for foreign VLAN");
                        filtered += 1;
                    }
                }
            }
        }

        let stats = &self.stats;
        if filtered > 0 {
            stats.vlan_filtered.fetch_add(filtered, Ordering::Relaxed);
        }
        if overflow > 0 {
            stats.flow_overflow.fetch_add(overflow, Ordering::Relaxed);
        }
        stats.rx_bytes.fetch_add(rx_bytes, Ordering::Relaxed);
        // published last: a reader that sees the packets sees their outcome
        stats
            .rx_packets
            .fetch_add(burst.len() as u64, Ordering::Release);
    }
}

/// Polls the ports of one core until shutdown.
pub(crate) struct CaptureWorker {
    core: u32,
    pin: bool,
    ports: Vec<PortQueue>,
    pipeline: Pipeline,
    shutdown: CancellationToken,
}

impl CaptureWorker {
    pub(crate) fn new(
        core: &CoreSpec,
        ports: Vec<PortQueue>,
        classifier: Arc<FlowClassifier>,
        aggregator: Arc<Aggregator>,
        as_table: Arc<SharedTable<AsTable>>,
        stats: Arc<EngineStats>,
        shutdown: CancellationToken,
    ) -> Self {
        CaptureWorker {
            core: core.index,
            pin: false,
            ports,
            pipeline: Pipeline {
                classifier,
                aggregator,
                as_table,
                stats,
            },
            shutdown,
        }
    }

    /// Pins the worker thread to the CPU numbered like its core.
    pub(crate) fn pinned(mut self, pin: bool) -> Self {
        self.pin = pin;
        self
    }

    pub(crate) fn spawn(self) -> io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name(format!("flowstat-core{}", self.core))
            .spawn(move || self.run())
    }

    fn run(mut self) {
        if self.pin {
            pin_to_core(self.core);
        }
        info!(
            core = self.core,
            ports = self.ports.len(),
            "capture worker started"
        );

        let mut burst = Vec::with_capacity(BURST_SIZE);
        while !self.shutdown.is_cancelled() {
            // one table reference per polling round
            let as_table = self.pipeline.as_table.load();
            for port in &mut self.ports {
                burst.clear();
                if port.source.rx_burst(&mut burst, BURST_SIZE) > 0 {
                    self.pipeline.process(&port.spec, &burst, &as_table);
                }
                *port.stats.lock() = port.source.stats();
            }
        }

        info!(core = self.core, "capture worker stopped");
    }
}

#[cfg(target_os = "linux")]
fn pin_to_core(core: u32) {
    use nix::sched::{sched_setaffinity, CpuSet};
    use nix::unistd::Pid;

    let mut cpus = CpuSet::new();
    let result = cpus
        .set(core as usize)
        .and_then(|()| sched_setaffinity(Pid::from_raw(0), &cpus));
    match result {
        Ok(()) => debug!(core, "pinned capture worker"),
        Err(e) => warn!(core, error = %e, "failed to pin capture worker, running unpinned"),
    }
}

#[cfg(not(target_os = "linux"))]
fn pin_to_core(core: u32) {
    debug!(core, "CPU pinning not supported on this platform");
}
