//! Packet-receive capability.
//!
//! The engine never talks to a NIC directly: each configured port is opened
//! through a [`PortDriver`], which hands back a [`PacketSource`] the capture
//! worker polls in bursts.

use crate::config::PortSpec;
use std::collections::{HashMap, VecDeque};
use std::fs::File;
use std::io;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;
use tracing::{info, warn};

/// A received frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub data: Vec<u8>,
    /// Length on the wire; may exceed `data.len()` for truncated captures
    pub wire_len: u32,
}

impl Packet {
    pub fn new(data: Vec<u8>) -> Self {
        let wire_len = data.len() as u32;
        Packet { data, wire_len }
    }
}

/// Receive counters reported by a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PortStats {
    pub rx_packets: u64,
    pub rx_bytes: u64,
    /// Packets dropped by the receiver before being polled
    pub missed: u64,
    /// Receive failures for lack of buffers
    pub no_buffer: u64,
}

/// A port receive queue.
pub trait PacketSource: Send {
    /// Appends up to `max` received packets to `buf` and returns how many
    /// were added. May block briefly when nothing is pending.
    fn rx_burst(&mut self, buf: &mut Vec<Packet>, max: usize) -> usize;

    fn stats(&self) -> PortStats;
}

/// Opens receive queues for configured ports.
pub trait PortDriver {
    fn open(&self, port: &PortSpec) -> io::Result<Box<dyn PacketSource>>;
}

/// Replays a fixed list of packets, then idles.
#[derive(Debug)]
pub struct ReplaySource {
    queue: VecDeque<Packet>,
    stats: PortStats,
    idle: Duration,
}

impl ReplaySource {
    pub const DEFAULT_IDLE: Duration = Duration::from_millis(1);

    pub fn new(packets: Vec<Packet>) -> Self {
        ReplaySource {
            queue: packets.into(),
            stats: PortStats::default(),
            idle: Self::DEFAULT_IDLE,
        }
    }

    pub fn remaining(&self) -> usize {
        self.queue.len()
    }
}

impl PacketSource for ReplaySource {
    fn rx_burst(&mut self, buf: &mut Vec<Packet>, max: usize) -> usize {
        if self.queue.is_empty() {
            thread::sleep(self.idle);
            return 0;
        }
        let n = max.min(self.queue.len());
        for packet in self.queue.drain(..n) {
            self.stats.rx_packets += 1;
            self.stats.rx_bytes += u64::from(packet.wire_len);
            buf.push(packet);
        }
        n
    }

    fn stats(&self) -> PortStats {
        self.stats
    }
}

/// Serves in-memory packet lists keyed by port index.
///
/// Ports without packets open as empty sources.
#[derive(Debug, Default, Clone)]
pub struct ReplayDriver {
    packets: HashMap<u8, Vec<Packet>>,
}

impl ReplayDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_packets(mut self, port: u8, packets: Vec<Packet>) -> Self {
        self.packets.entry(port).or_default().extend(packets);
        self
    }
}

impl PortDriver for ReplayDriver {
    fn open(&self, port: &PortSpec) -> io::Result<Box<dyn PacketSource>> {
        let packets = self.packets.get(&port.index).cloned().unwrap_or_default();
        Ok(Box::new(ReplaySource::new(packets)))
    }
}

/// Replays pcap capture files, one per port.
#[derive(Debug, Default, Clone)]
pub struct PcapDriver {
    files: HashMap<u8, PathBuf>,
}

impl PcapDriver {
    pub fn new(files: HashMap<u8, PathBuf>) -> Self {
        PcapDriver { files }
    }

    fn read_packets(path: &PathBuf) -> io::Result<Vec<Packet>> {
        let file = File::open(path)?;
        let mut reader = pcap_file::pcap::PcapReader::new(file)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        let mut packets = Vec::new();
        while let Some(packet) = reader.next_packet() {
            let packet = packet.map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            packets.push(Packet {
                data: packet.data.into_owned(),
                wire_len: packet.orig_len,
            });
        }
        Ok(packets)
    }
}

impl PortDriver for PcapDriver {
    fn open(&self, port: &PortSpec) -> io::Result<Box<dyn PacketSource>> {
        let Some(path) = self.files.get(&port.index) else {
            warn!(port = port.index, "no capture file for port, it will stay idle");
            return Ok(Box::new(ReplaySource::new(Vec::new())));
        };
        let packets = Self::read_packets(path)?;
        info!(
            port = port.index,
            path = %path.display(),
            packets = packets.len(),
            "opened capture file"
        );
        Ok(Box::new(ReplaySource::new(packets)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowstat_types::VlanId;
    use pretty_assertions::assert_eq;

    fn port(index: u8) -> PortSpec {
        PortSpec {
            index,
            description: String::new(),
            native_vlan: VlanId::new(1).unwrap(),
            tagged_vlans: Vec::new(),
        }
    }

    #[test]
    fn test_replay_bursts() {
        let packets = (0..5u8).map(|i| Packet::new(vec![i; 60])).collect();
        let mut source = ReplaySource::new(packets);
        let mut buf = Vec::new();

        assert_eq!(source.rx_burst(&mut buf, 3), 3);
        assert_eq!(source.rx_burst(&mut buf, 3), 2);
        assert_eq!(source.rx_burst(&mut buf, 3), 0);
        assert_eq!(buf.len(), 5);
        assert_eq!(buf[4].data[0], 4);
        assert_eq!(
            source.stats(),
            PortStats {
                rx_packets: 5,
                rx_bytes: 300,
                ..Default::default()
            }
        );
    }

    #[test]
    fn test_replay_driver_ports() {
        let driver = ReplayDriver::new().with_packets(2, vec![Packet::new(vec![0; 64])]);
        let mut buf = Vec::new();
        assert_eq!(driver.open(&port(2)).unwrap().rx_burst(&mut buf, 32), 1);
        assert_eq!(driver.open(&port(5)).unwrap().rx_burst(&mut buf, 32), 0);
    }

    #[test]
    fn test_pcap_replay() {
        use pcap_file::pcap::{PcapPacket, PcapWriter};

        let file = tempfile::NamedTempFile::new().unwrap();
        {
            let mut writer = PcapWriter::new(file.reopen().unwrap()).unwrap();
            let frame = [0xaau8; 64];
            writer
                .write_packet(&PcapPacket::new(Duration::from_secs(1), 64, &frame))
                .unwrap();
            writer
                .write_packet(&PcapPacket::new(Duration::from_secs(2), 1514, &frame))
                .unwrap();
        }

        let driver = PcapDriver::new(HashMap::from([(0, file.path().to_path_buf())]));
        let mut source = driver.open(&port(0)).unwrap();
        let mut buf = Vec::new();
        assert_eq!(source.rx_burst(&mut buf, 32), 2);
        assert_eq!(buf[1].wire_len, 1514);
        assert_eq!(buf[1].data.len(), 64);

        // ports without a file idle instead of failing
        assert_eq!(driver.open(&port(1)).unwrap().rx_burst(&mut buf, 32), 0);
    }

    #[test]
    fn test_pcap_missing_file() {
        let driver = PcapDriver::new(HashMap::from([(0, PathBuf::from("/nonexistent.pcap"))]));
        assert!(driver.open(&port(0)).is_err());
    }
}
