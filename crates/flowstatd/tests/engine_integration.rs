//! End-to-end tests of the capture engine
//!
//! Packets are replayed through an in-memory port driver and the exported
//! records are collected from a channel sink.

use flowstatd::packet::testing::{ipv4_frame, ipv6_frame};
use flowstatd::packet::{IPPROTO_TCP, IPPROTO_UDP};
use flowstatd::rib::testing::rib_record;
use flowstatd::*;
use flowstat_types::AsNumber;
use pretty_assertions::assert_eq;
use serial_test::serial;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tokio::sync::mpsc::UnboundedReceiver;

// ============================================================================
// TEST UTILITIES
// ============================================================================

const LOCAL_V4: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 10);
const REMOTE_V4: Ipv4Addr = Ipv4Addr::new(198, 51, 100, 1);

fn local_v6() -> Ipv6Addr {
    "2001:db8:1::10".parse().unwrap()
}

fn remote_v6() -> Ipv6Addr {
    "2001:db8:9::1".parse().unwrap()
}

/// One core with one port, the same flags for every direction class.
fn config_toml(flags: &str, extra: &str) -> String {
    format!(
        r#"
main_core_index = 0
interval = 3600
local_nets_ipv4 = ["192.168.1.0/24"]
local_nets_ipv6 = ["2001:db8:1::/48"]
aggregate_incoming = {flags}
aggregate_outgoing = {flags}
aggregate_internal = {flags}
aggregate_external = {flags}
protocols_path = "/nonexistent/protocols"
services_path = "/nonexistent/services"
pin_workers = false
{extra}

[[core]]
index = 1
  [[core.port]]
  index = 0
  description = "uplink"
  port_vlan_id = 1
  tag_vlan_ids = [2]
"#
    )
}

fn engine_for(toml: &str) -> Engine {
    let config = FlowstatConfig::from_toml_str(toml).unwrap();
    // each test gets its own slot so engines can run in parallel
    let registry: &'static EngineRegistry = Box::leak(Box::new(EngineRegistry::new()));
    Engine::init_in(registry, &config).unwrap()
}

/// Hands out its packets in one burst after `delay`, then idles.
struct SlowSource {
    delay: Duration,
    packets: Vec<Packet>,
    stats: PortStats,
}

impl PacketSource for SlowSource {
    fn rx_burst(&mut self, buf: &mut Vec<Packet>, max: usize) -> usize {
        std::thread::sleep(self.delay);
        let count = self.packets.len().min(max);
        for packet in self.packets.drain(..count) {
            self.stats.rx_packets += 1;
            self.stats.rx_bytes += u64::from(packet.wire_len);
            buf.push(packet);
        }
        count
    }

    fn stats(&self) -> PortStats {
        self.stats
    }
}

struct SlowDriver {
    delay: Duration,
    packets: Vec<Packet>,
}

impl PortDriver for SlowDriver {
    fn open(&self, _port: &PortSpec) -> std::io::Result<Box<dyn PacketSource>> {
        Ok(Box::new(SlowSource {
            delay: self.delay,
            packets: self.packets.clone(),
            stats: PortStats::default(),
        }))
    }
}

fn start(
    engine: &mut Engine,
    packets: Vec<Packet>,
) -> UnboundedReceiver<FlowMetric> {
    let driver = ReplayDriver::new().with_packets(0, packets);
    let (sink, rx) = ChannelSink::new();
    engine.start(&driver, Arc::new(sink)).unwrap();
    rx
}

async fn wait_until<F: FnMut() -> bool>(mut done: F) -> bool {
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    done()
}

fn collect(rx: &mut UnboundedReceiver<FlowMetric>) -> Vec<FlowMetric> {
    let mut metrics = Vec::new();
    while let Ok(metric) = rx.try_recv() {
        metrics.push(metric);
    }
    metrics
}

/// Pushes the modification time of `path` ahead of any earlier write.
fn touch_ahead(path: &Path, secs: u64) {
    let file = File::options().write(true).open(path).unwrap();
    file.set_modified(SystemTime::now() + Duration::from_secs(secs))
        .unwrap();
}

fn tcp_v4(src: Ipv4Addr, dst: Ipv4Addr) -> Packet {
    Packet::new(ipv4_frame(None, src, dst, IPPROTO_TCP, 443, 50123))
}

fn udp_v6(src: Ipv6Addr, dst: Ipv6Addr) -> Packet {
    Packet::new(ipv6_frame(None, src, dst, IPPROTO_UDP, 5353, 53))
}

// ============================================================================
// AGGREGATION
// ============================================================================

#[tokio::test]
async fn test_ten_packets_aggregate_into_four_records() {
    let mut engine = engine_for(&config_toml(r#"["iface", "direction", "af"]"#, ""));

    let mut packets = Vec::new();
    packets.extend((0..3).map(|_| tcp_v4(REMOTE_V4, LOCAL_V4)));
    packets.extend((0..3).map(|_| udp_v6(remote_v6(), local_v6())));
    packets.extend((0..2).map(|_| tcp_v4(LOCAL_V4, REMOTE_V4)));
    packets.extend((0..2).map(|_| udp_v6(local_v6(), remote_v6())));
    let mut rx = start(&mut engine, packets);

    assert!(wait_until(|| engine.stats().rx_packets == 10).await);
    assert_eq!(engine.export_now(), 4);

    let metrics = collect(&mut rx);
    assert_eq!(metrics.len(), 4);

    let mut counts = BTreeMap::new();
    for metric in &metrics {
        assert_eq!(metric.tags.iface, "uplink");
        assert_eq!(metric.tags.src_host, "0.0.0.0");
        assert_eq!(metric.tags.src_port, "-1");
        let key = (metric.tags.direction.clone(), metric.tags.af.clone());
        counts.insert(key, metric.packets);
    }
    let by_direction = |direction: &str| -> u64 {
        counts
            .iter()
            .filter(|((d, _), _)| d == direction)
            .map(|(_, packets)| packets)
            .sum()
    };
    assert_eq!(by_direction("incoming"), 6);
    assert_eq!(by_direction("outgoing"), 4);
    assert_eq!(counts[&("incoming".to_string(), "ipv6".to_string())], 3);
    assert_eq!(counts[&("outgoing".to_string(), "ipv4".to_string())], 2);

    // the tables were reset by the export
    assert_eq!(engine.live_flows(), 0);
    engine.stop();
    engine.wait().await;
    assert!(collect(&mut rx).is_empty());
    assert_eq!(engine.stats().records_exported, 4);
}

#[tokio::test]
async fn test_final_export_on_stop() {
    let mut engine = engine_for(&config_toml(r#"["proto"]"#, ""));
    let mut rx = start(&mut engine, vec![tcp_v4(REMOTE_V4, LOCAL_V4)]);

    assert!(wait_until(|| engine.stats().rx_packets == 1).await);
    engine.stop();
    engine.wait().await;

    let metrics = collect(&mut rx);
    assert_eq!(metrics.len(), 1);
    assert_eq!(metrics[0].tags.proto, "6");
    assert_eq!(metrics[0].tags.iface, "unknown");
}

#[tokio::test]
async fn test_burst_in_flight_at_stop_is_exported() {
    let mut engine = engine_for(&config_toml(r#"["proto"]"#, ""));
    let driver = SlowDriver {
        delay: Duration::from_millis(300),
        packets: vec![tcp_v4(REMOTE_V4, LOCAL_V4)],
    };
    let (sink, mut rx) = ChannelSink::new();
    engine.start(&driver, Arc::new(sink)).unwrap();

    // cancel while the worker is still blocked in its first burst
    tokio::time::sleep(Duration::from_millis(50)).await;
    engine.stop();
    engine.wait().await;

    assert_eq!(engine.stats().rx_packets, 1);
    assert_eq!(engine.stats().records_exported, 1);
    let metrics = collect(&mut rx);
    assert_eq!(metrics.len(), 1);
    assert_eq!(metrics[0].tags.proto, "6");
    assert_eq!(engine.export_now(), 0);
}

#[tokio::test]
async fn test_vlan_filtering() {
    let mut engine = engine_for(&config_toml(r#"["vlan"]"#, ""));
    let tagged = |vlan| Packet::new(ipv4_frame(Some(vlan), REMOTE_V4, LOCAL_V4, IPPROTO_TCP, 443, 50123));
    let carried = tagged(2);
    let wire_len = carried.wire_len;
    let mut rx = start(
        &mut engine,
        vec![carried, tagged(5), tcp_v4(REMOTE_V4, LOCAL_V4)],
    );

    assert!(wait_until(|| engine.stats().rx_packets == 3).await);
    engine.export_now();
    assert_eq!(engine.stats().vlan_filtered, 1);

    let mut metrics = collect(&mut rx);
    metrics.sort_by(|a, b| a.tags.vlan.cmp(&b.tags.vlan));
    let vlans: Vec<(&str, u64)> = metrics
        .iter()
        .map(|m| (m.tags.vlan.as_str(), m.bytes))
        .collect();
    assert_eq!(
        vlans,
        vec![("1", u64::from(wire_len) - 4), ("2", u64::from(wire_len) - 4)]
    );
}

#[tokio::test]
async fn test_flow_table_ceiling() {
    let mut engine = engine_for(&config_toml(
        r#"["src_port"]"#,
        "max_flows_per_core = 1",
    ));
    let packets = (0..3u16)
        .map(|i| Packet::new(ipv4_frame(None, REMOTE_V4, LOCAL_V4, IPPROTO_TCP, 1000 + i, 80)))
        .collect();
    let mut rx = start(&mut engine, packets);

    assert!(wait_until(|| engine.stats().rx_packets == 3).await);
    assert_eq!(engine.live_flows(), 1);
    assert_eq!(engine.stats().flow_overflow, 2);

    engine.export_now();
    let metrics = collect(&mut rx);
    assert_eq!(metrics.len(), 1);
    assert_eq!(metrics[0].tags.src_port, "1000");
}

#[tokio::test]
async fn test_application_descriptions() {
    let dir = tempfile::tempdir().unwrap();
    let protocols = dir.path().join("protocols");
    let services = dir.path().join("services");
    fs::write(&protocols, "tcp 6 TCP\nudp 17 UDP\nicmp 1 ICMP\n").unwrap();
    fs::write(&services, "https 443/tcp\nmdns 5353/udp\n").unwrap();

    let extra = format!(
        "protocols_path = {:?}\nservices_path = {:?}",
        protocols.display().to_string(),
        services.display().to_string()
    );
    let toml = config_toml(r#"["app"]"#, "").replace(
        "protocols_path = \"/nonexistent/protocols\"\nservices_path = \"/nonexistent/services\"",
        &extra,
    );
    let mut engine = engine_for(&toml);
    let mut rx = start(
        &mut engine,
        vec![
            tcp_v4(REMOTE_V4, LOCAL_V4),
            Packet::new(ipv4_frame(None, REMOTE_V4, LOCAL_V4, IPPROTO_TCP, 40000, 8443)),
            Packet::new(ipv4_frame(None, REMOTE_V4, LOCAL_V4, 1, 0, 0)),
        ],
    );
    assert!(!engine.app_table().is_empty());

    assert!(wait_until(|| engine.stats().rx_packets == 3).await);
    engine.export_now();

    let mut descs: Vec<(String, String)> = collect(&mut rx)
        .into_iter()
        .map(|m| (m.tags.app, m.tags.app_desc))
        .collect();
    descs.sort();
    assert_eq!(
        descs,
        vec![
            ("00010000".to_string(), "icmp(1)".to_string()),
            ("000601bb".to_string(), "tcp(6)/https(443)".to_string()),
            ("000620fb".to_string(), "tcp(6)/unknown(8443)".to_string()),
        ]
    );
}

// ============================================================================
// AS TABLE RELOAD
// ============================================================================

fn reload_errors(engine: &Engine) -> usize {
    engine
        .metrics_text()
        .unwrap_or_default()
        .lines()
        .filter(|line| {
            line.starts_with("flowstat_table_reloads_total{")
                && line.contains("table=\"mrt_rib\"")
                && line.contains("result=\"error\"")
        })
        .count()
}

#[tokio::test]
async fn test_as_table_reload() {
    let dir = tempfile::tempdir().unwrap();
    let rib: PathBuf = dir.path().join("mrt_rib");
    let prefix = IpAddr::V4(Ipv4Addr::new(198, 51, 100, 0));
    fs::write(&rib, rib_record(prefix, 24, &[64500, 64501])).unwrap();

    let extra = format!("mrt_rib_path = {:?}", rib.display().to_string());
    let mut engine = engine_for(&config_toml(r#"["src_as"]"#, &extra));
    let mut rx = start(&mut engine, vec![tcp_v4(REMOTE_V4, LOCAL_V4)]);

    let remote = IpAddr::V4(REMOTE_V4);
    assert_eq!(engine.as_table().lookup(remote), AsNumber::new(64501));

    assert!(wait_until(|| engine.stats().rx_packets == 1).await);
    engine.export_now();
    let metrics = collect(&mut rx);
    assert_eq!(metrics[0].tags.src_as, "64501");
    assert_eq!(metrics[0].tags.dst_as, "-1");

    // snapshot B replaces A
    fs::write(&rib, rib_record(prefix, 24, &[64500, 65010])).unwrap();
    touch_ahead(&rib, 10);
    assert!(wait_until(|| engine.as_table().lookup(remote) == AsNumber::new(65010)).await);

    // a malformed snapshot leaves B in place
    let good = rib_record(prefix, 24, &[64500, 65020]);
    fs::write(&rib, &good[..good.len() - 3]).unwrap();
    touch_ahead(&rib, 20);
    assert!(wait_until(|| reload_errors(&engine) > 0).await);
    assert_eq!(engine.as_table().lookup(remote), AsNumber::new(65010));

    engine.stop();
    engine.wait().await;
}

#[tokio::test]
async fn test_missing_snapshot_is_not_fatal() {
    let extra = "mrt_rib_path = \"/nonexistent/mrt_rib\"";
    let mut engine = engine_for(&config_toml(r#"["src_as"]"#, extra));
    let _rx = start(&mut engine, Vec::new());

    assert!(engine.is_running());
    assert!(engine.as_table().is_empty());
    assert_eq!(
        engine.as_table().lookup(IpAddr::V4(REMOTE_V4)),
        AsNumber::UNKNOWN
    );
    engine.stop();
    engine.wait().await;
}

// ============================================================================
// LIFECYCLE
// ============================================================================

#[test]
#[serial]
fn test_global_registry_singleton() {
    let config = FlowstatConfig::from_toml_str(&config_toml(r#"["iface"]"#, "")).unwrap();

    let engine = Engine::init(&config).unwrap();
    assert!(matches!(
        Engine::init(&config),
        Err(EngineError::SingletonViolation)
    ));

    drop(engine);
    assert!(Engine::init(&config).is_ok());
}

#[test]
#[serial]
fn test_invalid_config_rejected_at_init() {
    let toml = config_toml(r#"["iface", "bogus"]"#, "");
    let config = FlowstatConfig::from_toml_str(&toml).unwrap();
    let err = Engine::init(&config).err().unwrap();
    assert!(err.to_string().contains("bogus"), "{err}");
    assert!(!EngineRegistry::global().is_active());
}
