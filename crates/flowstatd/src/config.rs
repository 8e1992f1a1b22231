//! Engine configuration.
//!
//! [`FlowstatConfig`] mirrors the TOML file as written by the operator;
//! [`FlowstatConfig::normalize`] validates it and produces the
//! [`NormalizedConfig`] the engine runs on.
//!
//! ```toml
//! main_core_index = 2
//! interval = 300
//! local_nets_ipv4 = ["192.168.1.0/24"]
//! aggregate_incoming = ["iface", "direction", "af", "proto", "src_as"]
//! mrt_rib_path = "/opt/flowstat/db/mrt_rib"
//!
//! [[core]]
//! index = 3
//!   [[core.port]]
//!   index = 0
//!   description = "uplink"
//!   port_vlan_id = 1
//!   tag_vlan_ids = [2, 3]
//! ```

use crate::error::ConfigError;
use crate::flow::{AggregateFlags, AggregationSpec};
use crate::local_nets::LocalNetworks;
use flowstat_types::VlanId;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const MAX_CORES: usize = 8;
pub const MAX_PORTS_PER_CORE: usize = 8;
pub const MAX_TAG_VLANS: usize = 8;
pub const MAX_PATH_LEN: usize = 255;
pub const MAX_DESCRIPTION_LEN: usize = 64;
pub const DEFAULT_INTERVAL_SECS: u64 = 300;
pub const DEFAULT_STATS_INTERVAL_SECS: u64 = 10;
pub const DEFAULT_MAX_FLOWS_PER_CORE: usize = 262_144;

/// A receive port as configured.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortConfig {
    pub index: u8,

    #[serde(default)]
    pub description: String,

    /// VLAN assigned to untagged frames
    #[serde(default = "default_port_vlan_id")]
    pub port_vlan_id: u16,

    /// Tagged VLANs accepted on this port; other tagged frames are dropped
    #[serde(default)]
    pub tag_vlan_ids: Vec<u16>,
}

/// A processing core and the ports it polls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoreConfig {
    pub index: u32,

    #[serde(default, rename = "port")]
    pub ports: Vec<PortConfig>,
}

/// Complete flowstatd configuration file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowstatConfig {
    /// Control core; must not also be a capture core
    #[serde(default)]
    pub main_core_index: u32,

    /// Export interval in seconds (0 selects the default)
    #[serde(default = "default_interval")]
    pub interval: u64,

    #[serde(default)]
    pub local_nets_ipv4: Vec<String>,

    #[serde(default)]
    pub local_nets_ipv6: Vec<String>,

    #[serde(default)]
    pub aggregate_incoming: Vec<String>,

    #[serde(default)]
    pub aggregate_outgoing: Vec<String>,

    #[serde(default)]
    pub aggregate_internal: Vec<String>,

    #[serde(default)]
    pub aggregate_external: Vec<String>,

    /// MRT TABLE_DUMP_V2 RIB snapshot used for AS resolution
    #[serde(default)]
    pub mrt_rib_path: Option<PathBuf>,

    /// Flow table ceiling per core (0 disables the limit)
    #[serde(default = "default_max_flows_per_core")]
    pub max_flows_per_core: usize,

    #[serde(default = "default_protocols_path")]
    pub protocols_path: PathBuf,

    #[serde(default = "default_services_path")]
    pub services_path: PathBuf,

    /// Pin each capture worker to its core
    #[serde(default = "default_pin_workers")]
    pub pin_workers: bool,

    /// Stats report interval in seconds (0 selects the default)
    #[serde(default = "default_stats_interval")]
    pub stats_interval: u64,

    #[serde(default, rename = "core")]
    pub cores: Vec<CoreConfig>,
}

// Default functions
fn default_port_vlan_id() -> u16 {
    1
}

fn default_interval() -> u64 {
    DEFAULT_INTERVAL_SECS
}

fn default_max_flows_per_core() -> usize {
    DEFAULT_MAX_FLOWS_PER_CORE
}

fn default_protocols_path() -> PathBuf {
    PathBuf::from("/etc/protocols")
}

fn default_services_path() -> PathBuf {
    PathBuf::from("/etc/services")
}

fn default_pin_workers() -> bool {
    true
}

fn default_stats_interval() -> u64 {
    DEFAULT_STATS_INTERVAL_SECS
}

impl Default for FlowstatConfig {
    fn default() -> Self {
        Self {
            main_core_index: 0,
            interval: default_interval(),
            local_nets_ipv4: Vec::new(),
            local_nets_ipv6: Vec::new(),
            aggregate_incoming: Vec::new(),
            aggregate_outgoing: Vec::new(),
            aggregate_internal: Vec::new(),
            aggregate_external: Vec::new(),
            mrt_rib_path: None,
            max_flows_per_core: default_max_flows_per_core(),
            protocols_path: default_protocols_path(),
            services_path: default_services_path(),
            pin_workers: default_pin_workers(),
            stats_interval: default_stats_interval(),
            cores: Vec::new(),
        }
    }
}

impl FlowstatConfig {
    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&contents)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(contents)?)
    }

    /// Validates the configuration and derives the engine's runtime view.
    pub fn normalize(&self) -> Result<NormalizedConfig, ConfigError> {
        if self.cores.len() > MAX_CORES {
            return Err(ConfigError::TooManyCores {
                count: self.cores.len(),
                max: MAX_CORES,
            });
        }

        let mut core_indices = HashSet::new();
        let mut port_indices = HashSet::new();
        let mut cores = Vec::with_capacity(self.cores.len());

        for core in &self.cores {
            if core.index == self.main_core_index {
                return Err(ConfigError::MainCoreReused(core.index));
            }
            if !core_indices.insert(core.index) {
                return Err(ConfigError::DuplicateCore(core.index));
            }
            if core.ports.len() > MAX_PORTS_PER_CORE {
                return Err(ConfigError::TooManyPorts {
                    core: core.index,
                    count: core.ports.len(),
                    max: MAX_PORTS_PER_CORE,
                });
            }

            let mut ports = Vec::with_capacity(core.ports.len());
            for port in &core.ports {
                if !port_indices.insert(port.index) {
                    return Err(ConfigError::DuplicatePort(port.index));
                }
                ports.push(port.normalize()?);
            }
            cores.push(CoreSpec {
                index: core.index,
                ports,
            });
        }

        check_path("mrt_rib_path", self.mrt_rib_path.as_deref())?;
        check_path("protocols_path", Some(&self.protocols_path))?;
        check_path("services_path", Some(&self.services_path))?;

        let aggregation = AggregationSpec {
            incoming: AggregateFlags::parse_list("aggregate_incoming", &self.aggregate_incoming)?,
            outgoing: AggregateFlags::parse_list("aggregate_outgoing", &self.aggregate_outgoing)?,
            internal: AggregateFlags::parse_list("aggregate_internal", &self.aggregate_internal)?,
            external: AggregateFlags::parse_list("aggregate_external", &self.aggregate_external)?,
        };

        let local_networks = LocalNetworks::from_cidrs(&self.local_nets_ipv4, &self.local_nets_ipv6)?;

        Ok(NormalizedConfig {
            main_core_index: self.main_core_index,
            interval: seconds_or_default(self.interval, DEFAULT_INTERVAL_SECS),
            stats_interval: seconds_or_default(self.stats_interval, DEFAULT_STATS_INTERVAL_SECS),
            cores,
            local_networks,
            aggregation,
            mrt_rib_path: self.mrt_rib_path.clone(),
            protocols_path: self.protocols_path.clone(),
            services_path: self.services_path.clone(),
            max_flows_per_core: self.max_flows_per_core,
            pin_workers: self.pin_workers,
        })
    }
}

impl PortConfig {
    fn normalize(&self) -> Result<PortSpec, ConfigError> {
        if self.description.len() > MAX_DESCRIPTION_LEN {
            return Err(ConfigError::DescriptionTooLong {
                port: self.index,
                len: self.description.len(),
                max: MAX_DESCRIPTION_LEN,
            });
        }
        if self.tag_vlan_ids.len() > MAX_TAG_VLANS {
            return Err(ConfigError::TooManyTagVlans {
                port: self.index,
                count: self.tag_vlan_ids.len(),
                max: MAX_TAG_VLANS,
            });
        }

        let vlan = |field, value| {
            VlanId::new(value).map_err(|_| ConfigError::InvalidVlan {
                port: self.index,
                field,
                value,
            })
        };
        let native_vlan = vlan("port_vlan_id", self.port_vlan_id)?;
        let tagged_vlans = self
            .tag_vlan_ids
            .iter()
            .map(|id| vlan("tag_vlan_ids", *id))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(PortSpec {
            index: self.index,
            description: self.description.clone(),
            native_vlan,
            tagged_vlans,
        })
    }
}

fn check_path(field: &'static str, path: Option<&Path>) -> Result<(), ConfigError> {
    let len = path.map_or(0, |p| p.as_os_str().len());
    if len > MAX_PATH_LEN {
        return Err(ConfigError::PathTooLong {
            field,
            len,
            max: MAX_PATH_LEN,
        });
    }
    Ok(())
}

fn seconds_or_default(secs: u64, default: u64) -> Duration {
    Duration::from_secs(if secs == 0 { default } else { secs })
}

/// A validated receive port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortSpec {
    pub index: u8,
    pub description: String,
    pub native_vlan: VlanId,
    pub tagged_vlans: Vec<VlanId>,
}

impl PortSpec {
    /// Returns true if tagged frames of `vlan` are accepted on this port.
    pub fn accepts_tag(&self, vlan: VlanId) -> bool {
        self.tagged_vlans.contains(&vlan)
    }
}

/// A validated capture core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoreSpec {
    pub index: u32,
    pub ports: Vec<PortSpec>,
}

/// Validated configuration the engine runs on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedConfig {
    pub main_core_index: u32,
    pub interval: Duration,
    pub stats_interval: Duration,
    pub cores: Vec<CoreSpec>,
    pub local_networks: LocalNetworks,
    pub aggregation: AggregationSpec,
    pub mrt_rib_path: Option<PathBuf>,
    pub protocols_path: PathBuf,
    pub services_path: PathBuf,
    pub max_flows_per_core: usize,
    pub pin_workers: bool,
}

impl NormalizedConfig {
    /// Looks up a port by index across all cores.
    pub fn port(&self, index: u8) -> Option<&PortSpec> {
        self.cores
            .iter()
            .flat_map(|core| core.ports.iter())
            .find(|port| port.index == index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const SAMPLE: &str = r#"
main_core_index = 2
interval = 300
local_nets_ipv4 = ["192.168.1.0/24"]
local_nets_ipv6 = ["2001:db8:1::/48"]
aggregate_incoming = ["iface", "vlan", "direction", "af", "proto", "app", "src_as", "dst_host"]
aggregate_outgoing = ["iface", "vlan", "direction", "af", "proto", "app", "dst_as", "src_host"]
aggregate_internal = ["iface", "vlan", "direction", "af", "proto", "app", "dst_host", "src_host"]
aggregate_external = ["iface", "vlan", "direction", "af", "proto", "app", "dst_as", "src_as"]
mrt_rib_path = "/opt/flowstat/db/mrt_rib"

[[core]]
index = 3
  [[core.port]]
  index = 0
  description = "Port Description"
  port_vlan_id = 1
  tag_vlan_ids = [2, 3]
"#;

    fn port(index: u8) -> PortConfig {
        PortConfig {
            index,
            description: String::new(),
            port_vlan_id: 1,
            tag_vlan_ids: Vec::new(),
        }
    }

    fn core(index: u32, ports: Vec<PortConfig>) -> CoreConfig {
        CoreConfig { index, ports }
    }

    #[test]
    fn test_sample_config() {
        let config = FlowstatConfig::from_toml_str(SAMPLE).unwrap();
        let normalized = config.normalize().unwrap();

        assert_eq!(normalized.interval, Duration::from_secs(300));
        assert_eq!(normalized.cores.len(), 1);
        assert_eq!(normalized.cores[0].index, 3);

        let port = normalized.port(0).unwrap();
        assert_eq!(port.description, "Port Description");
        assert_eq!(port.native_vlan.as_u16(), 1);
        assert!(port.accepts_tag(VlanId::new(3).unwrap()));
        assert!(!port.accepts_tag(VlanId::new(4).unwrap()));

        // iface | af | proto | vlan | src_as | dst_host | app
        assert_eq!(normalized.aggregation.incoming.bits(), 0x08dd);
        assert_eq!(normalized.local_networks.ipv4().len(), 1);
        assert_eq!(
            normalized.mrt_rib_path,
            Some(PathBuf::from("/opt/flowstat/db/mrt_rib"))
        );
    }

    #[test]
    fn test_defaults() {
        let config = FlowstatConfig::from_toml_str("").unwrap();
        assert_eq!(config, FlowstatConfig::default());

        let normalized = config.normalize().unwrap();
        assert_eq!(normalized.stats_interval, Duration::from_secs(10));
        assert_eq!(normalized.max_flows_per_core, 262_144);
        assert!(normalized.pin_workers);
        assert_eq!(normalized.aggregation, AggregationSpec::default());
    }

    #[test]
    fn test_zero_interval_uses_default() {
        let config = FlowstatConfig {
            interval: 0,
            ..Default::default()
        };
        assert_eq!(
            config.normalize().unwrap().interval,
            Duration::from_secs(DEFAULT_INTERVAL_SECS)
        );
    }

    #[test]
    fn test_duplicate_port_across_cores() {
        let config = FlowstatConfig {
            cores: vec![core(1, vec![port(0)]), core(3, vec![port(0)])],
            ..Default::default()
        };
        assert!(matches!(
            config.normalize(),
            Err(ConfigError::DuplicatePort(0))
        ));
    }

    #[test]
    fn test_duplicate_core() {
        let config = FlowstatConfig {
            cores: vec![core(1, vec![port(0)]), core(1, vec![port(1)])],
            ..Default::default()
        };
        assert!(matches!(
            config.normalize(),
            Err(ConfigError::DuplicateCore(1))
        ));
    }

    #[test]
    fn test_main_core_reused() {
        let config = FlowstatConfig {
            main_core_index: 2,
            cores: vec![core(2, vec![port(0)])],
            ..Default::default()
        };
        assert!(matches!(
            config.normalize(),
            Err(ConfigError::MainCoreReused(2))
        ));
    }

    #[test]
    fn test_too_many_cores() {
        let config = FlowstatConfig {
            cores: (1..=9).map(|i| core(i, Vec::new())).collect(),
            ..Default::default()
        };
        assert!(matches!(
            config.normalize(),
            Err(ConfigError::TooManyCores { count: 9, max: 8 })
        ));
    }

    #[test]
    fn test_too_many_ports() {
        let config = FlowstatConfig {
            cores: vec![core(1, (0..9).map(port).collect())],
            ..Default::default()
        };
        assert!(matches!(
            config.normalize(),
            Err(ConfigError::TooManyPorts { core: 1, count: 9, .. })
        ));
    }

    #[test]
    fn test_unknown_flag() {
        let config = FlowstatConfig {
            aggregate_outgoing: vec!["iface".to_string(), "bogus".to_string()],
            ..Default::default()
        };
        assert!(matches!(
            config.normalize(),
            Err(ConfigError::UnknownFlag { field: "aggregate_outgoing", .. })
        ));
    }

    #[test]
    fn test_path_too_long() {
        let config = FlowstatConfig {
            mrt_rib_path: Some(PathBuf::from(format!("/{}", "a".repeat(255)))),
            ..Default::default()
        };
        assert!(matches!(
            config.normalize(),
            Err(ConfigError::PathTooLong { field: "mrt_rib_path", len: 256, .. })
        ));
    }

    #[test]
    fn test_description_too_long() {
        let mut p = port(0);
        p.description = "x".repeat(65);
        let config = FlowstatConfig {
            cores: vec![core(1, vec![p])],
            ..Default::default()
        };
        assert!(matches!(
            config.normalize(),
            Err(ConfigError::DescriptionTooLong { port: 0, len: 65, .. })
        ));
    }

    #[test]
    fn test_invalid_vlans() {
        let mut p = port(4);
        p.tag_vlan_ids = vec![10, 4095];
        let config = FlowstatConfig {
            cores: vec![core(1, vec![p])],
            ..Default::default()
        };
        assert!(matches!(
            config.normalize(),
            Err(ConfigError::InvalidVlan { port: 4, field: "tag_vlan_ids", value: 4095 })
        ));

        let mut p = port(4);
        p.port_vlan_id = 0;
        let config = FlowstatConfig {
            cores: vec![core(1, vec![p])],
            ..Default::default()
        };
        assert!(matches!(
            config.normalize(),
            Err(ConfigError::InvalidVlan { field: "port_vlan_id", .. })
        ));
    }

    #[test]
    fn test_too_many_tag_vlans() {
        let mut p = port(0);
        p.tag_vlan_ids = (2..11).collect();
        let config = FlowstatConfig {
            cores: vec![core(1, vec![p])],
            ..Default::default()
        };
        assert!(matches!(
            config.normalize(),
            Err(ConfigError::TooManyTagVlans { count: 9, .. })
        ));
    }

    #[test]
    fn test_unparsable_file() {
        assert!(matches!(
            FlowstatConfig::from_toml_str("interval = \"soon\""),
            Err(ConfigError::Parse(_))
        ));
        assert!(matches!(
            FlowstatConfig::from_file("/nonexistent/flowstat.toml"),
            Err(ConfigError::Read { .. })
        ));
    }
}
