//! Flow keys and aggregation masks.
//!
//! A packet is first described by a full [`FlowKey`] carrying every field the
//! capture path can observe. The mask selected for the packet's
//! [`Direction`] then reduces it: unselected fields are replaced by a fixed
//! wildcard, so two packets that differ only in unselected fields produce
//! equal (and equally hashed) keys.

use crate::error::ConfigError;
use flowstat_types::{AddressFamily, AsNumber, HostAddr, VlanId};
use std::fmt;
use std::ops::{BitOr, BitOrAssign};

/// Locality class of a packet, derived from its source and destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Direction {
    /// Non-IP or truncated packets
    Unknown,
    Incoming,
    Outgoing,
    Internal,
    External,
}

impl Direction {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Direction::Unknown => "unknown",
            Direction::Incoming => "incoming",
            Direction::Outgoing => "outgoing",
            Direction::Internal => "internal",
            Direction::External => "external",
        }
    }

    /// Classifies a packet from the locality of its two endpoints.
    pub const fn from_locality(src_local: bool, dst_local: bool) -> Self {
        match (src_local, dst_local) {
            (true, true) => Direction::Internal,
            (false, false) => Direction::External,
            (true, false) => Direction::Outgoing,
            (false, true) => Direction::Incoming,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Set of flow key fields kept by a direction class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct AggregateFlags(u16);

impl AggregateFlags {
    pub const EMPTY: Self = AggregateFlags(0);
    pub const IFACE: Self = AggregateFlags(0x0001);
    pub const AF: Self = AggregateFlags(0x0004);
    pub const PROTO: Self = AggregateFlags(0x0008);
    pub const VLAN: Self = AggregateFlags(0x0010);
    pub const SRC_HOST: Self = AggregateFlags(0x0020);
    pub const DST_HOST: Self = AggregateFlags(0x0040);
    pub const SRC_AS: Self = AggregateFlags(0x0080);
    pub const DST_AS: Self = AggregateFlags(0x0100);
    pub const SRC_PORT: Self = AggregateFlags(0x0200);
    pub const DST_PORT: Self = AggregateFlags(0x0400);
    pub const APP: Self = AggregateFlags(0x0800);

    pub const fn bits(&self) -> u16 {
        self.0
    }

    pub const fn contains(&self, other: AggregateFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// Looks up a single flag by its configuration name.
    ///
    /// `direction` is accepted and maps to no bit, since every key carries
    /// its direction.
    pub fn from_name(name: &str) -> Option<Self> {
        let flag = match name {
            "direction" => Self::EMPTY,
            "iface" => Self::IFACE,
            "af" => Self::AF,
            "proto" => Self::PROTO,
            "vlan" => Self::VLAN,
            "src_host" => Self::SRC_HOST,
            "dst_host" => Self::DST_HOST,
            "src_as" => Self::SRC_AS,
            "dst_as" => Self::DST_AS,
            "src_port" => Self::SRC_PORT,
            "dst_port" => Self::DST_PORT,
            "app" => Self::APP,
            _ => return None,
        };
        Some(flag)
    }

    /// Parses a configured flag list; `field` names the list in errors.
    pub fn parse_list<S: AsRef<str>>(
        field: &'static str,
        names: &[S],
    ) -> Result<Self, ConfigError> {
        names.iter().try_fold(Self::EMPTY, |acc, name| {
            let name = name.as_ref().trim();
            Self::from_name(name)
                .map(|flag| acc | flag)
                .ok_or_else(|| ConfigError::UnknownFlag {
                    field,
                    flag: name.to_string(),
                })
        })
    }
}

impl BitOr for AggregateFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        AggregateFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for AggregateFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// One mask per direction class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AggregationSpec {
    pub incoming: AggregateFlags,
    pub outgoing: AggregateFlags,
    pub internal: AggregateFlags,
    pub external: AggregateFlags,
}

impl AggregationSpec {
    /// The mask applied to packets of `direction`. Unknown keeps nothing.
    pub const fn mask_for(&self, direction: Direction) -> AggregateFlags {
        match direction {
            Direction::Unknown => AggregateFlags::EMPTY,
            Direction::Incoming => self.incoming,
            Direction::Outgoing => self.outgoing,
            Direction::Internal => self.internal,
            Direction::External => self.external,
        }
    }
}

/// Application identifier: protocol in the high 16 bits, the lower of the
/// two transport ports (when non-zero) in the low 16 bits.
pub fn app_id(proto: u8, src_port: u16, dst_port: u16) -> u32 {
    let service = src_port.min(dst_port);
    let base = u32::from(proto) << 16;
    if service > 0 {
        base | u32::from(service)
    } else {
        base
    }
}

/// Aggregation key of a flow.
///
/// `None` and zero values are the wildcard of their field once a key has
/// been reduced; see [`FlowKey::masked`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub direction: Direction,
    /// Receiving port index
    pub port: Option<u8>,
    pub af: Option<AddressFamily>,
    pub proto: u8,
    pub vlan: Option<VlanId>,
    pub src_host: HostAddr,
    pub dst_host: HostAddr,
    pub src_as: Option<AsNumber>,
    pub dst_as: Option<AsNumber>,
    pub src_port: Option<u16>,
    pub dst_port: Option<u16>,
    /// Application id, `None` when not part of the key
    pub app: Option<u32>,
}

impl FlowKey {
    /// A key with only the direction set.
    pub const fn wildcard(direction: Direction) -> Self {
        FlowKey {
            direction,
            port: None,
            af: None,
            proto: 0,
            vlan: None,
            src_host: HostAddr::UNSPECIFIED,
            dst_host: HostAddr::UNSPECIFIED,
            src_as: None,
            dst_as: None,
            src_port: None,
            dst_port: None,
            app: None,
        }
    }

    /// Replaces every field not selected by `mask` with its wildcard.
    pub fn masked(&self, mask: AggregateFlags) -> Self {
        let keep = |flag| mask.contains(flag);
        let mut key = FlowKey::wildcard(self.direction);
        if keep(AggregateFlags::IFACE) {
            key.port = self.port;
        }
        if keep(AggregateFlags::AF) {
            key.af = self.af;
        }
        if keep(AggregateFlags::PROTO) {
            key.proto = self.proto;
        }
        if keep(AggregateFlags::VLAN) {
            key.vlan = self.vlan;
        }
        if keep(AggregateFlags::SRC_HOST) {
            key.src_host = self.src_host;
        }
        if keep(AggregateFlags::DST_HOST) {
            key.dst_host = self.dst_host;
        }
        if keep(AggregateFlags::SRC_AS) {
            key.src_as = self.src_as;
        }
        if keep(AggregateFlags::DST_AS) {
            key.dst_as = self.dst_as;
        }
        if keep(AggregateFlags::SRC_PORT) {
            key.src_port = self.src_port;
        }
        if keep(AggregateFlags::DST_PORT) {
            key.dst_port = self.dst_port;
        }
        if keep(AggregateFlags::APP) {
            key.app = self.app;
        }
        key
    }
}

/// Packet and byte counters of one flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FlowCounters {
    pub packets: u64,
    pub bytes: u64,
}

impl FlowCounters {
    pub fn add(&mut self, bytes: u32) {
        self.packets += 1;
        self.bytes += u64::from(bytes);
    }
}

/// A drained flow with its totals for one export interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowRecord {
    pub key: FlowKey,
    pub packets: u64,
    pub bytes: u64,
}
