//! Value types shared by the flowstat capture engine.
//!
//! - [`HostAddr`]: 16-byte host address as carried in flow keys
//! - [`AddressFamily`]: IPv4 / IPv6 discriminant
//! - [`IpPrefix`]: IP network prefix (CIDR notation) with membership test
//! - [`VlanId`]: IEEE 802.1Q VLAN identifier
//! - [`AsNumber`]: autonomous system number with an unknown sentinel

mod asn;
mod ip;
mod vlan;

pub use asn::AsNumber;
pub use ip::{AddressFamily, HostAddr, IpPrefix};
pub use vlan::VlanId;

/// Common error type for parsing failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("invalid IP address format: {0}")]
    InvalidIpAddress(String),

    #[error("invalid IP prefix format: {0}")]
    InvalidIpPrefix(String),

    #[error("invalid VLAN ID: {0} (must be 1-4094)")]
    InvalidVlanId(u16),
}
