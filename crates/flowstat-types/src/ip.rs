//! Host address and prefix types.

use crate::ParseError;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

/// Address family of a parsed packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AddressFamily {
    Ipv4,
    Ipv6,
}

impl AddressFamily {
    /// Returns the label used in emitted metrics.
    pub const fn as_str(&self) -> &'static str {
        match self {
            AddressFamily::Ipv4 => "ipv4",
            AddressFamily::Ipv6 => "ipv6",
        }
    }
}

impl fmt::Display for AddressFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A host address stored in a fixed 16-byte buffer.
///
/// IPv4 addresses occupy the last four bytes with the first twelve zeroed
/// (IPv4-compatible layout, not the `::ffff:` mapped form). Rendering follows
/// the same rule in reverse: a value whose first twelve bytes are zero is
/// printed as a dotted quad, anything else as IPv6 text.
///
/// ```
/// use flowstat_types::HostAddr;
/// use std::net::Ipv4Addr;
///
/// let addr = HostAddr::from_ipv4(Ipv4Addr::new(192, 0, 2, 7));
/// assert_eq!(addr.to_string(), "192.0.2.7");
/// assert_eq!(HostAddr::UNSPECIFIED.to_string(), "0.0.0.0");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct HostAddr([u8; 16]);

impl HostAddr {
    pub const UNSPECIFIED: Self = HostAddr([0; 16]);

    pub const fn from_octets(octets: [u8; 16]) -> Self {
        HostAddr(octets)
    }

    pub const fn from_ipv4(addr: Ipv4Addr) -> Self {
        let o = addr.octets();
        HostAddr([0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, o[0], o[1], o[2], o[3]])
    }

    pub const fn from_ipv6(addr: Ipv6Addr) -> Self {
        HostAddr(addr.octets())
    }

    pub const fn octets(&self) -> [u8; 16] {
        self.0
    }

    /// Returns true if the first twelve bytes are zero.
    pub fn is_v4_layout(&self) -> bool {
        self.0[..12].iter().all(|b| *b == 0)
    }

    /// Interprets the last four bytes as an IPv4 address.
    pub const fn to_ipv4(&self) -> Ipv4Addr {
        Ipv4Addr::new(self.0[12], self.0[13], self.0[14], self.0[15])
    }

    pub fn to_ipv6(&self) -> Ipv6Addr {
        Ipv6Addr::from(self.0)
    }

    /// Converts to a std address using the packet's address family.
    pub fn to_ip_addr(&self, af: AddressFamily) -> IpAddr {
        match af {
            AddressFamily::Ipv4 => IpAddr::V4(self.to_ipv4()),
            AddressFamily::Ipv6 => IpAddr::V6(self.to_ipv6()),
        }
    }
}

impl fmt::Display for HostAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_v4_layout() {
            self.to_ipv4().fmt(f)
        } else {
            self.to_ipv6().fmt(f)
        }
    }
}

impl From<IpAddr> for HostAddr {
    fn from(addr: IpAddr) -> Self {
        match addr {
            IpAddr::V4(v4) => HostAddr::from_ipv4(v4),
            IpAddr::V6(v6) => HostAddr::from_ipv6(v6),
        }
    }
}

impl From<Ipv4Addr> for HostAddr {
    fn from(addr: Ipv4Addr) -> Self {
        HostAddr::from_ipv4(addr)
    }
}

impl From<Ipv6Addr> for HostAddr {
    fn from(addr: Ipv6Addr) -> Self {
        HostAddr::from_ipv6(addr)
    }
}

/// An IP prefix in CIDR notation (e.g., 10.0.0.0/24 or 2001:db8::/32).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IpPrefix {
    address: IpAddr,
    prefix_len: u8,
}

impl IpPrefix {
    /// Creates a new IP prefix.
    ///
    /// # Errors
    ///
    /// Returns an error if the prefix length is invalid for the address type
    /// (>32 for IPv4, >128 for IPv6).
    pub fn new(address: IpAddr, prefix_len: u8) -> Result<Self, ParseError> {
        let max_len = match address {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };

        if prefix_len > max_len {
            return Err(ParseError::InvalidIpPrefix(format!(
                "prefix length {} exceeds maximum {} for address type",
                prefix_len, max_len
            )));
        }

        Ok(IpPrefix {
            address,
            prefix_len,
        })
    }

    /// Returns the address this prefix was written with.
    pub const fn address(&self) -> &IpAddr {
        &self.address
    }

    /// Returns the prefix length in bits.
    pub const fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    pub const fn family(&self) -> AddressFamily {
        match self.address {
            IpAddr::V4(_) => AddressFamily::Ipv4,
            IpAddr::V6(_) => AddressFamily::Ipv6,
        }
    }

    pub const fn is_ipv4(&self) -> bool {
        self.address.is_ipv4()
    }

    pub const fn is_ipv6(&self) -> bool {
        self.address.is_ipv6()
    }

    /// Returns true if this is the default route (0.0.0.0/0 or ::/0).
    pub fn is_default(&self) -> bool {
        self.prefix_len == 0
    }

    /// Returns the same prefix with all host bits cleared.
    pub fn truncated(&self) -> Self {
        let address = match self.address {
            IpAddr::V4(v4) => IpAddr::V4(Ipv4Addr::from(u32::from(v4) & v4_mask(self.prefix_len))),
            IpAddr::V6(v6) => {
                IpAddr::V6(Ipv6Addr::from(u128::from(v6) & v6_mask(self.prefix_len)))
            }
        };
        IpPrefix {
            address,
            prefix_len: self.prefix_len,
        }
    }

    /// Returns true if `addr` falls inside this prefix.
    ///
    /// Addresses of the other family never match.
    pub fn contains(&self, addr: IpAddr) -> bool {
        match (self.address, addr) {
            (IpAddr::V4(net), IpAddr::V4(a)) => {
                let mask = v4_mask(self.prefix_len);
                u32::from(net) & mask == u32::from(a) & mask
            }
            (IpAddr::V6(net), IpAddr::V6(a)) => {
                let mask = v6_mask(self.prefix_len);
                u128::from(net) & mask == u128::from(a) & mask
            }
            _ => false,
        }
    }
}

fn v4_mask(len: u8) -> u32 {
    u32::MAX.checked_shl(32 - u32::from(len)).unwrap_or(0)
}

fn v6_mask(len: u8) -> u128 {
    u128::MAX.checked_shl(128 - u32::from(len)).unwrap_or(0)
}

impl fmt::Display for IpPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.address, self.prefix_len)
    }
}

impl FromStr for IpPrefix {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr_str, len_str) = s
            .trim()
            .rsplit_once('/')
            .ok_or_else(|| ParseError::InvalidIpPrefix(s.to_string()))?;

        let address: IpAddr = addr_str
            .parse()
            .map_err(|_| ParseError::InvalidIpAddress(addr_str.to_string()))?;
        let prefix_len: u8 = len_str
            .parse()
            .map_err(|_| ParseError::InvalidIpPrefix(s.to_string()))?;

        IpPrefix::new(address, prefix_len)
    }
}
