//! Local-network membership and direction classification.

use crate::error::ConfigError;
use crate::flow::Direction;
use flowstat_types::IpPrefix;
use std::net::IpAddr;
use tracing::warn;

/// Maximum number of local networks per address family.
pub const MAX_LOCAL_NETS: usize = 8;

/// Operator-owned prefixes, one ordered list per address family.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocalNetworks {
    ipv4: Vec<IpPrefix>,
    ipv6: Vec<IpPrefix>,
}

impl LocalNetworks {
    /// Builds the sets from configured CIDR strings.
    ///
    /// Lists longer than [`MAX_LOCAL_NETS`] are rejected. Entries that do not
    /// parse, or that belong to the other family, are skipped with a warning.
    pub fn from_cidrs<S: AsRef<str>>(ipv4: &[S], ipv6: &[S]) -> Result<Self, ConfigError> {
        Ok(LocalNetworks {
            ipv4: parse_family("local_nets_ipv4", ipv4, false)?,
            ipv6: parse_family("local_nets_ipv6", ipv6, true)?,
        })
    }

    pub fn ipv4(&self) -> &[IpPrefix] {
        &self.ipv4
    }

    pub fn ipv6(&self) -> &[IpPrefix] {
        &self.ipv6
    }

    /// Returns true if `addr` lies in a configured prefix of its family.
    pub fn contains(&self, addr: IpAddr) -> bool {
        let set = match addr {
            IpAddr::V4(_) => &self.ipv4,
            IpAddr::V6(_) => &self.ipv6,
        };
        set.iter().any(|prefix| prefix.contains(addr))
    }

    /// Direction class of a packet from `src` to `dst`.
    pub fn classify(&self, src: IpAddr, dst: IpAddr) -> Direction {
        Direction::from_locality(self.contains(src), self.contains(dst))
    }
}

fn parse_family<S: AsRef<str>>(
    field: &'static str,
    cidrs: &[S],
    want_v6: bool,
) -> Result<Vec<IpPrefix>, ConfigError> {
    if cidrs.len() > MAX_LOCAL_NETS {
        return Err(ConfigError::TooManyLocalNets {
            field,
            count: cidrs.len(),
            max: MAX_LOCAL_NETS,
        });
    }

    let mut prefixes = Vec::with_capacity(cidrs.len());
    for cidr in cidrs {
        let cidr = cidr.as_ref();
        match cidr.parse::<IpPrefix>() {
            Ok(prefix) if prefix.is_ipv6() == want_v6 => prefixes.push(prefix.truncated()),
            Ok(_) => {
                warn!(field, cidr, "local network has the wrong address family, skipping");
            }
            Err(e) => {
                warn!(field, cidr, error = %e, "invalid local network, skipping");
            }
        }
    }
    Ok(prefixes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn nets() -> LocalNetworks {
        LocalNetworks::from_cidrs(&["192.168.1.0/24", "10.0.0.0/8"], &["2001:db8:1::/48"])
            .unwrap()
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_classify_ipv4() {
        let nets = nets();
        assert_eq!(
            nets.classify(ip("192.168.1.5"), ip("10.2.3.4")),
            Direction::Internal
        );
        assert_eq!(
            nets.classify(ip("8.8.8.8"), ip("1.1.1.1")),
            Direction::External
        );
        assert_eq!(
            nets.classify(ip("192.168.1.5"), ip("8.8.8.8")),
            Direction::Outgoing
        );
        assert_eq!(
            nets.classify(ip("8.8.8.8"), ip("192.168.1.5")),
            Direction::Incoming
        );
    }

    #[test]
    fn test_classify_ipv6() {
        let nets = nets();
        assert_eq!(
            nets.classify(ip("2001:db8:1::1"), ip("2001:db8:1:ff::2")),
            Direction::Internal
        );
        assert_eq!(
            nets.classify(ip("2001:db8:2::1"), ip("2001:db8:3::2")),
            Direction::External
        );
        assert_eq!(
            nets.classify(ip("2001:db8:1::1"), ip("2001:db8:9::2")),
            Direction::Outgoing
        );
        assert_eq!(
            nets.classify(ip("2001:db8:9::1"), ip("2001:db8:1::2")),
            Direction::Incoming
        );
    }

    #[test]
    fn test_host_bits_cleared() {
        let nets = LocalNetworks::from_cidrs(&["192.168.1.77/24"], &[] as &[&str]).unwrap();
        assert_eq!(nets.ipv4()[0].to_string(), "192.168.1.0/24");
    }

    #[test]
    fn test_malformed_and_wrong_family_skipped() {
        let nets = LocalNetworks::from_cidrs(
            &["bogus", "2001:db8::/32", "172.16.0.0/12"],
            &["10.0.0.0/8", "fd00::/8"],
        )
        .unwrap();
        assert_eq!(nets.ipv4().len(), 1);
        assert_eq!(nets.ipv6().len(), 1);
        assert!(!nets.contains(ip("2001:db8::1")));
    }

    #[test]
    fn test_too_many_networks() {
        let v4: Vec<String> = (0..9).map(|i| format!("10.{i}.0.0/16")).collect();
        let err = LocalNetworks::from_cidrs(&v4, &[]).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::TooManyLocalNets {
                field: "local_nets_ipv4",
                count: 9,
                ..
            }
        ));
    }

    #[test]
    fn test_empty_sets_everything_external() {
        let nets = LocalNetworks::default();
        assert_eq!(
            nets.classify(ip("192.168.1.1"), ip("::1")),
            Direction::External
        );
    }
}
