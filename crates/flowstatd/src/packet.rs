//! Ethernet / IP / transport header parsing for the capture path.
//!
//! Parsing never fails: anything that cannot be read is reported as missing
//! (no L3 header, no ports) and the packet is still counted.

use crate::config::PortSpec;
use byteorder::{BigEndian, ByteOrder};
use flowstat_types::{AddressFamily, VlanId};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

pub const ETHERTYPE_IPV4: u16 = 0x0800;
pub const ETHERTYPE_IPV6: u16 = 0x86dd;
pub const ETHERTYPE_VLAN: u16 = 0x8100;

pub const IPPROTO_TCP: u8 = 6;
pub const IPPROTO_UDP: u8 = 17;
pub const IPPROTO_FRAGMENT: u8 = 44;

const ETH_HEADER_LEN: usize = 14;
const VLAN_TAG_LEN: usize = 4;
const IPV4_MIN_HEADER_LEN: usize = 20;
const IPV6_HEADER_LEN: usize = 40;
const IPV6_FRAGMENT_HEADER_LEN: usize = 8;
const IPV4_OFFSET_MASK: u16 = 0x1fff;

/// Network and transport fields of an IP packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpHeader {
    pub af: AddressFamily,
    pub src: IpAddr,
    pub dst: IpAddr,
    /// Transport protocol, or 44 for fragments whose transport header is not
    /// parsed
    pub proto: u8,
    pub src_port: Option<u16>,
    pub dst_port: Option<u16>,
}

/// A frame accepted on its port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsedFrame {
    pub vlan: VlanId,
    /// Wire length excluding any 802.1Q tag
    pub bytes: u32,
    /// `None` for non-IP or truncated packets
    pub ip: Option<IpHeader>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Frame {
    Accepted(ParsedFrame),
    /// Tagged with a VLAN the port does not carry; holds the raw VID
    VlanFiltered(u16),
}

fn be16(data: &[u8], offset: usize) -> Option<u16> {
    data.get(offset..offset + 2).map(BigEndian::read_u16)
}

/// Parses a received frame in the context of the port it arrived on.
pub fn parse_frame(data: &[u8], wire_len: u32, port: &PortSpec) -> Frame {
    let mut vlan = port.native_vlan;
    let mut bytes = wire_len;
    let mut offset = ETH_HEADER_LEN;

    let Some(mut ether_type) = be16(data, 12) else {
        return Frame::Accepted(ParsedFrame {
            vlan,
            bytes,
            ip: None,
        });
    };

    if ether_type == ETHERTYPE_VLAN {
        bytes = bytes.saturating_sub(VLAN_TAG_LEN as u32);
        let (Some(tci), Some(inner)) = (be16(data, offset), be16(data, offset + 2)) else {
            return Frame::Accepted(ParsedFrame {
                vlan,
                bytes,
                ip: None,
            });
        };
        match VlanId::from_tci(tci) {
            Some(tagged) if port.accepts_tag(tagged) => vlan = tagged,
            _ => return Frame::VlanFiltered(tci & VlanId::TCI_VID_MASK),
        }
        ether_type = inner;
        offset += VLAN_TAG_LEN;
    }

    let l3 = data.get(offset..).unwrap_or_default();
    let ip = match ether_type {
        ETHERTYPE_IPV4 => parse_ipv4(l3),
        ETHERTYPE_IPV6 => parse_ipv6(l3),
        _ => None,
    };

    Frame::Accepted(ParsedFrame { vlan, bytes, ip })
}

fn parse_ipv4(data: &[u8]) -> Option<IpHeader> {
    if data.len() < IPV4_MIN_HEADER_LEN {
        return None;
    }
    let header_len = usize::from(data[0] & 0x0f) * 4;
    if header_len < IPV4_MIN_HEADER_LEN {
        return None;
    }
    let src = Ipv4Addr::new(data[12], data[13], data[14], data[15]);
    let dst = Ipv4Addr::new(data[16], data[17], data[18], data[19]);

    let fragment_offset = BigEndian::read_u16(&data[6..8]) & IPV4_OFFSET_MASK;
    let (proto, l4) = if fragment_offset == 0 {
        (data[9], data.get(header_len..))
    } else {
        (IPPROTO_FRAGMENT, None)
    };

    Some(with_ports(
        AddressFamily::Ipv4,
        IpAddr::V4(src),
        IpAddr::V4(dst),
        proto,
        l4,
    ))
}

fn parse_ipv6(data: &[u8]) -> Option<IpHeader> {
    if data.len() < IPV6_HEADER_LEN {
        return None;
    }
    let mut octets = [0u8; 16];
    octets.copy_from_slice(&data[8..24]);
    let src = Ipv6Addr::from(octets);
    octets.copy_from_slice(&data[24..40]);
    let dst = Ipv6Addr::from(octets);

    let mut proto = data[6];
    let mut l4 = data.get(IPV6_HEADER_LEN..);
    if proto == IPPROTO_FRAGMENT {
        let frag = data.get(IPV6_HEADER_LEN..IPV6_HEADER_LEN + IPV6_FRAGMENT_HEADER_LEN);
        l4 = None;
        if let Some(frag) = frag {
            // only an atomic fragment (offset 0, more-fragments clear) carries
            // the complete transport header
            if BigEndian::read_u16(&frag[2..4]) == 0 {
                proto = frag[0];
                l4 = data.get(IPV6_HEADER_LEN + IPV6_FRAGMENT_HEADER_LEN..);
            }
        }
    }

    Some(with_ports(
        AddressFamily::Ipv6,
        IpAddr::V6(src),
        IpAddr::V6(dst),
        proto,
        l4,
    ))
}

fn with_ports(
    af: AddressFamily,
    src: IpAddr,
    dst: IpAddr,
    proto: u8,
    l4: Option<&[u8]>,
) -> IpHeader {
    let ports = match (proto, l4) {
        (IPPROTO_TCP | IPPROTO_UDP, Some(l4)) => be16(l4, 0).zip(be16(l4, 2)),
        _ => None,
    };
    IpHeader {
        af,
        src,
        dst,
        proto,
        src_port: ports.map(|(s, _)| s),
        dst_port: ports.map(|(_, d)| d),
    }
}

/// Frame builders shared with the integration tests.
#[doc(hidden)]
pub mod testing {
    use super::*;

    const SRC_MAC: [u8; 6] = [0x02, 0, 0, 0, 0, 0x01];
    const DST_MAC: [u8; 6] = [0x02, 0, 0, 0, 0, 0x02];

    fn ethernet(vlan: Option<u16>, ether_type: u16, payload: &[u8]) -> Vec<u8> {
        let mut frame = Vec::with_capacity(ETH_HEADER_LEN + VLAN_TAG_LEN + payload.len());
        frame.extend_from_slice(&DST_MAC);
        frame.extend_from_slice(&SRC_MAC);
        if let Some(tci) = vlan {
            frame.extend_from_slice(&ETHERTYPE_VLAN.to_be_bytes());
            frame.extend_from_slice(&tci.to_be_bytes());
        }
        frame.extend_from_slice(&ether_type.to_be_bytes());
        frame.extend_from_slice(payload);
        frame
    }

    fn transport(proto: u8, src_port: u16, dst_port: u16) -> Vec<u8> {
        let mut l4 = Vec::new();
        l4.extend_from_slice(&src_port.to_be_bytes());
        l4.extend_from_slice(&dst_port.to_be_bytes());
        let pad = if proto == IPPROTO_TCP { 16 } else { 4 };
        l4.extend(std::iter::repeat(0).take(pad));
        l4
    }

    /// An IPv4 frame carrying a TCP or UDP header (or no ports for other
    /// protocols).
    pub fn ipv4_frame(
        vlan: Option<u16>,
        src: Ipv4Addr,
        dst: Ipv4Addr,
        proto: u8,
        src_port: u16,
        dst_port: u16,
    ) -> Vec<u8> {
        ipv4_frame_with_offset(vlan, src, dst, proto, src_port, dst_port, 0)
    }

    pub fn ipv4_frame_with_offset(
        vlan: Option<u16>,
        src: Ipv4Addr,
        dst: Ipv4Addr,
        proto: u8,
        src_port: u16,
        dst_port: u16,
        fragment_offset: u16,
    ) -> Vec<u8> {
        let l4 = transport(proto, src_port, dst_port);
        let mut ip = vec![0x45, 0];
        ip.extend_from_slice(&((IPV4_MIN_HEADER_LEN + l4.len()) as u16).to_be_bytes());
        ip.extend_from_slice(&[0, 0]);
        ip.extend_from_slice(&fragment_offset.to_be_bytes());
        ip.extend_from_slice(&[64, proto, 0, 0]);
        ip.extend_from_slice(&src.octets());
        ip.extend_from_slice(&dst.octets());
        ip.extend_from_slice(&l4);
        ethernet(vlan, ETHERTYPE_IPV4, &ip)
    }

    /// An IPv6 frame carrying a TCP or UDP header.
    pub fn ipv6_frame(
        vlan: Option<u16>,
        src: Ipv6Addr,
        dst: Ipv6Addr,
        proto: u8,
        src_port: u16,
        dst_port: u16,
    ) -> Vec<u8> {
        let l4 = transport(proto, src_port, dst_port);
        ethernet(vlan, ETHERTYPE_IPV6, &ipv6_packet(src, dst, proto, &l4))
    }

    /// An IPv6 frame with a fragment header in front of the transport header.
    pub fn ipv6_fragment_frame(
        src: Ipv6Addr,
        dst: Ipv6Addr,
        proto: u8,
        src_port: u16,
        dst_port: u16,
        fragment_offset: u16,
        more_fragments: bool,
    ) -> Vec<u8> {
        let frag_data = (fragment_offset << 3) | u16::from(more_fragments);
        let mut payload = vec![proto, 0];
        payload.extend_from_slice(&frag_data.to_be_bytes());
        payload.extend_from_slice(&[0, 0, 0, 1]);
        payload.extend(transport(proto, src_port, dst_port));
        ethernet(
            None,
            ETHERTYPE_IPV6,
            &ipv6_packet(src, dst, IPPROTO_FRAGMENT, &payload),
        )
    }

    fn ipv6_packet(src: Ipv6Addr, dst: Ipv6Addr, next_header: u8, payload: &[u8]) -> Vec<u8> {
        let mut ip = vec![0x60, 0, 0, 0];
        ip.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        ip.extend_from_slice(&[next_header, 64]);
        ip.extend_from_slice(&src.octets());
        ip.extend_from_slice(&dst.octets());
        ip.extend_from_slice(payload);
        ip
    }

    /// A frame with a non-IP EtherType (ARP).
    pub fn arp_frame() -> Vec<u8> {
        ethernet(None, 0x0806, &[0u8; 28])
    }
}
