//! AS resolution from MRT routing table snapshots.
//!
//! Parses RFC 6396 TABLE_DUMP_V2 dumps (`RIB_IPV4_UNICAST` and
//! `RIB_IPV6_UNICAST` records) and keeps the origin AS of every prefix in a
//! longest-prefix-match table.
//!
//! Record layout (all integers big endian):
//!
//! ```text
//! header   timestamp:u32 type:u16 subtype:u16 length:u32
//! rib      sequence:u32 prefix_len:u8 prefix:[u8; ceil(prefix_len / 8)] entry_count:u16
//! entry    peer_index:u16 originated:u32 attr_len:u16 attrs:[u8; attr_len]
//! attr     flags:u8 type:u8 length:(u16 if flags & 0x10 else u8) value
//! AS_PATH  (segment_type:u8 count:u8 asn:[u32; count])*
//! ```

use crate::error::ReloadError;
use byteorder::{BigEndian, ReadBytesExt};
use flowstat_types::AsNumber;
use ip_network::IpNetwork;
use ip_network_table::IpNetworkTable;
use std::fs;
use std::io::{Cursor, Read};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::Path;
use tracing::{debug, info};

const MRT_HEADER_LEN: usize = 12;
const MRT_TABLE_DUMP_V2: u16 = 13;
const RIB_IPV4_UNICAST: u16 = 2;
const RIB_IPV6_UNICAST: u16 = 4;
const ATTR_FLAG_EXTENDED_LENGTH: u8 = 0x10;
const ATTR_TYPE_AS_PATH: u8 = 2;

/// Largest record body accepted.
pub const MAX_RECORD_LEN: usize = 64 * 1024;

/// A prefix and the AS that originates it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RibEntry {
    pub prefix: IpAddr,
    pub prefix_len: u8,
    pub origin_as: AsNumber,
}

/// Parses every unicast RIB record of an MRT dump.
///
/// Records of other types are skipped. Prefixes whose RIB entries all have
/// an empty or zero origin are omitted.
pub fn parse_mrt(data: &[u8]) -> Result<Vec<RibEntry>, ReloadError> {
    let mut entries = Vec::new();
    let mut offset = 0;

    while offset < data.len() {
        let header = data
            .get(offset..offset + MRT_HEADER_LEN)
            .ok_or(ReloadError::Truncated { offset })?;
        let mut cur = Cursor::new(header);
        let truncated = |_: std::io::Error| ReloadError::Truncated { offset };
        let _timestamp = cur.read_u32::<BigEndian>().map_err(truncated)?;
        let record_type = cur.read_u16::<BigEndian>().map_err(truncated)?;
        let subtype = cur.read_u16::<BigEndian>().map_err(truncated)?;
        let len = cur.read_u32::<BigEndian>().map_err(truncated)? as usize;

        if len > MAX_RECORD_LEN {
            return Err(ReloadError::RecordTooLarge {
                offset,
                len,
                max: MAX_RECORD_LEN,
            });
        }
        let body_start = offset + MRT_HEADER_LEN;
        let body = data
            .get(body_start..body_start + len)
            .ok_or(ReloadError::Truncated { offset })?;

        if record_type == MRT_TABLE_DUMP_V2 {
            let v6 = match subtype {
                RIB_IPV4_UNICAST => Some(false),
                RIB_IPV6_UNICAST => Some(true),
                _ => None,
            };
            if let Some(v6) = v6 {
                if let Some(entry) = parse_rib(body, v6, offset)? {
                    entries.push(entry);
                }
            }
        }

        offset = body_start + len;
    }

    Ok(entries)
}

fn parse_rib(body: &[u8], v6: bool, offset: usize) -> Result<Option<RibEntry>, ReloadError> {
    let truncated = |_: std::io::Error| ReloadError::Truncated { offset };
    let mut cur = Cursor::new(body);

    let _sequence = cur.read_u32::<BigEndian>().map_err(truncated)?;
    let prefix_len = cur.read_u8().map_err(truncated)?;
    let max = if v6 { 128 } else { 32 };
    if prefix_len > max {
        return Err(ReloadError::BadPrefixLength {
            offset,
            len: prefix_len,
            max,
        });
    }

    let mut octets = [0u8; 16];
    let n = usize::from(prefix_len).div_ceil(8);
    cur.read_exact(&mut octets[..n]).map_err(truncated)?;
    let prefix = if v6 {
        IpAddr::V6(Ipv6Addr::from(octets))
    } else {
        IpAddr::V4(Ipv4Addr::new(octets[0], octets[1], octets[2], octets[3]))
    };

    let entry_count = cur.read_u16::<BigEndian>().map_err(truncated)?;
    for _ in 0..entry_count {
        let _peer_index = cur.read_u16::<BigEndian>().map_err(truncated)?;
        let _originated = cur.read_u32::<BigEndian>().map_err(truncated)?;
        let attr_len = usize::from(cur.read_u16::<BigEndian>().map_err(truncated)?);
        let start = cur.position() as usize;
        let attrs = body
            .get(start..start + attr_len)
            .ok_or(ReloadError::Truncated { offset })?;
        cur.set_position((start + attr_len) as u64);

        let origin = origin_as(attrs, offset)?;
        if !origin.is_unknown() {
            return Ok(Some(RibEntry {
                prefix,
                prefix_len,
                origin_as: origin,
            }));
        }
    }

    Ok(None)
}

/// Origin AS of an attribute block: the last AS of its AS_PATH.
fn origin_as(attrs: &[u8], offset: usize) -> Result<AsNumber, ReloadError> {
    let truncated = |_: std::io::Error| ReloadError::Truncated { offset };
    let mut cur = Cursor::new(attrs);
    let mut origin = AsNumber::UNKNOWN;

    while (cur.position() as usize) < attrs.len() {
        let flags = cur.read_u8().map_err(truncated)?;
        let attr_type = cur.read_u8().map_err(truncated)?;
        let len = if flags & ATTR_FLAG_EXTENDED_LENGTH != 0 {
            usize::from(cur.read_u16::<BigEndian>().map_err(truncated)?)
        } else {
            usize::from(cur.read_u8().map_err(truncated)?)
        };
        let start = cur.position() as usize;
        let value = attrs
            .get(start..start + len)
            .ok_or(ReloadError::Truncated { offset })?;
        cur.set_position((start + len) as u64);

        if attr_type == ATTR_TYPE_AS_PATH {
            let mut path = Cursor::new(value);
            while (path.position() as usize) < value.len() {
                let _segment_type = path.read_u8().map_err(truncated)?;
                let count = path.read_u8().map_err(truncated)?;
                for _ in 0..count {
                    origin = AsNumber::new(path.read_u32::<BigEndian>().map_err(truncated)?);
                }
            }
        }
    }

    Ok(origin)
}

/// Longest-prefix-match table from prefix to origin AS.
pub struct AsTable {
    table: IpNetworkTable<AsNumber>,
    prefixes: usize,
}

impl Default for AsTable {
    fn default() -> Self {
        Self::new()
    }
}

impl AsTable {
    pub fn new() -> Self {
        AsTable {
            table: IpNetworkTable::new(),
            prefixes: 0,
        }
    }

    pub fn from_entries<I: IntoIterator<Item = RibEntry>>(entries: I) -> Self {
        let mut table = AsTable::new();
        for entry in entries {
            table.insert(entry);
        }
        table
    }

    /// Builds a table from an in-memory MRT dump.
    pub fn from_mrt(data: &[u8]) -> Result<Self, ReloadError> {
        Ok(Self::from_entries(parse_mrt(data)?))
    }

    /// Reads and parses an MRT dump from disk.
    pub fn load(path: &Path) -> Result<Self, ReloadError> {
        let data = fs::read(path).map_err(|source| ReloadError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let table = Self::from_mrt(&data)?;
        info!(
            path = %path.display(),
            bytes = data.len(),
            prefixes = table.len(),
            "loaded MRT RIB snapshot"
        );
        Ok(table)
    }

    pub fn insert(&mut self, entry: RibEntry) {
        match IpNetwork::new_truncate(entry.prefix, entry.prefix_len) {
            Ok(network) => {
                if self.table.insert(network, entry.origin_as).is_none() {
                    self.prefixes += 1;
                }
            }
            Err(e) => {
                debug!(
                    prefix = %entry.prefix,
                    len = entry.prefix_len,
                    error = %e,
                    "skipping RIB prefix"
                );
            }
        }
    }

    /// Origin AS of the longest prefix covering `addr`, or
    /// [`AsNumber::UNKNOWN`] when none does.
    pub fn lookup(&self, addr: IpAddr) -> AsNumber {
        self.table
            .longest_match(addr)
            .map_or(AsNumber::UNKNOWN, |(_, asn)| *asn)
    }

    pub fn len(&self) -> usize {
        self.prefixes
    }

    pub fn is_empty(&self) -> bool {
        self.prefixes == 0
    }
}

impl std::fmt::Debug for AsTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsTable")
            .field("prefixes", &self.prefixes)
            .finish()
    }
}

/// Builders for MRT dumps, shared with the integration tests.
#[doc(hidden)]
pub mod testing {
    use super::*;

    /// Encodes one RIB record whose single entry carries `as_path`.
    pub fn rib_record(prefix: IpAddr, prefix_len: u8, as_path: &[u32]) -> Vec<u8> {
        rib_record_entries(prefix, prefix_len, &[as_path])
    }

    /// Encodes one RIB record with one entry per AS path.
    pub fn rib_record_entries(prefix: IpAddr, prefix_len: u8, paths: &[&[u32]]) -> Vec<u8> {
        let (subtype, octets) = match prefix {
            IpAddr::V4(v4) => (RIB_IPV4_UNICAST, v4.octets().to_vec()),
            IpAddr::V6(v6) => (RIB_IPV6_UNICAST, v6.octets().to_vec()),
        };
        let mut body = Vec::new();
        body.extend_from_slice(&1u32.to_be_bytes());
        body.push(prefix_len);
        body.extend_from_slice(&octets[..usize::from(prefix_len).div_ceil(8)]);
        body.extend_from_slice(&(paths.len() as u16).to_be_bytes());
        for path in paths {
            let mut attrs = Vec::new();
            // ORIGIN (IGP)
            attrs.extend_from_slice(&[0x40, 1, 1, 0]);
            let mut segment = Vec::new();
            if !path.is_empty() {
                segment.push(2); // AS_SEQUENCE
                segment.push(path.len() as u8);
                for asn in *path {
                    segment.extend_from_slice(&asn.to_be_bytes());
                }
            }
            attrs.extend_from_slice(&[0x50, ATTR_TYPE_AS_PATH]);
            attrs.extend_from_slice(&(segment.len() as u16).to_be_bytes());
            attrs.extend_from_slice(&segment);

            body.extend_from_slice(&0u16.to_be_bytes());
            body.extend_from_slice(&0u32.to_be_bytes());
            body.extend_from_slice(&(attrs.len() as u16).to_be_bytes());
            body.extend_from_slice(&attrs);
        }
        record(MRT_TABLE_DUMP_V2, subtype, &body)
    }

    /// Wraps `body` in an MRT common header.
    pub fn record(record_type: u16, subtype: u16, body: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(MRT_HEADER_LEN + body.len());
        out.extend_from_slice(&0u32.to_be_bytes());
        out.extend_from_slice(&record_type.to_be_bytes());
        out.extend_from_slice(&subtype.to_be_bytes());
        out.extend_from_slice(&(body.len() as u32).to_be_bytes());
        out.extend_from_slice(body);
        out
    }
}
