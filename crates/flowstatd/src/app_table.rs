//! Application descriptions from the protocol and service databases.

use crate::error::ReloadError;
use ahash::RandomState;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use tracing::info;

/// Longest description emitted, in bytes.
pub const MAX_APP_DESC_LEN: usize = 43;

const IPPROTO_TCP: u8 = 6;
const IPPROTO_UDP: u8 = 17;

/// Maps application ids (`proto << 16 | port`) to display names.
#[derive(Debug, Clone, Default)]
pub struct AppTable {
    entries: HashMap<u32, String, RandomState>,
}

impl AppTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds the table from `protocols(5)` and `services(5)` formatted text.
    ///
    /// Every known protocol gets a `name(number)` entry, except TCP and UDP
    /// which get one `tcp(6)/service(port)` entry per service instead. The
    /// first name listed for a number wins.
    pub fn from_databases(protocols: &str, services: &str) -> Self {
        let mut protos: HashMap<u8, &str, RandomState> = HashMap::default();
        for (name, number) in db_entries(protocols) {
            if let Ok(proto) = number.parse::<u8>() {
                protos.entry(proto).or_insert(name);
            }
        }

        let mut entries: HashMap<u32, String, RandomState> = HashMap::default();
        let mut add = |app: u32, desc: String| {
            entries.entry(app).or_insert_with(|| truncate(desc));
        };

        for (&proto, name) in &protos {
            if proto != IPPROTO_TCP && proto != IPPROTO_UDP {
                add(u32::from(proto) << 16, format!("{}({})", name, proto));
            }
        }

        for (name, port_proto) in db_entries(services) {
            let Some((port, transport)) = port_proto.split_once('/') else {
                continue;
            };
            let Ok(port) = port.parse::<u16>() else {
                continue;
            };
            let (proto, label) = match transport {
                "tcp" => (IPPROTO_TCP, "tcp(6)"),
                "udp" => (IPPROTO_UDP, "udp(17)"),
                _ => continue,
            };
            if protos.contains_key(&proto) {
                let app = u32::from(proto) << 16 | u32::from(port);
                add(app, format!("{}/{}({})", label, name, port));
            }
        }

        AppTable { entries }
    }

    /// Reads both databases from disk.
    pub fn load(protocols_path: &Path, services_path: &Path) -> Result<Self, ReloadError> {
        let read = |path: &Path| {
            fs::read_to_string(path).map_err(|source| ReloadError::Io {
                path: path.to_path_buf(),
                source,
            })
        };
        let table = Self::from_databases(&read(protocols_path)?, &read(services_path)?);
        info!(
            protocols = %protocols_path.display(),
            services = %services_path.display(),
            entries = table.len(),
            "loaded application table"
        );
        Ok(table)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Description of `app`, falling back to `unknown` names for ids not in
    /// the table.
    pub fn describe(&self, app: u32) -> String {
        if let Some(desc) = self.entries.get(&app) {
            return desc.clone();
        }
        let port = app & 0xffff;
        match app >> 16 {
            6 => format!("tcp(6)/unknown({})", port),
            17 => format!("udp(17)/unknown({})", port),
            _ => format!("unknown({})", port),
        }
    }
}

/// Yields the first two fields of every non-comment line.
fn db_entries(text: &str) -> impl Iterator<Item = (&str, &str)> {
    text.lines().filter_map(|line| {
        let line = line.split('#').next().unwrap_or_default();
        let mut fields = line.split_whitespace();
        Some((fields.next()?, fields.next()?))
    })
}

fn truncate(mut desc: String) -> String {
    if desc.len() > MAX_APP_DESC_LEN {
        let mut end = MAX_APP_DESC_LEN;
        while !desc.is_char_boundary(end) {
            end -= 1;
        }
        desc.truncate(end);
    }
    desc
}
