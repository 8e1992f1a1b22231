//! Error types for flowstatd

use std::path::PathBuf;
use thiserror::Error;

/// Invalid or unreadable engine configuration. Fatal at init.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("core: {count} cores configured, at most {max} allowed")]
    TooManyCores { count: usize, max: usize },

    #[error("core[{core}].port: {count} ports configured, at most {max} allowed")]
    TooManyPorts { core: u32, count: usize, max: usize },

    #[error("port[{port}].tag_vlan_ids: {count} VLANs configured, at most {max} allowed")]
    TooManyTagVlans { port: u8, count: usize, max: usize },

    #[error("port[{port}].{field}: invalid VLAN ID {value} (must be 1-4094)")]
    InvalidVlan {
        port: u8,
        field: &'static str,
        value: u16,
    },

    #[error("port[{port}].description: {len} bytes, at most {max} allowed")]
    DescriptionTooLong { port: u8, len: usize, max: usize },

    #[error("core.index: duplicate core index {0}")]
    DuplicateCore(u32),

    #[error("port.index: duplicate port index {0}")]
    DuplicatePort(u8),

    #[error("core.index: core {0} is the main core index")]
    MainCoreReused(u32),

    #[error("{field}: path is {len} bytes, at most {max} allowed")]
    PathTooLong {
        field: &'static str,
        len: usize,
        max: usize,
    },

    #[error("{field}: {count} networks configured, at most {max} allowed")]
    TooManyLocalNets {
        field: &'static str,
        count: usize,
        max: usize,
    },

    #[error("{field}: unknown aggregation flag {flag:?}")]
    UnknownFlag { field: &'static str, flag: String },
}

/// Failure to rebuild a lookup table from its on-disk source.
///
/// Never fatal: the previously published table stays in place.
#[derive(Error, Debug)]
pub enum ReloadError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("truncated MRT record at offset {offset}")]
    Truncated { offset: usize },

    #[error("MRT record at offset {offset} is {len} bytes, at most {max} allowed")]
    RecordTooLarge { offset: usize, len: usize, max: usize },

    #[error("MRT record at offset {offset} has prefix length {len} (max {max})")]
    BadPrefixLength { offset: usize, len: u8, max: u8 },
}

/// Failure while bringing an initialized engine up.
#[derive(Error, Debug)]
pub enum StartError {
    #[error("start must be called from within a tokio runtime")]
    NoRuntime,

    #[error("engine already started")]
    AlreadyStarted,

    #[error("failed to open port {port}: {source}")]
    PortOpen {
        port: u8,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to spawn capture worker for core {core}: {source}")]
    WorkerSpawn {
        core: u32,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to register metrics: {0}")]
    Metrics(#[from] prometheus::Error),
}

/// Errors returned by [`Engine::init`](crate::Engine::init).
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("an engine is already active in this process")]
    SingletonViolation,
}

/// Result type for engine initialization
pub type Result<T> = std::result::Result<T, EngineError>;
