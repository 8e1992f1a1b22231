//! Flow Capture Engine
//!
//! Polls packet sources on dedicated per-core threads, classifies each packet
//! by locality into a direction class, reduces it to a flow key selected by
//! that class's aggregation flags and accumulates packet/byte counters per
//! key. On every export tick the per-core tables are drained and one metric
//! per flow is pushed to a [`MetricSink`].
//!
//! Source and destination addresses can be resolved to origin AS numbers
//! from an MRT TABLE_DUMP_V2 RIB snapshot, which is rebuilt and swapped in
//! whenever the file changes.

pub mod aggregator;
pub mod app_table;
pub mod config;
pub mod engine;
pub mod error;
pub mod exporter;
pub mod flow;
pub mod local_nets;
pub mod metrics;
pub mod packet;
pub mod reload;
pub mod rib;
pub mod sink;
pub mod source;
pub mod stats;
pub mod worker;

pub use aggregator::{Aggregator, FlowTable};
pub use app_table::AppTable;
pub use config::{CoreSpec, FlowstatConfig, NormalizedConfig, PortSpec};
pub use engine::{Engine, EngineRegistry};
pub use error::*;
pub use flow::{AggregateFlags, AggregationSpec, Direction, FlowKey, FlowRecord};
pub use local_nets::LocalNetworks;
pub use metrics::MetricsCollector;
pub use reload::SharedTable;
pub use rib::{AsTable, RibEntry};
pub use sink::{ChannelSink, FlowMetric, FlowTags, FnSink, JsonLinesSink, MetricSink};
pub use source::{Packet, PacketSource, PcapDriver, PortDriver, PortStats, ReplayDriver};
pub use stats::StatsSnapshot;
pub use worker::{FlowClassifier, Outcome};
