//! Per-core flow tables.

use crate::flow::{FlowCounters, FlowKey, FlowRecord};
use ahash::RandomState;
use parking_lot::{Mutex, MutexGuard};
use std::collections::HashMap;
use std::mem;

/// Counters keyed by reduced flow key, bounded by a flow ceiling.
#[derive(Debug, Default)]
pub struct FlowTable {
    flows: HashMap<FlowKey, FlowCounters, RandomState>,
    /// 0 disables the ceiling
    max_flows: usize,
}

impl FlowTable {
    pub fn new(max_flows: usize) -> Self {
        FlowTable {
            flows: HashMap::default(),
            max_flows,
        }
    }

    /// Adds one packet of `bytes` to `key`.
    ///
    /// Returns false when `key` is new and the table is full; the packet is
    /// then not counted.
    pub fn record(&mut self, key: FlowKey, bytes: u32) -> bool {
        if let Some(counters) = self.flows.get_mut(&key) {
            counters.add(bytes);
            return true;
        }
        if self.max_flows != 0 && self.flows.len() >= self.max_flows {
            return false;
        }
        self.flows.entry(key).or_default().add(bytes);
        true
    }

    pub fn get(&self, key: &FlowKey) -> Option<FlowCounters> {
        self.flows.get(key).copied()
    }

    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }

    /// Hands back every flow and leaves the table empty.
    pub fn drain(&mut self) -> Vec<FlowRecord> {
        let flows = mem::take(&mut self.flows);
        flows
            .into_iter()
            .map(|(key, counters)| FlowRecord {
                key,
                packets: counters.packets,
                bytes: counters.bytes,
            })
            .collect()
    }
}

/// The flow table of one capture core.
///
/// The capture worker holds the lock for one receive burst at a time; the
/// exporter holds it only long enough to swap the table out.
#[derive(Debug)]
pub struct Aggregator {
    core: u32,
    table: Mutex<FlowTable>,
}

impl Aggregator {
    pub fn new(core: u32, max_flows: usize) -> Self {
        Aggregator {
            core,
            table: Mutex::new(FlowTable::new(max_flows)),
        }
    }

    pub fn core(&self) -> u32 {
        self.core
    }

    pub fn lock(&self) -> MutexGuard<'_, FlowTable> {
        self.table.lock()
    }

    /// Swaps in an empty table and returns the previous contents.
    pub fn drain(&self) -> Vec<FlowRecord> {
        let mut full = {
            let mut table = self.table.lock();
            let max_flows = table.max_flows;
            mem::replace(&mut *table, FlowTable::new(max_flows))
        };
        full.drain()
    }

    pub fn len(&self) -> usize {
        self.table.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
