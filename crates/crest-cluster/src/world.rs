//! Process-wide registry shared by co-located agents.
//!
//! In a simulation every agent lives in one process, and the protocol
//! relies on a shared table to recover density maps and head records
//! that were lost on the wire, plus the designated base direction of
//! each potential starting node. Writers are agent initialization and
//! the density/head updates; readers see last-write-wins. The driver
//! lends the context mutably into one agent callback at a time, so no
//! synchronization is needed.

use std::collections::BTreeMap;

use crest_geom::{DensityGrid, Vec3};
use crest_proto::NodeInfo;

#[derive(Debug, Default)]
pub struct WorldContext {
    density: BTreeMap<u64, DensityGrid>,
    ch_records: BTreeMap<u64, NodeInfo>,
    base_directions: BTreeMap<u64, Vec3>,
}

impl WorldContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_density(&mut self, ch_id: u64, grid: DensityGrid) {
        self.density.insert(ch_id, grid);
    }

    pub fn density(&self, ch_id: u64) -> Option<&DensityGrid> {
        self.density.get(&ch_id)
    }

    pub fn register_ch(&mut self, ch_id: u64, record: NodeInfo) {
        self.ch_records.insert(ch_id, record);
    }

    pub fn ch_record(&self, ch_id: u64) -> Option<&NodeInfo> {
        self.ch_records.get(&ch_id)
    }

    pub fn set_base_direction(&mut self, node_id: u64, direction: Vec3) {
        self.base_directions.insert(node_id, direction);
    }

    pub fn base_direction(&self, node_id: u64) -> Option<Vec3> {
        self.base_directions.get(&node_id).copied()
    }
}
