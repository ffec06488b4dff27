//! Neighbor bookkeeping and reliable-unicast state.

use std::collections::BTreeMap;
use std::time::Duration;

use crest_proto::{Message, NodeInfo, Timestamp};

/// An id-keyed table of node records with timestamp-based expiry.
///
/// Ordered iteration matters: TDMA staggering and retry schedules walk
/// peers in id order, which keeps slot assignment deterministic.
#[derive(Debug, Clone, Default)]
pub struct NeighborTable {
    entries: BTreeMap<u64, NodeInfo>,
}

impl NeighborTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or refresh a record.
    pub fn upsert(&mut self, id: u64, info: NodeInfo) {
        self.entries.insert(id, info);
    }

    pub fn remove(&mut self, id: u64) -> Option<NodeInfo> {
        self.entries.remove(&id)
    }

    pub fn get(&self, id: u64) -> Option<&NodeInfo> {
        self.entries.get(&id)
    }

    pub fn contains(&self, id: u64) -> bool {
        self.entries.contains_key(&id)
    }

    /// Drop every record whose timestamp is older than `max_age` and
    /// return what was evicted.
    pub fn age(&mut self, now: Timestamp, max_age: Duration) -> Vec<(u64, NodeInfo)> {
        let expired: Vec<u64> = self
            .entries
            .iter()
            .filter(|(_, info)| now.saturating_duration_since(info.ts) > max_age)
            .map(|(&id, _)| id)
            .collect();

        expired
            .into_iter()
            .filter_map(|id| self.entries.remove(&id).map(|info| (id, info)))
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u64, &NodeInfo)> {
        self.entries.iter().map(|(&id, info)| (id, info))
    }

    pub fn values(&self) -> impl Iterator<Item = &NodeInfo> {
        self.entries.values()
    }

    /// Snapshot of the table, for mutation while iterating.
    pub fn entries(&self) -> Vec<(u64, NodeInfo)> {
        self.entries.iter().map(|(&id, info)| (id, *info)).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Delivery state of one reliable unicast to one peer cluster.
#[derive(Debug, Clone, PartialEq)]
pub enum AckState {
    /// Frame sent but not acknowledged; the retained copy is what the
    /// retry timer retransmits.
    Pending(Message),
    /// Acknowledged, or cancelled by leaving the sending state.
    Acked,
}

/// Per-peer acknowledgement tracking for reliable unicasts.
#[derive(Debug, Clone, Default)]
pub struct AckTable {
    entries: BTreeMap<u64, AckState>,
}

impl AckTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an outstanding frame for `peer`, replacing any previous
    /// state. Later sends supersede earlier ones per peer.
    pub fn mark_pending(&mut self, peer: u64, frame: Message) {
        self.entries.insert(peer, AckState::Pending(frame));
    }

    /// Flip `peer` to acknowledged. Returns whether a frame was pending.
    pub fn acknowledge(&mut self, peer: u64) -> bool {
        match self.entries.insert(peer, AckState::Acked) {
            Some(AckState::Pending(_)) => true,
            _ => false,
        }
    }

    /// The frame to retransmit to `peer`, if one is still outstanding.
    pub fn pending_frame(&self, peer: u64) -> Option<&Message> {
        match self.entries.get(&peer) {
            Some(AckState::Pending(frame)) => Some(frame),
            _ => None,
        }
    }

    /// Cancel every outstanding frame and return the peers whose
    /// retries must be cleared.
    pub fn cancel_all(&mut self) -> Vec<u64> {
        let pending: Vec<u64> = self
            .entries
            .iter()
            .filter(|(_, s)| matches!(s, AckState::Pending(_)))
            .map(|(&p, _)| p)
            .collect();
        for &p in &pending {
            self.entries.insert(p, AckState::Acked);
        }
        pending
    }

    /// Every peer this table has ever tracked.
    pub fn peers(&self) -> impl Iterator<Item = u64> + '_ {
        self.entries.keys().copied()
    }
}
