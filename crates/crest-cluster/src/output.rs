//! The agent's effect protocol.
//!
//! Agents never touch sockets or clocks. Every callback returns a list
//! of [`Output`]s for the driver to execute. Timers are logical:
//! installing one replaces any outstanding timer with the same identity,
//! and clearing one that does not exist is a no-op. The per-peer retry
//! timers carry the peer's cluster id in their identity, so retries to
//! different peers never collide.

use std::net::Ipv4Addr;
use std::time::Duration;

use crest_proto::Message;

/// Identity of a scheduled callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Timer {
    /// The beacon loop; earliest pending schedule wins.
    Beacon,
    /// Re-armed probe deciding whether to claim cluster headship.
    ElectionProbe,
    /// Periodic table aging.
    NeighborAging,
    /// One-second deadline to finish the density exchange.
    Decide,
    /// The node's own wave start.
    PropagationStart,
    /// End of the running wave, 1.5 s after the start.
    PropagationStop,
    /// Reliable-unicast retry of a density map to one peer cluster.
    DistroRetry(u64),
    /// Reliable-unicast retry of an inter-cluster handoff to one peer.
    PropagationRetry(u64),
    /// Reverse-propagation diagnostic: switch on.
    Activate,
    /// Reverse-propagation diagnostic: switch off.
    Deactivate,
}

/// Address of a peer cluster head's control endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerEndpoint {
    pub cluster_id: u64,
    pub address: Ipv4Addr,
}

/// An effect requested by the agent.
#[derive(Debug, Clone, PartialEq)]
pub enum Output {
    /// Broadcast a batch of sub-headers on the beacon socket. The
    /// transport packs them into carriers, flushing past the carrier
    /// limit.
    Broadcast(Vec<Message>),
    /// Unicast one message to a peer cluster head's control port.
    SendTo { cluster: u64, message: Message },
    /// Open unicast channels to the given peer heads.
    ConnectPeers(Vec<PeerEndpoint>),
    /// Tear down all peer channels.
    DisconnectPeers,
    /// Install (or replace) a logical timer.
    SetTimer { timer: Timer, delay: Duration },
    /// Cancel a logical timer; idempotent.
    ClearTimer(Timer),
}
