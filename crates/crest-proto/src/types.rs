//! Protocol value types: time, node records and the message set.

use std::net::Ipv4Addr;
use std::ops::Add;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crest_geom::Vec3;

/// Nanoseconds since the epoch of the run (simulation start or process
/// start). `Timestamp::MAX` is the "not yet scheduled" sentinel used by
/// the propagation start times.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Timestamp(u64);

impl Timestamp {
    pub const ZERO: Self = Self(0);
    pub const MAX: Self = Self(u64::MAX);

    pub const fn from_nanos(ns: u64) -> Self {
        Self(ns)
    }

    pub const fn as_nanos(&self) -> u64 {
        self.0
    }

    pub fn from_secs_f64(secs: f64) -> Self {
        Self((secs * 1e9) as u64)
    }

    pub fn as_secs_f64(&self) -> f64 {
        self.0 as f64 / 1e9
    }

    /// Time elapsed since `earlier`, zero if `earlier` is in the future.
    pub fn saturating_duration_since(&self, earlier: Self) -> Duration {
        Duration::from_nanos(self.0.saturating_sub(earlier.0))
    }
}

impl Add<Duration> for Timestamp {
    type Output = Self;

    /// Saturating: the MAX sentinel stays MAX.
    fn add(self, d: Duration) -> Self {
        Self(self.0.saturating_add(d.as_nanos() as u64))
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if *self == Self::MAX {
            write!(f, "unset")
        } else {
            write!(f, "{:.3}s", self.as_secs_f64())
        }
    }
}

/// Role of a node within the clustering overlay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum Degree {
    /// Not affiliated with any cluster.
    Standalone = 0,
    /// Cluster head; owns the cluster whose id equals its node id.
    Ch = 1,
    /// Cluster member.
    Cm = 2,
}

impl Degree {
    pub(crate) fn from_wire(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::Standalone),
            1 => Some(Self::Ch),
            2 => Some(Self::Cm),
            _ => None,
        }
    }
}

impl std::fmt::Display for Degree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Standalone => write!(f, "STANDALONE"),
            Self::Ch => write!(f, "CH"),
            Self::Cm => write!(f, "CM"),
        }
    }
}

/// A node's advertised record: carried in every beacon, stored in every
/// table. `ts` is reset to the sender's clock on each broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub ts: Timestamp,
    pub id: u64,
    pub cluster_id: u64,
    pub degree: Degree,
    pub is_starting_node: bool,
    pub position: Vec3,
    pub address: Ipv4Addr,
    pub ch_address: Ipv4Addr,
}

impl NodeInfo {
    /// Packed wire size: ts + id + cluster (8 each), degree + starting
    /// flag (1 each), position (3 x f64), two IPv4 addresses (4 each).
    pub const WIRE_LEN: usize = 8 + 8 + 8 + 1 + 1 + 24 + 4 + 4;

    pub fn new(id: u64, address: Ipv4Addr, position: Vec3) -> Self {
        Self {
            ts: Timestamp::ZERO,
            id,
            cluster_id: u64::MAX,
            degree: Degree::Standalone,
            is_starting_node: false,
            position,
            address,
            ch_address: Ipv4Addr::UNSPECIFIED,
        }
    }
}

/// On-wire message type tags. The tag doubles as the payload of an Ack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum TypeTag {
    ClusterInfo = 1,
    InitiateCluster = 2,
    FormCluster = 3,
    NeighborClusterInfo = 4,
    DistroMap = 5,
    IntraClusterPropagation = 6,
    InterClusterPropagation = 7,
    InterNodePropagation = 8,
    Ack = 9,
}

impl TypeTag {
    pub(crate) fn from_wire(raw: u32) -> Option<Self> {
        match raw {
            1 => Some(Self::ClusterInfo),
            2 => Some(Self::InitiateCluster),
            3 => Some(Self::FormCluster),
            4 => Some(Self::NeighborClusterInfo),
            5 => Some(Self::DistroMap),
            6 => Some(Self::IntraClusterPropagation),
            7 => Some(Self::InterClusterPropagation),
            8 => Some(Self::InterNodePropagation),
            9 => Some(Self::Ack),
            _ => None,
        }
    }
}

/// The decoded message set.
///
/// Periodic beacons (`ClusterInfo`, `NeighborClusterInfo`) and the
/// formation handshake travel on the broadcast socket; density maps,
/// inter-cluster propagation and acks travel on the CH-to-CH unicast
/// channels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    /// Periodic beacon carrying the sender's record.
    ClusterInfo { info: NodeInfo },
    /// A node claiming cluster headship during election.
    InitiateCluster { cluster_id: u64, info: NodeInfo },
    /// A node confirming headship during externally driven formation.
    FormCluster { info: NodeInfo },
    /// A member relaying a remote CH's record to its own head.
    NeighborClusterInfo { cluster_id: u64, info: NodeInfo },
    /// A CH's density surface, unicast to a peer CH (reliable).
    DistroMap { cluster_id: u64, info: NodeInfo, cells: Vec<f32> },
    /// CH instructing its members where and when the wave starts.
    IntraClusterPropagation {
        cluster_id: u64,
        starting_node: u64,
        starting_time: Timestamp,
        direction: Vec3,
    },
    /// CH-to-CH wave handoff (reliable).
    InterClusterPropagation {
        cluster_id: u64,
        starting_time: Timestamp,
        source: Vec3,
        destination: Vec3,
        direction: Vec3,
    },
    /// Single broadcast emitted by a node whose wave just started.
    InterNodePropagation {
        cluster_id: u64,
        starting_time: Timestamp,
        position: Vec3,
        direction: Vec3,
    },
    /// Receipt for a reliable unicast, named by the acked frame's tag.
    Ack { cluster_id: u64, acked: TypeTag },
}

impl Message {
    pub fn tag(&self) -> TypeTag {
        match self {
            Self::ClusterInfo { .. } => TypeTag::ClusterInfo,
            Self::InitiateCluster { .. } => TypeTag::InitiateCluster,
            Self::FormCluster { .. } => TypeTag::FormCluster,
            Self::NeighborClusterInfo { .. } => TypeTag::NeighborClusterInfo,
            Self::DistroMap { .. } => TypeTag::DistroMap,
            Self::IntraClusterPropagation { .. } => TypeTag::IntraClusterPropagation,
            Self::InterClusterPropagation { .. } => TypeTag::InterClusterPropagation,
            Self::InterNodePropagation { .. } => TypeTag::InterNodePropagation,
            Self::Ack { .. } => TypeTag::Ack,
        }
    }
}
