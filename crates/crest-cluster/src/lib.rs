//! The crest clustering agent.
//!
//! One [`ClusterAgent`] runs per node. Agents are symmetric; the roles
//! (cluster head, member, standalone) emerge from beacon exchange. The
//! agent is sans-IO: inbound messages, timer fires and lifecycle calls
//! each run to completion and return [`Output`] effects that a driver
//! (the simulator or the UDP runtime) executes. No callback ever blocks
//! and no state is shared between agents except the [`WorldContext`]
//! registry, which the driver lends mutably per callback.

mod agent;
mod config;
mod mobility;
mod output;
mod tables;
mod world;

pub use agent::{AgentStats, ClusterAgent, ClusterState};
pub use crest_proto::{Degree, Message, NodeInfo, Timestamp};
pub use config::{ClusterConfig, ConfigError};
pub use mobility::{FixedMobility, MobilityModel};
pub use output::{Output, PeerEndpoint, Timer};
pub use tables::{AckState, AckTable, NeighborTable};
pub use world::WorldContext;
