//! Discrete-event simulation of a crest mesh.
//!
//! Runs any number of [`crest_cluster::ClusterAgent`]s against a virtual
//! clock and an in-memory radio: broadcasts reach nodes within the
//! configured radio range, unicasts are routed by cluster id, and both
//! can be lost. Every callback runs to completion in timestamp order, so
//! a run is fully deterministic for a given seed.

mod network;
mod queue;
mod sim;

pub use network::{Network, NetworkConfig};
pub use queue::{EventId, EventQueue};
pub use sim::{MessageRecord, Simulation};
