//! Real-network execution of the crest clustering agent.
//!
//! Two UDP sockets per node: a broadcast socket for beacons and a
//! control socket (fixed port) for CH-to-CH unicast. A [`NodeRuntime`]
//! owns one agent and serializes everything — socket reads, timer fires
//! and lifecycle commands — through a single event loop, preserving the
//! agent's run-to-completion model on a real clock.

mod runtime;
mod transport;

pub use runtime::{NodeRuntime, RuntimeHandle};
pub use transport::{TransportConfig, UdpTransport};

/// Control port for inter-CH unicast.
pub const CONTROL_PORT: u16 = 50_000;
