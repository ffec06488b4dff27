//! Wire protocol for the crest clustering mesh.
//!
//! Every frame on the wire is a sequence of sub-headers inside one UDP
//! carrier packet. A sub-header is a u32 type tag, a u32 sequence number
//! and a packed little-endian body whose layout is fixed per tag. The
//! codec is written by hand because the byte layout *is* the protocol
//! contract, shared with non-Rust implementations.

mod codec;
mod error;
mod types;

pub use codec::{Codec, PacketBuilder, MAX_CARRIER_LEN};
pub use error::{CodecError, Result};
pub use types::{Degree, Message, NodeInfo, Timestamp, TypeTag};
