//! Codec error types.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, CodecError>;

/// Errors raised while decoding a carrier packet.
///
/// A decode error condemns the rest of the carrier: sub-header lengths
/// are implicit in the tag, so there is no way to resynchronize.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    /// Type tag not in the protocol's table.
    #[error("unknown message type tag {0}")]
    UnknownTag(u32),

    /// Carrier ended before the body it promised.
    #[error("truncated frame: needed {needed} bytes, {available} available")]
    Truncated { needed: usize, available: usize },

    /// Degree byte outside the enumeration.
    #[error("invalid degree byte {0}")]
    InvalidDegree(u8),

    /// Ack names a tag that is not in the table.
    #[error("ack references unknown type tag {0}")]
    UnknownAckedTag(u32),
}
