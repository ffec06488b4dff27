//! Packed little-endian encoding of the message set and carrier batching.

use std::net::Ipv4Addr;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crest_geom::Vec3;

use crate::error::{CodecError, Result};
use crate::types::{Degree, Message, NodeInfo, Timestamp, TypeTag};

/// Largest carrier payload before a batch is flushed.
pub const MAX_CARRIER_LEN: usize = 2296;

/// Encoder/decoder for one deployment.
///
/// The density grid's cell count is deployment configuration, not wire
/// data, so the codec has to be told what to expect.
#[derive(Debug, Clone, Copy)]
pub struct Codec {
    grid_cells: usize,
}

impl Codec {
    pub fn new(grid_cells: usize) -> Self {
        Self { grid_cells }
    }

    /// Encoded size of `message` including its tag and sequence number.
    pub fn encoded_len(&self, message: &Message) -> usize {
        const HEAD: usize = 4 + 4; // tag + seq
        const VEC3: usize = 24;
        HEAD + match message {
            Message::ClusterInfo { .. } | Message::FormCluster { .. } => NodeInfo::WIRE_LEN,
            Message::InitiateCluster { .. } | Message::NeighborClusterInfo { .. } => {
                8 + NodeInfo::WIRE_LEN
            }
            Message::DistroMap { .. } => 8 + NodeInfo::WIRE_LEN + 4 * self.grid_cells,
            Message::IntraClusterPropagation { .. } => 8 + 8 + 8 + VEC3,
            Message::InterClusterPropagation { .. } => 8 + 8 + 3 * VEC3,
            Message::InterNodePropagation { .. } => 8 + 8 + 2 * VEC3,
            Message::Ack { .. } => 8 + 4,
        }
    }

    /// Append one sub-header to a carrier under construction.
    pub fn encode(&self, message: &Message, seq: u32, dst: &mut BytesMut) {
        dst.reserve(self.encoded_len(message));
        dst.put_u32_le(message.tag() as u32);
        dst.put_u32_le(seq);

        match message {
            Message::ClusterInfo { info } | Message::FormCluster { info } => {
                put_node_info(dst, info);
            }
            Message::InitiateCluster { cluster_id, info }
            | Message::NeighborClusterInfo { cluster_id, info } => {
                dst.put_u64_le(*cluster_id);
                put_node_info(dst, info);
            }
            Message::DistroMap { cluster_id, info, cells } => {
                dst.put_u64_le(*cluster_id);
                put_node_info(dst, info);
                debug_assert_eq!(cells.len(), self.grid_cells);
                for &c in cells {
                    dst.put_f32_le(c);
                }
            }
            Message::IntraClusterPropagation {
                cluster_id,
                starting_node,
                starting_time,
                direction,
            } => {
                dst.put_u64_le(*cluster_id);
                dst.put_u64_le(*starting_node);
                dst.put_u64_le(starting_time.as_nanos());
                put_vec3(dst, direction);
            }
            Message::InterClusterPropagation {
                cluster_id,
                starting_time,
                source,
                destination,
                direction,
            } => {
                dst.put_u64_le(*cluster_id);
                dst.put_u64_le(starting_time.as_nanos());
                put_vec3(dst, source);
                put_vec3(dst, destination);
                put_vec3(dst, direction);
            }
            Message::InterNodePropagation {
                cluster_id,
                starting_time,
                position,
                direction,
            } => {
                dst.put_u64_le(*cluster_id);
                dst.put_u64_le(starting_time.as_nanos());
                put_vec3(dst, position);
                put_vec3(dst, direction);
            }
            Message::Ack { cluster_id, acked } => {
                dst.put_u64_le(*cluster_id);
                dst.put_u32_le(*acked as u32);
            }
        }
    }

    /// Decode every sub-header in a carrier packet.
    pub fn decode_packet(&self, packet: &[u8]) -> Result<Vec<Message>> {
        let mut buf = packet;
        let mut messages = Vec::new();
        while buf.has_remaining() {
            messages.push(self.decode_one(&mut buf)?);
        }
        Ok(messages)
    }

    fn decode_one(&self, buf: &mut &[u8]) -> Result<Message> {
        need(buf, 8)?;
        let raw_tag = buf.get_u32_le();
        let tag = TypeTag::from_wire(raw_tag).ok_or(CodecError::UnknownTag(raw_tag))?;
        let _seq = buf.get_u32_le();

        Ok(match tag {
            TypeTag::ClusterInfo => Message::ClusterInfo { info: get_node_info(buf)? },
            TypeTag::InitiateCluster => {
                need(buf, 8)?;
                let cluster_id = buf.get_u64_le();
                Message::InitiateCluster { cluster_id, info: get_node_info(buf)? }
            }
            TypeTag::FormCluster => Message::FormCluster { info: get_node_info(buf)? },
            TypeTag::NeighborClusterInfo => {
                need(buf, 8)?;
                let cluster_id = buf.get_u64_le();
                Message::NeighborClusterInfo { cluster_id, info: get_node_info(buf)? }
            }
            TypeTag::DistroMap => {
                need(buf, 8)?;
                let cluster_id = buf.get_u64_le();
                let info = get_node_info(buf)?;
                need(buf, 4 * self.grid_cells)?;
                let mut cells = Vec::with_capacity(self.grid_cells);
                for _ in 0..self.grid_cells {
                    cells.push(buf.get_f32_le());
                }
                Message::DistroMap { cluster_id, info, cells }
            }
            TypeTag::IntraClusterPropagation => {
                need(buf, 8 + 8 + 8 + 24)?;
                Message::IntraClusterPropagation {
                    cluster_id: buf.get_u64_le(),
                    starting_node: buf.get_u64_le(),
                    starting_time: Timestamp::from_nanos(buf.get_u64_le()),
                    direction: get_vec3(buf),
                }
            }
            TypeTag::InterClusterPropagation => {
                need(buf, 8 + 8 + 3 * 24)?;
                Message::InterClusterPropagation {
                    cluster_id: buf.get_u64_le(),
                    starting_time: Timestamp::from_nanos(buf.get_u64_le()),
                    source: get_vec3(buf),
                    destination: get_vec3(buf),
                    direction: get_vec3(buf),
                }
            }
            TypeTag::InterNodePropagation => {
                need(buf, 8 + 8 + 2 * 24)?;
                Message::InterNodePropagation {
                    cluster_id: buf.get_u64_le(),
                    starting_time: Timestamp::from_nanos(buf.get_u64_le()),
                    position: get_vec3(buf),
                    direction: get_vec3(buf),
                }
            }
            TypeTag::Ack => {
                need(buf, 8 + 4)?;
                let cluster_id = buf.get_u64_le();
                let raw = buf.get_u32_le();
                let acked = TypeTag::from_wire(raw).ok_or(CodecError::UnknownAckedTag(raw))?;
                Message::Ack { cluster_id, acked }
            }
        })
    }
}

fn need(buf: &&[u8], len: usize) -> Result<()> {
    if buf.remaining() < len {
        Err(CodecError::Truncated { needed: len, available: buf.remaining() })
    } else {
        Ok(())
    }
}

fn put_vec3(dst: &mut BytesMut, v: &Vec3) {
    dst.put_f64_le(v.x);
    dst.put_f64_le(v.y);
    dst.put_f64_le(v.z);
}

fn get_vec3(buf: &mut &[u8]) -> Vec3 {
    Vec3::new(buf.get_f64_le(), buf.get_f64_le(), buf.get_f64_le())
}

fn put_node_info(dst: &mut BytesMut, info: &NodeInfo) {
    dst.put_u64_le(info.ts.as_nanos());
    dst.put_u64_le(info.id);
    dst.put_u64_le(info.cluster_id);
    dst.put_u8(info.degree as u8);
    dst.put_u8(info.is_starting_node as u8);
    put_vec3(dst, &info.position);
    dst.put_u32_le(u32::from(info.address));
    dst.put_u32_le(u32::from(info.ch_address));
}

fn get_node_info(buf: &mut &[u8]) -> Result<NodeInfo> {
    need(buf, NodeInfo::WIRE_LEN)?;
    let ts = Timestamp::from_nanos(buf.get_u64_le());
    let id = buf.get_u64_le();
    let cluster_id = buf.get_u64_le();
    let raw_degree = buf.get_u8();
    let degree = Degree::from_wire(raw_degree).ok_or(CodecError::InvalidDegree(raw_degree))?;
    let is_starting_node = buf.get_u8() != 0;
    let position = get_vec3(buf);
    let address = Ipv4Addr::from(buf.get_u32_le());
    let ch_address = Ipv4Addr::from(buf.get_u32_le());
    Ok(NodeInfo { ts, id, cluster_id, degree, is_starting_node, position, address, ch_address })
}

/// Accumulates sub-headers into carrier packets, flushing whenever the
/// next sub-header would push a carrier past [`MAX_CARRIER_LEN`].
#[derive(Debug)]
pub struct PacketBuilder {
    codec: Codec,
    current: BytesMut,
    finished: Vec<Bytes>,
}

impl PacketBuilder {
    pub fn new(codec: Codec) -> Self {
        Self { codec, current: BytesMut::new(), finished: Vec::new() }
    }

    pub fn push(&mut self, message: &Message, seq: u32) {
        if !self.current.is_empty()
            && self.current.len() + self.codec.encoded_len(message) > MAX_CARRIER_LEN
        {
            self.flush();
        }
        self.codec.encode(message, seq, &mut self.current);
    }

    fn flush(&mut self) {
        if !self.current.is_empty() {
            self.finished.push(self.current.split().freeze());
        }
    }

    /// All carriers built so far, in push order.
    pub fn finish(mut self) -> Vec<Bytes> {
        self.flush();
        self.finished
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_info(id: u64) -> NodeInfo {
        NodeInfo {
            ts: Timestamp::from_secs_f64(1.25),
            id,
            cluster_id: 42,
            degree: Degree::Cm,
            is_starting_node: id == 7,
            position: Vec3::new(12.5, -3.0, 0.0),
            address: Ipv4Addr::new(10, 0, 0, id as u8),
            ch_address: Ipv4Addr::new(10, 0, 0, 42),
        }
    }

    fn codec() -> Codec {
        Codec::new(16 * 16)
    }

    fn round_trip(msg: Message) {
        let codec = codec();
        let mut buf = BytesMut::new();
        codec.encode(&msg, 99, &mut buf);
        assert_eq!(buf.len(), codec.encoded_len(&msg));
        let decoded = codec.decode_packet(&buf).unwrap();
        assert_eq!(decoded, vec![msg]);
    }

    #[test]
    fn cluster_info_round_trip() {
        round_trip(Message::ClusterInfo { info: sample_info(7) });
    }

    #[test]
    fn initiate_and_form_round_trip() {
        round_trip(Message::InitiateCluster { cluster_id: 9, info: sample_info(9) });
        round_trip(Message::FormCluster { info: sample_info(3) });
    }

    #[test]
    fn neighbor_cluster_info_round_trip() {
        round_trip(Message::NeighborClusterInfo { cluster_id: 42, info: sample_info(8) });
    }

    #[test]
    fn distro_map_round_trip() {
        let cells: Vec<f32> = (0..256).map(|i| i as f32 * 0.5).collect();
        round_trip(Message::DistroMap { cluster_id: 42, info: sample_info(42), cells });
    }

    #[test]
    fn propagation_headers_round_trip() {
        round_trip(Message::IntraClusterPropagation {
            cluster_id: 42,
            starting_node: 7,
            starting_time: Timestamp::from_secs_f64(10.0),
            direction: Vec3::new(10.0, 0.0, 0.0),
        });
        round_trip(Message::InterClusterPropagation {
            cluster_id: 42,
            starting_time: Timestamp::from_secs_f64(10.0),
            source: Vec3::ZERO,
            destination: Vec3::new(70.0, 5.0, 0.0),
            direction: Vec3::new(9.9, 0.5, 0.0),
        });
        round_trip(Message::InterNodePropagation {
            cluster_id: 42,
            starting_time: Timestamp::from_secs_f64(11.0),
            position: Vec3::new(1.0, 2.0, 0.0),
            direction: Vec3::new(10.0, 0.0, 0.0),
        });
    }

    #[test]
    fn ack_round_trip() {
        round_trip(Message::Ack { cluster_id: 42, acked: TypeTag::DistroMap });
    }

    #[test]
    fn unknown_tag_is_an_error() {
        let mut buf = BytesMut::new();
        buf.put_u32_le(77);
        buf.put_u32_le(0);
        assert_eq!(codec().decode_packet(&buf), Err(CodecError::UnknownTag(77)));
    }

    #[test]
    fn truncated_body_is_an_error() {
        let codec = codec();
        let mut buf = BytesMut::new();
        codec.encode(&Message::ClusterInfo { info: sample_info(1) }, 0, &mut buf);
        let cut = &buf[..buf.len() - 5];
        assert!(matches!(codec.decode_packet(cut), Err(CodecError::Truncated { .. })));
    }

    #[test]
    fn invalid_degree_is_an_error() {
        let codec = codec();
        let mut buf = BytesMut::new();
        codec.encode(&Message::ClusterInfo { info: sample_info(1) }, 0, &mut buf);
        buf[8 + 24] = 9; // degree byte after tag+seq and ts/id/cluster
        assert_eq!(codec.decode_packet(&buf), Err(CodecError::InvalidDegree(9)));
    }

    #[test]
    fn batched_carrier_decodes_in_order() {
        let codec = codec();
        let mut builder = PacketBuilder::new(codec);
        builder.push(&Message::ClusterInfo { info: sample_info(1) }, 0);
        builder.push(&Message::NeighborClusterInfo { cluster_id: 1, info: sample_info(2) }, 1);
        let carriers = builder.finish();
        assert_eq!(carriers.len(), 1);
        let decoded = codec.decode_packet(&carriers[0]).unwrap();
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded[0].tag(), TypeTag::ClusterInfo);
        assert_eq!(decoded[1].tag(), TypeTag::NeighborClusterInfo);
    }

    #[test]
    fn builder_flushes_past_carrier_limit() {
        let codec = codec();
        // A DistroMap sub-header is ~1.1 KiB; three cannot share a carrier.
        let cells = vec![0.0f32; 256];
        let mut builder = PacketBuilder::new(codec);
        for seq in 0..3 {
            builder.push(
                &Message::DistroMap { cluster_id: 42, info: sample_info(42), cells: cells.clone() },
                seq,
            );
        }
        let carriers = builder.finish();
        assert_eq!(carriers.len(), 2);
        assert!(carriers.iter().all(|c| c.len() <= MAX_CARRIER_LEN));
        let total: usize =
            carriers.iter().map(|c| codec.decode_packet(c).unwrap().len()).sum();
        assert_eq!(total, 3);
    }
}
