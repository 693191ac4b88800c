//! Payload encoding for every message type
//!
//! All multi-byte fields are little-endian, matching the frame header. Each
//! decoder returns a validation error instead of panicking on short or
//! malformed input.

use bytes::{BufMut, Bytes, BytesMut};
use weave_topology::{NodeAddress, NodeId};
use weave_transport::{frame, Message};

use crate::error::{EngineError, Result};
use crate::exchange::DataChunk;

/// A node id paired with its listen address, as carried in join responses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerEntry {
    /// The peer's id.
    pub id: NodeId,
    /// Where the peer listens.
    pub address: NodeAddress,
}

fn take<'a>(buf: &'a [u8], offset: &mut usize, len: usize) -> Result<&'a [u8]> {
    let end = offset
        .checked_add(len)
        .filter(|&end| end <= buf.len())
        .ok_or_else(|| EngineError::Validation("payload truncated".to_string()))?;
    let slice = &buf[*offset..end];
    *offset = end;
    Ok(slice)
}

fn take_u8(buf: &[u8], offset: &mut usize) -> Result<u8> {
    Ok(take(buf, offset, 1)?[0])
}

fn take_u16(buf: &[u8], offset: &mut usize) -> Result<u16> {
    Ok(u16::from_le_bytes(take(buf, offset, 2)?.try_into().unwrap()))
}

fn take_u32(buf: &[u8], offset: &mut usize) -> Result<u32> {
    Ok(u32::from_le_bytes(take(buf, offset, 4)?.try_into().unwrap()))
}

fn take_u64(buf: &[u8], offset: &mut usize) -> Result<u64> {
    Ok(u64::from_le_bytes(take(buf, offset, 8)?.try_into().unwrap()))
}

fn put_address(buf: &mut BytesMut, address: &NodeAddress) {
    let host = address.host.as_bytes();
    let len = host.len().min(u8::MAX as usize);
    buf.put_u16_le(address.port);
    buf.put_u8(len as u8);
    buf.put_slice(&host[..len]);
}

fn take_address(buf: &[u8], offset: &mut usize) -> Result<NodeAddress> {
    let port = take_u16(buf, offset)?;
    let host_len = take_u8(buf, offset)? as usize;
    let host = std::str::from_utf8(take(buf, offset, host_len)?)
        .map_err(|_| EngineError::Validation("host is not utf-8".to_string()))?;
    Ok(NodeAddress::new(host, port))
}

/// Join request: the requester's listen port. The responder derives the
/// host from the connection's remote address.
pub fn encode_join_request(listen_port: u16) -> Bytes {
    let mut buf = BytesMut::with_capacity(2);
    buf.put_u16_le(listen_port);
    buf.freeze()
}

/// Decode a join request payload.
pub fn decode_join_request(payload: &[u8]) -> Result<u16> {
    let mut offset = 0;
    take_u16(payload, &mut offset)
}

/// Join response: accept flag, id list, then an address annex so the
/// requester can dial the returned peers.
pub fn encode_join_response(accepted: bool, peers: &[PeerEntry]) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_u8(accepted as u8);
    buf.put_u32_le(peers.len() as u32);
    for peer in peers {
        buf.put_u64_le(peer.id.raw());
    }
    for peer in peers {
        put_address(&mut buf, &peer.address);
    }
    buf.freeze()
}

/// Decode a join response. An annex-less payload (ids only) yields entries
/// with empty addresses.
pub fn decode_join_response(payload: &[u8]) -> Result<(bool, Vec<PeerEntry>)> {
    let mut offset = 0;
    let accepted = take_u8(payload, &mut offset)? != 0;
    let count = take_u32(payload, &mut offset)? as usize;
    if count > payload.len() / 8 {
        return Err(EngineError::Validation(format!(
            "peer count {count} exceeds payload"
        )));
    }

    let mut entries = Vec::with_capacity(count);
    for _ in 0..count {
        entries.push(PeerEntry {
            id: NodeId::new(take_u64(payload, &mut offset)?),
            address: NodeAddress::new("", 0),
        });
    }
    if offset < payload.len() {
        for entry in &mut entries {
            entry.address = take_address(payload, &mut offset)?;
        }
    }
    Ok((accepted, entries))
}

/// Topology update / plain id list: count then ids.
pub fn encode_node_list(ids: &[NodeId]) -> Bytes {
    let mut buf = BytesMut::with_capacity(4 + ids.len() * 8);
    buf.put_u32_le(ids.len() as u32);
    for id in ids {
        buf.put_u64_le(id.raw());
    }
    buf.freeze()
}

/// Decode an id list.
pub fn decode_node_list(payload: &[u8]) -> Result<Vec<NodeId>> {
    let mut offset = 0;
    let count = take_u32(payload, &mut offset)? as usize;
    if count > payload.len() / 8 {
        return Err(EngineError::Validation(format!(
            "id count {count} exceeds payload"
        )));
    }
    let mut ids = Vec::with_capacity(count);
    for _ in 0..count {
        ids.push(NodeId::new(take_u64(payload, &mut offset)?));
    }
    Ok(ids)
}

/// Peer discovery request: how many peers the requester wants.
pub fn encode_peer_discovery(max_peers: i32) -> Bytes {
    Bytes::copy_from_slice(&max_peers.to_le_bytes())
}

/// Decode a peer discovery request.
pub fn decode_peer_discovery(payload: &[u8]) -> Result<i32> {
    let mut offset = 0;
    Ok(i32::from_le_bytes(
        take(payload, &mut offset, 4)?.try_into().unwrap(),
    ))
}

/// Acknowledgement: the acknowledged message id.
pub fn encode_ack(message_id: u64) -> Bytes {
    Bytes::copy_from_slice(&message_id.to_le_bytes())
}

/// Decode an acknowledgement.
pub fn decode_ack(payload: &[u8]) -> Result<u64> {
    let mut offset = 0;
    take_u64(payload, &mut offset)
}

/// Data message: message id (zero = no ack requested) then application
/// bytes.
pub fn encode_data(message_id: u64, data: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(8 + data.len());
    buf.put_u64_le(message_id);
    buf.put_slice(data);
    buf.freeze()
}

/// Decode a data message. Payloads shorter than the id prefix are treated
/// as fire-and-forget application bytes.
pub fn decode_data(payload: &Bytes) -> (u64, Bytes) {
    if payload.len() < 8 {
        return (0, payload.clone());
    }
    let id = u64::from_le_bytes(payload[..8].try_into().unwrap());
    (id, payload.slice(8..))
}

/// Data chunk: transfer id, sequence, total chunks, last flag, data.
pub fn encode_chunk(chunk: &DataChunk) -> Bytes {
    let mut buf = BytesMut::with_capacity(21 + chunk.data.len());
    buf.put_u64_le(chunk.transfer_id);
    buf.put_u32_le(chunk.sequence);
    buf.put_u32_le(chunk.total_chunks);
    buf.put_u8(chunk.is_last as u8);
    buf.put_u32_le(chunk.data.len() as u32);
    buf.put_slice(&chunk.data);
    buf.freeze()
}

/// Decode a data chunk.
pub fn decode_chunk(payload: &[u8]) -> Result<DataChunk> {
    let mut offset = 0;
    let transfer_id = take_u64(payload, &mut offset)?;
    let sequence = take_u32(payload, &mut offset)?;
    let total_chunks = take_u32(payload, &mut offset)?;
    let is_last = take_u8(payload, &mut offset)? != 0;
    let data_len = take_u32(payload, &mut offset)? as usize;
    let data = Bytes::copy_from_slice(take(payload, &mut offset, data_len)?);
    if total_chunks == 0 || sequence >= total_chunks {
        return Err(EngineError::Validation(format!(
            "chunk sequence {sequence} out of range for {total_chunks} chunks"
        )));
    }
    Ok(DataChunk {
        transfer_id,
        sequence,
        total_chunks,
        data,
        is_last,
    })
}

/// Flood envelope: remaining hop budget plus the inner frame.
pub fn encode_flood(ttl: u8, inner: &Message) -> Result<Bytes> {
    let inner_frame = frame::encode(inner).map_err(EngineError::Transport)?;
    let mut buf = BytesMut::with_capacity(5 + inner_frame.len());
    buf.put_u8(ttl);
    buf.put_u32_le(inner_frame.len() as u32);
    buf.put_slice(&inner_frame);
    Ok(buf.freeze())
}

/// Decode a flood envelope into its hop budget and inner message.
pub fn decode_flood(payload: &[u8]) -> Result<(u8, Message)> {
    let mut offset = 0;
    let ttl = take_u8(payload, &mut offset)?;
    let inner_len = take_u32(payload, &mut offset)? as usize;
    let inner = frame::decode(take(payload, &mut offset, inner_len)?)
        .map_err(EngineError::Transport)?;
    Ok((ttl, inner))
}

#[cfg(test)]
mod tests {
    use super::*;
    use weave_transport::MessageType;

    #[test]
    fn join_request_roundtrip() {
        let payload = encode_join_request(8001);
        assert_eq!(decode_join_request(&payload).unwrap(), 8001);
        assert!(decode_join_request(&[1]).is_err());
    }

    #[test]
    fn join_response_roundtrip_with_annex() {
        let peers = vec![
            PeerEntry {
                id: NodeId::new(11),
                address: NodeAddress::new("10.0.0.1", 9001),
            },
            PeerEntry {
                id: NodeId::new(22),
                address: NodeAddress::new("10.0.0.2", 9002),
            },
        ];
        let payload = encode_join_response(true, &peers);
        let (accepted, decoded) = decode_join_response(&payload).unwrap();
        assert!(accepted);
        assert_eq!(decoded, peers);
    }

    #[test]
    fn join_response_without_annex_parses_ids() {
        // A fixed-prefix-only payload: flag, count, ids.
        let mut buf = BytesMut::new();
        buf.put_u8(1);
        buf.put_u32_le(1);
        buf.put_u64_le(77);
        let (accepted, decoded) = decode_join_response(&buf).unwrap();
        assert!(accepted);
        assert_eq!(decoded[0].id, NodeId::new(77));
        assert!(!decoded[0].address.is_usable());
    }

    #[test]
    fn rejection_carries_no_peers() {
        let payload = encode_join_response(false, &[]);
        let (accepted, decoded) = decode_join_response(&payload).unwrap();
        assert!(!accepted);
        assert!(decoded.is_empty());
    }

    #[test]
    fn node_list_roundtrip() {
        let ids = vec![NodeId::new(1), NodeId::new(2), NodeId::new(3)];
        assert_eq!(decode_node_list(&encode_node_list(&ids)).unwrap(), ids);
    }

    #[test]
    fn oversized_count_is_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32_le(u32::MAX);
        assert!(decode_node_list(&buf).is_err());
    }

    #[test]
    fn data_prefix_roundtrip() {
        let payload = encode_data(99, b"abc");
        let (id, data) = decode_data(&payload);
        assert_eq!(id, 99);
        assert_eq!(data.as_ref(), b"abc");

        let (id, data) = decode_data(&Bytes::from_static(b"tiny"));
        assert_eq!(id, 0);
        assert_eq!(data.as_ref(), b"tiny");
    }

    #[test]
    fn chunk_roundtrip() {
        let chunk = DataChunk {
            transfer_id: 5,
            sequence: 2,
            total_chunks: 4,
            data: Bytes::from_static(b"chunk body"),
            is_last: false,
        };
        let decoded = decode_chunk(&encode_chunk(&chunk)).unwrap();
        assert_eq!(decoded, chunk);
    }

    #[test]
    fn chunk_sequence_must_be_in_range() {
        let chunk = DataChunk {
            transfer_id: 5,
            sequence: 4,
            total_chunks: 4,
            data: Bytes::new(),
            is_last: true,
        };
        assert!(decode_chunk(&encode_chunk(&chunk)).is_err());
    }

    #[test]
    fn flood_envelope_roundtrip() {
        let inner = Message::new(
            MessageType::DataMessage,
            NodeId::new(1),
            NodeId::BROADCAST,
            Bytes::from_static(b"flooded"),
        );
        let payload = encode_flood(3, &inner).unwrap();
        let (ttl, decoded) = decode_flood(&payload).unwrap();
        assert_eq!(ttl, 3);
        assert_eq!(decoded, inner);
    }
}
