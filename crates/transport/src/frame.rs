//! Wire framing: fixed 32-byte header + payload
//!
//! Layout, all multi-byte fields little-endian:
//!
//! ```text
//! offset size field
//!   0     1   type
//!   1     3   padding (zero)
//!   4     8   sender id
//!  12     8   receiver id (0 = broadcast)
//!  20     8   timestamp, milliseconds
//!  28     4   payload length
//!  32     N   payload
//! ```

use bytes::{Bytes, BytesMut};
use weave_topology::NodeId;

use crate::{Message, MessageType, TransportError};

/// Size of the fixed frame header.
pub const HEADER_LEN: usize = 32;

/// Hard cap on payload length. Large enough for the chunked transfer layer
/// with room to spare; anything above fails decode and the connection is
/// closed.
pub const MAX_PAYLOAD_LEN: usize = 1024 * 1024;

/// Decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Message type.
    pub kind: MessageType,
    /// Originating node.
    pub sender: NodeId,
    /// Destination node, or broadcast.
    pub receiver: NodeId,
    /// Sender wall clock in milliseconds.
    pub timestamp_ms: u64,
    /// Number of payload bytes following the header.
    pub payload_len: u32,
}

impl Header {
    /// Parse a header from its fixed-size wire form.
    pub fn parse(buf: &[u8; HEADER_LEN]) -> Result<Self, TransportError> {
        let kind = MessageType::from_wire(buf[0])
            .ok_or_else(|| TransportError::InvalidFrame(format!("unknown type {}", buf[0])))?;
        let sender = u64::from_le_bytes(buf[4..12].try_into().unwrap());
        let receiver = u64::from_le_bytes(buf[12..20].try_into().unwrap());
        let timestamp_ms = u64::from_le_bytes(buf[20..28].try_into().unwrap());
        let payload_len = u32::from_le_bytes(buf[28..32].try_into().unwrap());

        if payload_len as usize > MAX_PAYLOAD_LEN {
            return Err(TransportError::InvalidFrame(format!(
                "payload of {payload_len} bytes exceeds the {MAX_PAYLOAD_LEN} byte limit"
            )));
        }

        Ok(Self {
            kind,
            sender: NodeId::new(sender),
            receiver: NodeId::new(receiver),
            timestamp_ms,
            payload_len,
        })
    }
}

/// Encode a message into a single frame.
pub fn encode(message: &Message) -> Result<Bytes, TransportError> {
    if message.payload.len() > MAX_PAYLOAD_LEN {
        return Err(TransportError::InvalidFrame(format!(
            "payload of {} bytes exceeds the {MAX_PAYLOAD_LEN} byte limit",
            message.payload.len()
        )));
    }

    let mut buf = BytesMut::with_capacity(HEADER_LEN + message.payload.len());
    buf.extend_from_slice(&[message.kind as u8, 0, 0, 0]);
    buf.extend_from_slice(&message.sender.raw().to_le_bytes());
    buf.extend_from_slice(&message.receiver.raw().to_le_bytes());
    buf.extend_from_slice(&message.timestamp_ms.to_le_bytes());
    buf.extend_from_slice(&(message.payload.len() as u32).to_le_bytes());
    buf.extend_from_slice(&message.payload);
    Ok(buf.freeze())
}

/// Decode one complete frame. The buffer must contain exactly the header
/// and its payload; streaming transports read the header first and then
/// `payload_len` more bytes.
pub fn decode(buf: &[u8]) -> Result<Message, TransportError> {
    if buf.len() < HEADER_LEN {
        return Err(TransportError::InvalidFrame(format!(
            "short frame of {} bytes",
            buf.len()
        )));
    }

    let header = Header::parse(buf[..HEADER_LEN].try_into().unwrap())?;
    let expected = HEADER_LEN + header.payload_len as usize;
    if buf.len() != expected {
        return Err(TransportError::InvalidFrame(format!(
            "frame length {} does not match header ({expected})",
            buf.len()
        )));
    }

    Ok(Message {
        kind: header.kind,
        sender: header.sender,
        receiver: header.receiver,
        timestamp_ms: header.timestamp_ms,
        payload: Bytes::copy_from_slice(&buf[HEADER_LEN..]),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(kind: MessageType, payload: &[u8]) -> Message {
        Message {
            kind,
            sender: NodeId::new(42),
            receiver: NodeId::new(7),
            timestamp_ms: 1_700_000_000_123,
            payload: Bytes::copy_from_slice(payload),
        }
    }

    #[test]
    fn roundtrip() {
        let msg = sample(MessageType::DataMessage, b"hello overlay");
        let frame = encode(&msg).unwrap();
        assert_eq!(frame.len(), HEADER_LEN + 13);
        let decoded = decode(&frame).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn roundtrip_empty_payload() {
        let msg = sample(MessageType::Heartbeat, b"");
        let decoded = decode(&encode(&msg).unwrap()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn header_layout_is_fixed() {
        let msg = sample(MessageType::Heartbeat, b"xy");
        let frame = encode(&msg).unwrap();
        assert_eq!(frame[0], 4);
        assert_eq!(&frame[1..4], &[0, 0, 0]);
        assert_eq!(u64::from_le_bytes(frame[4..12].try_into().unwrap()), 42);
        assert_eq!(u64::from_le_bytes(frame[12..20].try_into().unwrap()), 7);
        assert_eq!(
            u32::from_le_bytes(frame[28..32].try_into().unwrap()),
            2
        );
    }

    #[test]
    fn unknown_type_is_rejected() {
        let msg = sample(MessageType::Heartbeat, b"");
        let mut frame = BytesMut::from(encode(&msg).unwrap().as_ref());
        frame[0] = 200;
        assert!(matches!(
            decode(&frame),
            Err(TransportError::InvalidFrame(_))
        ));
    }

    #[test]
    fn oversized_length_is_rejected() {
        let msg = sample(MessageType::DataMessage, b"abc");
        let mut frame = BytesMut::from(encode(&msg).unwrap().as_ref());
        frame[28..32].copy_from_slice(&(MAX_PAYLOAD_LEN as u32 + 1).to_le_bytes());
        assert!(matches!(
            decode(&frame),
            Err(TransportError::InvalidFrame(_))
        ));
    }
}
