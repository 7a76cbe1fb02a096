//! Opcode space, message envelope and the two wire formats.
//!
//! The opcode integers are shared with the external match authority and must
//! never be renumbered. Both wire formats decode into the same
//! [`MessageEnvelope`] shape so everything above the transport is format
//! agnostic:
//! - the legacy datagram backend uses a hand-framed binary layout,
//! - the newer stream backend uses a bincode-encoded structured value.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::channels::{ChannelId, DeliveryMethod};

/// Stable message class identifiers shared with the match authority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u16)]
pub enum Opcode {
    Handshake = 1,
    Chat = 2,
    PlayerStatus = 3,
    PlayerColor = 4,
    EntitySync = 10,
    EntityPrototype = 11,
    EntityPosition = 12,
    EntityRemove = 13,
    SecondaryState = 20,
    Settings = 30,
    TimeControl = 40,
    ResourceLock = 50,
    Scenario = 60,
    Admin = 100,
}

impl Opcode {
    pub const fn as_u16(self) -> u16 {
        self as u16
    }

    /// Unknown values are not an error against a newer/older peer; callers
    /// treat `None` as a no-op.
    pub fn from_u16(value: u16) -> Option<Self> {
        Some(match value {
            1 => Opcode::Handshake,
            2 => Opcode::Chat,
            3 => Opcode::PlayerStatus,
            4 => Opcode::PlayerColor,
            10 => Opcode::EntitySync,
            11 => Opcode::EntityPrototype,
            12 => Opcode::EntityPosition,
            13 => Opcode::EntityRemove,
            20 => Opcode::SecondaryState,
            30 => Opcode::Settings,
            40 => Opcode::TimeControl,
            50 => Opcode::ResourceLock,
            60 => Opcode::Scenario,
            100 => Opcode::Admin,
            _ => return None,
        })
    }
}

/// Wire encoding used by a backend. Fixed per backend, queried once at
/// connection establishment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireFormat {
    /// Hand-framed binary layout (legacy datagram backend).
    BinaryFrame,
    /// Bincode-encoded [`WireEnvelope`] (stream backend).
    Structured,
}

/// A routed message. Immutable once constructed.
#[derive(Debug, Clone)]
pub struct MessageEnvelope {
    pub opcode: Opcode,
    pub payload: Bytes,
    pub delivery: DeliveryMethod,
    pub channel: ChannelId,
}

impl MessageEnvelope {
    pub fn new(
        opcode: Opcode,
        payload: impl Into<Bytes>,
        delivery: DeliveryMethod,
        channel: ChannelId,
    ) -> Self {
        Self {
            opcode,
            payload: payload.into(),
            delivery,
            channel,
        }
    }
}

/// Structured wire shape used by the stream backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireEnvelope {
    pub opcode: u16,
    pub channel: ChannelId,
    pub delivery: DeliveryMethod,
    pub payload: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("frame truncated: expected {expected} more bytes, had {remaining}")]
    Truncated { expected: usize, remaining: usize },
    #[error("unknown delivery discriminant {0}")]
    UnknownDelivery(u8),
    #[error("unknown opcode {0}")]
    UnknownOpcode(u16),
    #[error("structured decode failed: {0}")]
    Structured(#[from] bincode::Error),
}

pub(crate) const fn delivery_to_wire(delivery: DeliveryMethod) -> u8 {
    match delivery {
        DeliveryMethod::Unreliable => 0,
        DeliveryMethod::UnreliableSequenced => 1,
        DeliveryMethod::ReliableUnordered => 2,
        DeliveryMethod::ReliableSequenced => 3,
        DeliveryMethod::ReliableOrdered => 4,
    }
}

pub(crate) fn delivery_from_wire(value: u8) -> Result<DeliveryMethod, ProtocolError> {
    Ok(match value {
        0 => DeliveryMethod::Unreliable,
        1 => DeliveryMethod::UnreliableSequenced,
        2 => DeliveryMethod::ReliableUnordered,
        3 => DeliveryMethod::ReliableSequenced,
        4 => DeliveryMethod::ReliableOrdered,
        other => return Err(ProtocolError::UnknownDelivery(other)),
    })
}

/// Legacy binary frame layout:
/// - 2 bytes opcode (u16, big-endian)
/// - 1 byte channel
/// - 1 byte delivery discriminant
/// - 4 bytes payload length (u32, big-endian)
/// - N bytes payload
pub fn encode_binary_frame(envelope: &MessageEnvelope) -> Bytes {
    let mut buf = BytesMut::with_capacity(8 + envelope.payload.len());
    buf.put_u16(envelope.opcode.as_u16());
    buf.put_u8(envelope.channel);
    buf.put_u8(delivery_to_wire(envelope.delivery));
    buf.put_u32(envelope.payload.len() as u32);
    buf.extend_from_slice(&envelope.payload);
    buf.freeze()
}

pub fn decode_binary_frame(mut frame: Bytes) -> Result<MessageEnvelope, ProtocolError> {
    if frame.len() < 8 {
        return Err(ProtocolError::Truncated {
            expected: 8,
            remaining: frame.len(),
        });
    }
    let opcode_raw = frame.get_u16();
    let channel = frame.get_u8();
    let delivery = delivery_from_wire(frame.get_u8())?;
    let len = frame.get_u32() as usize;
    if frame.len() < len {
        return Err(ProtocolError::Truncated {
            expected: len,
            remaining: frame.len(),
        });
    }
    let opcode = Opcode::from_u16(opcode_raw).ok_or(ProtocolError::UnknownOpcode(opcode_raw))?;
    Ok(MessageEnvelope {
        opcode,
        payload: frame.split_to(len),
        delivery,
        channel,
    })
}

/// Structured encoding used by the stream backend.
pub fn encode_structured(envelope: &MessageEnvelope) -> Result<Bytes, ProtocolError> {
    let wire = WireEnvelope {
        opcode: envelope.opcode.as_u16(),
        channel: envelope.channel,
        delivery: envelope.delivery,
        payload: envelope.payload.to_vec(),
    };
    Ok(Bytes::from(bincode::serialize(&wire)?))
}

pub fn decode_structured(frame: &[u8]) -> Result<MessageEnvelope, ProtocolError> {
    let wire: WireEnvelope = bincode::deserialize(frame)?;
    let opcode = Opcode::from_u16(wire.opcode).ok_or(ProtocolError::UnknownOpcode(wire.opcode))?;
    Ok(MessageEnvelope {
        opcode,
        payload: Bytes::from(wire.payload),
        delivery: wire.delivery,
        channel: wire.channel,
    })
}
