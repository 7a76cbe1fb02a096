//! Connection state machine, transport events and errors.

use bytes::Bytes;
use thiserror::Error;

use crate::channels::ChannelId;
use crate::protocol::WireFormat;

/// Lifecycle of one connection attempt. Written only by the owning backend;
/// observers consume [`ClientEvent::StateChanged`] notifications instead of
/// polling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

/// Reasons a connection ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    Graceful,
    Timeout,
    Kicked,
    ProtocolMismatch,
    TransportError,
}

/// Transport level error surfaced to higher layers.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport not connected")]
    NotConnected,
    #[error("transport already connected")]
    AlreadyConnected,
    #[error("outgoing buffer full")]
    BufferFull,
    #[error("reliable delivery failed after {attempts} attempts on channel {channel}")]
    DeliveryFailed { channel: ChannelId, attempts: u32 },
    #[error("configuration error: {0}")]
    InvalidConfig(&'static str),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("encode error: {0}")]
    Encode(String),
    #[error("connection closed")]
    Closed,
}

/// What a concrete backend can honor. Queried once at connection
/// establishment, never per message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportCapabilities {
    pub supports_unreliable: bool,
    pub supports_sequenced: bool,
    /// Message classes only the legacy wire carries (e.g. raw prototype
    /// requests). A class outside this surface is silently skipped.
    pub legacy_requests: bool,
    pub wire_format: WireFormat,
}

/// Events emitted by a backend toward the dispatcher. Delivered over the
/// unbounded channel handed in at connect time; the backend never blocks on
/// the consumer.
#[derive(Debug)]
pub enum ClientEvent {
    StateChanged(ConnectionState),
    Message { channel: ChannelId, payload: Bytes },
    Error(TransportError),
    Disconnected { reason: DisconnectReason },
}
