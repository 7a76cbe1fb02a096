//! Shared networking types for orbitlink.
//!
//! This crate hosts everything both ends of a connection agree on:
//! - channels: delivery guarantees and the logical channel registry
//! - protocol: opcode space, message envelope, both wire formats
//! - codec: magic-byte tagged compression for payloads
//! - stats: atomic per-connection counters
//! - events: connection state machine and transport events/errors
//! - transport: the backend-agnostic connection contract plus the two
//!   concrete backends (legacy datagram, newer stream)
//!
//! Keep this crate lean (no engine dependencies). Consumers that need to
//! marshal work onto an engine thread do so on their side.

use std::time::Duration;

pub mod channels;
pub mod codec;
pub mod events;
pub mod protocol;
pub mod serialization;
pub mod session;
pub mod stats;
pub mod transport;

/// Default max size of the bounded outgoing queue between `send` callers and
/// a backend's writer task. One queue per connection.
pub const DEFAULT_OUTGOING_QUEUE_SIZE: usize = 256;

/// Default period of inactivity before a backend sends a keep-alive packet.
///
/// Keep-alives prevent an inactive but otherwise healthy connection from
/// timing out on NAT/firewall state.
pub const DEFAULT_KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(4);

/// Interval at which the datagram backend retransmits unacknowledged
/// reliable frames.
pub const DEFAULT_RESEND_INTERVAL: Duration = Duration::from_millis(200);

/// Retransmit attempts before a reliable frame is considered undeliverable
/// and the connection is torn down with a transport error.
pub const DEFAULT_MAX_RESEND_ATTEMPTS: u32 = 25;

/// Maximum accepted frame size on the stream backend (1 MiB). Guards against
/// malicious or accidental large allocations.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 1024 * 1024;

pub use channels::{ChannelDescriptor, ChannelId, ChannelRegistry, DeliveryMethod};
pub use codec::{CompressionCodec, DecompressOutcome, COMPRESSION_MAGIC};
pub use events::{
    ClientEvent, ConnectionState, DisconnectReason, TransportCapabilities, TransportError,
};
pub use protocol::{MessageEnvelope, Opcode, WireFormat};
pub use session::SessionId;
pub use stats::ConnectionStats;
pub use transport::{ConnectTarget, Connection, Credentials, SendTicket};

/// Current micros since the unix epoch (UTC). Sample timestamps and envelope
/// timestamps use this scale.
pub fn now_micros() -> i64 {
    (time::OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000) as i64
}
