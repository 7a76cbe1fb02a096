//! Opcode-addressed message routing.
//!
//! The router owns one abstract connection and never branches on the
//! concrete backend: the wire format and capability surface are read once at
//! construction and drive encoding from then on. Inbound frames are
//! decoded, decompressed and fanned out through a handler table registered
//! at startup; outbound payloads are compressed and sent with the delivery
//! method their message class specifies.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Instant;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use orbitlink_shared::channels::{
    ChannelId, DeliveryMethod, CHANNEL_CONTROL, CHANNEL_POSITION, CHANNEL_STATUS,
};
use orbitlink_shared::codec::{CompressionCodec, DecompressOutcome, COMPRESSION_MAGIC};
use orbitlink_shared::events::{ClientEvent, TransportCapabilities, TransportError};
use orbitlink_shared::protocol::{
    decode_binary_frame, decode_structured, MessageEnvelope, Opcode, WireFormat,
};
use orbitlink_shared::serialization::{BincodeSerializer, MessageSerializer, SerializationError};
use orbitlink_shared::transport::{Connection, SendTicket};
use serde::{de::DeserializeOwned, Serialize};

use crate::context::SyncContext;

/// Delivery policy grouping for the opcode space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageClass {
    /// Ownership, admin, state sync: reliable and ordered.
    Control,
    /// Chat and player status: reliable, order irrelevant.
    Status,
    /// Entity position updates: lossy, only the newest matters.
    Position,
}

impl MessageClass {
    pub fn of(opcode: Opcode) -> Self {
        match opcode {
            Opcode::EntityPosition => Self::Position,
            Opcode::Chat | Opcode::PlayerStatus | Opcode::PlayerColor => Self::Status,
            _ => Self::Control,
        }
    }

    pub fn delivery(self) -> DeliveryMethod {
        match self {
            Self::Control => DeliveryMethod::ReliableOrdered,
            Self::Status => DeliveryMethod::ReliableUnordered,
            Self::Position => DeliveryMethod::UnreliableSequenced,
        }
    }

    pub fn channel(self) -> ChannelId {
        match self {
            Self::Control => CHANNEL_CONTROL,
            Self::Status => CHANNEL_STATUS,
            Self::Position => CHANNEL_POSITION,
        }
    }
}

/// Request types only the legacy wire carries.
fn legacy_only(opcode: Opcode) -> bool {
    matches!(opcode, Opcode::EntityPrototype)
}

/// Identity of one logical outbound request, for duplicate suppression.
/// `identity` disambiguates requests of the same opcode (entity id hash,
/// player id, and similar).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestKey {
    pub opcode: Opcode,
    pub identity: u64,
}

impl RequestKey {
    pub fn new(opcode: Opcode, identity: u64) -> Self {
        Self { opcode, identity }
    }
}

/// A decoded, decompressed inbound message as handed to a handler.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub opcode: Opcode,
    pub channel: ChannelId,
    pub payload: Bytes,
}

impl InboundMessage {
    /// Decodes the payload as a typed domain message.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, SerializationError> {
        BincodeSerializer.deserialize(&self.payload)
    }
}

type Handler = Box<dyn Fn(InboundMessage) + Send + Sync>;

/// Routes typed domain messages over one abstract connection.
pub struct MessageRouter {
    connection: Arc<dyn Connection>,
    capabilities: TransportCapabilities,
    codec: CompressionCodec,
    serializer: BincodeSerializer,
    context: Arc<SyncContext>,
    handlers: RwLock<HashMap<Opcode, Handler>>,
    recent_requests: Mutex<HashMap<RequestKey, Instant>>,
}

impl MessageRouter {
    /// The capability surface is read here, once, and never re-queried per
    /// message.
    pub fn new(connection: Arc<dyn Connection>, context: Arc<SyncContext>) -> Self {
        let capabilities = connection.capabilities();
        Self {
            connection,
            capabilities,
            codec: CompressionCodec::new(),
            serializer: BincodeSerializer,
            context,
            handlers: RwLock::new(HashMap::new()),
            recent_requests: Mutex::new(HashMap::new()),
        }
    }

    pub fn capabilities(&self) -> TransportCapabilities {
        self.capabilities
    }

    /// Registers the handler for one opcode. Called once per domain at
    /// startup; a later registration for the same opcode replaces the
    /// earlier one.
    pub fn register<F>(&self, opcode: Opcode, handler: F)
    where
        F: Fn(InboundMessage) + Send + Sync + 'static,
    {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(opcode, Box::new(handler));
    }

    /// Spawns the inbound pump. Runs until the connection reports
    /// disconnection or the event stream closes.
    pub fn spawn_pump(
        self: &Arc<Self>,
        mut events: mpsc::UnboundedReceiver<ClientEvent>,
    ) -> JoinHandle<()> {
        let router = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    ClientEvent::Message { channel, payload } => {
                        router.handle_frame(channel, payload);
                    }
                    ClientEvent::StateChanged(state) => {
                        debug!(?state, "connection state changed");
                    }
                    ClientEvent::Error(err) => {
                        warn!("connection error: {err}");
                    }
                    ClientEvent::Disconnected { reason } => {
                        info!(?reason, "connection closed, stopping message pump");
                        break;
                    }
                }
            }
        })
    }

    /// Decode, decompress, route. Every failure drops the frame with a log
    /// entry; nothing here is fatal to the connection.
    fn handle_frame(&self, channel: ChannelId, payload: Bytes) {
        let envelope = match self.capabilities.wire_format {
            WireFormat::BinaryFrame => decode_binary_frame(payload),
            WireFormat::Structured => decode_structured(&payload),
        };
        let envelope = match envelope {
            Ok(envelope) => envelope,
            Err(err) => {
                // Unknown opcodes are expected against newer or older peers.
                debug!(channel, "dropping inbound frame: {err}");
                return;
            }
        };

        let payload = match self.codec.decompress(&envelope.payload) {
            Ok(DecompressOutcome::Raw) => envelope.payload.clone(),
            Ok(DecompressOutcome::Expanded(expanded)) => expanded,
            Err(err) => {
                warn!(opcode = ?envelope.opcode, "dropping corrupt payload: {err}");
                return;
            }
        };

        let handlers = self.handlers.read().unwrap_or_else(PoisonError::into_inner);
        match handlers.get(&envelope.opcode) {
            Some(handler) => handler(InboundMessage {
                opcode: envelope.opcode,
                channel: envelope.channel,
                payload,
            }),
            None => {
                trace!(opcode = ?envelope.opcode, "no handler registered, ignoring");
            }
        }
    }

    /// Sends one payload with the delivery policy of its message class.
    ///
    /// Returns `Ok(None)` when the message was skipped by the backend
    /// capability shim: request types only the legacy wire carries are a
    /// silent no-op on the newer backend so mixed-version deployments keep
    /// working. Most callers discard the returned ticket; tests await it.
    pub fn send(
        &self,
        opcode: Opcode,
        payload: impl Into<Bytes>,
    ) -> Result<Option<SendTicket>, TransportError> {
        if legacy_only(opcode) && !self.capabilities.legacy_requests {
            trace!(?opcode, "skipping legacy-only message on this backend");
            return Ok(None);
        }

        let class = MessageClass::of(opcode);
        let payload = payload.into();
        // A raw payload whose first byte collides with the compression magic
        // would be misread as compressed on receive; force-deflating it keeps
        // the wire self-describing for any byte content.
        let compressed = if payload.first() == Some(&COMPRESSION_MAGIC) {
            self.codec.compress_force(&payload)
        } else {
            self.codec.compress(&payload)
        }
        .map_err(|err| TransportError::Encode(err.to_string()))?;

        let envelope = MessageEnvelope::new(opcode, compressed, class.delivery(), class.channel());
        self.connection.send(envelope).map(Some)
    }

    /// Serializes a typed domain message and sends it.
    pub fn send_message<T: Serialize>(
        &self,
        opcode: Opcode,
        message: &T,
    ) -> Result<Option<SendTicket>, TransportError> {
        let payload = self
            .serializer
            .serialize(message)
            .map_err(|err| TransportError::Encode(err.to_string()))?;
        self.send(opcode, payload)
    }

    /// Like [`send`](Self::send), with duplicate suppression: a request with
    /// the same key within the cool-down window is a no-op.
    pub fn send_request(
        &self,
        key: RequestKey,
        payload: impl Into<Bytes>,
    ) -> Result<Option<SendTicket>, TransportError> {
        let window = self.context.config.suppression_window();
        {
            let mut recent = self
                .recent_requests
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            let now = Instant::now();
            if let Some(last) = recent.get(&key) {
                if now.duration_since(*last) < window {
                    trace!(opcode = ?key.opcode, "suppressing duplicate request");
                    return Ok(None);
                }
            }
            recent.retain(|_, sent| now.duration_since(*sent) < window);
            recent.insert(key, now);
        }
        self.send(key.opcode, payload)
    }
}
