//! Newer stream backend.
//!
//! Reliable pub/sub transport over TCP. Frames are length-prefixed
//! (u32, big-endian) with a one-byte channel tag followed by the structured
//! envelope:
//!
//! ```text
//! [len u32 BE][channel u8][bincode WireEnvelope]
//! ```
//!
//! The first frame after connect is the hello, carrying credentials and the
//! opcode topics this client subscribes to. The stream itself provides
//! reliability and ordering, so every delivery method is honored as
//! reliable-ordered; the capability table reports the missing unreliable
//! surface and the dispatcher's shim handles the rest.

use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tracing::warn;

use crate::events::{
    ClientEvent, ConnectionState, DisconnectReason, TransportCapabilities, TransportError,
};
use crate::protocol::{self, MessageEnvelope, Opcode, WireFormat};
use crate::stats::ConnectionStats;
use crate::{DEFAULT_MAX_FRAME_SIZE, DEFAULT_OUTGOING_QUEUE_SIZE};

use super::{ConnectTarget, Connection, ConnectionCore, Credentials, OutboundFrame, SendTicket};

/// Channel tag used for transport-internal frames (hello).
const CHANNEL_INTERNAL: u8 = u8::MAX;

/// First frame on every stream connection.
#[derive(Debug, Serialize, Deserialize)]
struct StreamHello {
    credentials: Credentials,
    /// Opcode topics the client wants delivered.
    topics: Vec<u16>,
}

fn default_topics() -> Vec<u16> {
    [
        Opcode::Handshake,
        Opcode::Chat,
        Opcode::PlayerStatus,
        Opcode::PlayerColor,
        Opcode::EntitySync,
        Opcode::EntityPrototype,
        Opcode::EntityPosition,
        Opcode::EntityRemove,
        Opcode::SecondaryState,
        Opcode::Settings,
        Opcode::TimeControl,
        Opcode::ResourceLock,
        Opcode::Scenario,
        Opcode::Admin,
    ]
    .into_iter()
    .map(Opcode::as_u16)
    .collect()
}

async fn write_frame(
    writer: &mut OwnedWriteHalf,
    channel: u8,
    payload: &[u8],
) -> Result<usize, TransportError> {
    let len = 1 + payload.len();
    if len > DEFAULT_MAX_FRAME_SIZE {
        return Err(TransportError::Encode(format!(
            "frame too large: {len} bytes"
        )));
    }
    writer.write_all(&(len as u32).to_be_bytes()).await?;
    writer.write_all(&[channel]).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(4 + len)
}

/// Reads one frame; `Ok(None)` is a clean end of stream.
async fn read_frame(reader: &mut OwnedReadHalf) -> Result<Option<(u8, Bytes)>, TransportError> {
    let mut len_bytes = [0u8; 4];
    match reader.read_exact(&mut len_bytes).await {
        Ok(_) => {}
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(TransportError::Io(err)),
    }
    let len = u32::from_be_bytes(len_bytes) as usize;
    if len == 0 || len > DEFAULT_MAX_FRAME_SIZE {
        return Err(TransportError::Encode(format!(
            "unacceptable frame length {len}"
        )));
    }
    let mut frame = vec![0u8; len];
    reader.read_exact(&mut frame).await?;
    let channel = frame[0];
    Ok(Some((channel, Bytes::from(frame).slice(1..))))
}

async fn writer_task(
    mut writer: OwnedWriteHalf,
    core: Arc<ConnectionCore>,
    mut outgoing: mpsc::Receiver<OutboundFrame>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            frame = outgoing.recv() => {
                let Some(OutboundFrame { envelope, mut done }) = frame else { break };

                let encoded = match protocol::encode_structured(&envelope) {
                    Ok(encoded) => encoded,
                    Err(err) => {
                        if let Some(done) = done.take() {
                            let _ = done.send(Err(TransportError::Encode(err.to_string())));
                        }
                        continue;
                    }
                };
                match write_frame(&mut writer, envelope.channel, &encoded).await {
                    Ok(sent) => {
                        core.stats().record_send(sent);
                        if let Some(done) = done.take() {
                            let _ = done.send(Ok(()));
                        }
                    }
                    Err(err) => {
                        if let Some(done) = done.take() {
                            let _ = done.send(Err(err));
                        } else {
                            warn!(channel = envelope.channel, "stream send failed");
                        }
                        core.fail(TransportError::Closed, DisconnectReason::TransportError);
                        break;
                    }
                }
            }
        }
    }
}

async fn reader_task(
    mut reader: OwnedReadHalf,
    core: Arc<ConnectionCore>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let frame = tokio::select! {
            _ = shutdown.changed() => break,
            frame = read_frame(&mut reader) => frame,
        };

        match frame {
            Ok(Some((channel, payload))) => {
                core.stats().record_receive(5 + payload.len());
                if channel == CHANNEL_INTERNAL {
                    // Server-side control frames (unused today) stay below
                    // the dispatcher.
                    continue;
                }
                core.emit(ClientEvent::Message { channel, payload });
            }
            Ok(None) => {
                core.teardown(DisconnectReason::Graceful);
                break;
            }
            Err(err) => {
                core.fail(err, DisconnectReason::TransportError);
                break;
            }
        }
    }
}

/// Reliable pub/sub TCP transport.
pub struct StreamConnection {
    core: Arc<ConnectionCore>,
    topics: Vec<u16>,
}

impl StreamConnection {
    pub fn new() -> Self {
        Self::with_topics(default_topics())
    }

    /// Subscribes only to the given opcode topics.
    pub fn with_topics(topics: Vec<u16>) -> Self {
        Self {
            core: Arc::new(ConnectionCore::new("stream")),
            topics,
        }
    }
}

impl Default for StreamConnection {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Connection for StreamConnection {
    async fn connect(
        &self,
        target: ConnectTarget,
        credentials: Credentials,
        events: mpsc::UnboundedSender<ClientEvent>,
    ) -> Result<(), TransportError> {
        self.core.begin_connect(events)?;

        let stream = match TcpStream::connect(target.addr).await {
            Ok(stream) => stream,
            Err(err) => {
                self.core.teardown(DisconnectReason::TransportError);
                return Err(TransportError::Io(err));
            }
        };
        if let Err(err) = stream.set_nodelay(true) {
            self.core.teardown(DisconnectReason::TransportError);
            return Err(TransportError::Io(err));
        }

        let (reader, mut writer) = stream.into_split();

        let hello = StreamHello {
            credentials,
            topics: self.topics.clone(),
        };
        let hello_bytes = bincode::serialize(&hello)
            .map_err(|err| TransportError::Encode(err.to_string()))?;
        match write_frame(&mut writer, CHANNEL_INTERNAL, &hello_bytes).await {
            Ok(sent) => self.core.stats().record_send(sent),
            Err(err) => {
                self.core.teardown(DisconnectReason::TransportError);
                return Err(err);
            }
        }

        let (outgoing_tx, outgoing_rx) = mpsc::channel(DEFAULT_OUTGOING_QUEUE_SIZE);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        tokio::spawn(writer_task(
            writer,
            Arc::clone(&self.core),
            outgoing_rx,
            shutdown_rx.clone(),
        ));
        tokio::spawn(reader_task(reader, Arc::clone(&self.core), shutdown_rx));

        self.core.go_live(outgoing_tx, shutdown_tx);
        Ok(())
    }

    fn send(&self, envelope: MessageEnvelope) -> Result<SendTicket, TransportError> {
        // The stream is reliable end to end; unreliable delivery methods are
        // honored as reliable (documented downgrade).
        self.core.queue(envelope)
    }

    async fn disconnect(&self, reason: DisconnectReason) -> Result<(), TransportError> {
        if self.core.current_state() == ConnectionState::Disconnected {
            return Ok(());
        }
        self.core.set_state(ConnectionState::Disconnecting);
        self.core.teardown(reason);
        Ok(())
    }

    fn capabilities(&self) -> TransportCapabilities {
        TransportCapabilities {
            supports_unreliable: false,
            supports_sequenced: false,
            legacy_requests: false,
            wire_format: WireFormat::Structured,
        }
    }

    fn state(&self) -> ConnectionState {
        self.core.current_state()
    }

    fn stats(&self) -> Arc<ConnectionStats> {
        Arc::clone(self.core.stats())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::{CHANNEL_CONTROL, DeliveryMethod};
    use crate::session::SessionId;
    use tokio::net::TcpListener;

    fn credentials() -> Credentials {
        Credentials {
            session: SessionId::new(),
            player_name: "pilot".into(),
            token: Some("join-code".into()),
        }
    }

    async fn accept_with_hello(listener: &TcpListener) -> (TcpStream, StreamHello) {
        let (mut peer, _) = listener.accept().await.unwrap();
        let mut len_bytes = [0u8; 4];
        peer.read_exact(&mut len_bytes).await.unwrap();
        let len = u32::from_be_bytes(len_bytes) as usize;
        let mut frame = vec![0u8; len];
        peer.read_exact(&mut frame).await.unwrap();
        assert_eq!(frame[0], CHANNEL_INTERNAL);
        let hello: StreamHello = bincode::deserialize(&frame[1..]).unwrap();
        (peer, hello)
    }

    #[test_log::test(tokio::test)]
    async fn hello_carries_credentials_and_topics() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = ConnectTarget::from(listener.local_addr().unwrap());

        let connection = StreamConnection::new();
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let connect = connection.connect(target, credentials(), events_tx);
        let (accept, connected) = tokio::join!(accept_with_hello(&listener), connect);
        connected.unwrap();

        let (_peer, hello) = accept;
        assert_eq!(hello.credentials.player_name, "pilot");
        assert!(hello.topics.contains(&Opcode::EntityPosition.as_u16()));
    }

    #[test_log::test(tokio::test)]
    async fn frames_roundtrip_through_a_peer() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = ConnectTarget::from(listener.local_addr().unwrap());

        let connection = StreamConnection::new();
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let connect = connection.connect(target, credentials(), events_tx);
        let ((mut peer, _hello), connected) = tokio::join!(accept_with_hello(&listener), connect);
        connected.unwrap();

        // Outbound: an unreliable request is carried reliably by the stream.
        let ticket = connection
            .send(MessageEnvelope::new(
                Opcode::Chat,
                Bytes::from_static(b"hello there"),
                DeliveryMethod::Unreliable,
                CHANNEL_CONTROL,
            ))
            .unwrap();
        ticket.done().await.unwrap();

        let mut len_bytes = [0u8; 4];
        peer.read_exact(&mut len_bytes).await.unwrap();
        let len = u32::from_be_bytes(len_bytes) as usize;
        let mut frame = vec![0u8; len];
        peer.read_exact(&mut frame).await.unwrap();
        assert_eq!(frame[0], CHANNEL_CONTROL);
        let envelope = protocol::decode_structured(&frame[1..]).unwrap();
        assert_eq!(envelope.opcode, Opcode::Chat);
        assert_eq!(envelope.payload.as_ref(), b"hello there");

        // Inbound: peer pushes a structured envelope back.
        let reply = protocol::encode_structured(&MessageEnvelope::new(
            Opcode::Chat,
            Bytes::from_static(b"copy that"),
            DeliveryMethod::ReliableUnordered,
            CHANNEL_CONTROL,
        ))
        .unwrap();
        let reply_len = (1 + reply.len()) as u32;
        peer.write_all(&reply_len.to_be_bytes()).await.unwrap();
        peer.write_all(&[CHANNEL_CONTROL]).await.unwrap();
        peer.write_all(&reply).await.unwrap();

        let payload = loop {
            match events_rx.recv().await.unwrap() {
                ClientEvent::Message { payload, .. } => break payload,
                _ => continue,
            }
        };
        let inbound = protocol::decode_structured(&payload).unwrap();
        assert_eq!(inbound.payload.as_ref(), b"copy that");
    }

    #[test_log::test(tokio::test)]
    async fn peer_close_surfaces_disconnect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = ConnectTarget::from(listener.local_addr().unwrap());

        let connection = StreamConnection::new();
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let connect = connection.connect(target, credentials(), events_tx);
        let ((peer, _hello), connected) = tokio::join!(accept_with_hello(&listener), connect);
        connected.unwrap();

        drop(peer);

        let disconnected = loop {
            match events_rx.recv().await.unwrap() {
                ClientEvent::Disconnected { reason } => break reason,
                _ => continue,
            }
        };
        assert_eq!(disconnected, DisconnectReason::Graceful);
        assert_eq!(connection.state(), ConnectionState::Disconnected);
    }
}
