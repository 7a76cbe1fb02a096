//! Legacy datagram backend.
//!
//! Low-level UDP transport with per-channel sequencing and ack-driven
//! retransmission for the reliable delivery methods. The wire unit is one
//! datagram:
//!
//! - data:      `[0][channel][delivery][sequence u64 BE][binary frame]`
//! - ack:       `[1][channel][sequence u64 BE]`
//! - hello:     `[2][bincode credentials]`
//! - keepalive: `[3]`
//!
//! Reliable frames stay in the pending table until acknowledged; the resend
//! task retransmits them on a fixed interval and tears the connection down
//! once the attempt budget is exhausted.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::MissedTickBehavior;
use tracing::{trace, warn};

use crate::channels::{ChannelId, DeliveryMethod};
use crate::events::{
    ClientEvent, ConnectionState, DisconnectReason, TransportCapabilities, TransportError,
};
use crate::protocol::{self, MessageEnvelope, WireFormat};
use crate::stats::ConnectionStats;
use crate::{
    DEFAULT_KEEP_ALIVE_INTERVAL, DEFAULT_MAX_RESEND_ATTEMPTS, DEFAULT_OUTGOING_QUEUE_SIZE,
    DEFAULT_RESEND_INTERVAL,
};

use super::{ConnectTarget, Connection, ConnectionCore, Credentials, OutboundFrame, SendTicket};

const KIND_DATA: u8 = 0;
const KIND_ACK: u8 = 1;
const KIND_HELLO: u8 = 2;
const KIND_KEEPALIVE: u8 = 3;

/// Largest datagram the backend accepts from the wire.
const MAX_DATAGRAM_SIZE: usize = 64 * 1024;

struct PendingFrame {
    packet: Bytes,
    attempts: u32,
    first_sent: Instant,
    done: Option<oneshot::Sender<Result<(), TransportError>>>,
}

type PendingTable = Arc<tokio::sync::Mutex<HashMap<(ChannelId, u64), PendingFrame>>>;

#[derive(Default)]
struct ChannelReceiveState {
    last_sequenced: Option<u64>,
    next_ordered: u64,
    held_back: BTreeMap<u64, Bytes>,
    seen_unordered: HashSet<u64>,
}

impl ChannelReceiveState {
    /// Applies the delivery discipline and returns the payloads that become
    /// visible, in delivery order.
    fn admit(&mut self, delivery: DeliveryMethod, sequence: u64, payload: Bytes) -> Vec<Bytes> {
        match delivery {
            DeliveryMethod::Unreliable => vec![payload],
            DeliveryMethod::UnreliableSequenced | DeliveryMethod::ReliableSequenced => {
                if self.last_sequenced.is_some_and(|last| sequence <= last) {
                    trace!(sequence, "dropped out-of-date sequenced frame");
                    return Vec::new();
                }
                self.last_sequenced = Some(sequence);
                vec![payload]
            }
            DeliveryMethod::ReliableUnordered => {
                if !self.seen_unordered.insert(sequence) {
                    return Vec::new();
                }
                if self.seen_unordered.len() > 4096 {
                    let horizon = sequence.saturating_sub(4096);
                    self.seen_unordered.retain(|seen| *seen >= horizon);
                }
                vec![payload]
            }
            DeliveryMethod::ReliableOrdered => {
                if sequence < self.next_ordered {
                    return Vec::new();
                }
                self.held_back.insert(sequence, payload);
                let mut ready = Vec::new();
                while let Some(next) = self.held_back.remove(&self.next_ordered) {
                    ready.push(next);
                    self.next_ordered += 1;
                }
                ready
            }
        }
    }
}

fn encode_data_packet(sequence: u64, envelope: &MessageEnvelope) -> Bytes {
    let frame = protocol::encode_binary_frame(envelope);
    let mut packet = BytesMut::with_capacity(11 + frame.len());
    packet.put_u8(KIND_DATA);
    packet.put_u8(envelope.channel);
    packet.put_u8(protocol::delivery_to_wire(envelope.delivery));
    packet.put_u64(sequence);
    packet.extend_from_slice(&frame);
    packet.freeze()
}

fn encode_ack_packet(channel: ChannelId, sequence: u64) -> [u8; 10] {
    let mut packet = [0u8; 10];
    packet[0] = KIND_ACK;
    packet[1] = channel;
    packet[2..10].copy_from_slice(&sequence.to_be_bytes());
    packet
}

async fn writer_task(
    socket: Arc<UdpSocket>,
    core: Arc<ConnectionCore>,
    pending: PendingTable,
    mut outgoing: mpsc::Receiver<OutboundFrame>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut sequences: HashMap<ChannelId, u64> = HashMap::new();
    let mut keep_alive = tokio::time::interval(DEFAULT_KEEP_ALIVE_INTERVAL);
    keep_alive.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = keep_alive.tick() => {
                let _ = socket.send(&[KIND_KEEPALIVE]).await;
            }
            frame = outgoing.recv() => {
                let Some(OutboundFrame { envelope, mut done }) = frame else { break };

                let next = sequences.entry(envelope.channel).or_insert(0);
                let sequence = *next;
                *next += 1;

                let packet = encode_data_packet(sequence, &envelope);
                match socket.send(&packet).await {
                    Ok(sent) => {
                        core.stats().record_send(sent);
                        keep_alive.reset();
                        if envelope.delivery.is_reliable() {
                            pending.lock().await.insert(
                                (envelope.channel, sequence),
                                PendingFrame {
                                    packet,
                                    attempts: 1,
                                    first_sent: Instant::now(),
                                    done: done.take(),
                                },
                            );
                        } else if let Some(done) = done.take() {
                            let _ = done.send(Ok(()));
                        }
                    }
                    Err(err) => {
                        warn!(channel = envelope.channel, "datagram send failed: {err}");
                        if let Some(done) = done.take() {
                            let _ = done.send(Err(TransportError::Io(err)));
                        }
                    }
                }
            }
        }
    }
}

async fn reader_task(
    socket: Arc<UdpSocket>,
    core: Arc<ConnectionCore>,
    pending: PendingTable,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    let mut channels: HashMap<ChannelId, ChannelReceiveState> = HashMap::new();

    loop {
        let received = tokio::select! {
            _ = shutdown.changed() => break,
            received = socket.recv(&mut buf) => received,
        };

        let len = match received {
            Ok(len) => len,
            Err(err) => {
                core.fail(TransportError::Io(err), DisconnectReason::TransportError);
                break;
            }
        };

        let mut packet = Bytes::copy_from_slice(&buf[..len]);
        if packet.is_empty() {
            continue;
        }
        match packet.get_u8() {
            KIND_ACK => {
                if packet.len() < 9 {
                    continue;
                }
                let channel = packet.get_u8();
                let sequence = packet.get_u64();
                if let Some(mut acked) = pending.lock().await.remove(&(channel, sequence)) {
                    core.stats()
                        .record_rtt(acked.first_sent.elapsed().as_micros() as u64);
                    if let Some(done) = acked.done.take() {
                        let _ = done.send(Ok(()));
                    }
                }
            }
            KIND_DATA => {
                if packet.len() < 10 {
                    warn!("malformed data packet dropped");
                    continue;
                }
                let channel = packet.get_u8();
                let Ok(delivery) = protocol::delivery_from_wire(packet.get_u8()) else {
                    warn!(channel, "data packet with unknown delivery dropped");
                    continue;
                };
                let sequence = packet.get_u64();

                core.stats().record_receive(len);
                // Ack before the discipline check so duplicate reliable
                // frames still silence the remote resend timer.
                if delivery.is_reliable() {
                    let _ = socket.send(&encode_ack_packet(channel, sequence)).await;
                }

                let state = channels.entry(channel).or_default();
                for payload in state.admit(delivery, sequence, packet.clone()) {
                    core.emit(ClientEvent::Message { channel, payload });
                }
            }
            KIND_KEEPALIVE => {}
            other => {
                warn!(kind = other, "unknown datagram kind dropped");
            }
        }
    }
}

async fn resend_task(
    socket: Arc<UdpSocket>,
    core: Arc<ConnectionCore>,
    pending: PendingTable,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(DEFAULT_RESEND_INTERVAL);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = interval.tick() => {}
        }

        let mut expired = None;
        // Collect under the lock, transmit after releasing it so the writer
        // and the ack path never wait out a resend burst.
        let packets = {
            let mut table = pending.lock().await;
            let mut packets = Vec::new();
            for ((channel, sequence), frame) in table.iter_mut() {
                if frame.attempts >= DEFAULT_MAX_RESEND_ATTEMPTS {
                    expired = Some((*channel, *sequence));
                    break;
                }
                frame.attempts += 1;
                packets.push(frame.packet.clone());
            }
            if let Some(key) = expired {
                if let Some(mut frame) = table.remove(&key) {
                    if let Some(done) = frame.done.take() {
                        let _ = done.send(Err(TransportError::DeliveryFailed {
                            channel: key.0,
                            attempts: frame.attempts,
                        }));
                    }
                }
            }
            packets
        };

        for packet in packets {
            // Retransmits are not re-counted; the frame was recorded on its
            // first transmission.
            let _ = socket.send(&packet).await;
        }

        if let Some((channel, _)) = expired {
            core.fail(
                TransportError::DeliveryFailed {
                    channel,
                    attempts: DEFAULT_MAX_RESEND_ATTEMPTS,
                },
                DisconnectReason::Timeout,
            );
            break;
        }
    }
}

/// Legacy reliable/unreliable UDP transport.
pub struct DatagramConnection {
    core: Arc<ConnectionCore>,
}

impl DatagramConnection {
    pub fn new() -> Self {
        Self {
            core: Arc::new(ConnectionCore::new("datagram")),
        }
    }
}

impl Default for DatagramConnection {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Connection for DatagramConnection {
    async fn connect(
        &self,
        target: ConnectTarget,
        credentials: Credentials,
        events: mpsc::UnboundedSender<ClientEvent>,
    ) -> Result<(), TransportError> {
        self.core.begin_connect(events)?;

        let socket = match UdpSocket::bind("0.0.0.0:0").await {
            Ok(socket) => socket,
            Err(err) => {
                self.core.teardown(DisconnectReason::TransportError);
                return Err(TransportError::Io(err));
            }
        };
        if let Err(err) = socket.connect(target.addr).await {
            self.core.teardown(DisconnectReason::TransportError);
            return Err(TransportError::Io(err));
        }

        let hello = bincode::serialize(&credentials)
            .map_err(|err| TransportError::Encode(err.to_string()))?;
        let mut hello_packet = BytesMut::with_capacity(1 + hello.len());
        hello_packet.put_u8(KIND_HELLO);
        hello_packet.extend_from_slice(&hello);
        let sent = socket.send(&hello_packet).await?;
        self.core.stats().record_send(sent);

        let socket = Arc::new(socket);
        let (outgoing_tx, outgoing_rx) = mpsc::channel(DEFAULT_OUTGOING_QUEUE_SIZE);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let pending: PendingTable = Arc::new(tokio::sync::Mutex::new(HashMap::new()));

        tokio::spawn(writer_task(
            Arc::clone(&socket),
            Arc::clone(&self.core),
            Arc::clone(&pending),
            outgoing_rx,
            shutdown_rx.clone(),
        ));
        tokio::spawn(reader_task(
            Arc::clone(&socket),
            Arc::clone(&self.core),
            Arc::clone(&pending),
            shutdown_rx.clone(),
        ));
        tokio::spawn(resend_task(
            socket,
            Arc::clone(&self.core),
            pending,
            shutdown_rx,
        ));

        self.core.go_live(outgoing_tx, shutdown_tx);
        Ok(())
    }

    fn send(&self, envelope: MessageEnvelope) -> Result<SendTicket, TransportError> {
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
            supports_unreliable: true,
            supports_sequenced: true,
            legacy_requests: true,
            wire_format: WireFormat::BinaryFrame,
        }
    }

    fn state(&self) -> ConnectionState {
        self.core.current_state()
    }

    fn stats(&self) -> Arc<ConnectionStats> {
        Arc::clone(self.core.stats())
    }
}
