//! Backend-agnostic connection contract.
//!
//! Backend selection is a construction-time decision: callers hold an
//! `Arc<dyn Connection>` and never branch on the concrete backend. The two
//! implementations are the legacy datagram transport and the newer stream
//! transport; from the dispatcher's point of view they are identical.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, trace};

use crate::channels::{default_channels, ChannelRegistry};
use crate::events::{
    ClientEvent, ConnectionState, DisconnectReason, TransportCapabilities, TransportError,
};
use crate::protocol::MessageEnvelope;
use crate::session::SessionId;
use crate::stats::ConnectionStats;

pub mod datagram;
pub mod stream;

pub use datagram::DatagramConnection;
pub use stream::StreamConnection;

/// Where to connect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectTarget {
    pub addr: SocketAddr,
}

impl From<SocketAddr> for ConnectTarget {
    fn from(addr: SocketAddr) -> Self {
        Self { addr }
    }
}

/// Identity presented during the transport hello.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credentials {
    pub session: SessionId,
    pub player_name: String,
    pub token: Option<String>,
}

/// Completion handle returned by [`Connection::send`].
///
/// Resolves once the payload physically left the socket (or, for reliable
/// delivery on the datagram backend, once it was acknowledged). Most callers
/// drop the ticket; tests and the few callers that need confirmation await
/// it.
#[derive(Debug)]
pub struct SendTicket {
    inner: TicketInner,
}

#[derive(Debug)]
enum TicketInner {
    Ready(Option<Result<(), TransportError>>),
    Pending(oneshot::Receiver<Result<(), TransportError>>),
}

impl SendTicket {
    pub(crate) fn pending() -> (Self, oneshot::Sender<Result<(), TransportError>>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                inner: TicketInner::Pending(rx),
            },
            tx,
        )
    }

    pub(crate) fn resolved(result: Result<(), TransportError>) -> Self {
        Self {
            inner: TicketInner::Ready(Some(result)),
        }
    }

    /// Waits for the send to complete. A dropped backend resolves as
    /// [`TransportError::Closed`].
    pub async fn done(self) -> Result<(), TransportError> {
        match self.inner {
            TicketInner::Ready(result) => result.unwrap_or(Err(TransportError::Closed)),
            TicketInner::Pending(rx) => rx.await.unwrap_or(Err(TransportError::Closed)),
        }
    }
}

/// A frame queued toward a backend's writer task.
#[derive(Debug)]
pub(crate) struct OutboundFrame {
    pub envelope: MessageEnvelope,
    pub done: Option<oneshot::Sender<Result<(), TransportError>>>,
}

/// Connection bookkeeping shared by both backends: state machine ownership,
/// event emission, queue admission and cooperative teardown.
pub(crate) struct ConnectionCore {
    backend: &'static str,
    channels: ChannelRegistry,
    state: StdMutex<ConnectionState>,
    stats: Arc<ConnectionStats>,
    events: StdMutex<Option<mpsc::UnboundedSender<ClientEvent>>>,
    outgoing: StdMutex<Option<mpsc::Sender<OutboundFrame>>>,
    shutdown: StdMutex<Option<watch::Sender<bool>>>,
}

impl ConnectionCore {
    pub(crate) fn new(backend: &'static str) -> Self {
        Self {
            backend,
            channels: default_channels(),
            state: StdMutex::new(ConnectionState::Disconnected),
            stats: Arc::new(ConnectionStats::new()),
            events: StdMutex::new(None),
            outgoing: StdMutex::new(None),
            shutdown: StdMutex::new(None),
        }
    }

    pub(crate) fn stats(&self) -> &Arc<ConnectionStats> {
        &self.stats
    }

    pub(crate) fn emit(&self, event: ClientEvent) {
        let guard = self.events.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(sender) = guard.as_ref() {
            let _ = sender.send(event);
        }
    }

    /// State transitions are the only writes; observers get notified.
    pub(crate) fn set_state(&self, state: ConnectionState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
        self.emit(ClientEvent::StateChanged(state));
    }

    pub(crate) fn current_state(&self) -> ConnectionState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Begins a connection attempt: installs the event channel and moves to
    /// Connecting. Fails if a previous attempt is still live.
    pub(crate) fn begin_connect(
        &self,
        events: mpsc::UnboundedSender<ClientEvent>,
    ) -> Result<(), TransportError> {
        if self.current_state() != ConnectionState::Disconnected {
            return Err(TransportError::AlreadyConnected);
        }
        *self.events.lock().unwrap_or_else(PoisonError::into_inner) = Some(events);
        self.set_state(ConnectionState::Connecting);
        Ok(())
    }

    /// Publishes the worker plumbing and moves to Connected.
    pub(crate) fn go_live(
        &self,
        outgoing: mpsc::Sender<OutboundFrame>,
        shutdown: watch::Sender<bool>,
    ) {
        *self.outgoing.lock().unwrap_or_else(PoisonError::into_inner) = Some(outgoing);
        *self.shutdown.lock().unwrap_or_else(PoisonError::into_inner) = Some(shutdown);
        self.set_state(ConnectionState::Connected);
    }

    /// Buffer-admission send. Unreliable traffic is allowed to vanish when
    /// the queue is congested; reliable traffic reports the backpressure.
    pub(crate) fn queue(&self, envelope: MessageEnvelope) -> Result<SendTicket, TransportError> {
        if self.current_state() != ConnectionState::Connected {
            return Err(TransportError::NotConnected);
        }
        if self.channels.descriptor(envelope.channel).is_none() {
            return Err(TransportError::InvalidConfig("unknown channel"));
        }
        let guard = self.outgoing.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(outgoing) = guard.as_ref() else {
            return Err(TransportError::NotConnected);
        };

        let reliable = envelope.delivery.is_reliable();
        let (ticket, done) = SendTicket::pending();
        match outgoing.try_send(OutboundFrame {
            envelope,
            done: Some(done),
        }) {
            Ok(()) => Ok(ticket),
            Err(mpsc::error::TrySendError::Full(_)) if !reliable => {
                trace!(backend = self.backend, "outgoing queue full, unreliable frame dropped");
                Ok(SendTicket::resolved(Ok(())))
            }
            Err(mpsc::error::TrySendError::Full(_)) => Err(TransportError::BufferFull),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(TransportError::NotConnected),
        }
    }

    /// Terminal failure initiated from a worker task.
    pub(crate) fn fail(&self, error: TransportError, reason: DisconnectReason) {
        self.emit(ClientEvent::Error(error));
        self.teardown(reason);
    }

    /// Cooperative teardown: stop workers, flush statistics into the final
    /// log line, Disconnecting is assumed to have been set by the caller for
    /// graceful paths.
    pub(crate) fn teardown(&self, reason: DisconnectReason) {
        if let Some(shutdown) = self
            .shutdown
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            let _ = shutdown.send(true);
        }
        self.outgoing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        let snapshot = self.stats.snapshot();
        debug!(
            backend = self.backend,
            bytes_sent = snapshot.bytes_sent,
            bytes_received = snapshot.bytes_received,
            messages_sent = snapshot.messages_sent,
            messages_received = snapshot.messages_received,
            ?reason,
            "connection closed"
        );

        self.set_state(ConnectionState::Disconnected);
        self.emit(ClientEvent::Disconnected { reason });
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

/// The contract every transport backend honors.
///
/// `send` never blocks the caller beyond buffer admission. Unreliable sends
/// MAY be dropped silently under congestion; reliable sends MUST eventually
/// deliver or surface [`ClientEvent::Error`]; retry/ack mechanics are the
/// backend's responsibility.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Establishes the connection and hands the backend the event channel it
    /// reports through. Cancellable; a second call while connected is an
    /// error.
    async fn connect(
        &self,
        target: ConnectTarget,
        credentials: Credentials,
        events: mpsc::UnboundedSender<ClientEvent>,
    ) -> Result<(), TransportError>;

    /// Queues an envelope for transmission.
    fn send(&self, envelope: MessageEnvelope) -> Result<SendTicket, TransportError>;

    /// Cooperative teardown: flushes statistics into the final log line,
    /// transitions Disconnecting → Disconnected. In-flight unreliable sends
    /// may be lost.
    async fn disconnect(&self, reason: DisconnectReason) -> Result<(), TransportError>;

    fn capabilities(&self) -> TransportCapabilities;

    fn state(&self) -> ConnectionState;

    fn stats(&self) -> Arc<ConnectionStats>;
}
