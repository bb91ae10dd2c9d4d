//! Listening endpoints bound to overlay services.
//!
//! A [`Listener`] moves through four states: it starts initial, enters
//! binding while the bind handshake is in flight, becomes bound on success
//! and ends closed. Closed is terminal; a listener is not reusable after
//! failure or closure. While bound, inbound dials queue up to the backlog
//! given to [`Listener::bind`] and are consumed one per [`Listener::accept`].

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, error, info, warn};

use overlay_wire::{body_text, ContentType, HeaderId, Message, MessageBuilder};

use crate::addr::OverlayAddr;
use crate::channel::Channel;
use crate::connection::{lock_ignoring_poison, Connection, ConnectionCore};
use crate::controller::{ControllerClient, SessionKind};
use crate::error::OverlayError;
use crate::keys::{derive_session_keys, EndpointKeypair, KxRole};
use crate::pool::ChannelProvider;
use crate::registry::Receiver;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Initial = 0,
    Binding = 1,
    Bound = 2,
    Closed = 3,
}

impl State {
    fn from_u8(value: u8) -> State {
        match value {
            0 => State::Initial,
            1 => State::Binding,
            2 => State::Bound,
            _ => State::Closed,
        }
    }
}

/// State owned jointly by the listener handle and channel dispatch
#[derive(Default)]
struct Shared {
    channel: Option<Arc<Channel>>,
    conn_id: Option<u32>,
    token: Option<String>,
    local: Option<OverlayAddr>,
    dial_tx: Option<mpsc::Sender<Message>>,
}

/// Core of a listening endpoint, addressable from channel dispatch
pub(crate) struct ListenerCore {
    keypair: EndpointKeypair,
    state: AtomicU8,
    shared: Mutex<Shared>,
    dial_rx: tokio::sync::Mutex<Option<mpsc::Receiver<Message>>>,
}

impl ListenerCore {
    fn new() -> Self {
        ListenerCore {
            keypair: EndpointKeypair::generate(),
            state: AtomicU8::new(State::Initial as u8),
            shared: Mutex::new(Shared::default()),
            dial_rx: tokio::sync::Mutex::new(None),
        }
    }

    fn state(&self) -> State {
        State::from_u8(self.state.load(Ordering::Acquire))
    }

    fn log_id(&self) -> u32 {
        lock_ignoring_poison(&self.shared).conn_id.unwrap_or(0)
    }

    fn begin_bind(&self) -> Result<(), OverlayError> {
        match self.state.compare_exchange(
            State::Initial as u8,
            State::Binding as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => Ok(()),
            Err(current) => Err(match State::from_u8(current) {
                State::Closed => OverlayError::Closed,
                _ => OverlayError::AlreadyBound,
            }),
        }
    }

    fn note_registration(&self, channel: &Arc<Channel>, conn_id: u32, token: &str) {
        let mut shared = lock_ignoring_poison(&self.shared);
        shared.channel = Some(channel.clone());
        shared.conn_id = Some(conn_id);
        shared.token = Some(token.to_string());
    }

    async fn complete_bind(&self, addr: OverlayAddr, backlog: usize) -> Result<(), OverlayError> {
        // A zero backlog still buffers one dial; the queue is the only
        // rendezvous between dispatch and accept.
        let (dial_tx, dial_rx) = mpsc::channel(backlog.max(1));
        *self.dial_rx.lock().await = Some(dial_rx);
        {
            let mut shared = lock_ignoring_poison(&self.shared);
            shared.local = Some(addr);
            shared.dial_tx = Some(dial_tx);
        }

        match self.state.compare_exchange(
            State::Binding as u8,
            State::Bound as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => Ok(()),
            Err(_) => {
                // Closed while the bind reply was in flight.
                *self.dial_rx.lock().await = None;
                let mut shared = lock_ignoring_poison(&self.shared);
                shared.dial_tx = None;
                shared.local = None;
                Err(OverlayError::Closed)
            }
        }
    }

    async fn fail_bind(&self) {
        self.state.store(State::Closed as u8, Ordering::Release);
        let (channel, conn_id) = {
            let mut shared = lock_ignoring_poison(&self.shared);
            shared.dial_tx = None;
            (shared.channel.clone(), shared.conn_id)
        };
        if let (Some(channel), Some(conn_id)) = (channel, conn_id) {
            channel.deregister(conn_id);
        }
    }

    /// Inbound dispatch for messages addressed to this listener's id
    pub(crate) async fn receive(&self, msg: Message) {
        match msg.content {
            ContentType::Dial => self.handle_dial(msg).await,
            ContentType::StateClosed => {
                let reason = body_text(&msg).unwrap_or("").to_string();
                warn!(
                    "Listener conn {} closed by peer: {}",
                    self.log_id(),
                    reason
                );
                self.close_from_dispatch().await;
            }
            other => {
                error!(
                    "Protocol violation on listener conn {}: unexpected {:?}",
                    self.log_id(),
                    other
                );
                self.close_from_dispatch().await;
            }
        }
    }

    async fn handle_dial(&self, dial: Message) {
        let (dial_tx, channel, conn_id) = {
            let shared = lock_ignoring_poison(&self.shared);
            (
                shared.dial_tx.clone(),
                shared.channel.clone(),
                shared.conn_id,
            )
        };

        let (Some(channel), Some(conn_id)) = (channel, conn_id) else {
            debug!("Dial before listener registration, dropping");
            return;
        };

        let Some(dial_tx) = dial_tx else {
            // No queue yet (bind still completing) or no queue anymore.
            self.reject_dial(&channel, conn_id, dial.sequence).await;
            return;
        };

        match dial_tx.try_send(dial) {
            Ok(()) => {}
            Err(TrySendError::Full(dial)) => {
                warn!(
                    "Dial queue full on listener conn {}, rejecting dial seq {}",
                    conn_id, dial.sequence
                );
                self.reject_dial(&channel, conn_id, dial.sequence).await;
            }
            Err(TrySendError::Closed(dial)) => {
                debug!(
                    "Dial seq {} arrived while listener conn {} is closing",
                    dial.sequence, conn_id
                );
                self.reject_dial(&channel, conn_id, dial.sequence).await;
            }
        }
    }

    async fn reject_dial(&self, channel: &Channel, conn_id: u32, dial_seq: u32) {
        let reject = MessageBuilder::new(ContentType::DialFailed)
            .header_u32(HeaderId::ConnectionId, conn_id)
            .header_u32(HeaderId::SequenceNumber, 0)
            .header_u32(HeaderId::ReplyForSequence, dial_seq)
            .build();
        if let Err(err) = channel.send(reject).await {
            warn!(
                "Dial rejection on listener conn {} failed: {}",
                conn_id, err
            );
        }
    }

    async fn close_from_dispatch(&self) {
        self.state.store(State::Closed as u8, Ordering::Release);
        let (channel, conn_id) = {
            let mut shared = lock_ignoring_poison(&self.shared);
            shared.dial_tx = None;
            (shared.channel.clone(), shared.conn_id)
        };
        if let (Some(channel), Some(conn_id)) = (channel, conn_id) {
            channel.deregister(conn_id);
        }
    }
}

/// A listening endpoint on the overlay network.
///
/// Cloning yields another handle to the same endpoint.
#[derive(Clone)]
pub struct Listener {
    core: Arc<ListenerCore>,
    controller: Arc<dyn ControllerClient>,
    channels: Arc<dyn ChannelProvider>,
}

impl Listener {
    /// Create an unbound listener using the given collaborators
    pub fn new(controller: Arc<dyn ControllerClient>, channels: Arc<dyn ChannelProvider>) -> Self {
        Listener {
            core: Arc::new(ListenerCore::new()),
            controller,
            channels,
        }
    }

    /// Bind this endpoint to a service address.
    ///
    /// Obtains a hosting session from the controller, acquires a channel to
    /// one of the session's edge routers and runs the bind handshake. Dials
    /// arriving after success queue up to `backlog` before the router is
    /// told to fail them.
    pub async fn bind(&self, addr: &OverlayAddr, backlog: usize) -> Result<(), OverlayError> {
        let OverlayAddr::Service { name } = addr else {
            return Err(OverlayError::AddressKind(addr.to_string()));
        };
        self.core.begin_bind()?;

        match self.bind_inner(name, addr, backlog).await {
            Ok(()) => Ok(()),
            Err(err) => {
                error!("Bind to {} failed: {}", addr, err);
                self.core.fail_bind().await;
                Err(err)
            }
        }
    }

    async fn bind_inner(
        &self,
        service: &str,
        addr: &OverlayAddr,
        backlog: usize,
    ) -> Result<(), OverlayError> {
        let session = self
            .controller
            .create_session(service, SessionKind::Bind)
            .await
            .map_err(OverlayError::bind_failed)?;
        debug!("Bind session {} issued for service {}", session.id, service);

        let channel = self
            .channels
            .acquire(&session)
            .await
            .map_err(OverlayError::bind_failed)?;

        let conn_id = channel.reserve_conn_id();
        channel.register(conn_id, Receiver::Listener(Arc::downgrade(&self.core)));
        self.core.note_registration(&channel, conn_id, &session.token);

        let bind = MessageBuilder::new(ContentType::Bind)
            .header_u32(HeaderId::ConnectionId, conn_id)
            .header_u32(HeaderId::SequenceNumber, 0)
            .header_bytes(
                HeaderId::PublicKey,
                Bytes::copy_from_slice(&self.core.keypair.public_bytes()),
            )
            .text_body(&session.token)
            .build();

        let reply = channel
            .send_and_wait(bind)
            .await
            .map_err(OverlayError::bind_failed)?;

        match reply.content {
            ContentType::StateConnected => {
                self.core.complete_bind(addr.clone(), backlog).await?;
                info!(
                    "Listener bound to {} as conn {} via {}",
                    addr,
                    conn_id,
                    channel.peer()
                );
                Ok(())
            }
            ContentType::StateClosed => Err(OverlayError::BindRejected(
                body_text(&reply).unwrap_or("bind rejected").to_string(),
            )),
            other => Err(OverlayError::bind_failed(OverlayError::ProtocolViolation(
                format!("invalid response type {:?}", other),
            ))),
        }
    }

    /// Accept the next inbound dial, suspending until one arrives.
    ///
    /// Runs the accept handshake for the dequeued dial: a child connection
    /// id is registered and offered to the dialer, and the returned
    /// [`Connection`] is live once the dialer confirms.
    pub async fn accept(&self) -> Result<Connection, OverlayError> {
        match self.core.state() {
            State::Closed => return Err(OverlayError::Closed),
            State::Bound => {}
            _ => return Err(OverlayError::NotYetBound),
        }

        let dial = {
            let mut guard = self.core.dial_rx.lock().await;
            match guard.as_mut() {
                Some(dial_rx) => dial_rx.recv().await,
                None => None,
            }
        };
        let Some(dial) = dial else {
            // The queue producer is dropped on every path to closed.
            return Err(OverlayError::Closed);
        };

        self.accept_one(dial).await
    }

    async fn accept_one(&self, dial: Message) -> Result<Connection, OverlayError> {
        let (channel, parent_id, local) = {
            let shared = lock_ignoring_poison(&self.core.shared);
            match (&shared.channel, shared.conn_id, &shared.local) {
                (Some(channel), Some(conn_id), Some(local)) => {
                    (channel.clone(), conn_id, local.clone())
                }
                _ => return Err(OverlayError::Closed),
            }
        };
        let service = local.service_name().to_string();

        // Key agreement first. A dialer that sent no public key gets a
        // plaintext logical connection.
        let keys = match dial.headers.get_bytes(HeaderId::PublicKey) {
            Some(peer_public) => Some(
                derive_session_keys(&self.core.keypair, peer_public, KxRole::Responder).map_err(
                    |err| {
                        OverlayError::ProtocolViolation(format!(
                            "dial carried an unusable public key: {}",
                            err
                        ))
                    },
                )?,
            ),
            None => None,
        };

        let child_id = channel.reserve_conn_id();
        let core = Arc::new(ConnectionCore::new(child_id, channel.clone(), keys));
        channel.register(child_id, Receiver::Conn(Arc::downgrade(&core)));

        let success = MessageBuilder::new(ContentType::DialSuccess)
            .header_u32(HeaderId::ConnectionId, parent_id)
            .header_u32(HeaderId::SequenceNumber, 0)
            .header_u32(HeaderId::ReplyForSequence, dial.sequence)
            .conn_id_body(child_id)
            .build();

        let reply = match channel.send_and_wait(success).await {
            Ok(reply) => reply,
            Err(err) => {
                channel.deregister(child_id);
                return Err(OverlayError::Channel(err));
            }
        };

        match reply.content {
            ContentType::StateConnected => {
                let remote = OverlayAddr::Session {
                    listener_id: parent_id,
                    conn_id: child_id,
                    service,
                };
                core.promote(local, remote);
                info!("Accepted conn {} on listener conn {}", child_id, parent_id);
                Ok(Connection::new(core))
            }
            _ => {
                let reason = body_text(&reply).unwrap_or("dial rejected").to_string();
                // The spawned connection never became usable; release its
                // registration along with it.
                channel.deregister(child_id);
                warn!(
                    "Dial on listener conn {} rejected by peer: {}",
                    parent_id, reason
                );
                Err(OverlayError::DialRejected(reason))
            }
        }
    }

    /// Address this listener is bound to, set by a successful bind
    pub fn local_addr(&self) -> Option<OverlayAddr> {
        lock_ignoring_poison(&self.core.shared).local.clone()
    }

    /// True once the endpoint reached its terminal state
    pub fn is_closed(&self) -> bool {
        self.core.state() == State::Closed
    }

    /// Close the endpoint.
    ///
    /// A bound listener tells the router to release the service binding and
    /// waits for the unbind to reach the wire. Closing always succeeds
    /// locally, unblocks pending accepts and is idempotent.
    pub async fn close(&self) {
        let prev = State::from_u8(
            self.core
                .state
                .swap(State::Closed as u8, Ordering::AcqRel),
        );

        // Dropping the queue producer unblocks any accept parked on it.
        let (channel, conn_id, token) = {
            let mut shared = lock_ignoring_poison(&self.core.shared);
            shared.dial_tx = None;
            (shared.channel.clone(), shared.conn_id, shared.token.take())
        };

        if prev != State::Bound {
            debug!("Listener closed from state {:?}", prev);
            return;
        }

        if let (Some(channel), Some(conn_id), Some(token)) = (channel, conn_id, token) {
            let unbind = MessageBuilder::new(ContentType::Unbind)
                .header_u32(HeaderId::ConnectionId, conn_id)
                .text_body(&token)
                .build();
            if let Err(err) = channel.send_synch(unbind).await {
                warn!("Unbind for listener conn {} failed: {}", conn_id, err);
            }
            channel.deregister(conn_id);
            info!("Listener conn {} closed", conn_id);
        }
    }
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("state", &self.core.state())
            .field("local", &self.local_addr())
            .finish_non_exhaustive()
    }
}
