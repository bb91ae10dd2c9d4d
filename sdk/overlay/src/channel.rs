//! The multiplexed channel to an edge router.
//!
//! One channel owns one transport stream. Every message leaving the channel
//! is stamped with a channel-unique sequence number; replies from the router
//! name the sequence they answer and are routed to the suspended caller,
//! while unsolicited messages are routed by logical connection id to the
//! listener or connection registered under that id.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, trace, warn};

use overlay_wire::{
    body_text, ContentType, HeaderId, Message, MessageBuilder, MessageDecoder, WireError,
};

use crate::config::ChannelConfig;
use crate::registry::{Receiver, Registry};
use crate::waiters::ReplyWaiters;

/// Channel-level failures
#[derive(Error, Debug)]
pub enum ChannelError {
    /// The channel is closed, or closed while an operation was in flight
    #[error("channel closed")]
    Closed,

    /// The underlying stream failed
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A message could not be encoded or decoded
    #[error("wire error: {0}")]
    Wire(#[from] WireError),

    /// The router rejected the channel hello
    #[error("hello rejected: {0}")]
    HelloRejected(String),

    /// The hello exchange did not finish within the configured deadline
    #[error("hello timed out")]
    HelloTimeout,

    /// The session names no reachable edge router
    #[error("no edge routers available")]
    NoRouters,

    /// Connecting to the router took longer than allowed
    #[error("connect timed out")]
    ConnectTimeout,

    /// TLS setup or handshake failed
    #[error("tls error: {0}")]
    Tls(String),
}

/// One write handed to the writer task
struct WriteOp {
    bytes: Bytes,
    done: Option<oneshot::Sender<std::io::Result<()>>>,
}

/// A multiplexed channel to one edge router.
///
/// Cheap to share through an [`Arc`]; the reader and writer tasks it spawns
/// live until the stream fails or reaches EOF. After closure every send
/// fails with [`ChannelError::Closed`] and registered receivers observe a
/// synthesized close notification.
pub struct Channel {
    peer: String,
    write_tx: mpsc::Sender<WriteOp>,
    waiters: ReplyWaiters,
    registry: Registry,
    next_sequence: AtomicU32,
    closed: AtomicBool,
    max_message_size: usize,
}

impl Channel {
    /// Start a channel over an established stream and run the hello exchange
    pub async fn connect<S>(
        stream: S,
        peer: impl Into<String>,
        config: &ChannelConfig,
    ) -> Result<Arc<Self>, ChannelError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let channel = Self::start(stream, peer, config);
        channel.hello(config.hello_timeout()).await?;
        Ok(channel)
    }

    /// Spawn the reader and writer tasks over a stream, without the hello.
    ///
    /// Callers outside tests want [`Channel::connect`]; an un-greeted
    /// channel is only half open as far as the router is concerned.
    pub fn start<S>(stream: S, peer: impl Into<String>, config: &ChannelConfig) -> Arc<Self>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let peer = peer.into();
        let (read_half, write_half) = tokio::io::split(stream);
        let (write_tx, write_rx) = mpsc::channel(config.send_queue_depth.max(1));

        let channel = Arc::new(Channel {
            peer: peer.clone(),
            write_tx,
            waiters: ReplyWaiters::new(),
            registry: Registry::new(),
            next_sequence: AtomicU32::new(1),
            closed: AtomicBool::new(false),
            max_message_size: config.max_message_size,
        });

        tokio::spawn(write_loop(write_rx, write_half, peer));
        tokio::spawn(read_loop(read_half, channel.clone()));

        channel
    }

    /// Router address this channel is connected to
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// True once the channel has shut down
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Number of listeners and connections currently registered
    pub fn registered_receivers(&self) -> usize {
        self.registry.len()
    }

    /// Queue a message for transmission without waiting for any outcome
    pub async fn send(&self, msg: Message) -> Result<(), ChannelError> {
        let sequence = self.next_sequence.fetch_add(1, Ordering::Relaxed);
        self.submit(msg.with_sequence(sequence), None).await
    }

    /// Send a request and suspend until its correlated reply arrives
    pub async fn send_and_wait(&self, msg: Message) -> Result<Message, ChannelError> {
        let sequence = self.next_sequence.fetch_add(1, Ordering::Relaxed);
        let reply_rx = self.waiters.register(sequence);

        // The closed flag is rechecked after the slot exists, so a shutdown
        // racing this call either fails the slot or is seen here.
        if self.is_closed() {
            self.waiters.discard(sequence);
            return Err(ChannelError::Closed);
        }

        if let Err(err) = self.submit(msg.with_sequence(sequence), None).await {
            self.waiters.discard(sequence);
            return Err(err);
        }

        reply_rx.await.map_err(|_| ChannelError::Closed)
    }

    /// Send a message and suspend until its bytes are written to the stream
    pub async fn send_synch(&self, msg: Message) -> Result<(), ChannelError> {
        let sequence = self.next_sequence.fetch_add(1, Ordering::Relaxed);
        let (done_tx, done_rx) = oneshot::channel();
        self.submit(msg.with_sequence(sequence), Some(done_tx))
            .await?;
        done_rx
            .await
            .map_err(|_| ChannelError::Closed)?
            .map_err(ChannelError::Io)
    }

    /// Shut the channel down, failing pending requests and notifying
    /// registered receivers
    pub async fn close(&self) {
        self.shutdown().await;
    }

    async fn submit(
        &self,
        msg: Message,
        done: Option<oneshot::Sender<std::io::Result<()>>>,
    ) -> Result<(), ChannelError> {
        if self.is_closed() {
            return Err(ChannelError::Closed);
        }
        let bytes = msg.encode(self.max_message_size)?;
        self.write_tx
            .send(WriteOp { bytes, done })
            .await
            .map_err(|_| ChannelError::Closed)
    }

    async fn hello(&self, deadline: Duration) -> Result<(), ChannelError> {
        let hello = MessageBuilder::new(ContentType::Hello)
            .text_body(concat!("overlay-sdk/", env!("CARGO_PKG_VERSION")))
            .build();

        let reply = tokio::time::timeout(deadline, self.send_and_wait(hello))
            .await
            .map_err(|_| ChannelError::HelloTimeout)??;

        match reply.content {
            ContentType::StateConnected => {
                info!("Channel to {} established", self.peer);
                Ok(())
            }
            ContentType::StateClosed => Err(ChannelError::HelloRejected(
                body_text(&reply).unwrap_or("unspecified").to_string(),
            )),
            other => Err(ChannelError::HelloRejected(format!(
                "unexpected reply type {:?}",
                other
            ))),
        }
    }

    /// Allocate a connection id unique on this channel
    pub(crate) fn reserve_conn_id(&self) -> u32 {
        self.registry.reserve()
    }

    /// Register a receiver under a reserved connection id
    pub(crate) fn register(&self, conn_id: u32, receiver: Receiver) {
        self.registry.insert(conn_id, receiver);
        debug!("Registered receiver {} on channel to {}", conn_id, self.peer);
    }

    /// Drop a registration. Safe to call more than once.
    pub(crate) fn deregister(&self, conn_id: u32) {
        if self.registry.remove(conn_id) {
            debug!(
                "Deregistered receiver {} on channel to {}",
                conn_id, self.peer
            );
        }
    }

    async fn dispatch(&self, msg: Message) {
        if let Some(reply_for) = msg.reply_for() {
            if self.waiters.resolve(reply_for, msg) {
                return;
            }
            warn!(
                "Reply for sequence {} on channel to {} has no waiter, dropping",
                reply_for, self.peer
            );
            return;
        }

        let Some(conn_id) = msg.headers.get_u32(HeaderId::ConnectionId) else {
            warn!(
                "{:?} without connection id on channel to {}, dropping",
                msg.content, self.peer
            );
            return;
        };
        self.route(conn_id, msg).await;
    }

    async fn route(&self, conn_id: u32, msg: Message) {
        let Some(receiver) = self.registry.get(conn_id) else {
            debug!(
                "No receiver for conn {} on channel to {}, dropping {:?}",
                conn_id, self.peer, msg.content
            );
            return;
        };
        match receiver {
            Receiver::Listener(weak) => match weak.upgrade() {
                Some(listener) => listener.receive(msg).await,
                None => {
                    self.registry.remove(conn_id);
                    trace!("Pruned dropped listener {} from channel registry", conn_id);
                }
            },
            Receiver::Conn(weak) => match weak.upgrade() {
                Some(conn) => conn.receive(msg).await,
                None => {
                    self.registry.remove(conn_id);
                    trace!("Pruned dropped conn {} from channel registry", conn_id);
                }
            },
        }
    }

    async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("Channel to {} shutting down", self.peer);

        self.waiters.fail_all();

        // Each registered receiver gets a synthesized close so endpoints
        // observe transport loss the same way they observe a remote close.
        for conn_id in self.registry.ids() {
            let msg = MessageBuilder::new(ContentType::StateClosed)
                .header_u32(HeaderId::ConnectionId, conn_id)
                .text_body("channel closed")
                .build();
            self.route(conn_id, msg).await;
        }
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("peer", &self.peer)
            .field("closed", &self.is_closed())
            .field("receivers", &self.registry.len())
            .finish_non_exhaustive()
    }
}

async fn write_loop<W>(mut write_rx: mpsc::Receiver<WriteOp>, mut writer: W, peer: String)
where
    W: AsyncWrite + Unpin,
{
    while let Some(op) = write_rx.recv().await {
        let mut result = writer.write_all(&op.bytes).await;
        if result.is_ok() {
            result = writer.flush().await;
        }
        match result {
            Ok(()) => {
                if let Some(done) = op.done {
                    let _ = done.send(Ok(()));
                }
            }
            Err(err) => {
                warn!("Write failed on channel to {}: {}", peer, err);
                if let Some(done) = op.done {
                    let _ = done.send(Err(err));
                }
                break;
            }
        }
    }
    debug!("Writer task for channel to {} stopped", peer);
}

async fn read_loop<R>(mut reader: R, channel: Arc<Channel>)
where
    R: AsyncRead + Unpin,
{
    let mut decoder = MessageDecoder::with_max_size(channel.max_message_size);
    let mut buf = BytesMut::with_capacity(8 * 1024);

    loop {
        loop {
            match decoder.decode(&mut buf) {
                Ok(Some(msg)) => {
                    trace!(
                        "Channel to {} received {:?} seq {}",
                        channel.peer,
                        msg.content,
                        msg.sequence
                    );
                    channel.dispatch(msg).await;
                }
                Ok(None) => break,
                Err(err) => {
                    error!("Decode failed on channel to {}: {}", channel.peer, err);
                    channel.shutdown().await;
                    return;
                }
            }
        }

        match reader.read_buf(&mut buf).await {
            Ok(0) => {
                debug!("Channel to {} reached EOF", channel.peer);
                break;
            }
            Ok(_) => {}
            Err(err) => {
                warn!("Read failed on channel to {}: {}", channel.peer, err);
                break;
            }
        }
    }

    channel.shutdown().await;
}
