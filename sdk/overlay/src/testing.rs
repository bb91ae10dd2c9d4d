//! Shared test doubles: a scripted edge router, a canned controller, and a
//! channel provider that always hands back the same channel.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream};
use tokio::net::TcpListener;

use overlay_wire::{
    ContentType, HeaderId, Message, MessageBuilder, MessageDecoder, DEFAULT_MAX_MESSAGE_SIZE,
};

use crate::channel::{Channel, ChannelError};
use crate::config::ChannelConfig;
use crate::controller::{ControllerClient, ControllerError, NetworkSession, SessionKind};
use crate::pool::ChannelProvider;

/// The router end of a channel, driven imperatively from test bodies.
pub(crate) struct TestRouter<S> {
    stream: S,
    decoder: MessageDecoder,
    buf: BytesMut,
    next_seq: u32,
}

impl TestRouter<DuplexStream> {
    /// Open an in-memory channel and answer its hello.
    pub(crate) async fn connect(config: &ChannelConfig) -> (Arc<Channel>, TestRouter<DuplexStream>) {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let mut router = TestRouter::over(server_io);
        let (channel, ()) = tokio::join!(
            async {
                Channel::connect(client_io, "test-router", config)
                    .await
                    .unwrap()
            },
            async {
                let hello = router.recv().await;
                assert_eq!(hello.content, ContentType::Hello);
                router
                    .reply(&hello, ContentType::StateConnected, Bytes::new())
                    .await;
            }
        );
        (channel, router)
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> TestRouter<S> {
    /// Script the router side of an already-connected stream.
    pub(crate) fn over(stream: S) -> Self {
        TestRouter {
            stream,
            decoder: MessageDecoder::new(),
            buf: BytesMut::with_capacity(8 * 1024),
            // Far from the endpoint's own counter so collisions are obvious.
            next_seq: 1000,
        }
    }

    /// Read the next message the endpoint wrote, panicking if none arrives.
    pub(crate) async fn recv(&mut self) -> Message {
        let next = async {
            loop {
                if let Some(msg) = self.decoder.decode(&mut self.buf).unwrap() {
                    return msg;
                }
                let n = self.stream.read_buf(&mut self.buf).await.unwrap();
                assert!(n > 0, "endpoint hung up while a message was expected");
            }
        };
        tokio::time::timeout(Duration::from_secs(5), next)
            .await
            .expect("no message arrived within 5s")
    }

    /// Answer `to` with a correlated reply.
    pub(crate) async fn reply(&mut self, to: &Message, content: ContentType, body: Bytes) {
        let msg = MessageBuilder::new(content)
            .header_u32(HeaderId::ReplyForSequence, to.sequence)
            .body(body)
            .build();
        self.send(msg).await;
    }

    /// Push a dial at the listener registered under `conn_id`, returning the
    /// sequence the endpoint must answer.
    pub(crate) async fn send_dial(&mut self, conn_id: u32, public_key: Option<[u8; 32]>) -> u32 {
        let mut builder =
            MessageBuilder::new(ContentType::Dial).header_u32(HeaderId::ConnectionId, conn_id);
        if let Some(pk) = public_key {
            builder = builder.header_bytes(HeaderId::PublicKey, Bytes::copy_from_slice(&pk));
        }
        self.send(builder.build()).await
    }

    /// Push an uncorrelated message addressed to `conn_id`.
    pub(crate) async fn send_to_conn(
        &mut self,
        conn_id: u32,
        content: ContentType,
        body: Bytes,
    ) -> u32 {
        let msg = MessageBuilder::new(content)
            .header_u32(HeaderId::ConnectionId, conn_id)
            .body(body)
            .build();
        self.send(msg).await
    }

    async fn send(&mut self, msg: Message) -> u32 {
        let seq = self.next_seq;
        self.next_seq += 1;
        let bytes = msg
            .with_sequence(seq)
            .encode(DEFAULT_MAX_MESSAGE_SIZE)
            .unwrap();
        self.stream.write_all(&bytes).await.unwrap();
        seq
    }

    /// Assert the endpoint writes nothing for `dur`.
    pub(crate) async fn expect_silence(&mut self, dur: Duration) {
        let quiet = tokio::time::timeout(dur, self.recv()).await;
        assert!(quiet.is_err(), "unexpected message: {:?}", quiet);
    }

    /// Drain the stream until the endpoint hangs up.
    pub(crate) async fn read_until_eof(&mut self) {
        let mut sink = [0u8; 4096];
        loop {
            match self.stream.read(&mut sink).await {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
        }
    }
}

/// Accept one TCP channel, answer its hello, and hold the stream open
/// until the endpoint hangs up.
pub(crate) async fn serve_router_once(listener: TcpListener) {
    let (stream, _) = listener.accept().await.unwrap();
    let mut router = TestRouter::over(stream);
    let hello = router.recv().await;
    assert_eq!(hello.content, ContentType::Hello);
    router
        .reply(&hello, ContentType::StateConnected, Bytes::new())
        .await;
    router.read_until_eof().await;
}

/// Controller double that mints sessions from memory.
pub(crate) struct FakeController {
    token: String,
    deny: bool,
    calls: Mutex<Vec<(String, SessionKind)>>,
}

impl FakeController {
    pub(crate) fn new() -> Self {
        FakeController {
            token: uuid::Uuid::new_v4().to_string(),
            deny: false,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// A controller that refuses every session request.
    pub(crate) fn denying() -> Self {
        FakeController {
            deny: true,
            ..FakeController::new()
        }
    }

    /// The token stamped into every session this controller issues.
    pub(crate) fn token(&self) -> &str {
        &self.token
    }

    pub(crate) fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl ControllerClient for FakeController {
    async fn create_session(
        &self,
        service: &str,
        kind: SessionKind,
    ) -> Result<NetworkSession, ControllerError> {
        self.calls.lock().unwrap().push((service.to_string(), kind));
        if self.deny {
            return Err(ControllerError::Unauthorized(format!(
                "no grant for {}",
                service
            )));
        }
        Ok(NetworkSession {
            id: uuid::Uuid::new_v4().to_string(),
            service: service.to_string(),
            token: self.token.clone(),
            edge_routers: Vec::new(),
        })
    }
}

/// Channel provider that hands out one prebuilt channel.
pub(crate) struct StaticProvider {
    channel: Arc<Channel>,
    acquires: AtomicUsize,
}

impl StaticProvider {
    pub(crate) fn new(channel: Arc<Channel>) -> Self {
        StaticProvider {
            channel,
            acquires: AtomicUsize::new(0),
        }
    }

    pub(crate) fn acquire_count(&self) -> usize {
        self.acquires.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl ChannelProvider for StaticProvider {
    async fn acquire(&self, _session: &NetworkSession) -> Result<Arc<Channel>, ChannelError> {
        self.acquires.fetch_add(1, Ordering::Relaxed);
        Ok(self.channel.clone())
    }
}

/// Route test logs through the subscriber once per process.
pub(crate) fn init_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}
