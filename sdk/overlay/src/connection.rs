//! Accepted logical connections.
//!
//! A [`Connection`] is produced by a listener accepting a dial. It owns one
//! logical connection id on the channel it arrived on and, when the dialer
//! supplied a public key, the AEAD transform derived during the accept
//! handshake.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, trace, warn};

use overlay_wire::{ContentType, HeaderId, Message, MessageBuilder};

use crate::addr::OverlayAddr;
use crate::channel::Channel;
use crate::keys::{CipherPair, SessionKeys};

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnState {
    Accepting = 0,
    Connected = 1,
    Closed = 2,
}

impl ConnState {
    fn from_u8(value: u8) -> ConnState {
        match value {
            0 => ConnState::Accepting,
            1 => ConnState::Connected,
            _ => ConnState::Closed,
        }
    }
}

struct Addrs {
    local: OverlayAddr,
    remote: OverlayAddr,
}

/// Shared state of one accepted connection
pub(crate) struct ConnectionCore {
    id: u32,
    channel: Arc<Channel>,
    keys: Option<SessionKeys>,
    state: AtomicU8,
    crypto: Mutex<Option<CipherPair>>,
    addrs: Mutex<Option<Addrs>>,
    data_frames: AtomicU64,
}

impl ConnectionCore {
    pub(crate) fn new(id: u32, channel: Arc<Channel>, keys: Option<SessionKeys>) -> Self {
        ConnectionCore {
            id,
            channel,
            keys,
            state: AtomicU8::new(ConnState::Accepting as u8),
            crypto: Mutex::new(None),
            addrs: Mutex::new(None),
            data_frames: AtomicU64::new(0),
        }
    }

    /// Move the connection to its usable state once the dialer confirmed.
    ///
    /// Starts the cipher transform when session keys were derived, so it is
    /// live before any secured traffic can arrive.
    pub(crate) fn promote(&self, local: OverlayAddr, remote: OverlayAddr) {
        *lock_ignoring_poison(&self.crypto) = self.keys.as_ref().map(CipherPair::from_keys);
        *lock_ignoring_poison(&self.addrs) = Some(Addrs { local, remote });
        self.state
            .store(ConnState::Connected as u8, Ordering::Release);
    }

    /// Inbound dispatch for messages addressed to this connection id
    pub(crate) async fn receive(&self, msg: Message) {
        match msg.content {
            ContentType::Data => {
                self.data_frames.fetch_add(1, Ordering::Relaxed);
                trace!("Conn {} received {} data bytes", self.id, msg.body.len());
            }
            ContentType::StateClosed => {
                debug!("Conn {} closed by peer", self.id);
                self.state.store(ConnState::Closed as u8, Ordering::Release);
                self.channel.deregister(self.id);
            }
            other => {
                warn!("Unexpected {:?} on conn {}, ignoring", other, self.id);
            }
        }
    }

    fn state(&self) -> ConnState {
        ConnState::from_u8(self.state.load(Ordering::Acquire))
    }
}

/// Lock a mutex, recovering the guard if a panicking thread poisoned it
pub(crate) fn lock_ignoring_poison<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// One accepted logical connection on a bound listener.
///
/// Cloning yields another handle to the same connection.
#[derive(Clone)]
pub struct Connection {
    core: Arc<ConnectionCore>,
}

impl Connection {
    pub(crate) fn new(core: Arc<ConnectionCore>) -> Self {
        Connection { core }
    }

    /// Logical connection id on the underlying channel
    pub fn id(&self) -> u32 {
        self.core.id
    }

    /// Address of the listener side of this connection
    pub fn local_addr(&self) -> Option<OverlayAddr> {
        lock_ignoring_poison(&self.core.addrs)
            .as_ref()
            .map(|a| a.local.clone())
    }

    /// Composite address identifying this connection on the overlay
    pub fn remote_addr(&self) -> Option<OverlayAddr> {
        lock_ignoring_poison(&self.core.addrs)
            .as_ref()
            .map(|a| a.remote.clone())
    }

    /// True while the connection is usable
    pub fn is_connected(&self) -> bool {
        self.core.state() == ConnState::Connected
    }

    /// True when the accept handshake derived session keys and the AEAD
    /// transform is active
    pub fn is_secured(&self) -> bool {
        lock_ignoring_poison(&self.core.crypto).is_some()
    }

    /// Data messages observed on this connection so far
    pub fn data_frames(&self) -> u64 {
        self.core.data_frames.load(Ordering::Relaxed)
    }

    /// Close the connection, notifying the peer and releasing its id.
    ///
    /// Safe to call more than once; only the first call notifies the peer.
    pub async fn close(&self) {
        let prev = self
            .core
            .state
            .swap(ConnState::Closed as u8, Ordering::AcqRel);
        if ConnState::from_u8(prev) == ConnState::Closed {
            return;
        }

        let msg = MessageBuilder::new(ContentType::StateClosed)
            .header_u32(HeaderId::ConnectionId, self.core.id)
            .build();
        if let Err(err) = self.core.channel.send(msg).await {
            debug!("Close notification for conn {} failed: {}", self.core.id, err);
        }
        self.core.channel.deregister(self.core.id);
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.core.id)
            .field("state", &self.core.state())
            .field("secured", &self.is_secured())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChannelConfig;
    use crate::keys::{derive_session_keys, EndpointKeypair, KxRole};
    use crate::registry::Receiver;
    use crate::testing::TestRouter;
    use bytes::Bytes;
    use std::time::Duration;

    fn session_addrs() -> (OverlayAddr, OverlayAddr) {
        (
            OverlayAddr::service("echo"),
            OverlayAddr::Session {
                listener_id: 1,
                conn_id: 2,
                service: "echo".into(),
            },
        )
    }

    #[tokio::test]
    async fn test_promote_makes_connection_usable() {
        let (channel, _router) = TestRouter::connect(&ChannelConfig::default()).await;
        let local_kp = EndpointKeypair::generate();
        let peer_kp = EndpointKeypair::generate();
        let keys =
            derive_session_keys(&local_kp, &peer_kp.public_bytes(), KxRole::Responder).unwrap();

        let core = Arc::new(ConnectionCore::new(7, channel, Some(keys)));
        let conn = Connection::new(core.clone());
        assert!(!conn.is_connected());
        assert!(!conn.is_secured());

        let (local, remote) = session_addrs();
        core.promote(local.clone(), remote.clone());
        assert!(conn.is_connected());
        assert!(conn.is_secured());
        assert_eq!(conn.local_addr(), Some(local));
        assert_eq!(conn.remote_addr(), Some(remote));
    }

    #[tokio::test]
    async fn test_data_messages_are_counted() {
        let (channel, _router) = TestRouter::connect(&ChannelConfig::default()).await;
        let core = Arc::new(ConnectionCore::new(7, channel, None));
        let (local, remote) = session_addrs();
        core.promote(local, remote);
        let conn = Connection::new(core.clone());

        core.receive(
            MessageBuilder::new(ContentType::Data)
                .body(Bytes::from_static(b"abc"))
                .build(),
        )
        .await;
        core.receive(MessageBuilder::new(ContentType::Data).build())
            .await;
        assert_eq!(conn.data_frames(), 2);
    }

    #[tokio::test]
    async fn test_close_notifies_peer_once() {
        let (channel, mut router) = TestRouter::connect(&ChannelConfig::default()).await;
        let id = channel.reserve_conn_id();
        let core = Arc::new(ConnectionCore::new(id, channel.clone(), None));
        channel.register(id, Receiver::Conn(Arc::downgrade(&core)));
        let (local, remote) = session_addrs();
        core.promote(local, remote);
        let conn = Connection::new(core);

        conn.close().await;
        let closed = router.recv().await;
        assert_eq!(closed.content, ContentType::StateClosed);
        assert_eq!(closed.headers.get_u32(HeaderId::ConnectionId), Some(id));
        assert_eq!(channel.registered_receivers(), 0);
        assert!(!conn.is_connected());

        // A second close is a no-op on the wire.
        conn.close().await;
        router.expect_silence(Duration::from_millis(100)).await;
    }

    #[tokio::test]
    async fn test_remote_close_releases_registration() {
        let (channel, mut router) = TestRouter::connect(&ChannelConfig::default()).await;
        let id = channel.reserve_conn_id();
        let core = Arc::new(ConnectionCore::new(id, channel.clone(), None));
        channel.register(id, Receiver::Conn(Arc::downgrade(&core)));
        let (local, remote) = session_addrs();
        core.promote(local, remote);
        let conn = Connection::new(core);

        router
            .send_to_conn(id, ContentType::StateClosed, Bytes::new())
            .await;

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while conn.is_connected() {
            assert!(
                tokio::time::Instant::now() < deadline,
                "connection never observed the close"
            );
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(channel.registered_receivers(), 0);
    }
}
