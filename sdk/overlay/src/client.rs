//! Entry point tying the controller, channel pool, and endpoints together.

use std::sync::Arc;

use crate::addr::OverlayAddr;
use crate::config::Config;
use crate::controller::ControllerClient;
use crate::error::OverlayError;
use crate::listener::Listener;
use crate::pool::{ChannelPool, ChannelProvider};

/// Handle on one overlay network, scoped to one identity.
///
/// The client owns the channel pool shared by every endpoint it creates, so
/// listeners and connections created through one client reuse router channels
/// instead of opening their own.
#[derive(Clone)]
pub struct OverlayClient {
    controller: Arc<dyn ControllerClient>,
    channels: Arc<dyn ChannelProvider>,
    config: Config,
}

impl OverlayClient {
    /// Create a client backed by a pool of router channels.
    pub fn new(controller: Arc<dyn ControllerClient>, config: Config) -> Self {
        let channels = Arc::new(ChannelPool::new(config.clone()));
        OverlayClient {
            controller,
            channels,
            config,
        }
    }

    /// Create a client with a caller-supplied channel source.
    pub fn with_channel_provider(
        controller: Arc<dyn ControllerClient>,
        channels: Arc<dyn ChannelProvider>,
        config: Config,
    ) -> Self {
        OverlayClient {
            controller,
            channels,
            config,
        }
    }

    /// Create an unbound listening endpoint.
    pub fn listener(&self) -> Listener {
        Listener::new(self.controller.clone(), self.channels.clone())
    }

    /// Bind a listening endpoint to `service` in one step.
    pub async fn listen(&self, service: &str, backlog: usize) -> Result<Listener, OverlayError> {
        let listener = self.listener();
        listener
            .bind(&OverlayAddr::service(service), backlog)
            .await?;
        Ok(listener)
    }

    /// The configuration this client was built with.
    pub fn config(&self) -> &Config {
        &self.config
    }
}

impl std::fmt::Debug for OverlayClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OverlayClient").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChannelConfig;
    use crate::testing::{init_tracing, FakeController, StaticProvider, TestRouter};
    use bytes::Bytes;
    use overlay_wire::ContentType;

    #[tokio::test]
    async fn test_listen_binds_in_one_step() {
        init_tracing();
        let (channel, mut router) = TestRouter::connect(&ChannelConfig::default()).await;
        let controller = Arc::new(FakeController::new());
        let provider = Arc::new(StaticProvider::new(channel));
        let client = OverlayClient::with_channel_provider(controller, provider, Config::default());

        let (listen_res, ()) = tokio::join!(client.listen("echo", 16), async {
            let bind = router.recv().await;
            assert_eq!(bind.content, ContentType::Bind);
            router
                .reply(&bind, ContentType::StateConnected, Bytes::new())
                .await;
        });

        let listener = listen_res.unwrap();
        assert_eq!(listener.local_addr(), Some(OverlayAddr::service("echo")));
        assert!(!listener.is_closed());
    }

    #[tokio::test]
    async fn test_listener_handles_share_the_client_stack() {
        init_tracing();
        let (channel, _router) = TestRouter::connect(&ChannelConfig::default()).await;
        let controller = Arc::new(FakeController::new());
        let provider = Arc::new(StaticProvider::new(channel));
        let client = OverlayClient::with_channel_provider(controller, provider, Config::default());

        let a = client.listener();
        let b = client.listener();
        assert!(a.local_addr().is_none());
        assert!(b.local_addr().is_none());
    }
}
