//! Channel acquisition and per-router pooling.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::channel::{Channel, ChannelError};
use crate::config::Config;
use crate::controller::{NetworkSession, RouterEndpoint};
use crate::transport::RouterStream;

/// Source of transport channels for controller-issued sessions.
///
/// The default implementation is [`ChannelPool`]. Tests and embedders can
/// supply their own to control exactly which channel an endpoint uses.
#[async_trait]
pub trait ChannelProvider: Send + Sync {
    /// Acquire a channel able to reach one of the session's edge routers
    async fn acquire(&self, session: &NetworkSession) -> Result<Arc<Channel>, ChannelError>;
}

/// Pool keeping one live channel per edge router address.
///
/// Sessions listing the same router share its channel; a closed channel is
/// dropped from the pool and redialed on the next acquire.
pub struct ChannelPool {
    config: Config,
    channels: DashMap<String, Arc<Channel>>,
}

impl ChannelPool {
    /// Create an empty pool using the given configuration
    pub fn new(config: Config) -> Self {
        ChannelPool {
            config,
            channels: DashMap::new(),
        }
    }

    /// Number of live pooled channels
    pub fn len(&self) -> usize {
        self.channels.len()
    }

    /// True when no channel is pooled
    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    async fn connect(&self, router: &RouterEndpoint) -> Result<Arc<Channel>, ChannelError> {
        let tcp = timeout(
            self.config.connect_timeout(),
            TcpStream::connect(&router.addr),
        )
        .await
        .map_err(|_| ChannelError::ConnectTimeout)??;

        #[cfg(feature = "tls")]
        if let Some(tls_config) = &self.config.tls {
            let cert_pem = std::fs::read_to_string(&tls_config.cert_file)?;
            let key_pem = std::fs::read_to_string(&tls_config.key_file)?;
            let ca_pem = std::fs::read_to_string(&tls_config.ca_file)?;
            let client_config =
                crate::transport::tls::make_client_config(&cert_pem, &key_pem, &ca_pem)
                    .map_err(|err| ChannelError::Tls(err.to_string()))?;

            let sni = router.name.as_str();
            let stream = crate::transport::tls::connect_tls(client_config, tcp, sni)
                .await
                .map_err(|err| ChannelError::Tls(err.to_string()))?;
            return Channel::connect(stream, router.addr.clone(), &self.config.channel).await;
        }

        Channel::connect(
            RouterStream::Tcp(tcp),
            router.addr.clone(),
            &self.config.channel,
        )
        .await
    }
}

#[async_trait]
impl ChannelProvider for ChannelPool {
    async fn acquire(&self, session: &NetworkSession) -> Result<Arc<Channel>, ChannelError> {
        let mut last_err = None;

        for router in &session.edge_routers {
            if let Some(existing) = self.channels.get(&router.addr) {
                if !existing.is_closed() {
                    debug!("Reusing pooled channel to {}", router.addr);
                    return Ok(existing.clone());
                }
                drop(existing);
                self.channels.remove(&router.addr);
                debug!("Dropped closed channel to {} from pool", router.addr);
            }

            match self.connect(router).await {
                Ok(channel) => {
                    self.channels.insert(router.addr.clone(), channel.clone());
                    return Ok(channel);
                }
                Err(err) => {
                    warn!("Connect to edge router {} failed: {}", router.addr, err);
                    last_err = Some(err);
                }
            }
        }

        Err(last_err.unwrap_or(ChannelError::NoRouters))
    }
}
