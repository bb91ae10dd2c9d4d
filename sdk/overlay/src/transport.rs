//! TCP and TLS client transport to edge routers.

use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
#[cfg(feature = "tls")]
use tracing::{debug, info};

/// Unified stream type for the router connection
pub enum RouterStream {
    /// Plain TCP stream
    Tcp(TcpStream),
    /// TLS client stream
    #[cfg(feature = "tls")]
    Tls(tokio_rustls::client::TlsStream<TcpStream>),
}

impl AsyncRead for RouterStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            RouterStream::Tcp(stream) => Pin::new(stream).poll_read(cx, buf),
            #[cfg(feature = "tls")]
            RouterStream::Tls(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for RouterStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, std::io::Error>> {
        match self.get_mut() {
            RouterStream::Tcp(stream) => Pin::new(stream).poll_write(cx, buf),
            #[cfg(feature = "tls")]
            RouterStream::Tls(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), std::io::Error>> {
        match self.get_mut() {
            RouterStream::Tcp(stream) => Pin::new(stream).poll_flush(cx),
            #[cfg(feature = "tls")]
            RouterStream::Tls(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Result<(), std::io::Error>> {
        match self.get_mut() {
            RouterStream::Tcp(stream) => Pin::new(stream).poll_shutdown(cx),
            #[cfg(feature = "tls")]
            RouterStream::Tls(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

impl RouterStream {
    /// Get the peer address of the underlying stream
    pub fn peer_addr(&self) -> std::io::Result<SocketAddr> {
        match self {
            RouterStream::Tcp(stream) => stream.peer_addr(),
            #[cfg(feature = "tls")]
            RouterStream::Tls(stream) => stream.get_ref().0.peer_addr(),
        }
    }
}

/// Connect a plain TCP stream to a router address
pub async fn connect_tcp(addr: &str) -> tokio::io::Result<TcpStream> {
    TcpStream::connect(addr).await
}

// TLS-specific functionality
#[cfg(feature = "tls")]
/// TLS client layer for authenticated router connections
pub mod tls {
    use super::*;
    use anyhow::{Context as AnyhowContext, Result};
    use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
    use rustls::{ClientConfig, RootCertStore};
    use std::sync::Arc;
    use tokio_rustls::TlsConnector;

    /// Create a TLS client configuration with mutual authentication
    pub fn make_client_config(
        cert_chain_pem: &str,
        private_key_pem: &str,
        ca_pem: &str,
    ) -> Result<ClientConfig> {
        info!("Creating TLS client configuration");

        // Install default crypto provider if not already set
        let _ = rustls::crypto::ring::default_provider().install_default();

        // Load CA certificates for router verification
        let mut roots = RootCertStore::empty();
        let ca_results: Result<Vec<_>, _> = rustls_pemfile::certs(&mut ca_pem.as_bytes()).collect();
        let ca_certs = ca_results.context("Failed to parse CA certificates")?;

        for ca_cert in ca_certs {
            roots
                .add(CertificateDer::from(ca_cert))
                .context("Failed to add CA certificate to root store")?;
        }

        // Load client certificate chain
        let cert_results: Result<Vec<_>, _> =
            rustls_pemfile::certs(&mut cert_chain_pem.as_bytes()).collect();
        let certs = cert_results
            .context("Failed to parse certificate chain")?
            .into_iter()
            .map(CertificateDer::from)
            .collect::<Vec<_>>();

        if certs.is_empty() {
            anyhow::bail!("No certificates found in certificate chain");
        }

        // Load private key
        let key = {
            let key_results: Result<Vec<_>, _> =
                rustls_pemfile::pkcs8_private_keys(&mut private_key_pem.as_bytes()).collect();
            let mut keys = key_results.context("Failed to parse private key")?;
            if keys.is_empty() {
                anyhow::bail!("No private key found");
            }
            PrivateKeyDer::from(keys.remove(0))
        };

        // Build client configuration
        let mut config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_client_auth_cert(certs, key)
            .context("Failed to configure client certificate")?;

        // Set ALPN protocol
        config.alpn_protocols = vec![b"overlay/1".to_vec()];

        Ok(config)
    }

    /// Complete a TLS handshake over an established TCP stream
    pub async fn connect_tls(
        config: ClientConfig,
        tcp_stream: TcpStream,
        sni: &str,
    ) -> Result<RouterStream> {
        debug!("Starting TLS handshake (SNI: {})", sni);

        let connector = TlsConnector::from(Arc::new(config));
        let server_name = ServerName::try_from(sni.to_owned())
            .map_err(|_| anyhow::anyhow!("Invalid server name: {}", sni))?;

        let tls_stream = connector
            .connect(server_name, tcp_stream)
            .await
            .with_context(|| format!("TLS handshake failed (SNI: {})", sni))?;

        Ok(RouterStream::Tls(tls_stream))
    }
}
