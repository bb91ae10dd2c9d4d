//! Listening endpoints, dial handling, and encrypted connection multiplexing
//! for the overlay edge protocol.
//!
//! This crate is the client SDK for hosting services on an overlay network.
//! An endpoint authorizes itself against the network controller, opens one
//! framed channel to an edge router, and multiplexes its listeners and
//! connections over that channel by connection id. Dialing peers reach the
//! endpoint through the router; the endpoint never opens a listening port
//! of its own.
//!
//! ## Features
//!
//! - **Service hosting**: bind a listener to a service and accept dials
//! - **Channel multiplexing**: all endpoints share one channel per router
//! - **Channel pooling**: router channels are reused across sessions
//! - **End-to-end keys**: X25519 agreement with per-direction ChaCha20-Poly1305
//! - **TLS transport**: optional rustls-backed channel transport
//!
//! ## Example
//!
//! ```rust,no_run
//! use overlay_sdk::{Config, ControllerClient, OverlayClient};
//! use std::sync::Arc;
//!
//! # async fn example(controller: Arc<dyn ControllerClient>) -> Result<(), overlay_sdk::OverlayError> {
//! let client = OverlayClient::new(controller, Config::default());
//!
//! // Host a service. Each accepted connection is one dialing peer.
//! let listener = client.listen("echo", 16).await?;
//! loop {
//!     let conn = listener.accept().await?;
//!     println!("peer {} connected (secured: {})", conn.id(), conn.is_secured());
//! }
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod addr;
pub mod channel;
pub mod client;
pub mod config;
pub mod connection;
pub mod controller;
pub mod error;
pub mod keys;
pub mod listener;
pub mod pool;
pub mod transport;

mod registry;
mod waiters;

#[cfg(test)]
mod testing;

// Re-export main types
pub use addr::OverlayAddr;
pub use channel::{Channel, ChannelError};
pub use client::OverlayClient;
pub use config::{ChannelConfig, Config, ConfigError, TlsConfig};
pub use connection::Connection;
pub use controller::{
    ControllerClient, ControllerError, NetworkSession, RouterEndpoint, SessionKind,
};
pub use error::OverlayError;
pub use keys::{
    derive_session_keys, CipherPair, CipherState, EndpointKeypair, KeyError, KxRole, SessionKeys,
    KEY_SIZE,
};
pub use listener::Listener;
pub use pool::{ChannelPool, ChannelProvider};
pub use transport::{connect_tcp, RouterStream};

// Re-export TLS functionality when available
#[cfg(feature = "tls")]
pub use transport::tls::{connect_tls, make_client_config};
