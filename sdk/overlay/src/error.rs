//! Error taxonomy for listening endpoints and accepted connections.

use thiserror::Error;

use crate::channel::ChannelError;

/// Errors surfaced by listening endpoints and accepted connections.
///
/// Failures observed through asynchronous inbound dispatch (a remote close,
/// a protocol violation) are never returned from the dispatch path itself;
/// they move the endpoint to its closed state and the next call that touches
/// the endpoint reports [`OverlayError::Closed`] or
/// [`OverlayError::NotYetBound`].
#[derive(Error, Debug)]
pub enum OverlayError {
    /// Bind was called with an address that is not a service address
    #[error("unsupported address kind: {0}")]
    AddressKind(String),

    /// Bind was called while the endpoint is binding or bound
    #[error("endpoint already bound")]
    AlreadyBound,

    /// The endpoint is closed, or an in-flight accept was unblocked by closure
    #[error("endpoint closed")]
    Closed,

    /// Accept was called before a successful bind
    #[error("endpoint not yet bound")]
    NotYetBound,

    /// The remote explicitly rejected the bind, with its reason text
    #[error("bind rejected: {0}")]
    BindRejected(String),

    /// The bind sequence failed, carrying the underlying cause
    #[error("bind failed: {0}")]
    BindFailed(#[source] Box<dyn std::error::Error + Send + Sync + 'static>),

    /// The remote side failed the accept handshake, with its reason text
    #[error("dial rejected: {0}")]
    DialRejected(String),

    /// An unexpected or malformed message arrived on an established id
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// The transport channel failed underneath the endpoint
    #[error("channel error: {0}")]
    Channel(#[from] ChannelError),
}

impl OverlayError {
    /// Wrap an arbitrary failure from the bind sequence
    pub(crate) fn bind_failed(source: impl std::error::Error + Send + Sync + 'static) -> Self {
        OverlayError::BindFailed(Box::new(source))
    }
}
