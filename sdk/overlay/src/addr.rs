//! Logical addresses on the overlay network.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A logical overlay address.
///
/// Listening endpoints bind to [`OverlayAddr::Service`] addresses. Each
/// accepted connection is labelled with an [`OverlayAddr::Session`] address
/// naming the listener it arrived on and the service it targeted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OverlayAddr {
    /// A named service registered with the controller
    Service {
        /// Service name as known to the controller
        name: String,
    },
    /// One accepted logical connection on a bound listener
    Session {
        /// Connection id of the parent listener
        listener_id: u32,
        /// Connection id of the accepted connection itself
        conn_id: u32,
        /// Service name the parent listener is bound to
        service: String,
    },
}

impl OverlayAddr {
    /// Build a service address from a name
    pub fn service(name: impl Into<String>) -> Self {
        OverlayAddr::Service { name: name.into() }
    }

    /// The service name, for both address kinds
    pub fn service_name(&self) -> &str {
        match self {
            OverlayAddr::Service { name } => name,
            OverlayAddr::Session { service, .. } => service,
        }
    }

    /// True for [`OverlayAddr::Service`] addresses
    pub fn is_service(&self) -> bool {
        matches!(self, OverlayAddr::Service { .. })
    }
}

impl fmt::Display for OverlayAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OverlayAddr::Service { name } => write!(f, "service:{}", name),
            OverlayAddr::Session {
                listener_id,
                conn_id,
                service,
            } => write!(f, "session:{}/{}@{}", listener_id, conn_id, service),
        }
    }
}
