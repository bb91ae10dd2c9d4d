//! Controller client trait and the session records it hands out.
//!
//! The controller is the overlay's authorization authority. Before an
//! endpoint may bind or dial a service it must obtain a network session,
//! which names the edge routers able to terminate the session and carries
//! the opaque token those routers verify.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Purpose of a requested network session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionKind {
    /// Hosting: the endpoint will bind the service
    Bind,
    /// Initiating: the endpoint will dial the service
    Dial,
}

/// One edge router advertised in a network session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouterEndpoint {
    /// Router display name, also used as the TLS server name
    pub name: String,
    /// Host and port of the router's edge listener
    pub addr: String,
}

/// Controller-issued authorization to bind or dial one service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkSession {
    /// Controller-assigned session id
    pub id: String,
    /// Service the session was issued for
    pub service: String,
    /// Opaque token presented to edge routers
    pub token: String,
    /// Routers able to terminate this session
    pub edge_routers: Vec<RouterEndpoint>,
}

/// Failures reported by controller implementations
#[derive(Error, Debug)]
pub enum ControllerError {
    /// The controller could not be reached
    #[error("controller unreachable: {0}")]
    Unreachable(String),

    /// The identity is not authorized for the requested session
    #[error("not authorized: {0}")]
    Unauthorized(String),

    /// The named service does not exist
    #[error("unknown service: {0}")]
    UnknownService(String),
}

/// Client view of the overlay controller.
///
/// Implementations talk to a concrete controller deployment. The SDK only
/// requires session creation; enrollment and service management stay outside
/// this crate.
#[async_trait]
pub trait ControllerClient: Send + Sync {
    /// Request a network session authorizing `kind` on the named service
    async fn create_session(
        &self,
        service: &str,
        kind: SessionKind,
    ) -> Result<NetworkSession, ControllerError>;
}
