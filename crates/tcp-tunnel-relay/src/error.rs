use std::fmt;
use tcp_tunnel_transport::TransportError;
use thiserror::Error;

use crate::resolve::ResolveError;

/// Which side of the tunnel an error refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    Local,
    Remote,
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Local => write!(f, "local"),
            Endpoint::Remote => write!(f, "remote"),
        }
    }
}

/// Errors that keep a tunnel from starting
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("Invalid tunnel configuration: {0}")]
    InvalidConfig(String),

    #[error("Failed to resolve {endpoint} address: {source}")]
    Resolve {
        endpoint: Endpoint,
        #[source]
        source: ResolveError,
    },

    #[error("Transport setup failed: {0}")]
    Transport(#[from] TransportError),

    #[error("Tunnel '{name}' is already running")]
    AlreadyRunning { name: String },
}
