use std::net::SocketAddr;
use std::time::Duration;
use tcp_tunnel_cert::CertError;
use thiserror::Error;

/// Transport-level errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to bind to {address}: {reason}\n\nTroubleshooting:\n  • Check if another process is using this port: lsof -i :{port}\n  • Try using a different address or port")]
    BindError {
        address: String,
        port: u16,
        reason: String,
    },

    #[error("Failed to connect to {address}: {source}")]
    ConnectionFailed {
        address: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("Timed out after {timeout:?} connecting to {address}")]
    ConnectTimeout {
        address: SocketAddr,
        timeout: Duration,
    },

    #[error("TLS handshake with {peer} failed: {reason}")]
    HandshakeFailed { peer: SocketAddr, reason: String },

    #[error("TLS handshake with {peer} timed out after {timeout:?}")]
    HandshakeTimeout {
        peer: SocketAddr,
        timeout: Duration,
    },

    #[error("Certificate error: {0}")]
    Certificate(#[from] CertError),

    #[error("TLS error: {0}")]
    TlsError(String),

    #[error("Invalid TLS server name {0:?}")]
    InvalidServerName(String),

    #[error("Configuration error: {0}")]
    ConfigurationError(String),
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;
