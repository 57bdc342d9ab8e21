//! Transport layer for tunnel endpoints
//!
//! A tunnel talks to both of its peers through a [`Transport`]: it binds the
//! local listener, completes the inbound side of every accepted connection
//! and dials the remote. Two implementations exist and one is picked once,
//! when the tunnel starts:
//!
//! ```text
//!              build_transport(&TransportOptions)
//!                          │
//!            ┌─────────────┴─────────────┐
//!            ↓                           ↓
//!     PlainTransport               TlsTransport
//!   (raw TCP both ways)   (TLS server on accept, TLS client on dial)
//! ```
//!
//! The relay engine only ever sees [`BoxedStream`]s, so it never branches on
//! whether TLS is in use.

mod error;
mod plain;
mod tls;

pub use error::{TransportError, TransportResult};
pub use plain::PlainTransport;
pub use tls::{validate_server_name, TlsTransport};

pub use tcp_tunnel_cert::DEFAULT_CERT_PATH;

use async_trait::async_trait;
use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tracing::debug;

/// Default bound on establishing the outbound TCP connection
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(60);

/// Default bound on completing a TLS handshake
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// A byte stream the relay can splice
pub trait RelayStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> RelayStream for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

/// Type-erased stream handed to the relay engine
pub type BoxedStream = Box<dyn RelayStream>;

/// Which flavour of transport is in use
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Plain,
    Tls,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Plain => write!(f, "tcp"),
            TransportKind::Tls => write!(f, "tls"),
        }
    }
}

/// Lowest TLS protocol version the tunnel will negotiate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TlsVersion {
    #[default]
    Tls12,
    Tls13,
}

impl fmt::Display for TlsVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TlsVersion::Tls12 => write!(f, "1.2"),
            TlsVersion::Tls13 => write!(f, "1.3"),
        }
    }
}

impl FromStr for TlsVersion {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().trim_start_matches("tls").trim_start_matches('v') {
            "1.2" | "12" => Ok(TlsVersion::Tls12),
            "1.3" | "13" => Ok(TlsVersion::Tls13),
            other => Err(TransportError::ConfigurationError(format!(
                "Unsupported minimum TLS version '{}' (expected 1.2 or 1.3)",
                other
            ))),
        }
    }
}

/// Everything needed to build a transport
#[derive(Debug, Clone)]
pub struct TransportOptions {
    /// Terminate TLS on accept and originate TLS on dial
    pub tls: bool,

    /// Skip verification of the remote's certificate (INSECURE)
    pub insecure_skip_verify: bool,

    /// Combined certificate + key PEM served to inbound TLS clients
    pub cert_path: PathBuf,

    /// Extra trust anchors for the outbound TLS dial
    pub ca_cert_path: Option<PathBuf>,

    pub min_tls_version: TlsVersion,

    pub connect_timeout: Duration,

    pub handshake_timeout: Duration,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            tls: false,
            insecure_skip_verify: false,
            cert_path: PathBuf::from(DEFAULT_CERT_PATH),
            ca_cert_path: None,
            min_tls_version: TlsVersion::default(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }
}

/// Listen/accept/dial capability shared by the plaintext and TLS transports
#[async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
    fn kind(&self) -> TransportKind;

    /// Bind the local listening socket
    async fn listen(&self, addr: SocketAddr) -> TransportResult<TcpListener> {
        bind_listener(addr).await
    }

    /// Complete the inbound side of an accepted connection
    async fn accept(&self, stream: TcpStream, peer: SocketAddr) -> TransportResult<BoxedStream>;

    /// Open a connection to the remote
    ///
    /// `server_name` is the host part of the configured remote address and is
    /// used for TLS verification.
    async fn dial(&self, addr: SocketAddr, server_name: &str) -> TransportResult<BoxedStream>;
}

/// Pick and build the transport described by `options`
///
/// All certificate material is loaded here, so a TLS tunnel with a missing or
/// broken certificate fails before anything is bound.
pub fn build_transport(options: &TransportOptions) -> TransportResult<Arc<dyn Transport>> {
    let plain = PlainTransport::new(options.connect_timeout);
    if options.tls {
        Ok(Arc::new(TlsTransport::new(plain, options)?))
    } else {
        Ok(Arc::new(plain))
    }
}

pub(crate) async fn bind_listener(addr: SocketAddr) -> TransportResult<TcpListener> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| TransportError::BindError {
            address: addr.ip().to_string(),
            port: addr.port(),
            reason: e.to_string(),
        })?;
    debug!("Bound listener on {}", listener.local_addr()?);
    Ok(listener)
}

pub(crate) fn set_nodelay(stream: &TcpStream) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!("Failed to set TCP_NODELAY: {}", e);
    }
}
