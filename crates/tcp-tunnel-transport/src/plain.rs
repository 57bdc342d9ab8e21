//! Plaintext TCP transport

use async_trait::async_trait;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::debug;

use crate::{set_nodelay, BoxedStream, Transport, TransportError, TransportKind, TransportResult};

/// Raw TCP on both sides of the tunnel
#[derive(Debug, Clone)]
pub struct PlainTransport {
    connect_timeout: Duration,
}

impl PlainTransport {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }

    /// Establish the TCP connection, bounded by the connect timeout
    pub async fn connect(&self, addr: SocketAddr) -> TransportResult<TcpStream> {
        let stream = bounded_connect(addr, self.connect_timeout, TcpStream::connect(addr)).await?;

        set_nodelay(&stream);
        debug!("Connected to {}", addr);
        Ok(stream)
    }
}

pub(crate) async fn bounded_connect<F>(
    addr: SocketAddr,
    timeout: Duration,
    connect: F,
) -> TransportResult<TcpStream>
where
    F: Future<Output = io::Result<TcpStream>>,
{
    tokio::time::timeout(timeout, connect)
        .await
        .map_err(|_| TransportError::ConnectTimeout {
            address: addr,
            timeout,
        })?
        .map_err(|e| TransportError::ConnectionFailed {
            address: addr,
            source: e,
        })
}

impl Default for PlainTransport {
    fn default() -> Self {
        Self::new(crate::DEFAULT_CONNECT_TIMEOUT)
    }
}

#[async_trait]
impl Transport for PlainTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Plain
    }

    async fn accept(&self, stream: TcpStream, _peer: SocketAddr) -> TransportResult<BoxedStream> {
        set_nodelay(&stream);
        Ok(Box::new(stream))
    }

    async fn dial(&self, addr: SocketAddr, _server_name: &str) -> TransportResult<BoxedStream> {
        let stream = self.connect(addr).await?;
        Ok(Box::new(stream))
    }
}
