//! Endpoint resolution
//!
//! Turns the `host:port` strings of a tunnel configuration into socket
//! addresses once, at startup. A tunnel whose endpoints do not resolve never
//! starts; there is no re-resolution while it runs.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("Invalid address {address:?}: expected host:port")]
    InvalidSyntax { address: String },

    #[error("Invalid port in address {address:?}")]
    InvalidPort { address: String },

    #[error("Failed to resolve {address:?}: {source}")]
    Lookup {
        address: String,
        #[source]
        source: io::Error,
    },

    #[error("No addresses found for {address:?}")]
    NoAddresses { address: String },
}

/// A validated endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedAddress {
    /// Host as configured (name or literal, without IPv6 brackets)
    pub host: String,
    pub port: u16,
    /// Address connections are actually made to or accepted on
    pub addr: SocketAddr,
}

impl fmt::Display for ResolvedAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.addr)
    }
}

/// Split `host:port` (or `[v6]:port`) into its parts
///
/// An empty host means every local interface, as in `:8080`.
pub fn split_host_port(address: &str) -> Result<(String, u16), ResolveError> {
    let invalid = || ResolveError::InvalidSyntax {
        address: address.to_string(),
    };

    let (host, port) = if let Some(rest) = address.strip_prefix('[') {
        let (host, tail) = rest.split_once(']').ok_or_else(invalid)?;
        let port = tail.strip_prefix(':').ok_or_else(invalid)?;
        (host, port)
    } else {
        let (host, port) = address.rsplit_once(':').ok_or_else(invalid)?;
        if host.contains(':') {
            // bare IPv6 literal, port is ambiguous
            return Err(invalid());
        }
        (host, port)
    };

    if port.is_empty() || host.contains(char::is_whitespace) {
        return Err(invalid());
    }

    let port = port.parse::<u16>().map_err(|_| ResolveError::InvalidPort {
        address: address.to_string(),
    })?;

    Ok((host.to_string(), port))
}

/// Validate and resolve a `host:port` string
///
/// When a name resolves to several addresses the first IPv4 address is used,
/// falling back to the first address of any family.
pub async fn resolve(address: &str) -> Result<ResolvedAddress, ResolveError> {
    let (host, port) = split_host_port(address)?;
    let lookup_host = if host.is_empty() { "0.0.0.0" } else { host.as_str() };

    let candidates: Vec<SocketAddr> = tokio::net::lookup_host((lookup_host, port))
        .await
        .map_err(|e| ResolveError::Lookup {
            address: address.to_string(),
            source: e,
        })?
        .collect();

    let addr = candidates
        .iter()
        .find(|a| a.is_ipv4())
        .or_else(|| candidates.first())
        .copied()
        .ok_or_else(|| ResolveError::NoAddresses {
            address: address.to_string(),
        })?;

    debug!("Resolved {} to {}", address, addr);

    Ok(ResolvedAddress { host, port, addr })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_ipv4() {
        let (host, port) = split_host_port("127.0.0.1:8080").unwrap();
        assert_eq!(host, "127.0.0.1");
        assert_eq!(port, 8080);
    }

    #[test]
    fn test_split_hostname() {
        let (host, port) = split_host_port("db.internal:5432").unwrap();
        assert_eq!(host, "db.internal");
        assert_eq!(port, 5432);
    }

    #[test]
    fn test_split_bracketed_ipv6() {
        let (host, port) = split_host_port("[::1]:443").unwrap();
        assert_eq!(host, "::1");
        assert_eq!(port, 443);
    }

    #[test]
    fn test_split_empty_host() {
        let (host, port) = split_host_port(":9000").unwrap();
        assert_eq!(host, "");
        assert_eq!(port, 9000);
    }

    #[test]
    fn test_split_rejects_missing_port() {
        assert!(matches!(
            split_host_port("localhost"),
            Err(ResolveError::InvalidSyntax { .. })
        ));
        assert!(matches!(
            split_host_port("localhost:"),
            Err(ResolveError::InvalidSyntax { .. })
        ));
    }

    #[test]
    fn test_split_rejects_bare_ipv6() {
        assert!(matches!(
            split_host_port("::1:443"),
            Err(ResolveError::InvalidSyntax { .. })
        ));
        assert!(matches!(
            split_host_port("[::1]443"),
            Err(ResolveError::InvalidSyntax { .. })
        ));
    }

    #[test]
    fn test_split_rejects_bad_port() {
        assert!(matches!(
            split_host_port("127.0.0.1:http"),
            Err(ResolveError::InvalidPort { .. })
        ));
        assert!(matches!(
            split_host_port("127.0.0.1:70000"),
            Err(ResolveError::InvalidPort { .. })
        ));
    }

    #[tokio::test]
    async fn test_resolve_literal() {
        let resolved = resolve("127.0.0.1:18080").await.unwrap();
        assert_eq!(resolved.addr, "127.0.0.1:18080".parse().unwrap());
        assert_eq!(resolved.host, "127.0.0.1");
    }

    #[tokio::test]
    async fn test_resolve_localhost() {
        let resolved = resolve("localhost:80").await.unwrap();
        assert!(resolved.addr.ip().is_loopback());
        assert_eq!(resolved.host, "localhost");
    }

    #[tokio::test]
    async fn test_resolve_empty_host_is_unspecified() {
        let resolved = resolve(":0").await.unwrap();
        assert!(resolved.addr.ip().is_unspecified());
    }

    #[tokio::test]
    async fn test_resolve_unknown_host() {
        let err = resolve("no-such-host.invalid:80").await.unwrap_err();
        assert!(matches!(
            err,
            ResolveError::Lookup { .. } | ResolveError::NoAddresses { .. }
        ));
    }
}
