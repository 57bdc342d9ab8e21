//! Transparent TCP relay
//!
//! A [`Tunnel`] listens on a local address and relays every accepted
//! connection, byte for byte, to a single remote address. With TLS enabled
//! the tunnel terminates TLS from local clients and opens a fresh TLS
//! connection to the remote; bytes are re-encrypted in between.
//!
//! ```text
//!   client ──> [local listener] ──accept──> session ──dial──> remote
//!                                             │
//!                              copy both ways until either side ends
//! ```
//!
//! Each session is independent: a failed handshake, dial or copy is logged
//! and ends that session only.

pub mod config;
pub mod error;
pub mod resolve;
mod session;
pub mod stats;
pub mod tunnel;

pub use config::TunnelConfig;
pub use error::{Endpoint, TunnelError};
pub use resolve::{resolve, split_host_port, ResolveError, ResolvedAddress};
pub use stats::{TunnelStats, TunnelStatsSnapshot};
pub use tunnel::{Tunnel, TunnelState};

pub use tcp_tunnel_transport::{TlsVersion, TransportKind};
