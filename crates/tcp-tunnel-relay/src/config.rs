use std::path::PathBuf;
use std::time::Duration;
use tcp_tunnel_transport::{
    TlsVersion, TransportOptions, DEFAULT_CONNECT_TIMEOUT, DEFAULT_HANDSHAKE_TIMEOUT,
};

use crate::TunnelError;

/// Static description of one tunnel
///
/// Built once before the tunnel starts and never changed afterwards.
#[derive(Debug, Clone)]
pub struct TunnelConfig {
    /// Label used in logs (does not have to be unique)
    pub name: String,

    /// Address to listen on (`host:port`, port 0 picks a free port)
    pub local_address: String,

    /// Address every accepted connection is relayed to (`host:port`)
    pub remote_address: String,

    /// Terminate TLS on the local side and originate TLS to the remote
    pub tls: bool,

    /// Accept any certificate from the remote (INSECURE)
    pub insecure_skip_verify: bool,

    /// Combined certificate + key PEM served to local TLS clients
    pub cert_path: PathBuf,

    /// Extra CA certificates trusted when dialing the remote over TLS
    pub ca_cert_path: Option<PathBuf>,

    pub min_tls_version: TlsVersion,

    pub connect_timeout: Duration,

    pub handshake_timeout: Duration,
}

impl TunnelConfig {
    pub fn new(
        name: impl Into<String>,
        local_address: impl Into<String>,
        remote_address: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            local_address: local_address.into(),
            remote_address: remote_address.into(),
            tls: false,
            insecure_skip_verify: false,
            cert_path: PathBuf::from(tcp_tunnel_transport::DEFAULT_CERT_PATH),
            ca_cert_path: None,
            min_tls_version: TlsVersion::default(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }

    /// Enable TLS on both sides using the given combined PEM file
    pub fn with_tls(mut self, cert_path: impl Into<PathBuf>) -> Self {
        self.tls = true;
        self.cert_path = cert_path.into();
        self
    }

    /// Disable verification of the remote's certificate (INSECURE)
    pub fn with_insecure_skip_verify(mut self) -> Self {
        self.insecure_skip_verify = true;
        self
    }

    pub fn with_ca_cert(mut self, path: impl Into<PathBuf>) -> Self {
        self.ca_cert_path = Some(path.into());
        self
    }

    pub fn with_min_tls_version(mut self, version: TlsVersion) -> Self {
        self.min_tls_version = version;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn validate(&self) -> Result<(), TunnelError> {
        if self.local_address.trim().is_empty() {
            return Err(TunnelError::InvalidConfig(
                "local address must not be empty".to_string(),
            ));
        }
        if self.remote_address.trim().is_empty() {
            return Err(TunnelError::InvalidConfig(
                "remote address must not be empty".to_string(),
            ));
        }
        if self.connect_timeout.is_zero() {
            return Err(TunnelError::InvalidConfig(
                "connect timeout must be greater than zero".to_string(),
            ));
        }
        if self.tls && self.handshake_timeout.is_zero() {
            return Err(TunnelError::InvalidConfig(
                "handshake timeout must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn transport_options(&self) -> TransportOptions {
        TransportOptions {
            tls: self.tls,
            insecure_skip_verify: self.insecure_skip_verify,
            cert_path: self.cert_path.clone(),
            ca_cert_path: self.ca_cert_path.clone(),
            min_tls_version: self.min_tls_version,
            connect_timeout: self.connect_timeout,
            handshake_timeout: self.handshake_timeout,
        }
    }
}
