//! TLS transport: terminates TLS on accept, originates TLS on dial

use async_trait::async_trait;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::SupportedProtocolVersion;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tcp_tunnel_cert::Certificate;
use tokio::net::TcpStream;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, warn};

use crate::{
    BoxedStream, PlainTransport, TlsVersion, Transport, TransportError, TransportKind,
    TransportOptions, TransportResult,
};

static TLS13_ONLY: &[&SupportedProtocolVersion] = &[&rustls::version::TLS13];

/// TLS on both sides of the tunnel
pub struct TlsTransport {
    plain: PlainTransport,
    acceptor: TlsAcceptor,
    connector: TlsConnector,
    insecure_skip_verify: bool,
    handshake_timeout: Duration,
}

impl std::fmt::Debug for TlsTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsTransport")
            .field("plain", &self.plain)
            .field("insecure_skip_verify", &self.insecure_skip_verify)
            .field("handshake_timeout", &self.handshake_timeout)
            .finish()
    }
}

impl TlsTransport {
    /// Load the server identity and build both TLS configurations
    pub fn new(plain: PlainTransport, options: &TransportOptions) -> TransportResult<Self> {
        ensure_crypto_provider();

        let certificate = Certificate::load_combined(&options.cert_path)?;
        let acceptor = build_acceptor(certificate, options.min_tls_version)?;
        let connector = build_connector(options)?;

        if options.insecure_skip_verify {
            warn!("⚠️  Remote certificate verification disabled (insecure mode)");
        }

        Ok(Self {
            plain,
            acceptor,
            connector,
            insecure_skip_verify: options.insecure_skip_verify,
            handshake_timeout: options.handshake_timeout,
        })
    }
}

/// Check that `host` can be sent as the TLS server name when dialing it
pub fn validate_server_name(host: &str) -> TransportResult<()> {
    parse_server_name(host).map(|_| ())
}

fn parse_server_name(host: &str) -> TransportResult<ServerName<'static>> {
    ServerName::try_from(host.to_string())
        .map_err(|_| TransportError::InvalidServerName(host.to_string()))
}

#[async_trait]
impl Transport for TlsTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Tls
    }

    async fn accept(&self, stream: TcpStream, peer: SocketAddr) -> TransportResult<BoxedStream> {
        crate::set_nodelay(&stream);

        let tls_stream = tokio::time::timeout(self.handshake_timeout, self.acceptor.accept(stream))
            .await
            .map_err(|_| TransportError::HandshakeTimeout {
                peer,
                timeout: self.handshake_timeout,
            })?
            .map_err(|e| TransportError::HandshakeFailed {
                peer,
                reason: e.to_string(),
            })?;

        debug!("TLS handshake completed for {}", peer);
        Ok(Box::new(tls_stream))
    }

    async fn dial(&self, addr: SocketAddr, server_name: &str) -> TransportResult<BoxedStream> {
        let name = parse_server_name(server_name)?;

        let stream = self.plain.connect(addr).await?;

        let tls_stream =
            tokio::time::timeout(self.handshake_timeout, self.connector.connect(name, stream))
                .await
                .map_err(|_| TransportError::HandshakeTimeout {
                    peer: addr,
                    timeout: self.handshake_timeout,
                })?
                .map_err(|e| TransportError::HandshakeFailed {
                    peer: addr,
                    reason: e.to_string(),
                })?;

        debug!("TLS session to {} ({}) established", addr, server_name);
        Ok(Box::new(tls_stream))
    }
}

fn protocol_versions(min: TlsVersion) -> &'static [&'static SupportedProtocolVersion] {
    match min {
        TlsVersion::Tls12 => rustls::ALL_VERSIONS,
        TlsVersion::Tls13 => TLS13_ONLY,
    }
}

fn build_acceptor(certificate: Certificate, min: TlsVersion) -> TransportResult<TlsAcceptor> {
    let config = rustls::ServerConfig::builder_with_protocol_versions(protocol_versions(min))
        .with_no_client_auth()
        .with_single_cert(certificate.cert_chain, certificate.private_key)
        .map_err(|e| TransportError::TlsError(format!("Invalid cert/key: {}", e)))?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

fn build_connector(options: &TransportOptions) -> TransportResult<TlsConnector> {
    let builder =
        rustls::ClientConfig::builder_with_protocol_versions(protocol_versions(options.min_tls_version));

    let config = if options.insecure_skip_verify {
        builder
            .dangerous()
            .with_custom_certificate_verifier(SkipVerification::new())
            .with_no_client_auth()
    } else {
        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

        if let Some(ca_path) = &options.ca_cert_path {
            for cert in tcp_tunnel_cert::load_certs(ca_path)? {
                roots.add(cert).map_err(|e| {
                    TransportError::ConfigurationError(format!("Invalid root cert: {}", e))
                })?;
            }
            debug!("Trusting extra CA certificates from {}", ca_path.display());
        }

        builder.with_root_certificates(roots).with_no_client_auth()
    };

    Ok(TlsConnector::from(Arc::new(config)))
}

static CRYPTO_PROVIDER_INIT: std::sync::Once = std::sync::Once::new();

fn ensure_crypto_provider() {
    CRYPTO_PROVIDER_INIT.call_once(|| {
        if rustls::crypto::ring::default_provider()
            .install_default()
            .is_err()
        {
            debug!("Rustls crypto provider already installed");
        }
    });
}

// Accepts any server certificate chain. Handshake signatures are still
// checked so the peer has to hold the key for the certificate it sent.
#[derive(Debug)]
struct SkipVerification {
    provider: rustls::crypto::CryptoProvider,
}

impl SkipVerification {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            provider: rustls::crypto::ring::default_provider(),
        })
    }
}

impl rustls::client::danger::ServerCertVerifier for SkipVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}
