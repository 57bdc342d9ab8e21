//! End-to-end tests for TLS tunnels
//!
//! The tunnel terminates TLS from the client and originates a new TLS
//! connection to a TLS echo server. All certificates are generated on the fly.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore, ServerConfig};
use tokio_rustls::{TlsAcceptor, TlsConnector};

use tcp_tunnel_cert::{generate_self_signed_cert, Certificate, SelfSignedCertificate};
use tcp_tunnel_relay::{Tunnel, TunnelConfig, TunnelError, TunnelState};

const STEP: Duration = Duration::from_secs(10);

fn init() {
    let _ = rustls::crypto::ring::default_provider().install_default();
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init()
        .ok();
}

struct Identity {
    cert: SelfSignedCertificate,
    combined: PathBuf,
    ca: PathBuf,
}

fn write_identity(dir: &Path, name: &str) -> Identity {
    let cert = generate_self_signed_cert().unwrap();
    let combined = dir.join(format!("{name}.crt"));
    let ca = dir.join(format!("{name}-ca.pem"));
    cert.save_combined(&combined).unwrap();
    std::fs::write(&ca, &cert.pem_cert).unwrap();
    Identity { cert, combined, ca }
}

fn acceptor(identity: &Identity) -> TlsAcceptor {
    let Certificate {
        cert_chain,
        private_key,
    } = Certificate::from_pem(identity.cert.combined_pem().as_bytes()).unwrap();
    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(cert_chain, private_key)
        .unwrap();
    TlsAcceptor::from(Arc::new(config))
}

fn connector(trusted: &Identity) -> TlsConnector {
    let mut roots = RootCertStore::empty();
    roots.add(trusted.cert.cert_der.clone()).unwrap();
    let config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    TlsConnector::from(Arc::new(config))
}

/// TLS echo server standing in for the remote service
async fn spawn_tls_echo(identity: &Identity) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let acceptor = acceptor(identity);
    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            let acceptor = acceptor.clone();
            tokio::spawn(async move {
                let Ok(stream) = acceptor.accept(socket).await else {
                    return;
                };
                let (mut reader, mut writer) = tokio::io::split(stream);
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            });
        }
    });
    addr
}

async fn tls_ping(addr: SocketAddr, trusted: &Identity) -> std::io::Result<[u8; 4]> {
    let tcp = TcpStream::connect(addr).await?;
    let name = ServerName::try_from("localhost").unwrap();
    let mut stream = connector(trusted).connect(name, tcp).await?;
    stream.write_all(b"ping").await?;
    stream.flush().await?;
    let mut buf = [0u8; 4];
    stream.read_exact(&mut buf).await?;
    Ok(buf)
}

#[tokio::test(flavor = "multi_thread")]
async fn test_tls_tunnel_with_trusted_remote() {
    init();
    let dir = tempfile::tempdir().unwrap();
    let remote_id = write_identity(dir.path(), "remote");
    let tunnel_id = write_identity(dir.path(), "tunnel");
    let remote = spawn_tls_echo(&remote_id).await;

    let config = TunnelConfig::new("tls", "127.0.0.1:0", format!("localhost:{}", remote.port()))
        .with_tls(&tunnel_id.combined)
        .with_ca_cert(&remote_id.ca);
    let tunnel = Arc::new(Tunnel::new(config));
    let handle = tunnel.start().await.unwrap();
    let addr = tunnel.local_addr().unwrap();

    let reply = tokio::time::timeout(STEP, tls_ping(addr, &tunnel_id))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&reply, b"ping");

    tunnel.shutdown().await;
    handle.await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_tls_tunnel_insecure_skips_remote_verification() {
    init();
    let dir = tempfile::tempdir().unwrap();
    let remote_id = write_identity(dir.path(), "remote");
    let tunnel_id = write_identity(dir.path(), "tunnel");
    let remote = spawn_tls_echo(&remote_id).await;

    let config = TunnelConfig::new("insecure", "127.0.0.1:0", remote.to_string())
        .with_tls(&tunnel_id.combined)
        .with_insecure_skip_verify();
    let tunnel = Arc::new(Tunnel::new(config));
    let handle = tunnel.start().await.unwrap();
    let addr = tunnel.local_addr().unwrap();

    let reply = tokio::time::timeout(STEP, tls_ping(addr, &tunnel_id))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&reply, b"ping");

    tunnel.shutdown().await;
    handle.await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_untrusted_remote_is_never_relayed_in_plaintext() {
    init();
    let dir = tempfile::tempdir().unwrap();
    let remote_id = write_identity(dir.path(), "remote");
    let tunnel_id = write_identity(dir.path(), "tunnel");
    let remote = spawn_tls_echo(&remote_id).await;

    // remote certificate is self-signed and not trusted
    let config = TunnelConfig::new("strict", "127.0.0.1:0", format!("localhost:{}", remote.port()))
        .with_tls(&tunnel_id.combined);
    let tunnel = Arc::new(Tunnel::new(config));
    let handle = tunnel.start().await.unwrap();
    let addr = tunnel.local_addr().unwrap();

    let result = tokio::time::timeout(STEP, tls_ping(addr, &tunnel_id))
        .await
        .unwrap();
    assert!(result.is_err(), "session must not be relayed");

    assert_eq!(tunnel.state(), TunnelState::Listening);
    tunnel.shutdown().await;
    handle.await.unwrap();
    assert_eq!(tunnel.stats().completed, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_plaintext_client_is_rejected() {
    init();
    let dir = tempfile::tempdir().unwrap();
    let remote_id = write_identity(dir.path(), "remote");
    let tunnel_id = write_identity(dir.path(), "tunnel");
    let remote = spawn_tls_echo(&remote_id).await;

    let config = TunnelConfig::new("tls", "127.0.0.1:0", remote.to_string())
        .with_tls(&tunnel_id.combined)
        .with_insecure_skip_verify();
    let tunnel = Arc::new(Tunnel::new(config));
    let handle = tunnel.start().await.unwrap();
    let addr = tunnel.local_addr().unwrap();

    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(b"ping\r\n\r\n").await.unwrap();
    let mut buf = Vec::new();
    let _ = tokio::time::timeout(STEP, client.read_to_end(&mut buf))
        .await
        .unwrap();
    assert!(!buf.windows(4).any(|w| w == b"ping"));

    // the tunnel keeps serving TLS clients
    let reply = tokio::time::timeout(STEP, tls_ping(addr, &tunnel_id))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&reply, b"ping");

    tunnel.shutdown().await;
    handle.await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_missing_certificate_fails_startup() {
    init();
    let dir = tempfile::tempdir().unwrap();
    let config = TunnelConfig::new("nocert", "127.0.0.1:0", "127.0.0.1:443")
        .with_tls(dir.path().join("server.crt"));
    let tunnel = Tunnel::new(config);

    let err = tunnel.listen().await.unwrap_err();
    assert!(matches!(err, TunnelError::Transport(_)), "unexpected: {err}");
    assert_eq!(tunnel.state(), TunnelState::Idle);
    assert!(tunnel.local_addr().is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_tls_remote_without_server_name_fails_startup() {
    init();
    let dir = tempfile::tempdir().unwrap();
    let remote_id = write_identity(dir.path(), "remote");
    let tunnel_id = write_identity(dir.path(), "tunnel");
    let remote = spawn_tls_echo(&remote_id).await;

    // ":port" resolves to 0.0.0.0 but leaves nothing to put in SNI
    let config = TunnelConfig::new("noname", "127.0.0.1:0", format!(":{}", remote.port()))
        .with_tls(&tunnel_id.combined)
        .with_insecure_skip_verify();
    let tunnel = Tunnel::new(config);

    let err = tunnel.listen().await.unwrap_err();
    assert!(matches!(err, TunnelError::InvalidConfig(_)), "unexpected: {err}");
    assert_eq!(tunnel.state(), TunnelState::Idle);
    assert!(tunnel.local_addr().is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_idle_client_is_dropped_after_handshake_timeout() {
    init();
    let dir = tempfile::tempdir().unwrap();
    let remote_id = write_identity(dir.path(), "remote");
    let tunnel_id = write_identity(dir.path(), "tunnel");
    let remote = spawn_tls_echo(&remote_id).await;

    let config = TunnelConfig::new("slow", "127.0.0.1:0", remote.to_string())
        .with_tls(&tunnel_id.combined)
        .with_insecure_skip_verify()
        .with_handshake_timeout(Duration::from_millis(200));
    let tunnel = Arc::new(Tunnel::new(config));
    let handle = tunnel.start().await.unwrap();
    let addr = tunnel.local_addr().unwrap();

    // connect and never send a ClientHello
    let mut client = TcpStream::connect(addr).await.unwrap();
    let started = tokio::time::Instant::now();
    let mut buf = Vec::new();
    let _ = tokio::time::timeout(STEP, client.read_to_end(&mut buf))
        .await
        .unwrap();
    assert!(buf.is_empty());
    assert!(started.elapsed() < STEP);

    // the socket closes before the failure is counted
    tokio::time::timeout(STEP, async {
        while tunnel.stats().failed == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    let stats = tunnel.stats();
    assert_eq!(stats.accepted, 1);
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.completed, 0);

    tunnel.shutdown().await;
    handle.await.unwrap();
}
