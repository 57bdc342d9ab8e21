//! tcp-tunnel CLI
//!
//! Relays TCP connections from a local address to a remote address, with
//! optional TLS on both legs.

mod project_config;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tcp_tunnel_relay::{TlsVersion, Tunnel, TunnelConfig};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use project_config::{ProjectConfig, DEFAULT_CONFIG_FILE};

/// tcp-tunnel - Relay TCP connections, optionally over TLS
#[derive(Parser, Debug)]
#[command(name = "tcp-tunnel")]
#[command(about = "Relay TCP connections from a local address to a remote address")]
#[command(version)]
#[command(long_version = concat!(env!("GIT_TAG"), "\nCommit: ", env!("GIT_HASH"), "\nBuilt: ", env!("BUILD_TIME")))]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a single tunnel
    #[command(long_about = r#"
Listen on a local address and relay every connection to a remote address.

EXAMPLES:
  # Plain TCP relay to a database
  tcp-tunnel run --local 127.0.0.1:5433 --remote db.internal:5432

  # Terminate TLS locally and open TLS to the remote
  tcp-tunnel run --local :8443 --remote api.internal:443 --tls --cert server.crt

ENVIRONMENT VARIABLES:
  TCP_TUNNEL_LOCAL            Local address to listen on
  TCP_TUNNEL_REMOTE           Remote address to relay to
  TCP_TUNNEL_TLS              Enable TLS on both legs
  TCP_TUNNEL_CERT             Combined certificate + key PEM file
    "#)]
    Run {
        /// Name used in logs
        #[arg(long, env = "TCP_TUNNEL_NAME", default_value = "tunnel")]
        name: String,

        /// Local address to listen on (e.g., 127.0.0.1:5433 or :5433)
        #[arg(short, long, env = "TCP_TUNNEL_LOCAL")]
        local: String,

        /// Remote address to relay to (e.g., db.internal:5432)
        #[arg(short, long, env = "TCP_TUNNEL_REMOTE")]
        remote: String,

        /// Terminate TLS from clients and use TLS towards the remote
        #[arg(long, env = "TCP_TUNNEL_TLS")]
        tls: bool,

        /// Skip remote certificate verification (insecure, for development only)
        #[arg(long, env = "TCP_TUNNEL_INSECURE")]
        insecure: bool,

        /// Combined certificate + key PEM presented to TLS clients
        #[arg(long, env = "TCP_TUNNEL_CERT", default_value = tcp_tunnel_cert::DEFAULT_CERT_PATH)]
        cert: PathBuf,

        /// Additional CA certificates trusted for the remote
        #[arg(long, env = "TCP_TUNNEL_CA_CERT")]
        ca_cert: Option<PathBuf>,

        /// Minimum TLS version (1.2 or 1.3)
        #[arg(long, env = "TCP_TUNNEL_MIN_TLS_VERSION", default_value = "1.2")]
        min_tls_version: String,

        /// Remote connect timeout in seconds
        #[arg(long, env = "TCP_TUNNEL_CONNECT_TIMEOUT", default_value = "60")]
        connect_timeout: u64,

        /// TLS handshake timeout in seconds
        #[arg(long, env = "TCP_TUNNEL_HANDSHAKE_TIMEOUT", default_value = "30")]
        handshake_timeout: u64,
    },

    /// Run every enabled tunnel from a tunnels file
    Up {
        /// Tunnels file
        #[arg(short, long, env = "TCP_TUNNEL_CONFIG", default_value = DEFAULT_CONFIG_FILE)]
        config: PathBuf,

        /// Write a starter tunnels file and exit
        #[arg(long)]
        init: bool,
    },

    /// Generate a self-signed certificate for the TLS listener
    GenerateCert {
        /// Output file (certificate followed by private key)
        #[arg(short, long, default_value = tcp_tunnel_cert::DEFAULT_CERT_PATH)]
        out: PathBuf,

        /// Subject alternative names (defaults to localhost, 127.0.0.1, ::1)
        #[arg(short, long = "domain")]
        domains: Vec<String>,
    },
}

/// Setup logging with the specified log level
///
/// `RUST_LOG` takes precedence over `--verbose`.
fn setup_logging(verbose: bool) {
    let log_level = if verbose { "debug" } else { "info" };

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose);

    // One provider for every TLS config in the process
    let _ = rustls::crypto::ring::default_provider().install_default();

    match cli.command {
        Commands::Run {
            name,
            local,
            remote,
            tls,
            insecure,
            cert,
            ca_cert,
            min_tls_version,
            connect_timeout,
            handshake_timeout,
        } => {
            let min_tls_version: TlsVersion = min_tls_version
                .parse()
                .context("Invalid --min-tls-version")?;

            let mut config = TunnelConfig::new(name, local, remote)
                .with_min_tls_version(min_tls_version)
                .with_connect_timeout(Duration::from_secs(connect_timeout))
                .with_handshake_timeout(Duration::from_secs(handshake_timeout));
            config.cert_path = cert;
            config.tls = tls;
            config.insecure_skip_verify = insecure;
            if let Some(ca) = ca_cert {
                config = config.with_ca_cert(ca);
            }

            run_tunnels(vec![config]).await
        }

        Commands::Up { config, init } => {
            if init {
                if config.exists() {
                    anyhow::bail!("{:?} already exists", config);
                }
                std::fs::write(&config, ProjectConfig::template())
                    .with_context(|| format!("Failed to write {:?}", config))?;
                info!("Wrote {:?}", config);
                return Ok(());
            }

            let project = ProjectConfig::load(&config)?;
            let configs = project
                .enabled_tunnels()
                .into_iter()
                .map(|t| t.to_tunnel_config(&project.defaults))
                .collect::<Result<Vec<_>>>()?;

            if configs.is_empty() {
                anyhow::bail!("No enabled tunnels in {:?}", config);
            }

            info!("Loaded {} tunnel(s) from {:?}", configs.len(), config);
            run_tunnels(configs).await
        }

        Commands::GenerateCert { out, domains } => {
            let cert = if domains.is_empty() {
                tcp_tunnel_cert::generate_self_signed_cert()
            } else {
                tcp_tunnel_cert::generate_self_signed_cert_with_domains(&domains[..])
            }
            .context("Failed to generate certificate")?;

            cert.save_combined(&out)
                .with_context(|| format!("Failed to write {:?}", out))?;
            info!("Wrote self-signed certificate and key to {:?}", out);
            Ok(())
        }
    }
}

/// Start every tunnel, then run until interrupted
///
/// If any tunnel fails to start, the ones already running are shut down and
/// the error is returned.
async fn run_tunnels(configs: Vec<TunnelConfig>) -> Result<()> {
    let mut running: Vec<(Arc<Tunnel>, JoinHandle<()>)> = Vec::with_capacity(configs.len());

    for config in configs {
        if config.tls && config.insecure_skip_verify {
            warn!(
                "⚠️  Certificate verification disabled for tunnel '{}' (insecure mode)",
                config.name
            );
        }

        let tunnel = Arc::new(Tunnel::new(config));
        match tunnel.start().await {
            Ok(handle) => running.push((tunnel, handle)),
            Err(e) => {
                error!("Failed to start tunnel '{}': {}", tunnel.name(), e);
                stop_all(running).await;
                return Err(e).with_context(|| format!("Tunnel '{}' did not start", tunnel.name()));
            }
        }
    }

    wait_for_signal().await;
    info!("Shutting down...");
    stop_all(running).await;
    info!("tcp-tunnel stopped");
    Ok(())
}

async fn stop_all(running: Vec<(Arc<Tunnel>, JoinHandle<()>)>) {
    for (tunnel, _) in &running {
        tunnel.shutdown().await;
    }
    for (tunnel, handle) in running {
        if let Err(e) = handle.await {
            error!("Tunnel '{}' task failed: {}", tunnel.name(), e);
        }
        let stats = tunnel.stats();
        info!(
            accepted = stats.accepted,
            completed = stats.completed,
            failed = stats.failed,
            bytes_up = stats.bytes_upstream,
            bytes_down = stats.bytes_downstream,
            "Tunnel '{}' summary",
            tunnel.name()
        );
    }
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            warn!("Failed to install SIGTERM handler: {}", e);
            let _ = tokio::signal::ctrl_c().await;
            info!("Received Ctrl+C");
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Received Ctrl+C"),
        _ = terminate.recv() => info!("Received SIGTERM"),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("Received Ctrl+C");
}
