//! Tunnel lifecycle
//!
//! ```text
//!   Idle ──listen──> Listening ──shutdown──> Stopping ──> Stopped
//!    ↑                                                      │
//!    └───────────────────── listen again ───────────────────┘
//! ```
//!
//! `listen` resolves both endpoints, builds the transport and binds the local
//! socket before it reports anything; a failure at any of those steps leaves
//! the tunnel where it was. Once listening, the accept loop runs until
//! `shutdown` cancels it. Sessions already in flight are left to finish on
//! their own.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tcp_tunnel_transport::{build_transport, validate_server_name, TransportError};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::TunnelConfig;
use crate::error::{Endpoint, TunnelError};
use crate::resolve::resolve;
use crate::session::{self, SessionContext};
use crate::stats::{TunnelStats, TunnelStatsSnapshot};

/// Pause after a failed `accept()` before trying again
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    Idle,
    Listening,
    Stopping,
    Stopped,
}

impl std::fmt::Display for TunnelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TunnelState::Idle => write!(f, "idle"),
            TunnelState::Listening => write!(f, "listening"),
            TunnelState::Stopping => write!(f, "stopping"),
            TunnelState::Stopped => write!(f, "stopped"),
        }
    }
}

struct Lifecycle {
    state: watch::Sender<TunnelState>,
    /// Present exactly while the accept loop is running
    stop: Mutex<Option<CancellationToken>>,
}

/// Marks the tunnel stopped when the accept loop goes away, however it ends
struct StoppedOnDrop(Arc<Lifecycle>);

impl Drop for StoppedOnDrop {
    fn drop(&mut self) {
        self.0
            .stop
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.0.state.send_replace(TunnelState::Stopped);
    }
}

/// A bound tunnel that has not started accepting yet
struct Prepared {
    listener: TcpListener,
    context: Arc<SessionContext>,
    stop: CancellationToken,
    stopped: StoppedOnDrop,
}

/// A TCP relay from one local address to one remote address
///
/// ```ignore
/// let tunnel = Arc::new(Tunnel::new(TunnelConfig::new("db", "127.0.0.1:5433", "db.internal:5432")));
/// let handle = tunnel.start().await?;
/// // ...
/// tunnel.shutdown().await;
/// handle.await?;
/// ```
pub struct Tunnel {
    config: TunnelConfig,
    lifecycle: Arc<Lifecycle>,
    local_addr: Mutex<Option<SocketAddr>>,
    stats: Arc<TunnelStats>,
}

impl std::fmt::Debug for Tunnel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tunnel")
            .field("name", &self.config.name)
            .field("local_address", &self.config.local_address)
            .field("remote_address", &self.config.remote_address)
            .field("tls", &self.config.tls)
            .field("state", &self.state())
            .finish()
    }
}

impl Tunnel {
    pub fn new(config: TunnelConfig) -> Self {
        let (state, _) = watch::channel(TunnelState::Idle);
        Self {
            config,
            lifecycle: Arc::new(Lifecycle {
                state,
                stop: Mutex::new(None),
            }),
            local_addr: Mutex::new(None),
            stats: Arc::new(TunnelStats::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn state(&self) -> TunnelState {
        *self.lifecycle.state.borrow()
    }

    /// Watch state transitions
    pub fn subscribe(&self) -> watch::Receiver<TunnelState> {
        self.lifecycle.state.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.state() == TunnelState::Listening
    }

    /// Address the listener is bound to, once it has been bound
    ///
    /// Differs from the configured address when port 0 was requested.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn stats(&self) -> TunnelStatsSnapshot {
        self.stats.snapshot()
    }

    /// Bind the local address and relay connections until [`shutdown`](Self::shutdown)
    ///
    /// Returns an error without accepting anything if the configuration is
    /// invalid, an endpoint does not resolve, the certificate cannot be loaded
    /// or the local address cannot be bound. Otherwise returns `Ok(())` once
    /// the tunnel has been shut down.
    pub async fn listen(&self) -> Result<(), TunnelError> {
        let prepared = self.prepare().await?;
        self.serve(prepared).await;
        Ok(())
    }

    /// Bind the tunnel and run its accept loop in the background
    ///
    /// Startup errors are returned directly; the handle completes after
    /// shutdown.
    pub async fn start(self: &Arc<Self>) -> Result<JoinHandle<()>, TunnelError> {
        let prepared = self.prepare().await?;
        let tunnel = Arc::clone(self);
        Ok(tokio::spawn(async move { tunnel.serve(prepared).await }))
    }

    /// Stop accepting new connections and release the local address
    ///
    /// Waits until the listener is closed. Sessions already established keep
    /// running. Calling this on a tunnel that is not listening does nothing.
    pub async fn shutdown(&self) {
        let mut state = self.lifecycle.state.subscribe();

        let token = {
            let mut stop = self
                .lifecycle
                .stop
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if *self.lifecycle.state.borrow() == TunnelState::Listening {
                self.lifecycle.state.send_replace(TunnelState::Stopping);
                stop.take()
            } else {
                None
            }
        };

        let Some(token) = token else {
            debug!(
                "Shutdown of tunnel '{}' ignored (state: {})",
                self.config.name,
                self.state()
            );
            return;
        };

        info!("Stopping tunnel '{}'", self.config.name);
        token.cancel();

        if state
            .wait_for(|s| *s == TunnelState::Stopped)
            .await
            .is_err()
        {
            warn!("Tunnel '{}' state channel closed", self.config.name);
        }
    }

    async fn prepare(&self) -> Result<Prepared, TunnelError> {
        let name = self.config.name.clone();
        if matches!(
            self.state(),
            TunnelState::Listening | TunnelState::Stopping
        ) {
            return Err(TunnelError::AlreadyRunning { name });
        }

        self.config.validate()?;

        let local = resolve(&self.config.local_address)
            .await
            .map_err(|source| TunnelError::Resolve {
                endpoint: Endpoint::Local,
                source,
            })?;
        let remote = resolve(&self.config.remote_address)
            .await
            .map_err(|source| TunnelError::Resolve {
                endpoint: Endpoint::Remote,
                source,
            })?;
        if remote.port == 0 {
            return Err(TunnelError::InvalidConfig(format!(
                "remote address {:?} must have a non-zero port",
                self.config.remote_address
            )));
        }
        if self.config.tls {
            validate_server_name(&remote.host).map_err(|e| {
                TunnelError::InvalidConfig(format!(
                    "remote address {:?} cannot be used for TLS: {}",
                    self.config.remote_address, e
                ))
            })?;
        }

        let transport = build_transport(&self.config.transport_options())?;
        let listener = transport.listen(local.addr).await?;
        let local_addr = listener.local_addr().map_err(TransportError::IoError)?;

        let stop = CancellationToken::new();
        {
            let mut slot = self
                .lifecycle
                .stop
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            let busy = matches!(
                *self.lifecycle.state.borrow(),
                TunnelState::Listening | TunnelState::Stopping
            );
            if busy || slot.is_some() {
                return Err(TunnelError::AlreadyRunning { name });
            }
            *slot = Some(stop.clone());
            self.lifecycle.state.send_replace(TunnelState::Listening);
        }
        *self.local_addr.lock().unwrap_or_else(PoisonError::into_inner) = Some(local_addr);

        let context = Arc::new(SessionContext {
            tunnel: name,
            local_addr,
            remote,
            transport,
            stats: Arc::clone(&self.stats),
        });

        Ok(Prepared {
            listener,
            context,
            stop,
            stopped: StoppedOnDrop(Arc::clone(&self.lifecycle)),
        })
    }

    async fn serve(&self, prepared: Prepared) {
        let Prepared {
            listener,
            context,
            stop,
            stopped,
        } = prepared;

        info!(
            "Starting tunnel '{}' on {} -> {} (TLS: {}, insecure: {})",
            self.config.name,
            context.local_addr,
            context.remote,
            self.config.tls,
            self.config.insecure_skip_verify
        );

        accept_loop(listener, context, &stop).await;

        let stats = self.stats.snapshot();
        info!(
            accepted = stats.accepted,
            active = stats.active,
            failed = stats.failed,
            "Tunnel '{}' stopped",
            self.config.name
        );
        drop(stopped);
    }
}

async fn accept_loop(listener: TcpListener, context: Arc<SessionContext>, stop: &CancellationToken) {
    loop {
        tokio::select! {
            biased;

            _ = stop.cancelled() => {
                debug!("Accept loop for '{}' cancelled", context.tunnel);
                break;
            }

            result = listener.accept() => {
                match result {
                    Ok((stream, peer)) => {
                        debug!(tunnel = %context.tunnel, port = peer.port(), "Accepted connection from {}", peer);
                        context.stats.record_accept();
                        tokio::spawn(session::serve(Arc::clone(&context), stream, peer));
                    }
                    Err(e) => {
                        if stop.is_cancelled() {
                            break;
                        }
                        warn!(tunnel = %context.tunnel, "Failed to accept connection: {}", e);
                        if !pause_after_accept_error(stop).await {
                            break;
                        }
                    }
                }
            }
        }
    }

    // closes the local socket before shutdown() returns
    drop(listener);
}

/// Wait out [`ACCEPT_ERROR_BACKOFF`] so a persistent error (EMFILE) does not
/// spin the loop. Returns false if the tunnel was stopped meanwhile.
async fn pause_after_accept_error(stop: &CancellationToken) -> bool {
    tokio::select! {
        biased;
        _ = stop.cancelled() => false,
        _ = tokio::time::sleep(ACCEPT_ERROR_BACKOFF) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_new_tunnel_is_idle() {
        let tunnel = Tunnel::new(TunnelConfig::new("t", "127.0.0.1:0", "127.0.0.1:9"));
        assert_eq!(tunnel.state(), TunnelState::Idle);
        assert!(tunnel.local_addr().is_none());
        assert!(!tunnel.is_running());
    }

    #[tokio::test]
    async fn test_shutdown_before_listen_is_noop() {
        let tunnel = Tunnel::new(TunnelConfig::new("t", "127.0.0.1:0", "127.0.0.1:9"));
        tunnel.shutdown().await;
        assert_eq!(tunnel.state(), TunnelState::Idle);
    }

    #[tokio::test]
    async fn test_invalid_local_address_fails_startup() {
        let tunnel = Tunnel::new(TunnelConfig::new("t", "not-an-address", "127.0.0.1:9"));
        let err = tunnel.listen().await.unwrap_err();
        assert!(matches!(
            err,
            TunnelError::Resolve {
                endpoint: Endpoint::Local,
                ..
            }
        ));
        assert_eq!(tunnel.state(), TunnelState::Idle);
    }

    #[tokio::test]
    async fn test_invalid_remote_address_fails_startup() {
        let tunnel = Tunnel::new(TunnelConfig::new("t", "127.0.0.1:0", "127.0.0.1:port"));
        let err = tunnel.listen().await.unwrap_err();
        assert!(matches!(
            err,
            TunnelError::Resolve {
                endpoint: Endpoint::Remote,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_remote_port_zero_rejected() {
        let tunnel = Tunnel::new(TunnelConfig::new("t", "127.0.0.1:0", "127.0.0.1:0"));
        let err = tunnel.listen().await.unwrap_err();
        assert!(matches!(err, TunnelError::InvalidConfig(_)));
    }

    #[tokio::test]
    async fn test_start_then_shutdown() {
        let tunnel = Arc::new(Tunnel::new(TunnelConfig::new(
            "t",
            "127.0.0.1:0",
            "127.0.0.1:9",
        )));
        let handle = tunnel.start().await.unwrap();
        assert_eq!(tunnel.state(), TunnelState::Listening);
        assert!(tunnel.local_addr().unwrap().port() != 0);

        let second = tunnel.start().await;
        assert!(matches!(second, Err(TunnelError::AlreadyRunning { .. })));

        tokio::time::timeout(Duration::from_secs(5), tunnel.shutdown())
            .await
            .unwrap();
        assert_eq!(tunnel.state(), TunnelState::Stopped);
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_accept_error_pause_waits_for_backoff() {
        let stop = CancellationToken::new();
        let started = tokio::time::Instant::now();

        assert!(pause_after_accept_error(&stop).await);
        assert!(started.elapsed() >= ACCEPT_ERROR_BACKOFF);
    }

    #[tokio::test(start_paused = true)]
    async fn test_accept_error_pause_ends_on_shutdown() {
        let stop = CancellationToken::new();
        let cancel = stop.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            cancel.cancel();
        });

        let started = tokio::time::Instant::now();
        assert!(!pause_after_accept_error(&stop).await);
        assert!(started.elapsed() < ACCEPT_ERROR_BACKOFF);
    }
}
