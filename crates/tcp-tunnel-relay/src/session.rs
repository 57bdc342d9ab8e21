//! Relay sessions
//!
//! One session per accepted connection: complete the inbound handshake, dial
//! the remote, then copy bytes both ways until either direction finishes.
//! Whatever happens stays inside the session; the accept loop never hears
//! about it.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tcp_tunnel_transport::{BoxedStream, Transport};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::resolve::ResolvedAddress;
use crate::stats::TunnelStats;

const COPY_BUFFER_SIZE: usize = 16 * 1024;

/// Upper bound on flushing a close (TLS close_notify, TCP FIN)
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Everything a session needs from its tunnel
pub(crate) struct SessionContext {
    pub tunnel: String,
    pub local_addr: SocketAddr,
    pub remote: ResolvedAddress,
    pub transport: Arc<dyn Transport>,
    pub stats: Arc<TunnelStats>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Direction {
    /// local client → remote
    Upstream,
    /// remote → local client
    Downstream,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Upstream => write!(f, "local->remote"),
            Direction::Downstream => write!(f, "remote->local"),
        }
    }
}

/// How a splice ended
pub(crate) struct SpliceOutcome {
    /// Direction that finished first and ended the session
    pub first: Direction,
    /// Its terminal result; `Ok` means a clean EOF
    pub result: io::Result<()>,
    pub bytes_upstream: u64,
    pub bytes_downstream: u64,
}

/// Run one session to completion
pub(crate) async fn serve(ctx: Arc<SessionContext>, stream: TcpStream, peer: SocketAddr) {
    let port = peer.port();
    let _active = ctx.stats.open_session();

    let local = match ctx.transport.accept(stream, peer).await {
        Ok(local) => local,
        Err(e) => {
            warn!(tunnel = %ctx.tunnel, port, "Rejected connection from {}: {}", peer, e);
            ctx.stats.record_failed();
            return;
        }
    };

    let remote = match ctx.transport.dial(ctx.remote.addr, &ctx.remote.host).await {
        Ok(remote) => remote,
        Err(e) => {
            warn!(
                tunnel = %ctx.tunnel,
                port,
                "Failed to reach remote {}: {}",
                ctx.remote, e
            );
            ctx.stats.record_failed();
            return;
        }
    };

    info!(
        tunnel = %ctx.tunnel,
        port,
        "Connection established ({} -> {})",
        ctx.local_addr, ctx.remote
    );

    let started = Instant::now();
    let outcome = splice(local, remote).await;
    ctx.stats
        .record_bytes(outcome.bytes_upstream, outcome.bytes_downstream);

    match outcome.result {
        Ok(()) => {
            ctx.stats.record_completed();
            info!(
                tunnel = %ctx.tunnel,
                port,
                bytes_up = outcome.bytes_upstream,
                bytes_down = outcome.bytes_downstream,
                duration_ms = started.elapsed().as_millis() as u64,
                "Connection closed ({} -> {})",
                ctx.local_addr, ctx.remote
            );
        }
        Err(e) => {
            ctx.stats.record_failed();
            warn!(
                tunnel = %ctx.tunnel,
                port,
                direction = %outcome.first,
                bytes_up = outcome.bytes_upstream,
                bytes_down = outcome.bytes_downstream,
                "Connection failed: {}",
                e
            );
        }
    }
}

/// Copy bytes between `local` and `remote` until one direction ends
///
/// Each direction runs in its own task and reports its terminal result into
/// a channel with room for both. The first report decides the outcome; the
/// other copy is cancelled, both streams are reassembled and each is shut
/// down once.
pub(crate) async fn splice(local: BoxedStream, remote: BoxedStream) -> SpliceOutcome {
    let (local_read, local_write) = tokio::io::split(local);
    let (remote_read, remote_write) = tokio::io::split(remote);

    let upstream_bytes = Arc::new(AtomicU64::new(0));
    let downstream_bytes = Arc::new(AtomicU64::new(0));
    let cancel = CancellationToken::new();
    let (done_tx, mut done_rx) = mpsc::channel(2);

    let upstream = tokio::spawn(copy_half(
        local_read,
        remote_write,
        Direction::Upstream,
        upstream_bytes.clone(),
        done_tx.clone(),
        cancel.clone(),
    ));
    let downstream = tokio::spawn(copy_half(
        remote_read,
        local_write,
        Direction::Downstream,
        downstream_bytes.clone(),
        done_tx,
        cancel.clone(),
    ));

    let (first, result) = done_rx.recv().await.unwrap_or_else(|| {
        // both senders gone without a report: the copy tasks panicked
        (
            Direction::Upstream,
            Err(io::Error::new(io::ErrorKind::Other, "relay task aborted")),
        )
    });
    debug!("Session ended by {} ({:?})", first, result);

    cancel.cancel();
    let (upstream, downstream) = tokio::join!(upstream, downstream);

    if let (Ok((local_read, remote_write)), Ok((remote_read, local_write))) =
        (upstream, downstream)
    {
        let local = local_read.unsplit(local_write);
        let remote = remote_read.unsplit(remote_write);
        tokio::join!(close(local), close(remote));
    }

    SpliceOutcome {
        first,
        result,
        bytes_upstream: upstream_bytes.load(Ordering::Relaxed),
        bytes_downstream: downstream_bytes.load(Ordering::Relaxed),
    }
}

type DirectionResult = (Direction, io::Result<()>);

/// One direction of a splice; hands its halves back when done
async fn copy_half(
    mut reader: ReadHalf<BoxedStream>,
    mut writer: WriteHalf<BoxedStream>,
    direction: Direction,
    counter: Arc<AtomicU64>,
    done: mpsc::Sender<DirectionResult>,
    cancel: CancellationToken,
) -> (ReadHalf<BoxedStream>, WriteHalf<BoxedStream>) {
    let result = tokio::select! {
        result = copy_until_eof(&mut reader, &mut writer, &counter) => Some(result),
        _ = cancel.cancelled() => None,
    };

    if let Some(result) = result {
        let _ = done.send((direction, result)).await;
    }

    (reader, writer)
}

async fn copy_until_eof<R, W>(reader: &mut R, writer: &mut W, counter: &AtomicU64) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buffer = vec![0u8; COPY_BUFFER_SIZE];
    loop {
        let n = reader.read(&mut buffer).await?;
        if n == 0 {
            return Ok(());
        }
        writer.write_all(&buffer[..n]).await?;
        writer.flush().await?;
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }
}

async fn close(mut stream: BoxedStream) {
    match tokio::time::timeout(CLOSE_TIMEOUT, stream.shutdown()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!("Error while closing stream: {}", e),
        Err(_) => debug!("Timed out closing stream"),
    }
}
