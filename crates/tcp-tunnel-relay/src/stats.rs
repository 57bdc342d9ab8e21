//! Per-tunnel session counters

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct TunnelStats {
    accepted: AtomicU64,
    active: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    bytes_upstream: AtomicU64,
    bytes_downstream: AtomicU64,
}

/// Point-in-time copy of [`TunnelStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TunnelStatsSnapshot {
    /// Connections accepted by the listener
    pub accepted: u64,
    /// Sessions currently open
    pub active: u64,
    /// Sessions that ended on a clean EOF
    pub completed: u64,
    /// Sessions aborted by a handshake, dial or I/O error
    pub failed: u64,
    /// Bytes copied from local clients to the remote
    pub bytes_upstream: u64,
    /// Bytes copied from the remote back to local clients
    pub bytes_downstream: u64,
}

impl TunnelStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_accept(&self) {
        self.accepted.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a session as open until the returned guard is dropped
    pub(crate) fn open_session(&self) -> ActiveSession<'_> {
        self.active.fetch_add(1, Ordering::Relaxed);
        ActiveSession { stats: self }
    }

    pub(crate) fn record_completed(&self) {
        self.completed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_bytes(&self, upstream: u64, downstream: u64) {
        self.bytes_upstream.fetch_add(upstream, Ordering::Relaxed);
        self.bytes_downstream.fetch_add(downstream, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> TunnelStatsSnapshot {
        TunnelStatsSnapshot {
            accepted: self.accepted.load(Ordering::Relaxed),
            active: self.active.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            bytes_upstream: self.bytes_upstream.load(Ordering::Relaxed),
            bytes_downstream: self.bytes_downstream.load(Ordering::Relaxed),
        }
    }
}

pub(crate) struct ActiveSession<'a> {
    stats: &'a TunnelStats,
}

impl Drop for ActiveSession<'_> {
    fn drop(&mut self) {
        self.stats.active.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_active_guard() {
        let stats = TunnelStats::new();
        {
            let _a = stats.open_session();
            let _b = stats.open_session();
            assert_eq!(stats.snapshot().active, 2);
        }
        assert_eq!(stats.snapshot().active, 0);
    }

    #[test]
    fn test_counters() {
        let stats = TunnelStats::new();
        stats.record_accept();
        stats.record_accept();
        stats.record_completed();
        stats.record_failed();
        stats.record_bytes(10, 4);
        stats.record_bytes(1, 0);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.accepted, 2);
        assert_eq!(snapshot.completed, 1);
        assert_eq!(snapshot.failed, 1);
        assert_eq!(snapshot.bytes_upstream, 11);
        assert_eq!(snapshot.bytes_downstream, 4);
    }
}
