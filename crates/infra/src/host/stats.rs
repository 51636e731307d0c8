use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use serde::Serialize;

/// Runtime counters of one host.
#[derive(Debug)]
pub struct HostStats {
    started_at: Instant,
    events_received: AtomicU64,
    messages_dispatched: AtomicU64,
    messages_dropped: AtomicU64,
    handler_failures: AtomicU64,
    checkpoints_written: AtomicU64,
    checkpoint_failures: AtomicU64,
    reconnects: AtomicU64,
    restarts: AtomicU64,
}

/// Point-in-time copy of [`HostStats`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HostStatsSnapshot {
    pub events_received: u64,
    pub messages_dispatched: u64,
    pub messages_dropped: u64,
    pub handler_failures: u64,
    pub checkpoints_written: u64,
    pub checkpoint_failures: u64,
    pub reconnects: u64,
    pub restarts: u64,
    pub uptime_secs: u64,
}

impl HostStats {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            events_received: AtomicU64::new(0),
            messages_dispatched: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
            handler_failures: AtomicU64::new(0),
            checkpoints_written: AtomicU64::new(0),
            checkpoint_failures: AtomicU64::new(0),
            reconnects: AtomicU64::new(0),
            restarts: AtomicU64::new(0),
        }
    }

    pub fn snapshot(&self) -> HostStatsSnapshot {
        HostStatsSnapshot {
            events_received: self.events_received.load(Ordering::Relaxed),
            messages_dispatched: self.messages_dispatched.load(Ordering::Relaxed),
            messages_dropped: self.messages_dropped.load(Ordering::Relaxed),
            handler_failures: self.handler_failures.load(Ordering::Relaxed),
            checkpoints_written: self.checkpoints_written.load(Ordering::Relaxed),
            checkpoint_failures: self.checkpoint_failures.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            restarts: self.restarts.load(Ordering::Relaxed),
            uptime_secs: self.started_at.elapsed().as_secs(),
        }
    }

    pub(crate) fn record_received(&self) {
        self.events_received.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_dispatched(&self) {
        self.messages_dispatched.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_dropped(&self) {
        self.messages_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_handler_failure(&self) {
        self.handler_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_checkpoint(&self) {
        self.checkpoints_written.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_checkpoint_failure(&self) {
        self.checkpoint_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_restart(&self) {
        self.restarts.fetch_add(1, Ordering::Relaxed);
    }
}

impl Default for HostStats {
    fn default() -> Self {
        Self::new()
    }
}
