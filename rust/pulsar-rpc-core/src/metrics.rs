use std::sync::atomic::{AtomicU64, Ordering};

/// Counters shared by a channel or dispatcher and all of its calls.
#[derive(Debug, Default)]
pub struct RpcMetrics {
    envelopes_sent: AtomicU64,
    envelopes_received: AtomicU64,
    /// Unknown correlation id or already-terminal call.
    unroutable: AtomicU64,
    /// Sequence number already consumed.
    duplicates: AtomicU64,
    /// Payload was not a valid envelope.
    malformed: AtomicU64,
    calls_started: AtomicU64,
    calls_completed: AtomicU64,
    calls_cancelled: AtomicU64,
    calls_failed: AtomicU64,
}

/// Non-atomic snapshot of [`RpcMetrics`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RpcMetricsSnapshot {
    pub envelopes_sent: u64,
    pub envelopes_received: u64,
    pub unroutable: u64,
    pub duplicates: u64,
    pub malformed: u64,
    pub calls_started: u64,
    pub calls_completed: u64,
    pub calls_cancelled: u64,
    pub calls_failed: u64,
}

impl RpcMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_sent(&self) {
        self.envelopes_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_received(&self) {
        self.envelopes_received.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_unroutable(&self) {
        self.unroutable.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_duplicate(&self) {
        self.duplicates.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_malformed(&self) {
        self.malformed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_call_started(&self) {
        self.calls_started.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_call_completed(&self) {
        self.calls_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_call_cancelled(&self) {
        self.calls_cancelled.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_call_failed(&self) {
        self.calls_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> RpcMetricsSnapshot {
        RpcMetricsSnapshot {
            envelopes_sent: self.envelopes_sent.load(Ordering::Relaxed),
            envelopes_received: self.envelopes_received.load(Ordering::Relaxed),
            unroutable: self.unroutable.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            calls_started: self.calls_started.load(Ordering::Relaxed),
            calls_completed: self.calls_completed.load(Ordering::Relaxed),
            calls_cancelled: self.calls_cancelled.load(Ordering::Relaxed),
            calls_failed: self.calls_failed.load(Ordering::Relaxed),
        }
    }
}
