//! Atomic counters for junction observability.
//!
//! One [`Metrics`] instance lives in the [`crate::context::JunctionContext`]
//! and is shared by reference; there is no process-global instance.
//! Call [`Metrics::flush`] at natural boundaries to emit the current values
//! as a single `tracing::info!` event.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

#[derive(Debug, Default)]
pub struct Metrics {
    signals_captured: AtomicU64,
    runs_published: AtomicU64,
    runs_rejected: AtomicU64,
    runs_failed: AtomicU64,
    duplicates_rejected: AtomicU64,
    messages_delivered: AtomicU64,
    messages_dropped: AtomicU64,
    sessions_finalized: AtomicU64,
    cache_hits: AtomicU64,
    worker_restarts: AtomicU64,
}

/// Point-in-time copy of every counter.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub signals_captured: u64,
    pub runs_published: u64,
    pub runs_rejected: u64,
    pub runs_failed: u64,
    pub duplicates_rejected: u64,
    pub messages_delivered: u64,
    pub messages_dropped: u64,
    pub sessions_finalized: u64,
    pub cache_hits: u64,
    pub worker_restarts: u64,
}

macro_rules! counter {
    ($inc:ident, $get:ident, $field:ident) => {
        pub fn $inc(&self) {
            self.$field.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(metric = stringify!($field), "counter incremented");
        }

        pub fn $get(&self) -> u64 {
            self.$field.load(Ordering::Relaxed)
        }
    };
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    counter!(inc_signals_captured, signals_captured, signals_captured);
    counter!(inc_runs_published, runs_published, runs_published);
    counter!(inc_runs_rejected, runs_rejected, runs_rejected);
    counter!(inc_runs_failed, runs_failed, runs_failed);
    counter!(inc_duplicates_rejected, duplicates_rejected, duplicates_rejected);
    counter!(inc_messages_delivered, messages_delivered, messages_delivered);
    counter!(inc_messages_dropped, messages_dropped, messages_dropped);
    counter!(inc_sessions_finalized, sessions_finalized, sessions_finalized);
    counter!(inc_cache_hits, cache_hits, cache_hits);
    counter!(inc_worker_restarts, worker_restarts, worker_restarts);

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            signals_captured: self.signals_captured(),
            runs_published: self.runs_published(),
            runs_rejected: self.runs_rejected(),
            runs_failed: self.runs_failed(),
            duplicates_rejected: self.duplicates_rejected(),
            messages_delivered: self.messages_delivered(),
            messages_dropped: self.messages_dropped(),
            sessions_finalized: self.sessions_finalized(),
            cache_hits: self.cache_hits(),
            worker_restarts: self.worker_restarts(),
        }
    }

    /// Emit all current counter values as a single `info!` event.
    pub fn flush(&self) {
        let s = self.snapshot();
        tracing::info!(
            metric = "flush",
            signals_captured = s.signals_captured,
            runs_published = s.runs_published,
            runs_rejected = s.runs_rejected,
            runs_failed = s.runs_failed,
            duplicates_rejected = s.duplicates_rejected,
            messages_delivered = s.messages_delivered,
            messages_dropped = s.messages_dropped,
            sessions_finalized = s.sessions_finalized,
            cache_hits = s.cache_hits,
            worker_restarts = s.worker_restarts,
        );
    }
}
