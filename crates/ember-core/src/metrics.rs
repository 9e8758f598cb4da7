// src/metrics.rs
use std::sync::atomic::{AtomicUsize, Ordering};

/// Process-wide counters shared by the dispatch thread and every worker.
///
/// `live_conns` doubles as the admission-control count: the reactor refuses
/// new accepts once it reaches the configured ceiling.
#[repr(C, align(64))]
pub struct ServerStats {
    pub live_conns: AtomicUsize,
    pub req_count: AtomicUsize,
    pub bytes_sent: AtomicUsize,
    pub overlapping_tasks: AtomicUsize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub live_conns: usize,
    pub req_count: usize,
    pub bytes_sent: usize,
    pub overlapping_tasks: usize,
}

impl ServerStats {
    pub fn new() -> Self {
        Self {
            live_conns: AtomicUsize::new(0),
            req_count: AtomicUsize::new(0),
            bytes_sent: AtomicUsize::new(0),
            overlapping_tasks: AtomicUsize::new(0),
        }
    }

    pub fn inc_conn(&self) -> usize {
        self.live_conns.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn dec_conn(&self) -> usize {
        self.live_conns.fetch_sub(1, Ordering::AcqRel) - 1
    }

    pub fn live(&self) -> usize {
        self.live_conns.load(Ordering::Acquire)
    }

    pub fn inc_req(&self) {
        self.req_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_bytes(&self, bytes: usize) {
        self.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
    }

    /// A worker found another task already holding its connection.
    pub fn inc_overlap(&self) {
        self.overlapping_tasks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            live_conns: self.live_conns.load(Ordering::Relaxed),
            req_count: self.req_count.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            overlapping_tasks: self.overlapping_tasks.load(Ordering::Relaxed),
        }
    }
}

impl Default for ServerStats {
    fn default() -> Self {
        Self::new()
    }
}
