// src/metrics.rs
use std::sync::atomic::{AtomicUsize, Ordering};

/// Process-wide counters. `active_conns` doubles as the admission count.
#[repr(C, align(64))]
pub struct ServerMetrics {
    pub active_conns: AtomicUsize,
    pub req_count: AtomicUsize,
    pub bytes_sent: AtomicUsize,
    /// Tasks the loop had to hold because the queue was full.
    pub queue_retries: AtomicUsize,
    /// Connections turned away with the busy message.
    pub rejected: AtomicUsize,
    /// Connections closed by the idle sweep.
    pub evicted: AtomicUsize,
}

/// Point-in-time copy for logging and assertions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub active: usize,
    pub requests: usize,
    pub bytes: usize,
    pub queue_retries: usize,
    pub rejected: usize,
    pub evicted: usize,
}

impl ServerMetrics {
    pub fn new() -> Self {
        Self {
            active_conns: AtomicUsize::new(0),
            req_count: AtomicUsize::new(0),
            bytes_sent: AtomicUsize::new(0),
            queue_retries: AtomicUsize::new(0),
            rejected: AtomicUsize::new(0),
            evicted: AtomicUsize::new(0),
        }
    }

    pub fn inc_req(&self) {
        self.req_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_conn(&self) {
        self.active_conns.fetch_add(1, Ordering::Relaxed);
    }

    /// Saturates at zero; returns `false` if there was nothing to take.
    pub fn dec_conn(&self) -> bool {
        self.active_conns
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
            .is_ok()
    }

    pub fn add_bytes(&self, bytes: usize) {
        self.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn inc_retry(&self) {
        self.queue_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_evicted(&self) {
        self.evicted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn active(&self) -> usize {
        self.active_conns.load(Ordering::Relaxed)
    }

    pub fn requests(&self) -> usize {
        self.req_count.load(Ordering::Relaxed)
    }

    pub fn bytes(&self) -> usize {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    pub fn retries(&self) -> usize {
        self.queue_retries.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            active: self.active(),
            requests: self.requests(),
            bytes: self.bytes(),
            queue_retries: self.retries(),
            rejected: self.rejected.load(Ordering::Relaxed),
            evicted: self.evicted.load(Ordering::Relaxed),
        }
    }
}

impl Default for ServerMetrics {
    fn default() -> Self {
        Self::new()
    }
}
