//! Process-wide request and session counters.
//!
//! Counters are plain relaxed atomics; the snapshot is what `/metrics` and
//! `/health/detailed` serve. Per-component stats (pools, caches, queue) live
//! with their components and are merged into the operational responses by the
//! route handlers.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Shared counter block. Incremented on every request regardless of outcome.
#[derive(Debug, Default)]
pub struct Metrics {
    pub http_requests: AtomicU64,
    pub http_errors: AtomicU64,
    pub tcp_frames_in: AtomicU64,
    pub tcp_frames_out: AtomicU64,
    pub tcp_protocol_errors: AtomicU64,
    pub sessions_opened: AtomicU64,
    pub sessions_closed: AtomicU64,
    pub sessions_closed_missed_heartbeat: AtomicU64,
    pub heartbeats_sent: AtomicU64,
    pub dispatch_hits: AtomicU64,
    pub dispatch_misses: AtomicU64,
    pub auth_rejections: AtomicU64,
}

/// Serializable snapshot of [`Metrics`].
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub http_requests: u64,
    pub http_errors: u64,
    pub tcp_frames_in: u64,
    pub tcp_frames_out: u64,
    pub tcp_protocol_errors: u64,
    pub sessions_opened: u64,
    pub sessions_closed: u64,
    pub sessions_closed_missed_heartbeat: u64,
    pub heartbeats_sent: u64,
    pub dispatch_hits: u64,
    pub dispatch_misses: u64,
    pub auth_rejections: u64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            http_requests: self.http_requests.load(Ordering::Relaxed),
            http_errors: self.http_errors.load(Ordering::Relaxed),
            tcp_frames_in: self.tcp_frames_in.load(Ordering::Relaxed),
            tcp_frames_out: self.tcp_frames_out.load(Ordering::Relaxed),
            tcp_protocol_errors: self.tcp_protocol_errors.load(Ordering::Relaxed),
            sessions_opened: self.sessions_opened.load(Ordering::Relaxed),
            sessions_closed: self.sessions_closed.load(Ordering::Relaxed),
            sessions_closed_missed_heartbeat: self
                .sessions_closed_missed_heartbeat
                .load(Ordering::Relaxed),
            heartbeats_sent: self.heartbeats_sent.load(Ordering::Relaxed),
            dispatch_hits: self.dispatch_hits.load(Ordering::Relaxed),
            dispatch_misses: self.dispatch_misses.load(Ordering::Relaxed),
            auth_rejections: self.auth_rejections.load(Ordering::Relaxed),
        }
    }
}
