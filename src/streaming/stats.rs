//! Running counters for one stream.
//!
//! Written only by the sender task; read concurrently through `snapshot()`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

#[derive(Debug)]
pub struct Stats {
    num: AtomicU64,
    offset: AtomicU64,
    size: AtomicU64,
    compressed_size: AtomicU64,
    session_id: AtomicU64,
    idle_nanos: AtomicU64,
    started: Instant,
}

/// Point-in-time copy of `Stats`.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StatsSnapshot {
    /// Objects completed (sent, or consumed in dry-run)
    pub num: u64,
    /// Payload bytes sent within the current session
    pub offset: u64,
    /// Payload bytes sent over the stream's lifetime
    pub size: u64,
    /// Bytes written to the wire after compression; 0 when uncompressed
    pub compressed_size: u64,
    pub session_id: u64,
    /// Share of the sender's lifetime spent waiting for work, in percent
    pub idle_pct: f64,
}

impl StatsSnapshot {
    /// raw / compressed; 1.0 when nothing was compressed
    pub fn compression_ratio(&self) -> f64 {
        if self.compressed_size == 0 {
            1.0
        } else {
            self.size as f64 / self.compressed_size as f64
        }
    }
}

impl Stats {
    pub fn new() -> Self {
        Self {
            num: AtomicU64::new(0),
            offset: AtomicU64::new(0),
            size: AtomicU64::new(0),
            compressed_size: AtomicU64::new(0),
            session_id: AtomicU64::new(0),
            idle_nanos: AtomicU64::new(0),
            started: Instant::now(),
        }
    }

    pub(crate) fn add_payload(&self, n: u64) {
        self.offset.fetch_add(n, Ordering::Relaxed);
        self.size.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn inc_num(&self) {
        self.num.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add_compressed(&self, n: u64) {
        self.compressed_size.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn add_idle(&self, d: Duration) {
        self.idle_nanos
            .fetch_add(d.as_nanos().min(u64::MAX as u128) as u64, Ordering::Relaxed);
    }

    /// New session: the per-session offset starts over.
    pub(crate) fn new_session(&self, session_id: u64) {
        self.session_id.store(session_id, Ordering::Relaxed);
        self.offset.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let elapsed = self.started.elapsed().as_nanos() as f64;
        let idle = self.idle_nanos.load(Ordering::Relaxed) as f64;
        let idle_pct = if elapsed > 0.0 {
            (idle / elapsed * 100.0).clamp(0.0, 100.0)
        } else {
            0.0
        };
        StatsSnapshot {
            num: self.num.load(Ordering::Relaxed),
            offset: self.offset.load(Ordering::Relaxed),
            size: self.size.load(Ordering::Relaxed),
            compressed_size: self.compressed_size.load(Ordering::Relaxed),
            session_id: self.session_id.load(Ordering::Relaxed),
            idle_pct,
        }
    }
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}
