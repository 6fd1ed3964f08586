//! Global atomic counters for LKGM coordination.
//!
//! Counters are incremented silently at the call site. Call
//! [`Metrics::flush`] to emit current values as a single
//! `tracing::info!` event (e.g. at the end of an agent run or launcher tick).

use std::sync::atomic::{AtomicU64, Ordering};

/// Global metrics singleton.
pub static METRICS: Metrics = Metrics::new();

/// Lightweight atomic counters, no allocations and no locking.
pub struct Metrics {
    candidates_published: AtomicU64,
    push_retries: AtomicU64,
    promotions: AtomicU64,
    launches: AtomicU64,
    rejections: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            candidates_published: AtomicU64::new(0),
            push_retries: AtomicU64::new(0),
            promotions: AtomicU64::new(0),
            launches: AtomicU64::new(0),
            rejections: AtomicU64::new(0),
        }
    }

    pub fn inc_candidates_published(&self) {
        self.candidates_published.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "candidates_published", "counter incremented");
    }

    /// A ledger write lost a push race and will be attempted again.
    pub fn inc_push_retries(&self) {
        self.push_retries.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "push_retries", "counter incremented");
    }

    pub fn inc_promotions(&self) {
        self.promotions.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "promotions", "counter incremented");
    }

    pub fn inc_launches(&self) {
        self.launches.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "launches", "counter incremented");
    }

    pub fn inc_rejections(&self) {
        self.rejections.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "rejections", "counter incremented");
    }

    /// Emit all current counter values as a single `info!` event.
    pub fn flush(&self) {
        tracing::info!(
            metric = "flush",
            candidates_published = self.candidates_published(),
            push_retries = self.push_retries(),
            promotions = self.promotions(),
            launches = self.launches(),
            rejections = self.rejections(),
        );
    }

    pub fn candidates_published(&self) -> u64 {
        self.candidates_published.load(Ordering::Relaxed)
    }

    pub fn push_retries(&self) -> u64 {
        self.push_retries.load(Ordering::Relaxed)
    }

    pub fn promotions(&self) -> u64 {
        self.promotions.load(Ordering::Relaxed)
    }

    pub fn launches(&self) -> u64 {
        self.launches.load(Ordering::Relaxed)
    }

    pub fn rejections(&self) -> u64 {
        self.rejections.load(Ordering::Relaxed)
    }

    /// Reset all counters to zero (useful in tests).
    pub fn reset(&self) {
        for counter in [
            &self.candidates_published,
            &self.push_retries,
            &self.promotions,
            &self.launches,
            &self.rejections,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}
