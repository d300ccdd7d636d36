//! Per-source token-bucket admission.

use crate::record::SourceId;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Instant;

#[derive(Debug)]
struct Bucket {
    rate: f64,
    tokens: f64,
    last_refill: Instant,
}

impl Bucket {
    fn new(rate: f64, now: Instant) -> Self {
        Self {
            rate,
            // A fresh bucket starts full: one second's worth of burst.
            tokens: rate,
            last_refill: now,
        }
    }

    fn try_acquire(&mut self, now: Instant) -> bool {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate).min(self.rate);
        self.last_refill = now;
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// Token buckets keyed by source. Capacity and refill rate both equal the
/// source's configured records/second, so burst size is one second's worth.
/// Buckets are shared between the watcher and the buffer replayer, guarded by
/// one mutex; every call is constant-time and never blocks on I/O.
#[derive(Debug, Default)]
pub struct RateLimiter {
    buckets: Mutex<HashMap<SourceId, Bucket>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit one record for `source`. `rate` comes from the source spec;
    /// `None` means unlimited and always admits.
    pub fn try_acquire(&self, source: &SourceId, rate: Option<f64>) -> bool {
        self.try_acquire_at(source, rate, Instant::now())
    }

    /// Clock-injected variant used by tests.
    pub fn try_acquire_at(&self, source: &SourceId, rate: Option<f64>, now: Instant) -> bool {
        let rate = match rate {
            Some(rate) if rate > 0.0 => rate,
            _ => return true,
        };
        let mut buckets = self.buckets.lock();
        buckets
            .entry(source.clone())
            .or_insert_with(|| Bucket::new(rate, now))
            .try_acquire(now)
    }

    /// Drop state for sources that disappeared (glob reconciliation).
    pub fn forget(&self, source: &SourceId) {
        self.buckets.lock().remove(source);
    }
}
