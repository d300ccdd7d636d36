//! The central bounded FIFO between watchers and the export side.

use crate::record::LogRecord;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::warn;

/// Default capacity, also the fixed capacity of legacy mode.
pub const DEFAULT_CAPACITY: usize = 5000;

/// Outcome of a non-blocking [`BoundedQueue::offer`].
#[derive(Debug)]
pub enum Offer {
    Accepted,
    /// Queue full; the record is handed back so the caller can dispatch on
    /// its overflow policy.
    Rejected(LogRecord),
}

impl Offer {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Offer::Accepted)
    }
}

/// Observable counters, used by threshold warnings and the stats log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStats {
    pub depth: usize,
    pub capacity: usize,
    pub last_warn_bucket: u8,
}

#[derive(Debug)]
struct Inner {
    items: VecDeque<LogRecord>,
    last_warn_bucket: u8,
}

/// Many-producer single-consumer FIFO of fixed capacity.
///
/// `offer` never blocks. Depth crossing an upward 20% boundary logs a warning
/// once per crossing; the warn bucket decays as the queue drains so a slow
/// drain does not suppress future warnings.
///
/// In legacy mode (no `QUEUE_SIZE` configured) reaching capacity clears the
/// whole queue in one operation, dropping the buffered records regardless of
/// their per-source policy. This mirrors the historical behavior; rejecting
/// instead (so DISK sources spill to the buffer) would be the obvious fix,
/// but compatibility wins here.
#[derive(Debug)]
pub struct BoundedQueue {
    inner: Mutex<Inner>,
    notify: Notify,
    capacity: usize,
    legacy_clear: bool,
}

impl BoundedQueue {
    /// Queue with an explicit capacity: full queue rejects and the caller's
    /// overflow policy decides.
    pub fn bounded(capacity: usize) -> Self {
        Self::new(capacity.max(1), false)
    }

    /// Legacy queue: fixed capacity of 5000, cleared wholesale when reached.
    pub fn legacy() -> Self {
        Self::new(DEFAULT_CAPACITY, true)
    }

    fn new(capacity: usize, legacy_clear: bool) -> Self {
        Self {
            inner: Mutex::new(Inner {
                items: VecDeque::with_capacity(capacity.min(16_384)),
                last_warn_bucket: 0,
            }),
            notify: Notify::new(),
            capacity,
            legacy_clear,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Non-blocking admission.
    pub fn offer(&self, record: LogRecord) -> Offer {
        let mut inner = self.inner.lock();

        if !self.legacy_clear && inner.items.len() >= self.capacity {
            return Offer::Rejected(record);
        }

        inner.items.push_back(record);

        if self.legacy_clear && inner.items.len() >= self.capacity {
            let dropped = inner.items.len();
            inner.items.clear();
            inner.last_warn_bucket = 0;
            warn!(dropped, "queue cleared: reached legacy capacity");
            return Offer::Accepted;
        }

        let depth = inner.items.len();
        let bucket = Self::bucket_for(depth, self.capacity);
        if bucket > inner.last_warn_bucket {
            inner.last_warn_bucket = bucket;
            warn!(
                depth,
                capacity = self.capacity,
                filled_pct = bucket as usize * 20,
                "queue filling up"
            );
        }

        drop(inner);
        self.notify.notify_one();
        Offer::Accepted
    }

    /// Pop the oldest record, waiting up to `timeout` when empty. Returns
    /// `None` on timeout so periodic flushes and shutdown stay observable.
    pub async fn poll(&self, timeout: Duration) -> Option<LogRecord> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(record) = self.try_pop() {
                return Some(record);
            }
            let notified = self.notify.notified();
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.try_pop();
            }
        }
    }

    /// Non-blocking pop, used while draining at shutdown.
    pub fn try_pop(&self) -> Option<LogRecord> {
        let mut inner = self.inner.lock();
        let record = inner.items.pop_front()?;
        let depth = inner.items.len();
        // Decay one warn bucket each time depth falls below its boundary.
        if inner.last_warn_bucket > 0
            && depth < Self::boundary(inner.last_warn_bucket, self.capacity)
        {
            inner.last_warn_bucket -= 1;
        }
        Some(record)
    }

    pub fn stats(&self) -> QueueStats {
        let inner = self.inner.lock();
        QueueStats {
            depth: inner.items.len(),
            capacity: self.capacity,
            last_warn_bucket: inner.last_warn_bucket,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().items.is_empty()
    }

    /// Warn bucket for a given depth: 0 below 20%, then 1..=4.
    fn bucket_for(depth: usize, capacity: usize) -> u8 {
        ((depth * 5) / capacity).min(4) as u8
    }

    /// Depth at which `bucket` begins.
    fn boundary(bucket: u8, capacity: usize) -> usize {
        capacity * bucket as usize / 5
    }
}
