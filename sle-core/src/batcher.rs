//! Per-source batch accumulation between the queue and the exporter.

use crate::record::{LogRecord, SourceId};
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// How long a batch may age before it is flushed regardless of size.
pub const MAX_BATCH_AGE: Duration = Duration::from_secs(1);

/// Ordered group of records from a single source, sent in one request.
#[derive(Debug, Clone)]
pub struct Batch {
    pub source_id: SourceId,
    pub records: Vec<LogRecord>,
}

impl Batch {
    /// Segment numbers of the replayed records in this batch, for commit
    /// after confirmed delivery.
    pub fn wal_segments(&self) -> Vec<u64> {
        self.records.iter().filter_map(|r| r.wal_seq).collect()
    }
}

#[derive(Debug)]
struct Slot {
    records: Vec<LogRecord>,
    first_at: Instant,
}

/// Accumulates records per source until the source's batch size is reached,
/// the batch ages out, or the pipeline shuts down. Owned by the single queue
/// consumer; one periodic scan flushes every aged batch.
#[derive(Debug, Default)]
pub struct Batcher {
    slots: HashMap<SourceId, Slot>,
}

impl Batcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one record. Returns the full batch once it reaches `buffer_size`.
    /// A size of one makes the batcher a pass-through.
    pub fn push(&mut self, record: LogRecord, buffer_size: usize) -> Option<Batch> {
        let buffer_size = buffer_size.max(1);
        let source_id = record.source_id.clone();

        if buffer_size == 1 && !self.slots.contains_key(&source_id) {
            return Some(Batch {
                source_id,
                records: vec![record],
            });
        }

        let slot = self.slots.entry(source_id.clone()).or_insert_with(|| Slot {
            records: Vec::with_capacity(buffer_size),
            first_at: Instant::now(),
        });
        slot.records.push(record);

        if slot.records.len() >= buffer_size {
            let records = std::mem::take(&mut slot.records);
            self.slots.remove(&source_id);
            Some(Batch { source_id, records })
        } else {
            None
        }
    }

    /// Flush every batch older than `max_age`.
    pub fn take_expired(&mut self, max_age: Duration) -> Vec<Batch> {
        let now = Instant::now();
        let expired: Vec<SourceId> = self
            .slots
            .iter()
            .filter(|(_, slot)| now.saturating_duration_since(slot.first_at) >= max_age)
            .map(|(id, _)| id.clone())
            .collect();
        expired
            .into_iter()
            .filter_map(|id| {
                self.slots.remove(&id).map(|slot| Batch {
                    source_id: id,
                    records: slot.records,
                })
            })
            .collect()
    }

    /// Flush everything, used at shutdown.
    pub fn drain(&mut self) -> Vec<Batch> {
        self.slots
            .drain()
            .map(|(source_id, slot)| Batch {
                source_id,
                records: slot.records,
            })
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}
