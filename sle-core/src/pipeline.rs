//! Shared ingest path: enrich, rate-limit, offer, overflow dispatch.
//!
//! Every watcher pushes raw lines through one [`Pipeline`] handle; the
//! supervisor owns the other end of the queue.

use crate::enrich::enrich;
use crate::limiter::RateLimiter;
use crate::queue::{BoundedQueue, Offer};
use crate::record::{
    LogRecord, OverflowPolicy, FILEPATH_LABEL, JOB_LABEL, JOB_VALUE, LEVEL_LABEL, NAME_LABEL,
    SUBNAME_LABEL,
};
use crate::source::SourceSpec;
use crate::wal::Wal;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error};

/// Pipeline counters, all monotonic.
#[derive(Debug, Default)]
pub struct PipelineStats {
    /// Records admitted into the queue.
    pub enqueued: AtomicU64,
    /// Records discarded by the DROP policy or unrecoverable failures.
    pub dropped: AtomicU64,
    /// Records spilled to the disk buffer by the DISK policy.
    pub spilled: AtomicU64,
    /// Batches confirmed by at least one endpoint.
    pub batches_delivered: AtomicU64,
    /// Batches every endpoint refused.
    pub batches_failed: AtomicU64,
}

impl PipelineStats {
    pub fn count_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> (u64, u64, u64, u64, u64) {
        (
            self.enqueued.load(Ordering::Relaxed),
            self.dropped.load(Ordering::Relaxed),
            self.spilled.load(Ordering::Relaxed),
            self.batches_delivered.load(Ordering::Relaxed),
            self.batches_failed.load(Ordering::Relaxed),
        )
    }
}

/// Cheaply cloneable front half of the pipeline, handed to every watcher.
#[derive(Debug, Clone)]
pub struct Pipeline {
    pub queue: Arc<BoundedQueue>,
    pub limiter: Arc<RateLimiter>,
    pub wal: Arc<Wal>,
    pub stats: Arc<PipelineStats>,
}

impl Pipeline {
    pub fn new(
        queue: Arc<BoundedQueue>,
        limiter: Arc<RateLimiter>,
        wal: Arc<Wal>,
        stats: Arc<PipelineStats>,
    ) -> Self {
        Self {
            queue,
            limiter,
            wal,
            stats,
        }
    }

    /// Enrich one raw line and run it through admission. Empty records
    /// (consecutive delimiters) are skipped.
    pub fn ingest_line(&self, spec: &SourceSpec, filepath: &str, raw: &str) {
        if raw.is_empty() {
            return;
        }
        let record = build_record(spec, filepath, raw, Utc::now());
        self.admit(record, spec.rate_limit);
    }

    /// Admit an already-built record: rate limiter first, then the queue;
    /// rejection on either dispatches the overflow policy.
    pub fn admit(&self, record: LogRecord, rate_limit: Option<f64>) {
        if !self.limiter.try_acquire(&record.source_id, rate_limit) {
            self.handle_rejected(record);
            return;
        }
        match self.queue.offer(record) {
            Offer::Accepted => {
                self.stats.enqueued.fetch_add(1, Ordering::Relaxed);
            }
            Offer::Rejected(record) => self.handle_rejected(record),
        }
    }

    /// Overflow dispatch: DROP counts and discards, DISK persists. Records
    /// that were replayed from the buffer still have their segment on disk
    /// and are not written twice.
    pub fn handle_rejected(&self, record: LogRecord) {
        match record.overflow_policy {
            OverflowPolicy::Drop => {
                self.stats.count_dropped();
                debug!(source = %record.source_id, "record dropped by policy");
            }
            OverflowPolicy::Disk => {
                if record.wal_seq.is_some() {
                    return;
                }
                match self.wal.append(&record) {
                    Ok(_) => {
                        self.stats.spilled.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(err) => {
                        self.stats.count_dropped();
                        error!(source = %record.source_id, error = %err, "buffer write failed, record dropped");
                    }
                }
            }
        }
    }
}

/// Build the queue unit for one raw line: enrichment plus the mandatory
/// label set (`job`, `name`, `subname`, `filepath`), the optional `level`,
/// and the user labels from the source spec.
pub fn build_record(
    spec: &SourceSpec,
    filepath: &str,
    raw: &str,
    now: DateTime<Utc>,
) -> LogRecord {
    let enriched = enrich(raw, now);

    let mut labels = spec.labels.clone();
    labels.insert(JOB_LABEL.to_string(), JOB_VALUE.to_string());
    labels.insert(NAME_LABEL.to_string(), spec.service.clone());
    labels.insert(SUBNAME_LABEL.to_string(), spec.category.clone());
    labels.insert(FILEPATH_LABEL.to_string(), filepath.to_string());
    if let Some(level) = &enriched.level {
        labels.insert(LEVEL_LABEL.to_string(), level.clone());
    }

    LogRecord {
        text: enriched.text,
        timestamp: enriched.timestamp,
        labels,
        source_id: spec.source_id(filepath),
        overflow_policy: spec.overflow_policy,
        wal_seq: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn spec() -> SourceSpec {
        let mut labels = BTreeMap::new();
        labels.insert("env".to_string(), "prod".to_string());
        SourceSpec {
            service: "nginx".to_string(),
            category: "ACCESS".to_string(),
            path: "/tmp/a.log".to_string(),
            delimiter: b"\n".to_vec(),
            labels,
            rate_limit: None,
            buffer_size: 1,
            overflow_policy: OverflowPolicy::Drop,
        }
    }

    fn pipeline(capacity: usize, wal_dir: &TempDir) -> Pipeline {
        Pipeline::new(
            Arc::new(BoundedQueue::bounded(capacity)),
            Arc::new(RateLimiter::new()),
            Arc::new(Wal::new(wal_dir.path())),
            Arc::new(PipelineStats::default()),
        )
    }

    #[test]
    fn record_carries_mandatory_labels() {
        let now = Utc.with_ymd_and_hms(2025, 10, 17, 0, 26, 16).unwrap();
        let record = build_record(
            &spec(),
            "/tmp/a.log",
            "2025-10-17T02:26:16+0200 INFO Complete!",
            now,
        );
        assert_eq!(record.labels.get("job").map(String::as_str), Some("sle"));
        assert_eq!(record.labels.get("name").map(String::as_str), Some("nginx"));
        assert_eq!(
            record.labels.get("subname").map(String::as_str),
            Some("ACCESS")
        );
        assert_eq!(
            record.labels.get("filepath").map(String::as_str),
            Some("/tmp/a.log")
        );
        assert_eq!(record.labels.get("level").map(String::as_str), Some("INFO"));
        assert_eq!(record.labels.get("env").map(String::as_str), Some("prod"));
        assert_eq!(record.text, "Complete!");
    }

    #[test]
    fn queue_rejection_spills_disk_sources() {
        let dir = TempDir::new().unwrap();
        let pipeline = pipeline(1, &dir);
        let mut disk_spec = spec();
        disk_spec.overflow_policy = OverflowPolicy::Disk;

        pipeline.ingest_line(&disk_spec, "/tmp/a.log", "first");
        pipeline.ingest_line(&disk_spec, "/tmp/a.log", "second");

        assert_eq!(pipeline.queue.stats().depth, 1);
        let replayed = pipeline.wal.replay().unwrap();
        assert_eq!(replayed.len(), 1);
        assert_eq!(replayed[0].text, "second");
    }

    #[test]
    fn queue_rejection_drops_drop_sources() {
        let dir = TempDir::new().unwrap();
        let pipeline = pipeline(1, &dir);

        pipeline.ingest_line(&spec(), "/tmp/a.log", "first");
        pipeline.ingest_line(&spec(), "/tmp/a.log", "second");

        assert_eq!(pipeline.queue.stats().depth, 1);
        assert_eq!(pipeline.stats.snapshot().1, 1);
        assert!(pipeline.wal.replay().unwrap().is_empty());
    }

    #[test]
    fn rate_limit_rejection_applies_policy() {
        let dir = TempDir::new().unwrap();
        let pipeline = pipeline(100, &dir);
        let mut limited = spec();
        limited.rate_limit = Some(1.0);

        pipeline.ingest_line(&limited, "/tmp/a.log", "first");
        pipeline.ingest_line(&limited, "/tmp/a.log", "second");

        assert_eq!(pipeline.queue.stats().depth, 1);
        assert_eq!(pipeline.stats.snapshot().1, 1);
    }

    #[test]
    fn replayed_records_are_not_rewritten() {
        let dir = TempDir::new().unwrap();
        let pipeline = pipeline(100, &dir);
        let mut record = build_record(&spec(), "/tmp/a.log", "replayed", Utc::now());
        record.overflow_policy = OverflowPolicy::Disk;
        record.wal_seq = Some(3);

        pipeline.handle_rejected(record);
        assert!(pipeline.wal.replay().unwrap().is_empty());
    }
}
