//! The normalized in-memory log event and its identifiers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Label every emitted record carries.
pub const JOB_LABEL: &str = "job";
/// Value of the `job` label on every record.
pub const JOB_VALUE: &str = "sle";
/// Label holding the service name.
pub const NAME_LABEL: &str = "name";
/// Label holding the category.
pub const SUBNAME_LABEL: &str = "subname";
/// Label holding the origin path.
pub const FILEPATH_LABEL: &str = "filepath";
/// Label holding the extracted severity, when present.
pub const LEVEL_LABEL: &str = "level";

/// Opaque key identifying the origin of a record. Used by the rate limiter,
/// the batcher, and the disk buffer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SourceId {
    pub service: String,
    pub category: String,
    pub filepath: String,
}

impl SourceId {
    pub fn new(
        service: impl Into<String>,
        category: impl Into<String>,
        filepath: impl Into<String>,
    ) -> Self {
        Self {
            service: service.into(),
            category: category.into(),
            filepath: filepath.into(),
        }
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}:{}", self.service, self.category, self.filepath)
    }
}

/// What happens to a record when the queue or the rate limiter rejects it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OverflowPolicy {
    /// Discard the record and count it.
    Drop,
    /// Persist the record to the write-ahead buffer for later delivery.
    Disk,
}

impl Default for OverflowPolicy {
    fn default() -> Self {
        Self::Drop
    }
}

/// The unit that flows through the queue.
///
/// `text` never holds an empty string: when enrichment would strip a line down
/// to nothing the original line is kept instead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub text: String,
    pub timestamp: DateTime<Utc>,
    pub labels: BTreeMap<String, String>,
    pub source_id: SourceId,
    pub overflow_policy: OverflowPolicy,
    /// Sequence number of the buffer segment this record was replayed from.
    /// Live records carry `None`. Not persisted.
    #[serde(skip)]
    pub wal_seq: Option<u64>,
}

impl LogRecord {
    /// Nanosecond epoch timestamp, saturating at the representable range.
    pub fn timestamp_nanos(&self) -> i64 {
        self.timestamp
            .timestamp_nanos_opt()
            .unwrap_or_else(|| self.timestamp.timestamp_micros().saturating_mul(1_000))
    }
}
