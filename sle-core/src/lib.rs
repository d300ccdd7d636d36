//! Core pipeline of the SLE log-shipping agent: watchers tail files and the
//! systemd journal, lines are enriched and admitted through a bounded queue,
//! batched per source, and dispatched to the configured backends with an
//! at-least-once disk buffer for DISK-policy sources.

pub mod batcher;
pub mod enrich;
pub mod error;
pub mod export;
pub mod limiter;
pub mod pipeline;
pub mod queue;
pub mod record;
pub mod source;
pub mod wal;
pub mod watch;

pub use batcher::{Batch, Batcher, MAX_BATCH_AGE};
pub use enrich::{enrich, Enriched};
pub use error::{Result, SleError};
pub use export::{BackendKind, BackendSpec, ExportOutcome, Exporter};
pub use limiter::RateLimiter;
pub use pipeline::{build_record, Pipeline, PipelineStats};
pub use queue::{BoundedQueue, Offer, QueueStats, DEFAULT_CAPACITY};
pub use record::{LogRecord, OverflowPolicy, SourceId};
pub use source::{is_glob_pattern, SourceSpec};
pub use wal::{CommitSink, Wal};
pub use watch::file::StartPosition;
pub use watch::{FileTailer, GlobManager, JournalWatcher};
