//! Source watchers: file tailing, glob reconciliation, journal streaming.

pub mod file;
pub mod globs;
pub mod journal;

pub use file::FileTailer;
pub use globs::GlobManager;
pub use journal::JournalWatcher;

use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Backoff floor while a source is unavailable.
pub(crate) const BACKOFF_START: Duration = Duration::from_secs(1);
/// Backoff ceiling while a source is unavailable.
pub(crate) const BACKOFF_CAP: Duration = Duration::from_secs(30);

/// Sleep unless cancelled first. Returns `true` when the watcher should stop.
pub(crate) async fn cancelled_within(cancel: &CancellationToken, duration: Duration) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => true,
        _ = tokio::time::sleep(duration) => false,
    }
}

pub(crate) fn next_backoff(current: Duration) -> Duration {
    (current * 2).min(BACKOFF_CAP)
}
