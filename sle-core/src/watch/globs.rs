//! Wildcard source expansion and watcher lifecycle reconciliation.

use crate::pipeline::Pipeline;
use crate::source::SourceSpec;
use crate::watch::file::StartPosition;
use crate::watch::FileTailer;
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Reload cycles a matched path may be absent before its watcher is retired.
/// One cycle of grace tolerates in-place renames during rotation.
const DISAPPEAR_GRACE_CYCLES: u32 = 1;

/// Callback producing a fresh SourceSpec set on a reload tick. `None` keeps
/// the current set (e.g. the config directory failed to parse).
pub type SourceReloader = Box<dyn Fn() -> Option<Vec<Arc<SourceSpec>>> + Send>;

/// Stable watcher identity across reloads: source plus concrete path.
type WatcherKey = (String, String, PathBuf);

struct WatcherHandle {
    cancel: CancellationToken,
    missing_cycles: u32,
}

/// Expands glob-patterned sources to concrete paths, spawns one tailer per
/// matched file, and reconciles the watcher set on every reload tick.
/// Literal paths get a permanent tailer as long as they stay configured.
/// Rate limiting and batching apply per matched file, not per pattern.
///
/// With a [`SourceReloader`] attached, each tick also swaps in the current
/// config's source set, so sources added or removed from the config
/// directory take effect without a restart.
pub struct GlobManager {
    sources: Vec<Arc<SourceSpec>>,
    reload_interval: Duration,
    pipeline: Pipeline,
    reloader: Option<SourceReloader>,
}

impl fmt::Debug for GlobManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GlobManager")
            .field("sources", &self.sources.len())
            .field("reload_interval", &self.reload_interval)
            .field("reloader", &self.reloader.is_some())
            .finish()
    }
}

impl GlobManager {
    /// `reload_secs` of zero disables auto-reload: sources are expanded once
    /// at startup.
    pub fn new(sources: Vec<Arc<SourceSpec>>, reload_secs: u64, pipeline: Pipeline) -> Self {
        Self {
            sources,
            reload_interval: Duration::from_secs(reload_secs),
            pipeline,
            reloader: None,
        }
    }

    /// Re-read the source set through `reloader` on every reload tick.
    pub fn with_reloader(mut self, reloader: SourceReloader) -> Self {
        self.reloader = Some(reloader);
        self
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        let mut watchers: HashMap<WatcherKey, WatcherHandle> = HashMap::new();

        // Registration pass: warn once for patterns matching nothing yet.
        for spec in &self.sources {
            if spec.is_pattern() && expand_pattern(&spec.path).is_empty() {
                warn!(pattern = %spec.path, "pattern currently matches no files");
            }
        }

        // Files present at startup are tailed from their end; anything the
        // reload loop discovers later is new content and is read in full.
        self.reconcile(&mut watchers, &cancel, StartPosition::End);

        if self.reload_interval.is_zero() {
            cancel.cancelled().await;
        } else {
            let mut ticker = interval(self.reload_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The first tick completes immediately; skip it, reconciliation
            // already ran.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Some(reloader) = &self.reloader {
                            if let Some(sources) = reloader() {
                                self.sources = sources;
                            }
                        }
                        self.reconcile(&mut watchers, &cancel, StartPosition::Beginning);
                    }
                }
            }
        }

        for handle in watchers.values() {
            handle.cancel.cancel();
        }
        info!("glob manager stopped");
    }

    fn reconcile(
        &self,
        watchers: &mut HashMap<WatcherKey, WatcherHandle>,
        cancel: &CancellationToken,
        start: StartPosition,
    ) {
        // The set of watchers that should exist right now. Literal paths are
        // always wanted (the tailer waits for the file itself); patterns
        // contribute their current matches.
        let mut desired: HashMap<WatcherKey, Arc<SourceSpec>> = HashMap::new();
        for spec in &self.sources {
            let paths = if spec.is_pattern() {
                expand_pattern(&spec.path)
            } else {
                vec![PathBuf::from(&spec.path)]
            };
            for path in paths {
                desired.insert(
                    (spec.service.clone(), spec.category.clone(), path),
                    Arc::clone(spec),
                );
            }
        }

        for (key, spec) in &desired {
            if let Some(handle) = watchers.get_mut(key) {
                handle.missing_cycles = 0;
                continue;
            }
            let child = cancel.child_token();
            let tailer =
                FileTailer::new(Arc::clone(spec), key.2.clone(), self.pipeline.clone(), start);
            tokio::spawn(tailer.run(child.clone()));
            debug!(path = %key.2.display(), source = %spec.path, "watcher spawned");
            watchers.insert(
                key.clone(),
                WatcherHandle {
                    cancel: child,
                    missing_cycles: 0,
                },
            );
        }

        let retired: Vec<WatcherKey> = watchers
            .iter_mut()
            .filter(|(key, _)| !desired.contains_key(*key))
            .filter_map(|(key, handle)| {
                handle.missing_cycles += 1;
                (handle.missing_cycles > DISAPPEAR_GRACE_CYCLES).then(|| key.clone())
            })
            .collect();

        for key in retired {
            if let Some(handle) = watchers.remove(&key) {
                handle.cancel.cancel();
                let path_str = key.2.to_string_lossy();
                self.pipeline
                    .limiter
                    .forget(&crate::record::SourceId::new(&key.0, &key.1, path_str));
                info!(path = %key.2.display(), "watcher retired");
            }
        }
    }
}

/// Current set of files matching `pattern`. Unreadable entries are skipped.
fn expand_pattern(pattern: &str) -> Vec<PathBuf> {
    let paths = match glob::glob(pattern) {
        Ok(paths) => paths,
        Err(err) => {
            warn!(pattern, error = %err, "invalid glob pattern");
            return Vec::new();
        }
    };
    paths
        .filter_map(|entry| entry.ok())
        .filter(|path| path.is_file())
        .collect()
}
