//! Lifecycle owner: wires the queue, buffer, watchers, batcher, and exporter
//! together, replays the buffer ahead of live traffic, and drives graceful
//! shutdown.

use anyhow::Context;
use parking_lot::RwLock;
use sle_config::{Config, ConfigLoader, GlobalSettings};
use sle_core::{
    Batcher, BoundedQueue, CommitSink, ExportOutcome, Exporter, GlobManager, JournalWatcher,
    Offer, Pipeline, PipelineStats, RateLimiter, SourceSpec, Wal, MAX_BATCH_AGE,
};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Bound on the whole shutdown sequence.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);
/// Consumer wake-up interval; also the flush cadence for aged batches.
const QUEUE_POLL: Duration = Duration::from_millis(200);
/// Delay between admission attempts while replaying against a full limiter.
const REPLAY_RETRY: Duration = Duration::from_millis(50);
/// How often the consumer re-attempts buffered segments while idle.
const BUFFER_SWEEP_INTERVAL: Duration = Duration::from_secs(5);
/// Cadence of the pipeline stats log line.
const STATS_INTERVAL: Duration = Duration::from_secs(60);
/// Worker crashes within this window before the cool-down kicks in.
const CRASH_WINDOW: Duration = Duration::from_secs(60);
const CRASH_LIMIT: usize = 3;
const CRASH_COOLDOWN: Duration = Duration::from_secs(60);

/// Per-source batching and admission parameters, looked up by the consumer
/// for records coming off the queue. Journal sources fall back to defaults.
#[derive(Debug, Clone, Copy)]
struct SourceProfile {
    buffer_size: usize,
    rate_limit: Option<f64>,
}

type ProfileMap = HashMap<(String, String), SourceProfile>;

fn build_profiles(sources: &[SourceSpec]) -> ProfileMap {
    sources
        .iter()
        .map(|spec| {
            (
                (spec.service.clone(), spec.category.clone()),
                SourceProfile {
                    buffer_size: spec.buffer_size,
                    rate_limit: spec.rate_limit,
                },
            )
        })
        .collect()
}

/// Owns every long-lived task of the agent.
#[derive(Debug)]
pub struct Supervisor {
    pipeline: Pipeline,
    exporter: Arc<Exporter>,
    sources: Vec<Arc<SourceSpec>>,
    globals: GlobalSettings,
    profiles: Arc<RwLock<ProfileMap>>,
    config_dir: PathBuf,
}

impl Supervisor {
    pub fn new(config: Config, buffer_dir: PathBuf, config_dir: PathBuf) -> anyhow::Result<Self> {
        let queue = Arc::new(match config.globals.queue_size {
            Some(capacity) => BoundedQueue::bounded(capacity),
            None => BoundedQueue::legacy(),
        });
        let wal = Arc::new(Wal::new(buffer_dir));
        let stats = Arc::new(PipelineStats::default());
        let limiter = Arc::new(RateLimiter::new());
        let pipeline = Pipeline::new(
            queue,
            limiter,
            Arc::clone(&wal),
            Arc::clone(&stats),
        );

        let commit: Arc<dyn CommitSink> = wal;
        let exporter = Arc::new(
            Exporter::new(config.backends.clone(), commit, stats)
                .context("constructing exporter")?,
        );

        let profiles = build_profiles(&config.sources);

        Ok(Self {
            pipeline,
            exporter,
            sources: config.sources.into_iter().map(Arc::new).collect(),
            globals: config.globals,
            profiles: Arc::new(RwLock::new(profiles)),
            config_dir,
        })
    }

    /// Run until `cancel` fires, then drain within the shutdown grace.
    pub async fn run(self, cancel: CancellationToken) -> anyhow::Result<()> {
        // Buffered records from a previous run go first, before any watcher
        // produces live traffic.
        self.replay_buffer(&cancel).await;

        let mut consumer = {
            let pipeline = self.pipeline.clone();
            let exporter = Arc::clone(&self.exporter);
            let profiles = Arc::clone(&self.profiles);
            let cancel = cancel.clone();
            spawn_supervised("consumer", cancel.clone(), move || {
                consume(
                    pipeline.clone(),
                    Arc::clone(&exporter),
                    Arc::clone(&profiles),
                    cancel.clone(),
                )
            })
        };

        {
            let sources = self.sources.clone();
            let reload = self.globals.auto_reload;
            let pipeline = self.pipeline.clone();
            let config_dir = self.config_dir.clone();
            let profiles = Arc::clone(&self.profiles);
            let cancel = cancel.clone();
            spawn_supervised("glob-manager", cancel.clone(), move || {
                let manager =
                    GlobManager::new(sources.clone(), reload, pipeline.clone());
                let manager = if reload > 0 {
                    // Auto-reload re-reads the config directory each cycle; a
                    // bad reload keeps the previous source set.
                    let loader = ConfigLoader::new(config_dir.clone());
                    let profiles = Arc::clone(&profiles);
                    manager.with_reloader(Box::new(move || match loader.load() {
                        Ok(config) => {
                            *profiles.write() = build_profiles(&config.sources);
                            Some(config.sources.into_iter().map(Arc::new).collect())
                        }
                        Err(err) => {
                            warn!(error = %err, "config reload failed, keeping previous config");
                            None
                        }
                    }))
                } else {
                    manager
                };
                manager.run(cancel.child_token())
            });
        }

        if self.globals.journalctl {
            let labels = self.globals.journal_labels.clone();
            let pipeline = self.pipeline.clone();
            let cancel = cancel.clone();
            spawn_supervised("journal", cancel.clone(), move || {
                JournalWatcher::new(labels.clone(), pipeline.clone()).run(cancel.child_token())
            });
        }

        {
            let pipeline = self.pipeline.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                loop {
                    if sleep_cancelled(&cancel, STATS_INTERVAL).await {
                        break;
                    }
                    let (enqueued, dropped, spilled, delivered, failed) =
                        pipeline.stats.snapshot();
                    let queue = pipeline.queue.stats();
                    debug!(
                        enqueued,
                        dropped,
                        spilled,
                        batches_delivered = delivered,
                        batches_failed = failed,
                        queue_depth = queue.depth,
                        queue_capacity = queue.capacity,
                        "pipeline stats"
                    );
                }
            });
        }

        info!(
            sources = self.sources.len(),
            journal = self.globals.journalctl,
            auto_reload = self.globals.auto_reload,
            "agent running"
        );

        cancel.cancelled().await;
        info!("shutting down, draining pipeline");

        if tokio::time::timeout(SHUTDOWN_GRACE, &mut consumer)
            .await
            .is_err()
        {
            warn!("shutdown grace elapsed, abandoning in-flight work");
            consumer.abort();
        }
        Ok(())
    }

    /// Re-admit every surviving buffer segment, oldest first, honoring the
    /// shared per-source rate limits. Records the queue rejects keep their
    /// on-disk segment and are retried on the next start.
    async fn replay_buffer(&self, cancel: &CancellationToken) {
        let records = match self.pipeline.wal.replay() {
            Ok(records) => records,
            Err(err) => {
                error!(error = %err, "buffer replay failed, continuing without it");
                return;
            }
        };
        if records.is_empty() {
            return;
        }
        info!(records = records.len(), "replaying buffered records");

        for record in records {
            let rate_limit = self
                .profiles
                .read()
                .get(&(record.source_id.service.clone(), record.source_id.category.clone()))
                .and_then(|profile| profile.rate_limit);
            loop {
                if cancel.is_cancelled() {
                    return;
                }
                if self
                    .pipeline
                    .limiter
                    .try_acquire(&record.source_id, rate_limit)
                {
                    if let Offer::Rejected(rejected) = self.pipeline.queue.offer(record) {
                        // Segment stays on disk; nothing to do now.
                        debug!(source = %rejected.source_id, "queue full during replay, segment deferred");
                    }
                    break;
                }
                if sleep_cancelled(cancel, REPLAY_RETRY).await {
                    return;
                }
            }
        }
    }
}

/// Queue consumer: batches records per source and dispatches full or aged
/// batches. After cancellation it drains what it can within the grace period
/// and persists unsent DISK records.
async fn consume(
    pipeline: Pipeline,
    exporter: Arc<Exporter>,
    profiles: Arc<RwLock<ProfileMap>>,
    cancel: CancellationToken,
) {
    let mut batcher = Batcher::new();
    let mut last_sweep = Instant::now();

    while !cancel.is_cancelled() {
        let idle = match pipeline.queue.poll(QUEUE_POLL).await {
            Some(record) => {
                let buffer_size = profile_buffer_size(&profiles, &record);
                if let Some(batch) = batcher.push(record, buffer_size) {
                    dispatch(&pipeline, &exporter, batch).await;
                }
                false
            }
            None => true,
        };
        for batch in batcher.take_expired(MAX_BATCH_AGE) {
            dispatch(&pipeline, &exporter, batch).await;
        }

        // Failed DISK batches wait in the buffer; while nothing is in
        // flight, retry them each cycle until the backend comes back.
        if idle
            && batcher.is_empty()
            && last_sweep.elapsed() >= BUFFER_SWEEP_INTERVAL
        {
            last_sweep = Instant::now();
            sweep_buffer(&pipeline, &exporter, &profiles).await;
        }
    }

    // Final drain, bounded by the shutdown grace the supervisor enforces.
    let deadline = Instant::now() + SHUTDOWN_GRACE;
    while let Some(record) = pipeline.queue.try_pop() {
        if Instant::now() >= deadline {
            pipeline.handle_rejected(record);
            continue;
        }
        let buffer_size = profile_buffer_size(&profiles, &record);
        if let Some(batch) = batcher.push(record, buffer_size) {
            dispatch(&pipeline, &exporter, batch).await;
        }
    }
    for batch in batcher.drain() {
        if Instant::now() < deadline {
            dispatch(&pipeline, &exporter, batch).await;
        } else {
            for record in batch.records {
                pipeline.handle_rejected(record);
            }
        }
    }
    debug!("consumer drained");
}

/// Re-attempt every segment still in the buffer, batched per source in
/// sequence order. Delivery commits (unlinks) the segments through the
/// exporter; failures leave them for the next sweep. Runs only when the
/// queue and the batcher are empty, so no record is ever both in memory and
/// on disk.
async fn sweep_buffer(
    pipeline: &Pipeline,
    exporter: &Exporter,
    profiles: &RwLock<ProfileMap>,
) {
    let records = match pipeline.wal.replay() {
        Ok(records) => records,
        Err(err) => {
            warn!(error = %err, "buffer sweep failed");
            return;
        }
    };
    if records.is_empty() {
        return;
    }
    debug!(records = records.len(), "retrying buffered records");

    let mut batcher = Batcher::new();
    let mut batches = Vec::new();
    for record in records {
        let buffer_size = profile_buffer_size(profiles, &record);
        if let Some(batch) = batcher.push(record, buffer_size) {
            batches.push(batch);
        }
    }
    batches.extend(batcher.drain());

    for batch in batches {
        if exporter.export(&batch).await == ExportOutcome::Failed {
            // Segments stay on disk for the next sweep.
            return;
        }
    }
}

fn profile_buffer_size(profiles: &RwLock<ProfileMap>, record: &sle_core::LogRecord) -> usize {
    profiles
        .read()
        .get(&(
            record.source_id.service.clone(),
            record.source_id.category.clone(),
        ))
        .map(|profile| profile.buffer_size)
        .unwrap_or(1)
}

async fn dispatch(pipeline: &Pipeline, exporter: &Exporter, batch: sle_core::Batch) {
    match exporter.export(&batch).await {
        ExportOutcome::Delivered => {}
        ExportOutcome::Failed => {
            // DISK records go to the buffer, DROP records are counted away;
            // replayed records keep their existing segment.
            for record in batch.records {
                pipeline.handle_rejected(record);
            }
        }
    }
}

/// Keep a worker running: restart it when it crashes, with a cool-down after
/// repeated crashes in a short window. A worker that returns after
/// cancellation ends the supervision loop.
fn spawn_supervised<F, Fut>(
    name: &'static str,
    cancel: CancellationToken,
    factory: F,
) -> JoinHandle<()>
where
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut crashes: VecDeque<Instant> = VecDeque::new();
        loop {
            let outcome = tokio::spawn(factory()).await;
            if cancel.is_cancelled() {
                break;
            }
            match outcome {
                Ok(()) => warn!(worker = name, "worker exited unexpectedly, restarting"),
                Err(err) => error!(worker = name, error = %err, "worker crashed, restarting"),
            }

            let now = Instant::now();
            crashes.push_back(now);
            while crashes
                .front()
                .is_some_and(|first| now.duration_since(*first) > CRASH_WINDOW)
            {
                crashes.pop_front();
            }
            if crashes.len() >= CRASH_LIMIT {
                warn!(worker = name, "repeated crashes, cooling down");
                crashes.clear();
                if sleep_cancelled(&cancel, CRASH_COOLDOWN).await {
                    break;
                }
            }
        }
    })
}

/// Sleep unless cancelled first; `true` means cancelled.
async fn sleep_cancelled(cancel: &CancellationToken, duration: Duration) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => true,
        _ = tokio::time::sleep(duration) => false,
    }
}
