//! Durable per-source overflow store.
//!
//! One segment file per record under `<root>/<service>/<category>/<seq>.rec`,
//! JSON-encoded. A record counts as durable only after its contents are
//! fsynced and the temporary file is renamed into place. Segments survive
//! restarts and are replayed ahead of live traffic; delivery confirmation
//! unlinks them through the [`CommitSink`] trait.

use crate::error::{Result, SleError};
use crate::record::{LogRecord, SourceId};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Segments older than this at startup are deleted unread.
pub const MAX_SEGMENT_AGE: Duration = Duration::from_secs(24 * 60 * 60);

const SEGMENT_EXT: &str = "rec";

/// Delivery confirmation consumed by the exporter. The write-ahead buffer is
/// the production implementation; keeping it a trait keeps the ownership
/// graph acyclic.
pub trait CommitSink: Send + Sync {
    /// Unlink the given segments of `source` after confirmed delivery.
    fn commit(&self, source: &SourceId, segments: &[u64]);
}

/// Append-only segment store rooted at one directory.
#[derive(Debug)]
pub struct Wal {
    root: PathBuf,
    next_seq: Mutex<HashMap<(String, String), u64>>,
}

impl Wal {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            next_seq: Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Persist one record. Returns the assigned segment sequence number.
    /// The record is durable once this returns `Ok`.
    pub fn append(&self, record: &LogRecord) -> Result<u64> {
        let dir = self.source_dir(&record.source_id);
        fs::create_dir_all(&dir)?;

        let seq = self.next_sequence(&record.source_id, &dir)?;
        let payload = serde_json::to_vec(record)?;

        let tmp = dir.join(format!(".{seq}.{SEGMENT_EXT}.tmp"));
        let mut file = fs::File::create(&tmp)?;
        file.write_all(&payload)?;
        file.sync_all()?;
        drop(file);

        let target = dir.join(format!("{seq}.{SEGMENT_EXT}"));
        fs::rename(&tmp, &target)?;
        Ok(seq)
    }

    /// Enumerate and decode all surviving segments, oldest first within each
    /// source. Segments past [`MAX_SEGMENT_AGE`] are deleted unread; segments
    /// that fail to decode are quarantined with a `.bad` suffix and never
    /// retried. Decoded records carry their segment number in `wal_seq`.
    pub fn replay(&self) -> Result<Vec<LogRecord>> {
        self.replay_with_max_age(MAX_SEGMENT_AGE)
    }

    /// [`Wal::replay`] with an explicit age cutoff.
    pub fn replay_with_max_age(&self, max_age: Duration) -> Result<Vec<LogRecord>> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }

        let mut segments: Vec<(String, String, u64, PathBuf)> = Vec::new();
        for entry in WalkDir::new(&self.root).min_depth(3).max_depth(3) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    warn!(error = %err, "skipping unreadable buffer entry");
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(SEGMENT_EXT) {
                continue;
            }
            let seq = match path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.parse::<u64>().ok())
            {
                Some(seq) => seq,
                None => continue,
            };

            if segment_age(path).map_or(false, |age| age >= max_age) {
                debug!(path = %path.display(), "evicting expired buffer segment");
                if let Err(err) = fs::remove_file(path) {
                    warn!(path = %path.display(), error = %err, "failed to evict segment");
                }
                continue;
            }

            let mut components = path.strip_prefix(&self.root).ok().map(Path::components);
            let (service, category) = match components.as_mut().map(|c| {
                (
                    c.next().map(|p| p.as_os_str().to_string_lossy().to_string()),
                    c.next().map(|p| p.as_os_str().to_string_lossy().to_string()),
                )
            }) {
                Some((Some(service), Some(category))) => (service, category),
                _ => continue,
            };

            segments.push((service, category, seq, path.to_path_buf()));
        }

        segments.sort();

        let mut records = Vec::with_capacity(segments.len());
        for (service, category, seq, path) in segments {
            match fs::read(&path).map_err(SleError::from).and_then(|bytes| {
                serde_json::from_slice::<LogRecord>(&bytes).map_err(SleError::from)
            }) {
                Ok(mut record) => {
                    record.wal_seq = Some(seq);
                    records.push(record);
                }
                Err(err) => {
                    warn!(
                        path = %path.display(),
                        service, category, error = %err,
                        "quarantining undecodable buffer segment"
                    );
                    let bad = path.with_extension(format!("{SEGMENT_EXT}.bad"));
                    if let Err(err) = fs::rename(&path, &bad) {
                        warn!(path = %path.display(), error = %err, "failed to quarantine segment");
                    }
                }
            }
        }
        Ok(records)
    }

    fn source_dir(&self, source: &SourceId) -> PathBuf {
        self.root.join(&source.service).join(&source.category)
    }

    /// Next sequence for a source directory: cached after the first scan,
    /// starting at the maximum existing segment number plus one.
    fn next_sequence(&self, source: &SourceId, dir: &Path) -> Result<u64> {
        let key = (source.service.clone(), source.category.clone());
        let mut cache = self.next_seq.lock();
        let next = match cache.get(&key) {
            Some(next) => *next,
            None => scan_max_seq(dir)? + 1,
        };
        cache.insert(key, next + 1);
        Ok(next)
    }
}

impl CommitSink for Wal {
    fn commit(&self, source: &SourceId, segments: &[u64]) {
        let dir = self.source_dir(source);
        for seq in segments {
            let path = dir.join(format!("{seq}.{SEGMENT_EXT}"));
            if let Err(err) = fs::remove_file(&path) {
                warn!(path = %path.display(), error = %err, "failed to unlink committed segment");
            }
        }
    }
}

fn segment_age(path: &Path) -> Option<Duration> {
    fs::metadata(path)
        .and_then(|meta| meta.modified())
        .ok()
        .and_then(|mtime| mtime.elapsed().ok())
}

fn scan_max_seq(dir: &Path) -> Result<u64> {
    let mut max = 0;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some(SEGMENT_EXT) {
            continue;
        }
        if let Some(seq) = path
            .file_stem()
            .and_then(|s| s.to_str())
            .and_then(|s| s.parse::<u64>().ok())
        {
            max = max.max(seq);
        }
    }
    Ok(max)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::OverflowPolicy;
    use chrono::{TimeZone, Utc};
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn record(text: &str) -> LogRecord {
        let mut labels = BTreeMap::new();
        labels.insert("job".to_string(), "sle".to_string());
        labels.insert("name".to_string(), "svc".to_string());
        LogRecord {
            text: text.to_string(),
            timestamp: Utc.with_ymd_and_hms(2025, 10, 17, 0, 26, 16).unwrap(),
            labels,
            source_id: SourceId::new("svc", "CAT", "/tmp/w.log"),
            overflow_policy: OverflowPolicy::Disk,
            wal_seq: None,
        }
    }

    #[test]
    fn round_trip() {
        let dir = TempDir::new().unwrap();
        let wal = Wal::new(dir.path());

        let original = record("hello");
        wal.append(&original).unwrap();

        let replayed = wal.replay().unwrap();
        assert_eq!(replayed.len(), 1);
        let got = &replayed[0];
        assert_eq!(got.text, original.text);
        assert_eq!(got.timestamp, original.timestamp);
        assert_eq!(got.labels, original.labels);
        assert_eq!(got.source_id, original.source_id);
        assert_eq!(got.overflow_policy, original.overflow_policy);
        assert_eq!(got.wal_seq, Some(1));
    }

    #[test]
    fn sequences_are_strictly_increasing_and_replay_in_order() {
        let dir = TempDir::new().unwrap();
        let wal = Wal::new(dir.path());

        for n in 0..5 {
            let seq = wal.append(&record(&format!("line {n}"))).unwrap();
            assert_eq!(seq, n + 1);
        }

        let replayed = wal.replay().unwrap();
        let texts: Vec<_> = replayed.iter().map(|r| r.text.as_str()).collect();
        assert_eq!(texts, ["line 0", "line 1", "line 2", "line 3", "line 4"]);
    }

    #[test]
    fn sequence_scan_resumes_after_restart() {
        let dir = TempDir::new().unwrap();
        {
            let wal = Wal::new(dir.path());
            wal.append(&record("before")).unwrap();
            wal.append(&record("before")).unwrap();
        }
        // Fresh instance rescans the directory instead of restarting at 1.
        let wal = Wal::new(dir.path());
        assert_eq!(wal.append(&record("after")).unwrap(), 3);
    }

    #[test]
    fn commit_unlinks_segments() {
        let dir = TempDir::new().unwrap();
        let wal = Wal::new(dir.path());

        let source = record("x").source_id;
        let seq_a = wal.append(&record("a")).unwrap();
        let _seq_b = wal.append(&record("b")).unwrap();

        wal.commit(&source, &[seq_a]);
        let replayed = wal.replay().unwrap();
        assert_eq!(replayed.len(), 1);
        assert_eq!(replayed[0].text, "b");
    }

    #[test]
    fn undecodable_segment_is_quarantined() {
        let dir = TempDir::new().unwrap();
        let wal = Wal::new(dir.path());
        wal.append(&record("good")).unwrap();

        let bad_path = dir.path().join("svc").join("CAT").join("99.rec");
        fs::write(&bad_path, b"not json").unwrap();

        let replayed = wal.replay().unwrap();
        assert_eq!(replayed.len(), 1);
        assert!(!bad_path.exists());
        assert!(bad_path.with_extension("rec.bad").exists());

        // Quarantined segments are never retried.
        assert_eq!(wal.replay().unwrap().len(), 1);
    }

    #[test]
    fn expired_segments_are_evicted_unread() {
        let dir = TempDir::new().unwrap();
        let wal = Wal::new(dir.path());
        wal.append(&record("old")).unwrap();

        let replayed = wal.replay_with_max_age(Duration::ZERO).unwrap();
        assert!(replayed.is_empty());
        assert!(wal.replay().unwrap().is_empty());
    }

    #[test]
    fn replay_on_missing_root_is_empty() {
        let dir = TempDir::new().unwrap();
        let wal = Wal::new(dir.path().join("never-created"));
        assert!(wal.replay().unwrap().is_empty());
    }
}
