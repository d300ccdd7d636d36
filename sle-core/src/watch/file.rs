//! Poll-based tailer for one concrete file path.
//!
//! The tailer never uses filesystem notifications: polling keeps behavior
//! identical across local and network filesystems. Rotation is detected by
//! comparing the open handle's device/inode identity against a fresh stat;
//! in-place truncation by the stat size falling behind the read offset.

use crate::pipeline::Pipeline;
use crate::source::SourceSpec;
use crate::watch::{cancelled_within, next_backoff, BACKOFF_START};
use std::io::SeekFrom;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Idle delay between read attempts once the file is drained.
const IDLE_POLL: Duration = Duration::from_millis(100);

const READ_CHUNK: usize = 8 * 1024;

/// Where the first successful open starts reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartPosition {
    /// Skip historical content; tail only what is appended from now on.
    /// Used for files that already existed when the agent came up.
    End,
    /// Read the whole file. Used for files that appeared while the agent was
    /// already running, where everything in them is new.
    Beginning,
}

/// Tails one file and feeds complete records into the pipeline.
#[derive(Debug)]
pub struct FileTailer {
    spec: Arc<SourceSpec>,
    path: PathBuf,
    pipeline: Pipeline,
    start: StartPosition,
}

impl FileTailer {
    pub fn new(
        spec: Arc<SourceSpec>,
        path: PathBuf,
        pipeline: Pipeline,
        start: StartPosition,
    ) -> Self {
        Self {
            spec,
            path,
            pipeline,
            start,
        }
    }

    /// Run until cancelled. States: opening (with backoff while the file is
    /// missing), reading, rotated (reopen).
    pub async fn run(self, cancel: CancellationToken) {
        let path_str = self.path.to_string_lossy().to_string();
        let mut backoff = BACKOFF_START;
        let mut first_open = true;

        info!(path = %path_str, source = %self.spec.source_id(&path_str), "tailing file");

        'opening: loop {
            if cancel.is_cancelled() {
                break;
            }

            let mut file = match File::open(&self.path).await {
                Ok(file) => file,
                Err(err) => {
                    debug!(path = %path_str, error = %err, "file not readable, waiting");
                    if cancelled_within(&cancel, backoff).await {
                        break;
                    }
                    backoff = next_backoff(backoff);
                    continue;
                }
            };
            backoff = BACKOFF_START;

            let identity = match file.metadata().await {
                Ok(meta) => file_identity(&meta),
                Err(err) => {
                    warn!(path = %path_str, error = %err, "stat after open failed");
                    if cancelled_within(&cancel, backoff).await {
                        break;
                    }
                    continue;
                }
            };

            // A reopen after rotation always reads the fresh file from the
            // top; the first open honors the configured start position.
            let mut offset: u64 = if first_open && self.start == StartPosition::End {
                match file.seek(SeekFrom::End(0)).await {
                    Ok(offset) => offset,
                    Err(err) => {
                        warn!(path = %path_str, error = %err, "seek to end failed");
                        continue;
                    }
                }
            } else {
                0
            };
            first_open = false;

            let mut partial: Vec<u8> = Vec::new();
            let mut chunk = vec![0u8; READ_CHUNK];

            // READING
            loop {
                if cancel.is_cancelled() {
                    break 'opening;
                }

                let mut progressed = false;
                loop {
                    match file.read(&mut chunk).await {
                        Ok(0) => break,
                        Ok(n) => {
                            progressed = true;
                            offset += n as u64;
                            partial.extend_from_slice(&chunk[..n]);
                            self.emit_complete(&mut partial, &path_str);
                        }
                        Err(err) => {
                            warn!(path = %path_str, error = %err, "read failed");
                            break;
                        }
                    }
                }
                if progressed {
                    continue;
                }

                if cancelled_within(&cancel, IDLE_POLL).await {
                    break 'opening;
                }

                match tokio::fs::metadata(&self.path).await {
                    // Path gone: rotated away.
                    Err(_) => {
                        debug!(path = %path_str, "path disappeared, reopening");
                        continue 'opening;
                    }
                    Ok(meta) => {
                        if file_identity(&meta) != identity {
                            debug!(path = %path_str, "inode changed, reopening");
                            continue 'opening;
                        }
                        if meta.len() < offset {
                            debug!(path = %path_str, "file truncated, rewinding");
                            if file.seek(SeekFrom::Start(0)).await.is_err() {
                                continue 'opening;
                            }
                            offset = 0;
                            partial.clear();
                        }
                    }
                }
            }
        }

        debug!(path = %path_str, "tailer stopped");
    }

    /// Split the buffered bytes on the source delimiter and push every
    /// complete record through the pipeline. The trailing partial record
    /// stays buffered for the next read.
    fn emit_complete(&self, partial: &mut Vec<u8>, path_str: &str) {
        for raw in split_off_records(partial, &self.spec.delimiter) {
            let line = String::from_utf8_lossy(&raw);
            self.pipeline.ingest_line(&self.spec, path_str, &line);
        }
    }
}

fn file_identity(meta: &std::fs::Metadata) -> (u64, u64) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        (meta.dev(), meta.ino())
    }
    #[cfg(not(unix))]
    {
        let _ = meta;
        (0, 0)
    }
}

/// Drain all delimiter-terminated records off the front of `buf`.
fn split_off_records(buf: &mut Vec<u8>, delimiter: &[u8]) -> Vec<Vec<u8>> {
    let mut records = Vec::new();
    if delimiter.is_empty() {
        return records;
    }
    while let Some(pos) = find_subsequence(buf, delimiter) {
        let rest = buf.split_off(pos + delimiter.len());
        let mut record = std::mem::replace(buf, rest);
        record.truncate(pos);
        records.push(record);
    }
    records
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}
