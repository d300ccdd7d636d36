//! systemd journal streaming via a `journalctl --follow` child process.

use crate::pipeline::Pipeline;
use crate::record::{
    LogRecord, FILEPATH_LABEL, JOB_LABEL, JOB_VALUE, LEVEL_LABEL, NAME_LABEL, SUBNAME_LABEL,
};
use crate::source::SourceSpec;
use crate::watch::{cancelled_within, next_backoff, BACKOFF_START};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// One decoded journal entry.
#[derive(Debug, Clone, PartialEq)]
pub struct JournalEntry {
    pub unit: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub priority: Option<u8>,
}

/// Streams the journal from the present tail. Each entry becomes a record
/// with `name = "journald"` and the unit (upper-cased, `.service` dropped)
/// as the subname. No cursor is persisted: every start tails from now,
/// matching the file watchers' end-seek behavior.
#[derive(Debug)]
pub struct JournalWatcher {
    labels: BTreeMap<String, String>,
    pipeline: Pipeline,
    specs: HashMap<String, Arc<SourceSpec>>,
}

impl JournalWatcher {
    pub fn new(labels: BTreeMap<String, String>, pipeline: Pipeline) -> Self {
        Self {
            labels,
            pipeline,
            specs: HashMap::new(),
        }
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        let mut backoff = BACKOFF_START;

        info!("streaming systemd journal");

        loop {
            if cancel.is_cancelled() {
                break;
            }

            let mut child = match Command::new("journalctl")
                .args(["--follow", "--output=json", "--since", "now"])
                .stdout(Stdio::piped())
                .stderr(Stdio::null())
                .spawn()
            {
                Ok(child) => child,
                Err(err) => {
                    warn!(error = %err, "failed to start journalctl, waiting");
                    if cancelled_within(&cancel, backoff).await {
                        break;
                    }
                    backoff = next_backoff(backoff);
                    continue;
                }
            };

            let stdout = match child.stdout.take() {
                Some(stdout) => stdout,
                None => {
                    warn!("journalctl spawned without stdout");
                    let _ = child.kill().await;
                    if cancelled_within(&cancel, backoff).await {
                        break;
                    }
                    backoff = next_backoff(backoff);
                    continue;
                }
            };
            let mut lines = BufReader::new(stdout).lines();

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        let _ = child.kill().await;
                        return;
                    }
                    line = lines.next_line() => match line {
                        Ok(Some(line)) => {
                            backoff = BACKOFF_START;
                            self.handle_line(&line);
                        }
                        Ok(None) => {
                            warn!("journalctl stream ended, restarting");
                            break;
                        }
                        Err(err) => {
                            warn!(error = %err, "journal read failed, restarting");
                            break;
                        }
                    }
                }
            }

            let _ = child.kill().await;
            let _ = child.wait().await;
            if cancelled_within(&cancel, backoff).await {
                break;
            }
            backoff = next_backoff(backoff);
        }

        debug!("journal watcher stopped");
    }

    fn handle_line(&mut self, line: &str) {
        let entry = match parse_entry(line) {
            Some(entry) => entry,
            None => {
                debug!("skipping undecodable journal entry");
                return;
            }
        };

        let spec = self
            .specs
            .entry(entry.unit.clone())
            .or_insert_with(|| SourceSpec::for_journal_unit(&entry.unit, &self.labels))
            .clone();

        // The journal already carries the authoritative timestamp and the
        // syslog priority, so the line enricher is bypassed here.
        let mut labels = spec.labels.clone();
        labels.insert(JOB_LABEL.to_string(), JOB_VALUE.to_string());
        labels.insert(NAME_LABEL.to_string(), spec.service.clone());
        labels.insert(SUBNAME_LABEL.to_string(), spec.category.clone());
        labels.insert(FILEPATH_LABEL.to_string(), spec.path.clone());
        if let Some(level) = entry.priority.and_then(priority_level) {
            labels.insert(LEVEL_LABEL.to_string(), level.to_string());
        }

        let record = LogRecord {
            text: entry.message,
            timestamp: entry.timestamp,
            labels,
            source_id: spec.source_id(&spec.path),
            overflow_policy: spec.overflow_policy,
            wal_seq: None,
        };
        self.pipeline.admit(record, spec.rate_limit);
    }
}

/// Decode one `journalctl --output=json` line. Returns `None` for entries
/// without a usable message.
pub fn parse_entry(line: &str) -> Option<JournalEntry> {
    let value: Value = serde_json::from_str(line).ok()?;

    let unit = value
        .get("_SYSTEMD_UNIT")
        .and_then(Value::as_str)
        .or_else(|| value.get("SYSLOG_IDENTIFIER").and_then(Value::as_str))
        .unwrap_or("unknown")
        .to_string();

    let message = match value.get("MESSAGE") {
        Some(Value::String(text)) => text.clone(),
        // journald emits non-UTF-8 payloads as byte arrays.
        Some(Value::Array(bytes)) => {
            let raw: Vec<u8> = bytes
                .iter()
                .filter_map(Value::as_u64)
                .map(|b| b as u8)
                .collect();
            String::from_utf8_lossy(&raw).to_string()
        }
        _ => return None,
    };
    if message.is_empty() {
        return None;
    }

    let timestamp = value
        .get("__REALTIME_TIMESTAMP")
        .and_then(Value::as_str)
        .and_then(|micros| micros.parse::<i64>().ok())
        .and_then(DateTime::<Utc>::from_timestamp_micros)
        .unwrap_or_else(Utc::now);

    let priority = value
        .get("PRIORITY")
        .and_then(Value::as_str)
        .and_then(|p| p.parse::<u8>().ok());

    Some(JournalEntry {
        unit,
        message,
        timestamp,
        priority,
    })
}

/// Map a syslog priority to the level vocabulary used by the enricher.
fn priority_level(priority: u8) -> Option<&'static str> {
    match priority {
        0 => Some("EMERGENCY"),
        1 => Some("ALERT"),
        2 => Some("CRITICAL"),
        3 => Some("ERROR"),
        4 => Some("WARN"),
        5 => Some("NOTICE"),
        6 => Some("INFO"),
        7 => Some("DEBUG"),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_entry() {
        let line = r#"{"_SYSTEMD_UNIT":"nginx.service","MESSAGE":"request handled","__REALTIME_TIMESTAMP":"1760660776000000","PRIORITY":"6"}"#;
        let entry = parse_entry(line).unwrap();
        assert_eq!(entry.unit, "nginx.service");
        assert_eq!(entry.message, "request handled");
        assert_eq!(entry.timestamp.timestamp(), 1_760_660_776);
        assert_eq!(entry.priority, Some(6));
    }

    #[test]
    fn parses_byte_array_message() {
        let line = r#"{"_SYSTEMD_UNIT":"app.service","MESSAGE":[104,105],"__REALTIME_TIMESTAMP":"1760660776000000"}"#;
        let entry = parse_entry(line).unwrap();
        assert_eq!(entry.message, "hi");
    }

    #[test]
    fn skips_entries_without_message() {
        let line = r#"{"_SYSTEMD_UNIT":"app.service","__REALTIME_TIMESTAMP":"1760660776000000"}"#;
        assert!(parse_entry(line).is_none());
    }

    #[test]
    fn falls_back_to_syslog_identifier() {
        let line = r#"{"SYSLOG_IDENTIFIER":"kernel","MESSAGE":"oops"}"#;
        let entry = parse_entry(line).unwrap();
        assert_eq!(entry.unit, "kernel");
    }

    #[test]
    fn priority_maps_to_levels() {
        assert_eq!(priority_level(3), Some("ERROR"));
        assert_eq!(priority_level(4), Some("WARN"));
        assert_eq!(priority_level(9), None);
    }
}
