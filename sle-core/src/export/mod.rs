//! Batch dispatch to the configured backends.
//!
//! Serialize once per backend kind, POST to every endpoint concurrently,
//! retry transient failures per endpoint, and call a batch delivered as soon
//! as any endpoint accepts it.

pub mod generic;
pub mod loki;

use crate::batcher::Batch;
use crate::error::{Result, SleError};
use crate::pipeline::PipelineStats;
use crate::wal::CommitSink;
use std::fmt;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Total deadline for one HTTP request.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
/// Retries after the initial attempt, per endpoint.
const MAX_RETRIES: u32 = 4;
const RETRY_BASE: Duration = Duration::from_millis(100);
const RETRY_CAP: Duration = Duration::from_secs(5);

/// Supported backend families, derived from the `<KIND>_IP` config key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Loki,
    Elastic,
    Opensearch,
    Graylog,
    Victorialogs,
    Clickhouse,
    Fluentbit,
    Kafka,
    Cloudwatch,
    Gcp,
    Azure,
}

impl BackendKind {
    /// Parse a top-level config key like `LOKI_IP`. Returns `None` when the
    /// key does not name a backend.
    pub fn from_config_key(key: &str) -> Option<Self> {
        let kind = key.strip_suffix("_IP")?;
        match kind {
            "LOKI" => Some(Self::Loki),
            "ELASTIC" | "ELASTICSEARCH" => Some(Self::Elastic),
            "OPENSEARCH" => Some(Self::Opensearch),
            "GRAYLOG" => Some(Self::Graylog),
            "VICTORIALOGS" => Some(Self::Victorialogs),
            "CLICKHOUSE" => Some(Self::Clickhouse),
            "FLUENTBIT" => Some(Self::Fluentbit),
            "KAFKA" => Some(Self::Kafka),
            "CLOUDWATCH" => Some(Self::Cloudwatch),
            "GCP" => Some(Self::Gcp),
            "AZURE" => Some(Self::Azure),
            _ => None,
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Loki => "loki",
            Self::Elastic => "elastic",
            Self::Opensearch => "opensearch",
            Self::Graylog => "graylog",
            Self::Victorialogs => "victorialogs",
            Self::Clickhouse => "clickhouse",
            Self::Fluentbit => "fluentbit",
            Self::Kafka => "kafka",
            Self::Cloudwatch => "cloudwatch",
            Self::Gcp => "gcp",
            Self::Azure => "azure",
        };
        f.write_str(name)
    }
}

/// One configured backend: a kind plus its endpoint list. A single URL in
/// the config normalizes to a one-element list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendSpec {
    pub kind: BackendKind,
    pub endpoints: Vec<String>,
}

/// Result of dispatching one batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportOutcome {
    /// At least one endpoint accepted the batch.
    Delivered,
    /// Every endpoint refused; the caller applies the overflow policy.
    Failed,
}

/// HTTP dispatcher shared by the export task.
pub struct Exporter {
    client: reqwest::Client,
    backends: Vec<BackendSpec>,
    commit: Arc<dyn CommitSink>,
    stats: Arc<PipelineStats>,
}

impl fmt::Debug for Exporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Exporter")
            .field("backends", &self.backends)
            .finish()
    }
}

impl Exporter {
    pub fn new(
        backends: Vec<BackendSpec>,
        commit: Arc<dyn CommitSink>,
        stats: Arc<PipelineStats>,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|err| SleError::Export(format!("http client: {err}")))?;
        Ok(Self {
            client,
            backends,
            commit,
            stats,
        })
    }

    /// Dispatch one batch to every configured endpoint concurrently. On
    /// delivery, replayed buffer segments in the batch are committed.
    pub async fn export(&self, batch: &Batch) -> ExportOutcome {
        if self.backends.is_empty() {
            return ExportOutcome::Failed;
        }

        let mut attempts = Vec::new();
        for backend in &self.backends {
            let body = match backend.kind {
                BackendKind::Loki => loki::payload(&batch.records).to_string(),
                _ => generic::payload(&batch.records).to_string(),
            };
            let body = Arc::new(body);
            for endpoint in &backend.endpoints {
                let url = match backend.kind {
                    BackendKind::Loki => loki::push_url(endpoint),
                    _ => endpoint.clone(),
                };
                attempts.push(self.send_with_retry(url, Arc::clone(&body)));
            }
        }

        let delivered = futures::future::join_all(attempts)
            .await
            .into_iter()
            .any(|accepted| accepted);

        if delivered {
            self.stats.batches_delivered.fetch_add(1, Ordering::Relaxed);
            let segments = batch.wal_segments();
            if !segments.is_empty() {
                self.commit.commit(&batch.source_id, &segments);
            }
            ExportOutcome::Delivered
        } else {
            self.stats.batches_failed.fetch_add(1, Ordering::Relaxed);
            warn!(source = %batch.source_id, records = batch.records.len(), "batch refused by every endpoint");
            ExportOutcome::Failed
        }
    }

    /// One endpoint: retry connection errors, 5xx, and 429 with exponential
    /// backoff; any other 4xx means the payload is poisoned and is not
    /// retried.
    async fn send_with_retry(&self, url: String, body: Arc<String>) -> bool {
        for attempt in 0..=MAX_RETRIES {
            let result = self
                .client
                .post(&url)
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .body(body.as_str().to_owned())
                .send()
                .await;

            match result {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return true;
                    }
                    if !(status.as_u16() == 429 || status.is_server_error()) {
                        warn!(%url, %status, "endpoint rejected batch permanently");
                        return false;
                    }
                    debug!(%url, %status, attempt, "endpoint busy, will retry");
                }
                Err(err) => {
                    debug!(%url, error = %err, attempt, "request failed, will retry");
                }
            }

            if attempt < MAX_RETRIES {
                let delay = RETRY_BASE
                    .checked_mul(1 << attempt)
                    .unwrap_or(RETRY_CAP)
                    .min(RETRY_CAP);
                tokio::time::sleep(delay).await;
            }
        }
        warn!(%url, "endpoint unreachable after retries");
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{LogRecord, OverflowPolicy, SourceId};
    use axum::http::StatusCode;
    use axum::response::IntoResponse;
    use axum::Router;
    use chrono::Utc;
    use parking_lot::Mutex;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Default)]
    struct RecordingSink {
        commits: Mutex<Vec<(SourceId, Vec<u64>)>>,
    }

    impl CommitSink for RecordingSink {
        fn commit(&self, source: &SourceId, segments: &[u64]) {
            self.commits
                .lock()
                .push((source.clone(), segments.to_vec()));
        }
    }

    fn batch(wal_seq: Option<u64>) -> Batch {
        let mut labels = BTreeMap::new();
        labels.insert("job".to_string(), "sle".to_string());
        Batch {
            source_id: SourceId::new("svc", "CAT", "/tmp/a.log"),
            records: vec![LogRecord {
                text: "hello".to_string(),
                timestamp: Utc::now(),
                labels,
                source_id: SourceId::new("svc", "CAT", "/tmp/a.log"),
                overflow_policy: OverflowPolicy::Drop,
                wal_seq,
            }],
        }
    }

    /// Mock backend answering every request by policy: fail the first
    /// `failures` hits with 500, then answer `then` for the rest.
    async fn spawn_backend(failures: usize, then: StatusCode) -> (String, Arc<AtomicUsize>) {
        let hits = Arc::new(AtomicUsize::new(0));
        let handler_hits = Arc::clone(&hits);
        let app = Router::new().fallback(move || {
            let hits = Arc::clone(&handler_hits);
            async move {
                let n = hits.fetch_add(1, Ordering::SeqCst);
                if n < failures {
                    StatusCode::INTERNAL_SERVER_ERROR.into_response()
                } else {
                    then.into_response()
                }
            }
        });
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}"), hits)
    }

    fn exporter(backends: Vec<BackendSpec>, sink: Arc<RecordingSink>) -> Exporter {
        Exporter::new(backends, sink, Arc::new(PipelineStats::default())).unwrap()
    }

    #[tokio::test]
    async fn delivered_when_any_endpoint_accepts() {
        let (bad, bad_hits) = spawn_backend(usize::MAX, StatusCode::INTERNAL_SERVER_ERROR).await;
        let (ok, ok_hits) = spawn_backend(0, StatusCode::NO_CONTENT).await;
        let sink = Arc::new(RecordingSink::default());

        let exporter = exporter(
            vec![BackendSpec {
                kind: BackendKind::Loki,
                endpoints: vec![bad, ok],
            }],
            Arc::clone(&sink),
        );

        let outcome = exporter.export(&batch(None)).await;
        assert_eq!(outcome, ExportOutcome::Delivered);
        assert_eq!(ok_hits.load(Ordering::SeqCst), 1);
        // The failing endpoint exhausted its retries without blocking the
        // delivery verdict.
        assert_eq!(bad_hits.load(Ordering::SeqCst), 5);
        assert!(sink.commits.lock().is_empty());
    }

    #[tokio::test]
    async fn retries_until_endpoint_recovers() {
        let (url, hits) = spawn_backend(2, StatusCode::NO_CONTENT).await;
        let sink = Arc::new(RecordingSink::default());
        let exporter = exporter(
            vec![BackendSpec {
                kind: BackendKind::Loki,
                endpoints: vec![url],
            }],
            sink,
        );

        let outcome = exporter.export(&batch(None)).await;
        assert_eq!(outcome, ExportOutcome::Delivered);
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_4xx_is_not_retried() {
        let (url, hits) = spawn_backend(0, StatusCode::BAD_REQUEST).await;
        let sink = Arc::new(RecordingSink::default());
        let exporter = exporter(
            vec![BackendSpec {
                kind: BackendKind::Loki,
                endpoints: vec![url],
            }],
            sink,
        );

        let outcome = exporter.export(&batch(None)).await;
        assert_eq!(outcome, ExportOutcome::Failed);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn connection_refused_exhausts_retries_and_fails() {
        // Bind-then-drop guarantees nothing listens on the port.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let sink = Arc::new(RecordingSink::default());
        let exporter = exporter(
            vec![BackendSpec {
                kind: BackendKind::Loki,
                endpoints: vec![format!("http://{addr}")],
            }],
            sink,
        );

        let outcome = exporter.export(&batch(None)).await;
        assert_eq!(outcome, ExportOutcome::Failed);
    }

    #[tokio::test]
    async fn delivery_commits_replayed_segments() {
        let (url, _) = spawn_backend(0, StatusCode::NO_CONTENT).await;
        let sink = Arc::new(RecordingSink::default());
        let exporter = exporter(
            vec![BackendSpec {
                kind: BackendKind::Loki,
                endpoints: vec![url],
            }],
            Arc::clone(&sink),
        );

        let outcome = exporter.export(&batch(Some(7))).await;
        assert_eq!(outcome, ExportOutcome::Delivered);
        let commits = sink.commits.lock();
        assert_eq!(commits.len(), 1);
        assert_eq!(commits[0].1, vec![7]);
    }

    #[test]
    fn backend_kind_from_config_key() {
        assert_eq!(
            BackendKind::from_config_key("LOKI_IP"),
            Some(BackendKind::Loki)
        );
        assert_eq!(
            BackendKind::from_config_key("ELASTICSEARCH_IP"),
            Some(BackendKind::Elastic)
        );
        assert_eq!(BackendKind::from_config_key("nginx"), None);
        assert_eq!(BackendKind::from_config_key("MYSQL_IP"), None);
    }
}
