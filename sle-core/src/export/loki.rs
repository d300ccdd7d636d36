//! Loki push-API payload construction.
//!
//! Conformant to the public API: one stream per distinct label set, entries
//! as `[nanosecond-epoch-as-string, line]` pairs, intra-stream order
//! preserved.

use crate::record::LogRecord;
use serde_json::{json, Value};
use std::collections::BTreeMap;

/// Default push endpoint path, appended when the configured URL has none.
const PUSH_PATH: &str = "/loki/api/v1/push";

/// Resolve the push URL for a configured endpoint. An endpoint with an
/// explicit path is used as-is.
pub fn push_url(endpoint: &str) -> String {
    let trimmed = endpoint.trim_end_matches('/');
    if let Some(scheme_end) = trimmed.find("://") {
        if trimmed[scheme_end + 3..].contains('/') {
            return endpoint.to_string();
        }
    }
    format!("{trimmed}{PUSH_PATH}")
}

/// Build the push body for one batch. Records in a batch share a source but
/// may differ in the `level` label, so streams are grouped by the full label
/// set.
pub fn payload(records: &[LogRecord]) -> Value {
    let mut streams: Vec<(&BTreeMap<String, String>, Vec<Value>)> = Vec::new();
    for record in records {
        let entry = json!([record.timestamp_nanos().to_string(), record.text]);
        match streams.iter_mut().find(|(labels, _)| *labels == &record.labels) {
            Some((_, values)) => values.push(entry),
            None => streams.push((&record.labels, vec![entry])),
        }
    }

    json!({
        "streams": streams
            .into_iter()
            .map(|(labels, values)| json!({ "stream": labels, "values": values }))
            .collect::<Vec<_>>(),
    })
}
