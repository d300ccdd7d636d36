//! Shared JSON body for backends without a dedicated serializer.

use crate::record::LogRecord;
use chrono::SecondsFormat;
use serde_json::{json, Value};

/// One object per record, keyed by `timestamp`, `labels`, `message`.
pub fn payload(records: &[LogRecord]) -> Value {
    Value::Array(
        records
            .iter()
            .map(|record| {
                json!({
                    "timestamp": record
                        .timestamp
                        .to_rfc3339_opts(SecondsFormat::Nanos, true),
                    "labels": record.labels,
                    "message": record.text,
                })
            })
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{OverflowPolicy, SourceId};
    use chrono::{TimeZone, Utc};
    use std::collections::BTreeMap;

    #[test]
    fn one_object_per_record() {
        let record = LogRecord {
            text: "hello".to_string(),
            timestamp: Utc.with_ymd_and_hms(2025, 10, 17, 0, 26, 16).unwrap(),
            labels: BTreeMap::new(),
            source_id: SourceId::new("svc", "CAT", "/tmp/a.log"),
            overflow_policy: OverflowPolicy::Drop,
            wal_seq: None,
        };
        let body = payload(&[record]);
        let entries = body.as_array().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0]["message"], "hello");
        assert_eq!(entries[0]["timestamp"], "2025-10-17T00:26:16.000000000Z");
    }
}
