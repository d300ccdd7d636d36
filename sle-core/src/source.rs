//! Immutable descriptors for watched sources.

use crate::record::{OverflowPolicy, SourceId};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Descriptor created from configuration for one watched file or journal
/// stream. One `SourceSpec` may expand to several concrete paths when `path`
/// is a glob pattern; rate limiting and batching then apply per matched file.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceSpec {
    /// Service name, sanitized (no `..`, no path separators).
    pub service: String,
    /// Category name, sanitized like `service`.
    pub category: String,
    /// Absolute path; a literal file or a glob pattern.
    pub path: String,
    /// Byte sequence separating records. Default is a single line feed.
    pub delimiter: Vec<u8>,
    /// User-supplied labels merged into every record.
    pub labels: BTreeMap<String, String>,
    /// Maximum records per second admitted, or `None` for unlimited.
    pub rate_limit: Option<f64>,
    /// Maximum records per outgoing batch.
    pub buffer_size: usize,
    /// Policy applied when the queue or the limiter rejects a record.
    pub overflow_policy: OverflowPolicy,
}

impl SourceSpec {
    /// Source identity for a concrete matched path.
    pub fn source_id(&self, filepath: &str) -> SourceId {
        SourceId::new(&self.service, &self.category, filepath)
    }

    /// Whether `path` needs glob expansion.
    pub fn is_pattern(&self) -> bool {
        is_glob_pattern(&self.path)
    }

    /// Spec for the journal stream of one systemd unit. The unit name becomes
    /// the category (upper-cased, `.service` suffix dropped).
    pub fn for_journal_unit(unit: &str, labels: &BTreeMap<String, String>) -> Arc<Self> {
        let subname = unit.strip_suffix(".service").unwrap_or(unit).to_uppercase();
        Arc::new(Self {
            service: "journald".to_string(),
            category: subname,
            path: format!("journald:{unit}"),
            delimiter: b"\n".to_vec(),
            labels: labels.clone(),
            rate_limit: None,
            buffer_size: 1,
            overflow_policy: OverflowPolicy::Drop,
        })
    }
}

/// A path is a pattern when it contains any of `*`, `?`, `[`.
pub fn is_glob_pattern(path: &str) -> bool {
    path.contains(['*', '?', '['])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pattern_detection() {
        assert!(is_glob_pattern("/var/log/*.log"));
        assert!(is_glob_pattern("/var/log/app-?.log"));
        assert!(is_glob_pattern("/var/log/app[0-9].log"));
        assert!(!is_glob_pattern("/var/log/app.log"));
    }

    #[test]
    fn journal_spec_strips_unit_suffix() {
        let spec = SourceSpec::for_journal_unit("nginx.service", &BTreeMap::new());
        assert_eq!(spec.service, "journald");
        assert_eq!(spec.category, "NGINX");
        assert_eq!(spec.path, "journald:nginx.service");
    }
}
