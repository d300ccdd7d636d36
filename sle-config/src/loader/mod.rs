//! Config-directory loading and key classification.
//!
//! Every `.json`/`.yaml`/`.yml` file in the directory is parsed and merged
//! into one logical config. Top-level keys fall into three classes: global
//! settings (honored only in the `default` file), backend endpoints
//! (`<KIND>_IP`), and service blocks (everything else).

pub mod error;

use crate::models::{sanitize_name, Config, GlobalSettings, DEFAULT_FILE_STEM};
use error::ConfigError;
use serde::Deserialize;
use serde_json::Value;
use sle_core::{BackendKind, BackendSpec, OverflowPolicy, SourceSpec};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

const GLOBAL_KEYS: [&str; 4] = [
    "AUTO_RELOAD",
    "QUEUE_SIZE",
    "JOURNALCTL",
    "JOURNALCTL_LABELS",
];

/// Loads and validates the config directory.
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    dir: PathBuf,
}

/// `<KIND>_IP` values come as a bare URL or a list of URLs; both normalize
/// to a list.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl OneOrMany {
    fn into_vec(self) -> Vec<String> {
        match self {
            Self::One(url) => vec![url],
            Self::Many(urls) => urls,
        }
    }
}

/// Raw per-category block, before validation. Unknown fields are collected
/// and warned about rather than rejected.
#[derive(Debug, Deserialize)]
struct RawSourceSpec {
    path_file: Option<String>,
    delimiter: Option<String>,
    labels: Option<Value>,
    rate_limit: Option<f64>,
    buffer_size: Option<i64>,
    disk_buffer: Option<String>,
    #[serde(flatten)]
    unknown: BTreeMap<String, Value>,
}

impl ConfigLoader {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Load, merge, and validate every config file in the directory.
    pub fn load(&self) -> Result<Config, ConfigError> {
        let mut files: Vec<PathBuf> = fs::read_dir(&self.dir)
            .map_err(|source| ConfigError::Directory {
                path: self.dir.clone(),
                source,
            })?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| {
                matches!(
                    path.extension().and_then(|e| e.to_str()),
                    Some("json" | "yaml" | "yml")
                )
            })
            .collect();
        files.sort();

        let mut config = Config::default();
        for path in &files {
            self.merge_file(path, &mut config)?;
        }
        Ok(config)
    }

    fn merge_file(&self, path: &Path, config: &mut Config) -> Result<(), ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let parsed: Value = if path.extension().and_then(|e| e.to_str()) == Some("json") {
            serde_json::from_str(&text).map_err(|err| ConfigError::Parse {
                path: path.to_path_buf(),
                message: err.to_string(),
            })?
        } else {
            serde_yaml::from_str(&text).map_err(|err| ConfigError::Parse {
                path: path.to_path_buf(),
                message: err.to_string(),
            })?
        };

        let object = match parsed {
            Value::Object(object) => object,
            Value::Null => return Ok(()),
            _ => {
                return Err(ConfigError::Parse {
                    path: path.to_path_buf(),
                    message: "top level must be an object".to_string(),
                })
            }
        };

        let is_default_file = path
            .file_stem()
            .and_then(|s| s.to_str())
            .map(|stem| stem.eq_ignore_ascii_case(DEFAULT_FILE_STEM))
            .unwrap_or(false);

        for (key, value) in object {
            if GLOBAL_KEYS.contains(&key.as_str()) {
                if is_default_file {
                    apply_global(path, &key, value, &mut config.globals)?;
                } else {
                    warn!(file = %path.display(), key, "global key outside the default file is ignored");
                }
                continue;
            }

            if key.ends_with("_IP") {
                let kind = BackendKind::from_config_key(&key).ok_or_else(|| {
                    ConfigError::Invalid {
                        path: path.to_path_buf(),
                        key: key.clone(),
                        message: "unknown backend kind".to_string(),
                    }
                })?;
                let endpoints = parse_endpoints(path, &key, value)?;
                merge_backend(&mut config.backends, kind, endpoints);
                continue;
            }

            parse_service(path, &key, value, &mut config.sources)?;
        }
        Ok(())
    }
}

fn apply_global(
    path: &Path,
    key: &str,
    value: Value,
    globals: &mut GlobalSettings,
) -> Result<(), ConfigError> {
    let invalid = |message: &str| ConfigError::Invalid {
        path: path.to_path_buf(),
        key: key.to_string(),
        message: message.to_string(),
    };

    match key {
        "AUTO_RELOAD" => {
            globals.auto_reload = value
                .as_u64()
                .ok_or_else(|| invalid("expected a non-negative integer"))?;
        }
        "QUEUE_SIZE" => {
            let size = value
                .as_u64()
                .ok_or_else(|| invalid("expected a non-negative integer"))?;
            if size == 0 {
                return Err(invalid("queue size must be positive"));
            }
            globals.queue_size = Some(size as usize);
        }
        "JOURNALCTL" => {
            globals.journalctl = match value.as_str() {
                Some("on") => true,
                Some("off") => false,
                _ => return Err(invalid("expected \"on\" or \"off\"")),
            };
        }
        "JOURNALCTL_LABELS" => {
            globals.journal_labels = parse_labels(path, key, &value)?;
        }
        _ => unreachable!("key checked against GLOBAL_KEYS"),
    }
    Ok(())
}

fn parse_endpoints(path: &Path, key: &str, value: Value) -> Result<Vec<String>, ConfigError> {
    let urls: OneOrMany =
        serde_json::from_value(value).map_err(|_| ConfigError::Invalid {
            path: path.to_path_buf(),
            key: key.to_string(),
            message: "expected a URL string or a list of URL strings".to_string(),
        })?;
    let urls = urls.into_vec();
    if urls.is_empty() || urls.iter().any(|url| url.trim().is_empty()) {
        return Err(ConfigError::Invalid {
            path: path.to_path_buf(),
            key: key.to_string(),
            message: "endpoint list must be non-empty".to_string(),
        });
    }
    Ok(urls)
}

fn merge_backend(backends: &mut Vec<BackendSpec>, kind: BackendKind, endpoints: Vec<String>) {
    match backends.iter_mut().find(|b| b.kind == kind) {
        Some(existing) => {
            for endpoint in endpoints {
                if !existing.endpoints.contains(&endpoint) {
                    existing.endpoints.push(endpoint);
                }
            }
        }
        None => backends.push(BackendSpec { kind, endpoints }),
    }
}

fn parse_service(
    path: &Path,
    service_key: &str,
    value: Value,
    sources: &mut Vec<SourceSpec>,
) -> Result<(), ConfigError> {
    let service = sanitize_name(service_key);
    if service.is_empty() {
        return Err(ConfigError::Invalid {
            path: path.to_path_buf(),
            key: service_key.to_string(),
            message: "service name is empty after sanitization".to_string(),
        });
    }

    let categories = match value {
        Value::Object(categories) => categories,
        _ => {
            return Err(ConfigError::Invalid {
                path: path.to_path_buf(),
                key: service_key.to_string(),
                message: "expected an object of categories".to_string(),
            })
        }
    };

    for (category_key, spec_value) in categories {
        let qualified = format!("{service_key}.{category_key}");
        let category = sanitize_name(&category_key);
        if category.is_empty() {
            return Err(ConfigError::Invalid {
                path: path.to_path_buf(),
                key: qualified,
                message: "category name is empty after sanitization".to_string(),
            });
        }

        let raw: RawSourceSpec =
            serde_json::from_value(spec_value).map_err(|err| ConfigError::Invalid {
                path: path.to_path_buf(),
                key: qualified.clone(),
                message: err.to_string(),
            })?;

        let spec = validate_source(path, &qualified, &service, &category, raw)?;
        if let Some(existing) = sources
            .iter_mut()
            .find(|s| s.service == spec.service && s.category == spec.category)
        {
            warn!(
                file = %path.display(),
                key = %qualified,
                "duplicate source definition, later file wins"
            );
            *existing = spec;
        } else {
            sources.push(spec);
        }
    }
    Ok(())
}

fn validate_source(
    path: &Path,
    qualified: &str,
    service: &str,
    category: &str,
    raw: RawSourceSpec,
) -> Result<SourceSpec, ConfigError> {
    let invalid = |message: String| ConfigError::Invalid {
        path: path.to_path_buf(),
        key: qualified.to_string(),
        message,
    };

    for unknown in raw.unknown.keys() {
        warn!(file = %path.display(), key = %qualified, field = %unknown, "unknown field is ignored");
    }

    let path_file = raw
        .path_file
        .ok_or_else(|| invalid("`path_file` is required".to_string()))?;
    if !Path::new(&path_file).is_absolute() {
        return Err(invalid(format!("`path_file` must be absolute: {path_file}")));
    }

    let delimiter = raw.delimiter.unwrap_or_else(|| "\n".to_string());
    if delimiter.is_empty() {
        return Err(invalid("`delimiter` must not be empty".to_string()));
    }

    let rate_limit = match raw.rate_limit {
        Some(rate) if rate < 0.0 => {
            return Err(invalid(format!("`rate_limit` must be >= 0, got {rate}")))
        }
        Some(rate) if rate > 0.0 => Some(rate),
        _ => None,
    };

    let buffer_size = match raw.buffer_size {
        Some(size) if size < 0 => {
            return Err(invalid(format!("`buffer_size` must be >= 0, got {size}")))
        }
        Some(size) => (size as usize).max(1),
        None => 1,
    };

    let overflow_policy = match raw.disk_buffer.as_deref() {
        None => OverflowPolicy::Drop,
        Some(policy) => match policy.to_uppercase().as_str() {
            "DROP" => OverflowPolicy::Drop,
            "DISK" => OverflowPolicy::Disk,
            other => {
                return Err(invalid(format!(
                    "`disk_buffer` must be \"DROP\" or \"DISK\", got {other:?}"
                )))
            }
        },
    };

    let labels = match &raw.labels {
        None => BTreeMap::new(),
        Some(value) => parse_labels(path, qualified, value)?,
    };

    Ok(SourceSpec {
        service: service.to_string(),
        category: category.to_string(),
        path: path_file,
        delimiter: delimiter.into_bytes(),
        labels,
        rate_limit,
        buffer_size,
        overflow_policy,
    })
}

/// Label maps must be string-to-string; non-string scalars are rejected at
/// parse time.
fn parse_labels(
    path: &Path,
    key: &str,
    value: &Value,
) -> Result<BTreeMap<String, String>, ConfigError> {
    let invalid = |message: &str| ConfigError::Invalid {
        path: path.to_path_buf(),
        key: key.to_string(),
        message: message.to_string(),
    };

    let object = value
        .as_object()
        .ok_or_else(|| invalid("labels must be an object"))?;
    let mut labels = BTreeMap::new();
    for (name, label_value) in object {
        let label_value = label_value
            .as_str()
            .ok_or_else(|| invalid("label values must be strings"))?;
        labels.insert(name.clone(), label_value.to_string());
    }
    Ok(labels)
}
