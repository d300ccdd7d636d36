//! Typed configuration model produced by the loader.

use sle_core::{BackendSpec, SourceSpec};
use std::collections::BTreeMap;

/// Directory scanned for `.json`/`.yaml`/`.yml` config files.
pub const DEFAULT_CONFIG_DIR: &str = "/etc/sle.d";
/// Root of the on-disk overflow buffer.
pub const DEFAULT_BUFFER_DIR: &str = "/var/lib/sle/buffer";

/// The file whose stem may carry global keys.
pub(crate) const DEFAULT_FILE_STEM: &str = "default";

/// Settings recognized only in `default.json`/`default.yml`.
#[derive(Debug, Clone, PartialEq)]
pub struct GlobalSettings {
    /// Seconds between glob re-expansions; zero disables auto-reload.
    pub auto_reload: u64,
    /// Queue capacity. `None` selects the legacy fixed-5000 queue with its
    /// clear-on-overflow behavior.
    pub queue_size: Option<usize>,
    /// Whether the systemd journal watcher runs.
    pub journalctl: bool,
    /// Labels merged into every journal record.
    pub journal_labels: BTreeMap<String, String>,
}

impl Default for GlobalSettings {
    fn default() -> Self {
        Self {
            auto_reload: 0,
            queue_size: None,
            journalctl: false,
            journal_labels: BTreeMap::new(),
        }
    }
}

/// One logical configuration merged from every file in the config directory.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Config {
    pub globals: GlobalSettings,
    pub backends: Vec<BackendSpec>,
    pub sources: Vec<SourceSpec>,
}

impl Config {
    /// A config with no backend cannot ship anything; callers treat this as
    /// a fatal startup error.
    pub fn has_backends(&self) -> bool {
        !self.backends.is_empty()
    }
}

/// Strip `..` and path separators from service and category names so they
/// cannot escape the buffer root.
pub fn sanitize_name(raw: &str) -> String {
    raw.replace("..", "").replace(['/', '\\'], "")
}
