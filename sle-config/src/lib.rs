//! Shared configuration library for SLE.
//!
//! This crate centralizes config-directory loading, file merging, key
//! classification (globals, backends, services), validation, and name
//! sanitization. The `sle` binary consumes it at startup and on auto-reload
//! so there is a single source of truth for defaults and validation rules.

pub mod loader;
pub mod models;

pub use loader::{error::ConfigError, ConfigLoader};
pub use models::{Config, GlobalSettings, DEFAULT_BUFFER_DIR, DEFAULT_CONFIG_DIR};
