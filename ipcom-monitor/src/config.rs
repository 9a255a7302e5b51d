//! Configuration for the monitor binary.

use std::path::Path;

use ipcom_core::EngineConfig;
use serde::{Deserialize, Serialize};

/// Top-level configuration loaded from a TOML file.
///
/// The engine sections (`[controller]`, `[timing]`, `[reconnect]`) sit at
/// the top level next to `[logging]`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    #[serde(flatten)]
    pub engine: EngineConfig,
    /// Logging settings.
    pub logging: LoggingConfig,
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level or filter directive, e.g. "info" or "ipcom_core=debug".
    pub level: String,
    /// Log every snapshot, not only changed outputs.
    pub log_every_snapshot: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            log_every_snapshot: false,
        }
    }
}

// ── Loading ──────────────────────────────────────────────────────

impl MonitorConfig {
    /// Load configuration from a TOML file, falling back to defaults.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_else(|e| {
                tracing::warn!("invalid config {}: {e}; using defaults", path.display());
                Self::default()
            }),
            Err(_) => {
                tracing::info!("no config at {}; using defaults", path.display());
                Self::default()
            }
        }
    }

    /// The default configuration as TOML (for bootstrapping).
    pub fn default_toml() -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(&Self::default())
    }
}

// ── Tests ────────────────────────────────────────────────────────
