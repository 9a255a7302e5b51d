//! Engine configuration, loadable from TOML.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::IpcomError;

/// Default controller TCP port.
pub const DEFAULT_PORT: u16 = 5000;

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Controller endpoint and credentials.
    pub controller: ControllerConfig,
    /// Loop periods and timeouts.
    pub timing: TimingConfig,
    /// Backoff used after the socket is lost.
    pub reconnect: ReconnectConfig,
}

/// Controller endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Host name or IP address. No default; must be provided.
    pub host: String,
    pub port: u16,
    /// Sent in the login frame when set.
    pub username: Option<String>,
    pub password: Option<String>,
}

/// Loop periods and timeouts, all in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    pub keepalive_interval_ms: u64,
    pub poll_interval_ms: u64,
    /// How long the dispatch loop waits for a command ack.
    pub ack_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    pub handshake_timeout_ms: u64,
    /// Pause between refusing writes and dropping the socket on close.
    pub close_grace_ms: u64,
    /// Upper bound on joining the loops during `stop()`.
    pub shutdown_timeout_ms: u64,
}

/// Exponential backoff parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Used when `start()` is called without an explicit preference.
    pub enabled: bool,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
}

// ── Defaults ─────────────────────────────────────────────────────

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: DEFAULT_PORT,
            username: None,
            password: None,
        }
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            keepalive_interval_ms: 30_000,
            poll_interval_ms: 350,
            ack_timeout_ms: 2_000,
            connect_timeout_ms: 5_000,
            handshake_timeout_ms: 5_000,
            close_grace_ms: 100,
            shutdown_timeout_ms: 5_000,
        }
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            multiplier: 2.0,
        }
    }
}

// ── Accessors ────────────────────────────────────────────────────

impl TimingConfig {
    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_millis(self.keepalive_interval_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn close_grace(&self) -> Duration {
        Duration::from_millis(self.close_grace_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

impl ControllerConfig {
    /// `host:port`, suitable for `TcpStream::connect`.
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

// ── Loading ──────────────────────────────────────────────────────

impl EngineConfig {
    /// Config for `host:port` with every other setting at its default.
    pub fn for_controller(host: impl Into<String>, port: u16) -> Self {
        let mut cfg = Self::default();
        cfg.controller.host = host.into();
        cfg.controller.port = port;
        cfg
    }

    /// Load and validate configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, IpcomError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| IpcomError::Config(format!("{}: {e}", path.display())))?;
        let cfg: Self = toml::from_str(&text)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<(), IpcomError> {
        if self.controller.host.trim().is_empty() {
            return Err(IpcomError::Config("controller.host is required".into()));
        }
        if self.controller.port == 0 {
            return Err(IpcomError::Config("controller.port must be non-zero".into()));
        }
        let t = &self.timing;
        for (name, value) in [
            ("keepalive_interval_ms", t.keepalive_interval_ms),
            ("poll_interval_ms", t.poll_interval_ms),
            ("ack_timeout_ms", t.ack_timeout_ms),
            ("connect_timeout_ms", t.connect_timeout_ms),
            ("handshake_timeout_ms", t.handshake_timeout_ms),
            ("shutdown_timeout_ms", t.shutdown_timeout_ms),
        ] {
            if value == 0 {
                return Err(IpcomError::Config(format!("timing.{name} must be non-zero")));
            }
        }
        let r = &self.reconnect;
        if r.base_delay_ms == 0 {
            return Err(IpcomError::Config("reconnect.base_delay_ms must be non-zero".into()));
        }
        if r.max_delay_ms < r.base_delay_ms {
            return Err(IpcomError::Config(
                "reconnect.max_delay_ms must not be below base_delay_ms".into(),
            ));
        }
        if !(r.multiplier >= 1.0) {
            return Err(IpcomError::Config("reconnect.multiplier must be >= 1.0".into()));
        }
        Ok(())
    }
}

// ── Tests ────────────────────────────────────────────────────────
