//! Domain-specific error types for the IPCom engine.
//!
//! All fallible operations return `Result<T, IpcomError>`.
//! Nothing read off the wire is allowed to panic; every failure is typed.

use thiserror::Error;

/// The canonical error type for the IPCom engine.
#[derive(Debug, Error)]
pub enum IpcomError {
    // ── Protocol Errors ──────────────────────────────────────────
    /// Received bytes that do not start with the `IC` magic sequence.
    #[error("invalid magic bytes: expected IC")]
    InvalidMagic,

    /// The sealed payload failed integrity verification.
    #[error("checksum mismatch: header {expected:#010x}, computed {actual:#010x}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    /// A numeric value did not map to any known enum variant.
    #[error("unknown {type_name} discriminant: {value:#x}")]
    UnknownVariant { type_name: &'static str, value: u64 },

    /// A frame payload could not be parsed for its kind.
    #[error("invalid {kind} payload: {reason}")]
    InvalidPayload {
        kind: &'static str,
        reason: &'static str,
    },

    /// The payload exceeds the codec limit.
    #[error("payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// The frame cipher refused to open a sealed payload.
    #[error("cipher error: {0}")]
    Cipher(String),

    // ── Connection Errors ────────────────────────────────────────
    /// The TCP connect to the controller failed.
    #[error("connect to {addr} failed: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// The controller rejected or never completed the protocol handshake.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// A write was attempted while the session was not `Connected`.
    #[error("not connected")]
    NotConnected,

    /// The TCP/IO layer reported an error on an established socket.
    #[error("connection error: {0}")]
    Io(#[from] std::io::Error),

    // ── State Errors ─────────────────────────────────────────────
    /// A connection phase transition was requested from the wrong phase.
    #[error("invalid transition: {0}")]
    InvalidTransition(&'static str),

    // ── Configuration Errors ─────────────────────────────────────
    /// The engine configuration is unreadable or inconsistent.
    #[error("configuration error: {0}")]
    Config(String),
}

// ── Convenient From implementations ──────────────────────────────

impl From<toml::de::Error> for IpcomError {
    fn from(e: toml::de::Error) -> Self {
        IpcomError::Config(e.to_string())
    }
}
