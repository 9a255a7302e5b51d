//! Session state machine for the controller connection.
//!
//! Provides a `ConnectionPhase` enum that models the full lifecycle of
//! the single controller session, with validated transitions that return
//! `Result` instead of panicking.

use std::time::Instant;

use crate::error::IpcomError;

// ── ConnectionPhase ──────────────────────────────────────────────

/// The current phase of the controller session.
///
/// ```text
///  Disconnected ──► Connecting ──► Handshaking ──► Connected
///       ▲               ▲  │             │             │
///       │               │  ▼             ▼             ▼
///       │               └───────── Reconnecting ◄──────┘
///       └──────────────── (stop / failed first open) ◄──┘
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConnectionPhase {
    /// No socket. Initial / terminal state.
    #[default]
    Disconnected,

    /// TCP connect in progress.
    Connecting,

    /// TCP link is up; waiting for the controller to accept the login.
    Handshaking,

    /// Handshake complete; frames may be written.
    Connected {
        /// When the session entered the `Connected` state.
        since: Instant,
    },

    /// The socket was lost; waiting out the backoff before reconnecting.
    Reconnecting,
}

impl std::fmt::Display for ConnectionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Handshaking => write!(f, "Handshaking"),
            Self::Connected { .. } => write!(f, "Connected"),
            Self::Reconnecting => write!(f, "Reconnecting"),
        }
    }
}

impl ConnectionPhase {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected { .. })
    }

    pub fn is_disconnected(&self) -> bool {
        matches!(self, Self::Disconnected)
    }

    /// How long the session has been in the `Connected` state.
    ///
    /// Returns `None` for any other phase.
    pub fn connected_duration(&self) -> Option<std::time::Duration> {
        match self {
            Self::Connected { since } => Some(since.elapsed()),
            _ => None,
        }
    }

    /// The consumer-facing view of this phase.
    pub fn public_state(&self) -> ConnectionState {
        match self {
            Self::Disconnected => ConnectionState::Disconnected,
            Self::Connecting | Self::Handshaking => ConnectionState::Connecting,
            Self::Connected { .. } => ConnectionState::Connected,
            Self::Reconnecting => ConnectionState::Reconnecting,
        }
    }

    // ── Transitions ──────────────────────────────────────────────

    /// Transition to `Connecting`.
    ///
    /// Valid from: `Disconnected`, `Reconnecting`.
    pub fn begin_connect(&mut self) -> Result<(), IpcomError> {
        match self {
            Self::Disconnected | Self::Reconnecting => {
                *self = Self::Connecting;
                Ok(())
            }
            _ => Err(IpcomError::InvalidTransition(
                "cannot connect: not in Disconnected or Reconnecting state",
            )),
        }
    }

    /// Transition to `Handshaking`.
    ///
    /// Valid from: `Connecting`.
    pub fn begin_handshake(&mut self) -> Result<(), IpcomError> {
        match self {
            Self::Connecting => {
                *self = Self::Handshaking;
                Ok(())
            }
            _ => Err(IpcomError::InvalidTransition(
                "cannot handshake: not in Connecting state",
            )),
        }
    }

    /// Transition to `Connected`.
    ///
    /// Valid from: `Handshaking`.
    pub fn complete_handshake(&mut self) -> Result<(), IpcomError> {
        match self {
            Self::Handshaking => {
                *self = Self::Connected {
                    since: Instant::now(),
                };
                Ok(())
            }
            _ => Err(IpcomError::InvalidTransition(
                "cannot complete handshake: not in Handshaking state",
            )),
        }
    }

    /// Transition to `Reconnecting` after the socket died or an attempt failed.
    ///
    /// Valid from: `Connecting`, `Handshaking`, `Connected`.
    pub fn connection_lost(&mut self) -> Result<(), IpcomError> {
        match self {
            Self::Connecting | Self::Handshaking | Self::Connected { .. } => {
                *self = Self::Reconnecting;
                Ok(())
            }
            _ => Err(IpcomError::InvalidTransition(
                "cannot mark lost: no connection attempt in progress",
            )),
        }
    }

    /// Transition to `Reconnecting` without a prior live session.
    ///
    /// Valid from: `Disconnected`. Used when a failed first open is retried
    /// in the background.
    pub fn schedule_retry(&mut self) -> Result<(), IpcomError> {
        match self {
            Self::Disconnected => {
                *self = Self::Reconnecting;
                Ok(())
            }
            _ => Err(IpcomError::InvalidTransition(
                "cannot schedule retry: not in Disconnected state",
            )),
        }
    }

    /// Force-reset to `Disconnected` regardless of current state.
    ///
    /// Used on stop and when the very first open fails.
    pub fn force_disconnect(&mut self) {
        *self = Self::Disconnected;
    }
}

// ── ConnectionState ──────────────────────────────────────────────

/// Connection state as reported to consumers.
///
/// `Handshaking` is folded into `Connecting`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

// ── Tests ────────────────────────────────────────────────────────
