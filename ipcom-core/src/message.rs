//! Frame kinds and command operation codes.
//!
//! Uses proper enums with `TryFrom` — no panics on unknown values.

use crate::error::IpcomError;
use std::fmt;
use std::time::Instant;

// ── FrameKind ────────────────────────────────────────────────────

/// The type discriminator embedded in every frame header.
///
/// Organized by category:
/// - `0x01..0x0F` — Session (handshake)
/// - `0x10..0x1F` — Liveness and state
/// - `0x20..0x2F` — Commands
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameKind {
    // ── Session (0x0x) ───────────────────────────────────────────
    /// Client login carrying optional credentials.
    Hello = 0x01,
    /// Controller accepted the login.
    HelloAck = 0x02,
    /// Controller refused the login.
    HelloReject = 0x03,

    // ── Liveness / state (0x1x) ──────────────────────────────────
    /// Minimal periodic frame that keeps the transport alive.
    KeepAlive = 0x10,
    /// Ask the controller for a full state readout.
    SnapshotRequest = 0x11,
    /// Full state readout of every addressed output.
    StateSnapshot = 0x12,

    // ── Commands (0x2x) ──────────────────────────────────────────
    /// Operate a single output.
    Command = 0x20,
    /// Controller accepted a command.
    CommandAck = 0x21,
    /// Controller refused a command or reports a fault.
    Error = 0x2F,
}

impl TryFrom<u8> for FrameKind {
    type Error = IpcomError;

    fn try_from(value: u8) -> Result<Self, IpcomError> {
        match value {
            0x01 => Ok(FrameKind::Hello),
            0x02 => Ok(FrameKind::HelloAck),
            0x03 => Ok(FrameKind::HelloReject),
            0x10 => Ok(FrameKind::KeepAlive),
            0x11 => Ok(FrameKind::SnapshotRequest),
            0x12 => Ok(FrameKind::StateSnapshot),
            0x20 => Ok(FrameKind::Command),
            0x21 => Ok(FrameKind::CommandAck),
            0x2F => Ok(FrameKind::Error),
            _ => Err(IpcomError::UnknownVariant {
                type_name: "FrameKind",
                value: value as u64,
            }),
        }
    }
}

impl fmt::Display for FrameKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

// ── Operation ────────────────────────────────────────────────────

/// What a command does to its target output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    On,
    Off,
    /// Dim to a display percentage (0..=100). Build it with
    /// [`Operation::set_level`] when the value is not a literal.
    SetLevel(u8),
    /// Shutter up.
    Raise,
    /// Shutter down.
    Lower,
    /// Halt a moving shutter.
    Stop,
}

impl Operation {
    /// `SetLevel(percent)`, or an error for anything above 100%.
    pub fn set_level(percent: u8) -> Result<Self, IpcomError> {
        let op = Operation::SetLevel(percent);
        op.validate()?;
        Ok(op)
    }

    /// Rejects levels that cannot survive the round trip over the wire.
    pub fn validate(&self) -> Result<(), IpcomError> {
        match self {
            Operation::SetLevel(percent) if *percent > MAX_LEVEL => {
                Err(IpcomError::InvalidPayload {
                    kind: "Command",
                    reason: "level above 100%",
                })
            }
            _ => Ok(()),
        }
    }

    /// Wire opcode for this operation.
    pub fn opcode(&self) -> u8 {
        match self {
            Operation::On => 0x01,
            Operation::Off => 0x02,
            Operation::SetLevel(_) => 0x03,
            Operation::Raise => 0x04,
            Operation::Lower => 0x05,
            Operation::Stop => 0x06,
        }
    }

    /// Wire level byte (0..=255). Only `SetLevel` carries a real value.
    pub fn wire_level(&self) -> u8 {
        match self {
            Operation::On => 255,
            Operation::SetLevel(percent) => percent_to_wire(*percent),
            _ => 0,
        }
    }

    /// Rebuild an operation from its opcode and level byte.
    pub fn from_wire(opcode: u8, level: u8) -> Result<Self, IpcomError> {
        match opcode {
            0x01 => Ok(Operation::On),
            0x02 => Ok(Operation::Off),
            0x03 => Ok(Operation::SetLevel(wire_to_percent(level))),
            0x04 => Ok(Operation::Raise),
            0x05 => Ok(Operation::Lower),
            0x06 => Ok(Operation::Stop),
            _ => Err(IpcomError::UnknownVariant {
                type_name: "Operation",
                value: opcode as u64,
            }),
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::SetLevel(p) => write!(f, "SetLevel({p}%)"),
            other => fmt::Debug::fmt(other, f),
        }
    }
}

// ── Address / Command ────────────────────────────────────────────

/// Two-part hardware address of a single controllable point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address {
    pub module: u8,
    pub output: u8,
}

impl Address {
    pub fn new(module: u8, output: u8) -> Self {
        Self { module, output }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.module, self.output)
    }
}

/// One requested operation on one output.
///
/// Created by `queue_command`, consumed exactly once by the dispatch loop.
#[derive(Debug, Clone, Copy)]
pub struct Command {
    pub target: Address,
    pub operation: Operation,
    pub enqueued_at: Instant,
}

impl Command {
    pub fn new(target: Address, operation: Operation) -> Self {
        Self {
            target,
            operation,
            enqueued_at: Instant::now(),
        }
    }
}

/// Two commands are the same request when target and operation match;
/// the enqueue instant is bookkeeping only.
impl PartialEq for Command {
    fn eq(&self, other: &Self) -> bool {
        self.target == other.target && self.operation == other.operation
    }
}

impl Eq for Command {}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} @ {}", self.operation, self.target)
    }
}

// ── Value scaling ────────────────────────────────────────────────

/// Highest display percentage.
pub const MAX_LEVEL: u8 = 100;

/// Map a display percentage (clamped to 0..=100) onto the 0..=255 wire range.
pub fn percent_to_wire(percent: u8) -> u8 {
    let p = percent.min(MAX_LEVEL) as u32;
    ((p * 255 + 50) / 100) as u8
}

/// Map a 0..=255 wire value onto a rounded display percentage.
pub fn wire_to_percent(value: u8) -> u8 {
    ((value as u32 * 100 + 127) / 255) as u8
}
