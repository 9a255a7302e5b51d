//! Plaintext frames: typed constructors and payload parsing per kind.

use std::fmt::Debug;

use crate::error::IpcomError;
use crate::message::{Address, Command, FrameKind, Operation};
use crate::state::StateSnapshot;

/// Largest sealed payload the codec accepts.
pub const MAX_PAYLOAD_SIZE: usize = 4096;

/// One protocol unit with its payload in plaintext.
///
/// Sealing (encryption + checksum) happens in the codec; a `Frame` never
/// holds ciphertext.
#[derive(Clone, PartialEq, Eq)]
pub struct Frame {
    kind: FrameKind,
    sequence: u16,
    payload: Vec<u8>,
}

/// A frame's payload parsed according to its kind.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Hello { username: String, password: String },
    HelloAck,
    HelloReject { reason: String },
    KeepAlive,
    SnapshotRequest,
    StateSnapshot(StateSnapshot),
    Command(Command),
    CommandAck,
    Error { code: u8, message: String },
}

impl Frame {
    pub fn new(kind: FrameKind, sequence: u16, payload: Vec<u8>) -> Result<Self, IpcomError> {
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(IpcomError::PayloadTooLarge {
                size: payload.len(),
                max: MAX_PAYLOAD_SIZE,
            });
        }
        Ok(Self {
            kind,
            sequence,
            payload,
        })
    }

    fn empty(kind: FrameKind, sequence: u16) -> Self {
        Self {
            kind,
            sequence,
            payload: Vec::new(),
        }
    }

    pub fn keep_alive() -> Self {
        Self::empty(FrameKind::KeepAlive, 0)
    }

    pub fn snapshot_request() -> Self {
        Self::empty(FrameKind::SnapshotRequest, 0)
    }

    pub fn hello(username: &str, password: &str) -> Result<Self, IpcomError> {
        let mut payload = Vec::with_capacity(2 + username.len() + password.len());
        for field in [username, password] {
            let len = u8::try_from(field.len()).map_err(|_| IpcomError::InvalidPayload {
                kind: "Hello",
                reason: "credential longer than 255 bytes",
            })?;
            payload.push(len);
            payload.extend_from_slice(field.as_bytes());
        }
        Self::new(FrameKind::Hello, 0, payload)
    }

    pub fn hello_ack() -> Self {
        Self::empty(FrameKind::HelloAck, 0)
    }

    pub fn hello_reject(reason: &str) -> Result<Self, IpcomError> {
        Self::new(FrameKind::HelloReject, 0, reason.as_bytes().to_vec())
    }

    /// Fails for an operation that has no exact wire form, such as a
    /// level above 100%.
    pub fn command(sequence: u16, command: &Command) -> Result<Self, IpcomError> {
        command.operation.validate()?;
        Ok(Self {
            kind: FrameKind::Command,
            sequence,
            payload: vec![
                command.target.module,
                command.target.output,
                command.operation.opcode(),
                command.operation.wire_level(),
            ],
        })
    }

    pub fn command_ack(sequence: u16) -> Self {
        Self::empty(FrameKind::CommandAck, sequence)
    }

    pub fn error(sequence: u16, code: u8, message: &str) -> Result<Self, IpcomError> {
        let mut payload = Vec::with_capacity(1 + message.len());
        payload.push(code);
        payload.extend_from_slice(message.as_bytes());
        Self::new(FrameKind::Error, sequence, payload)
    }

    /// Encode a state readout. Entries are written in iteration order.
    pub fn state_snapshot<I>(values: I) -> Result<Self, IpcomError>
    where
        I: IntoIterator<Item = (Address, u8)>,
    {
        let mut payload = vec![0, 0];
        let mut count: u16 = 0;
        for (addr, value) in values {
            count = count.checked_add(1).ok_or(IpcomError::InvalidPayload {
                kind: "StateSnapshot",
                reason: "too many entries",
            })?;
            payload.extend_from_slice(&[addr.module, addr.output, value]);
        }
        payload[0..2].copy_from_slice(&count.to_le_bytes());
        Self::new(FrameKind::StateSnapshot, 0, payload)
    }

    pub fn kind(&self) -> FrameKind {
        self.kind
    }

    pub fn sequence(&self) -> u16 {
        self.sequence
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Interpret the payload according to the frame kind.
    pub fn parse(&self) -> Result<Message, IpcomError> {
        let p = &self.payload;
        match self.kind {
            FrameKind::Hello => {
                let (username, rest) = take_prefixed(p)?;
                let (password, _) = take_prefixed(rest)?;
                Ok(Message::Hello { username, password })
            }
            FrameKind::HelloAck => Ok(Message::HelloAck),
            FrameKind::HelloReject => Ok(Message::HelloReject {
                reason: String::from_utf8_lossy(p).into_owned(),
            }),
            FrameKind::KeepAlive => Ok(Message::KeepAlive),
            FrameKind::SnapshotRequest => Ok(Message::SnapshotRequest),
            FrameKind::StateSnapshot => parse_snapshot(p).map(Message::StateSnapshot),
            FrameKind::Command => {
                if p.len() != 4 {
                    return Err(IpcomError::InvalidPayload {
                        kind: "Command",
                        reason: "expected 4 bytes",
                    });
                }
                let operation = Operation::from_wire(p[2], p[3])?;
                Ok(Message::Command(Command::new(
                    Address::new(p[0], p[1]),
                    operation,
                )))
            }
            FrameKind::CommandAck => Ok(Message::CommandAck),
            FrameKind::Error => {
                let (&code, text) = p.split_first().ok_or(IpcomError::InvalidPayload {
                    kind: "Error",
                    reason: "missing error code",
                })?;
                Ok(Message::Error {
                    code,
                    message: String::from_utf8_lossy(text).into_owned(),
                })
            }
        }
    }
}

fn take_prefixed(bytes: &[u8]) -> Result<(String, &[u8]), IpcomError> {
    let truncated = IpcomError::InvalidPayload {
        kind: "Hello",
        reason: "truncated credential",
    };
    let (&len, rest) = bytes.split_first().ok_or(truncated)?;
    let len = len as usize;
    if rest.len() < len {
        return Err(IpcomError::InvalidPayload {
            kind: "Hello",
            reason: "truncated credential",
        });
    }
    let text = String::from_utf8_lossy(&rest[..len]).into_owned();
    Ok((text, &rest[len..]))
}

fn parse_snapshot(p: &[u8]) -> Result<StateSnapshot, IpcomError> {
    if p.len() < 2 {
        return Err(IpcomError::InvalidPayload {
            kind: "StateSnapshot",
            reason: "missing entry count",
        });
    }
    let count = u16::from_le_bytes([p[0], p[1]]) as usize;
    let body = &p[2..];
    if body.len() != count * 3 {
        return Err(IpcomError::InvalidPayload {
            kind: "StateSnapshot",
            reason: "entry count does not match payload length",
        });
    }
    Ok(StateSnapshot::from_values(
        body.chunks_exact(3)
            .map(|e| (Address::new(e[0], e[1]), e[2])),
    ))
}

impl Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("kind", &self.kind)
            .field("sequence", &self.sequence)
            .field("payload_length", &self.payload.len())
            .finish()
    }
}

// ── Tests ────────────────────────────────────────────────────────
