//! # ipcom-core
//!
//! Persistent connection engine for IPCom home-automation controllers.
//!
//! This crate contains:
//! - **Protocol types**: `FrameHeader`, `Frame`, `Message`, `FrameKind`, `Command`, `Operation`
//! - **Codec**: `FrameCodec` for framed TCP I/O via `tokio_util`, with a pluggable `FrameCipher`
//! - **Network**: `ConnectionManager` owning the socket, `ReconnectPolicy` backoff
//! - **Queue**: `CommandQueue` serializing outbound commands against state polls
//! - **Publisher**: `SnapshotPublisher` delivering immutable `StateSnapshot`s
//! - **Engine**: `Engine` with the keep-alive, poll, dispatch and receive loops
//! - **Config**: `EngineConfig`, loadable from TOML
//! - **Error**: `IpcomError`, a typed `thiserror`-based error hierarchy

pub mod codec;
pub mod config;
pub mod engine;
pub mod error;
pub mod frame;
pub mod header;
pub mod message;
pub mod network;
pub mod publisher;
pub mod queue;
pub mod state;
pub mod task;

// ── Re-exports for ergonomic usage ───────────────────────────────

pub use codec::{FrameCipher, FrameCodec, PassthroughCipher};
pub use config::{ControllerConfig, EngineConfig, ReconnectConfig, TimingConfig};
pub use engine::{Engine, StartOptions};
pub use error::IpcomError;
pub use frame::{Frame, MAX_PAYLOAD_SIZE, Message};
pub use header::{FrameHeader, HEADER_LENGTH};
pub use message::{Address, Command, FrameKind, MAX_LEVEL, Operation};
pub use network::{ConnectionManager, Inbound, ReconnectPolicy};
pub use publisher::SnapshotPublisher;
pub use queue::{CommandOutcome, CommandQueue, CommandResult};
pub use state::{ConnectionPhase, ConnectionState, DeviceState, StateSnapshot};
pub use task::{LoopExit, LoopSet};
