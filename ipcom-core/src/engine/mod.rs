//! Session lifecycle and the public engine API.
//!
//! An [`Engine`] owns one controller session. `start()` opens the socket and
//! spawns four loops sharing a single [`Shared`] context:
//!
//! | loop      | role                                                    |
//! |-----------|---------------------------------------------------------|
//! | keepalive | writes a `KeepAlive` frame every `keepalive_interval`   |
//! | poll      | writes a `SnapshotRequest` every `poll_interval`        |
//! | dispatch  | drains the command queue, one command on the wire       |
//! | receive   | sole reader; routes frames, drives reconnection         |
//!
//! Consumers never touch the socket. They enqueue commands and observe
//! snapshots, command results and connection state.

mod dispatch;
mod keepalive;
mod poll;
mod receive;

use std::sync::{Arc, PoisonError, RwLock};

use tokio::sync::{Mutex as AsyncMutex, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::codec::{FrameCipher, FrameCodec};
use crate::config::EngineConfig;
use crate::error::IpcomError;
use crate::message::{Address, Command, Operation};
use crate::network::ConnectionManager;
use crate::publisher::SnapshotPublisher;
use crate::queue::{CommandQueue, CommandResult};
use crate::state::{ConnectionState, StateSnapshot};
use crate::task::{LoopExit, LoopSet, call_handler};

type ResultHandler = Arc<dyn Fn(CommandResult) + Send + Sync + 'static>;

/// How `start` behaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartOptions {
    /// Re-open the socket with backoff after it is lost.
    pub auto_reconnect: bool,
    /// Treat a failed first open like a lost connection instead of
    /// returning the error. Only meaningful with `auto_reconnect`.
    pub retry_initial: bool,
}

impl Default for StartOptions {
    fn default() -> Self {
        Self {
            auto_reconnect: true,
            retry_initial: false,
        }
    }
}

/// State shared by the engine handle and its loops.
pub(crate) struct Shared {
    config: EngineConfig,
    connection: ConnectionManager,
    queue: CommandQueue,
    publisher: SnapshotPublisher,
    result_handlers: RwLock<Vec<ResultHandler>>,
}

impl Shared {
    fn report(&self, result: CommandResult) {
        let handlers = self
            .result_handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for handler in handlers {
            let result = result.clone();
            call_handler("command result", move || handler(result));
        }
    }
}

struct Session {
    /// Stops keep-alive, poll, dispatch intake and reconnect attempts.
    shutdown: CancellationToken,
    /// Stops the receive loop; cancelled after dispatch has drained.
    stop_reading: CancellationToken,
    writers: LoopSet,
    reader: LoopSet,
}

pub struct Engine {
    shared: Arc<Shared>,
    session: AsyncMutex<Option<Session>>,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        Self::with_codec(config, FrameCodec::default())
    }

    /// Engine whose frames are sealed by `cipher`.
    pub fn with_cipher(config: EngineConfig, cipher: Arc<dyn FrameCipher>) -> Self {
        Self::with_codec(config, FrameCodec::new(cipher))
    }

    fn with_codec(config: EngineConfig, codec: FrameCodec) -> Self {
        let connection =
            ConnectionManager::new(config.controller.clone(), config.timing.clone(), codec);
        Self {
            shared: Arc::new(Shared {
                config,
                connection,
                queue: CommandQueue::new(),
                publisher: SnapshotPublisher::new(),
                result_handlers: RwLock::new(Vec::new()),
            }),
            session: AsyncMutex::new(None),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    // ── Lifecycle ────────────────────────────────────────────────

    /// Open the session and spawn the loops.
    ///
    /// Fails if the first open fails. Calling `start` on a running engine
    /// is a no-op.
    pub async fn start(&self, auto_reconnect: bool) -> Result<(), IpcomError> {
        self.start_with(StartOptions {
            auto_reconnect,
            retry_initial: false,
        })
        .await
    }

    pub async fn start_with(&self, options: StartOptions) -> Result<(), IpcomError> {
        let mut session = self.session.lock().await;
        if session.is_some() {
            return Ok(());
        }
        self.shared.config.validate()?;
        info!(
            addr = %self.shared.config.controller.socket_addr(),
            auto_reconnect = options.auto_reconnect,
            "starting engine"
        );

        if let Err(e) = self.shared.connection.open().await {
            if !(options.auto_reconnect && options.retry_initial) {
                return Err(e);
            }
            warn!("initial connect failed, retrying in background: {e}");
            self.shared.connection.schedule_retry()?;
        }

        let shutdown = CancellationToken::new();
        let stop_reading = CancellationToken::new();

        let mut writers = LoopSet::new();
        writers.spawn(
            "keepalive",
            keepalive::run(self.shared.clone(), shutdown.clone()),
        );
        writers.spawn("poll", poll::run(self.shared.clone(), shutdown.clone()));
        writers.spawn(
            "dispatch",
            dispatch::run(self.shared.clone(), shutdown.clone()),
        );

        let mut reader = LoopSet::new();
        reader.spawn(
            "receive",
            receive::run(
                self.shared.clone(),
                shutdown.clone(),
                stop_reading.clone(),
                options.auto_reconnect,
            ),
        );

        *session = Some(Session {
            shutdown,
            stop_reading,
            writers,
            reader,
        });
        Ok(())
    }

    /// Stop the loops and close the socket. Idempotent.
    ///
    /// The command on the wire, if any, is given until its ack timeout to
    /// resolve. The whole shutdown is bounded by `shutdown_timeout`; loops
    /// still running after that are aborted.
    pub async fn stop(&self) {
        let Some(session) = self.session.lock().await.take() else {
            return;
        };
        info!("stopping engine");
        let deadline = Instant::now() + self.shared.config.timing.shutdown_timeout();

        session.shutdown.cancel();
        let mut exits = session.writers.join_until(deadline).await;

        session.stop_reading.cancel();
        self.shared.connection.close().await;
        exits.extend(session.reader.join_until(deadline).await);

        let aborted: Vec<&str> = exits
            .iter()
            .filter(|(_, exit)| *exit == LoopExit::Aborted)
            .map(|(name, _)| *name)
            .collect();
        if !aborted.is_empty() {
            warn!(?aborted, "loops aborted after shutdown timeout");
        }
        info!("engine stopped");
    }

    pub async fn is_running(&self) -> bool {
        self.session.lock().await.is_some()
    }

    // ── Commands ─────────────────────────────────────────────────

    /// Queue a command for `module`/`output`. Never blocks and never fails;
    /// the outcome is reported through [`on_command_result`](Self::on_command_result).
    pub fn queue_command(&self, module: u8, output: u8, operation: Operation) {
        self.enqueue(Command::new(Address::new(module, output), operation));
    }

    pub fn enqueue(&self, command: Command) {
        self.shared.queue.enqueue(command);
    }

    /// Commands waiting for the dispatcher.
    pub fn pending_commands(&self) -> usize {
        self.shared.queue.len()
    }

    /// Called once per dispatched command with its outcome, from the
    /// dispatch task. Must not block; a panic is logged and contained.
    pub fn on_command_result<F>(&self, handler: F)
    where
        F: Fn(CommandResult) + Send + Sync + 'static,
    {
        self.shared
            .result_handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(handler));
    }

    // ── Snapshots ────────────────────────────────────────────────

    /// Called for every decoded snapshot, in receive order, from the
    /// receive task. Must not block; a panic is logged and contained.
    pub fn on_state_snapshot<F>(&self, handler: F)
    where
        F: Fn(Arc<StateSnapshot>) + Send + Sync + 'static,
    {
        self.shared.publisher.on_snapshot(handler);
    }

    pub fn latest_snapshot(&self) -> Option<Arc<StateSnapshot>> {
        self.shared.publisher.latest()
    }

    /// Raw value of one output from the latest snapshot.
    pub fn value(&self, module: u8, output: u8) -> Option<u8> {
        self.latest_snapshot()?.value(module, output)
    }

    /// `(output, value)` pairs of one module from the latest snapshot.
    pub fn module_values(&self, module: u8) -> Vec<(u8, u8)> {
        self.latest_snapshot()
            .map(|s| s.module_values(module))
            .unwrap_or_default()
    }

    pub fn subscribe_snapshots(&self) -> watch::Receiver<Option<Arc<StateSnapshot>>> {
        self.shared.publisher.subscribe()
    }

    // ── Connection state ─────────────────────────────────────────

    pub fn connection_state(&self) -> ConnectionState {
        self.shared.connection.state()
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connection.is_connected()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.connection.subscribe()
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        // Without an explicit stop the loops are only signalled; they hold
        // their own reference to the shared context and exit on their own.
        if let Some(session) = self.session.get_mut().take() {
            session.shutdown.cancel();
            session.stop_reading.cancel();
        }
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("addr", &self.shared.config.controller.socket_addr())
            .field("state", &self.connection_state())
            .field("queue", &self.shared.queue)
            .finish()
    }
}
