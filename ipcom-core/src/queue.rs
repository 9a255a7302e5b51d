//! Outbound command intake and wire-exchange coordination.
//!
//! The queue is an unbounded FIFO: producers never block. It also owns
//! the two pieces of state the poll and dispatch loops share:
//!
//! - the *exchange lock*, held by whichever of {poll, command} is on the
//!   wire; the dispatch loop waits for it, the poll loop only `try_lock`s;
//! - the *in-flight flag* and ack slot of the single dispatched command.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use tokio::sync::{Mutex as AsyncMutex, MutexGuard, mpsc, oneshot};
use tracing::debug;

use crate::message::Command;

// ── Results ──────────────────────────────────────────────────────

/// Controller reply routed to the waiting dispatch loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckReply {
    Ack,
    Rejected { code: u8, message: String },
}

/// How a dispatched command ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome {
    Acked,
    Rejected { code: u8, message: String },
    TimedOut,
    NotConnected,
    /// Never sent: the command has no valid wire form.
    Invalid(String),
    WriteFailed(String),
}

impl CommandOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, CommandOutcome::Acked)
    }
}

impl From<AckReply> for CommandOutcome {
    fn from(reply: AckReply) -> Self {
        match reply {
            AckReply::Ack => CommandOutcome::Acked,
            AckReply::Rejected { code, message } => CommandOutcome::Rejected { code, message },
        }
    }
}

/// Delivered to the optional command-result callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResult {
    pub command: Command,
    pub outcome: CommandOutcome,
}

// ── CommandQueue ─────────────────────────────────────────────────

struct PendingAck {
    sequence: u16,
    reply_tx: oneshot::Sender<AckReply>,
}

pub struct CommandQueue {
    tx: mpsc::UnboundedSender<Command>,
    rx: AsyncMutex<mpsc::UnboundedReceiver<Command>>,
    queued: AtomicUsize,
    exchange: AsyncMutex<()>,
    in_flight: AtomicBool,
    pending_ack: Mutex<Option<PendingAck>>,
}

impl CommandQueue {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: AsyncMutex::new(rx),
            queued: AtomicUsize::new(0),
            exchange: AsyncMutex::new(()),
            in_flight: AtomicBool::new(false),
            pending_ack: Mutex::new(None),
        }
    }

    /// Append a command. Never blocks.
    pub fn enqueue(&self, command: Command) {
        self.queued.fetch_add(1, Ordering::SeqCst);
        // The receiver lives as long as `self`, so the send cannot fail.
        if self.tx.send(command).is_err() {
            self.queued.fetch_sub(1, Ordering::SeqCst);
        }
    }

    /// Commands enqueued but not yet taken by the dispatcher.
    pub fn len(&self) -> usize {
        self.queued.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait for the next command. Cancel-safe; meant for a single consumer.
    pub async fn next(&self) -> Option<Command> {
        let command = self.rx.lock().await.recv().await?;
        self.queued.fetch_sub(1, Ordering::SeqCst);
        Some(command)
    }

    /// Whether a command is on the wire awaiting its ack.
    pub fn in_flight(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Claim the wire for a command with correlation id `sequence`.
    ///
    /// Waits for a poll write in progress to finish, then raises the
    /// in-flight flag until the returned guard is dropped.
    pub async fn begin(&self, sequence: u16) -> (InFlight<'_>, oneshot::Receiver<AckReply>) {
        let exchange = self.exchange.lock().await;
        let (reply_tx, reply_rx) = oneshot::channel();
        *self.slot() = Some(PendingAck { sequence, reply_tx });
        self.in_flight.store(true, Ordering::SeqCst);
        (
            InFlight {
                queue: self,
                _exchange: exchange,
            },
            reply_rx,
        )
    }

    /// Claim the wire for a poll, or `None` if a command holds it.
    pub fn try_begin_poll(&self) -> Option<MutexGuard<'_, ()>> {
        if self.in_flight() {
            return None;
        }
        let guard = self.exchange.try_lock().ok()?;
        // `begin` sets the flag only while holding the lock, so a clear
        // flag under the lock stays clear until the guard drops.
        if self.in_flight() {
            return None;
        }
        Some(guard)
    }

    /// Route a controller reply to the in-flight command.
    ///
    /// A reply with sequence 0 matches whatever is in flight. Returns
    /// `false` if nothing was waiting for it (late or stray reply).
    pub fn resolve(&self, sequence: u16, reply: AckReply) -> bool {
        let mut slot = self.slot();
        match slot.as_ref() {
            Some(p) if sequence == 0 || p.sequence == sequence => {}
            Some(p) => {
                debug!(seq = sequence, expected = p.sequence, "reply for a different command");
                return false;
            }
            None => return false,
        }
        match slot.take() {
            Some(pending) => pending.reply_tx.send(reply).is_ok(),
            None => false,
        }
    }

    fn slot(&self) -> std::sync::MutexGuard<'_, Option<PendingAck>> {
        self.pending_ack.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for CommandQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CommandQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandQueue")
            .field("queued", &self.len())
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

// ── InFlight ─────────────────────────────────────────────────────

/// Holds the wire for one command; clears the flag and ack slot on drop.
pub struct InFlight<'a> {
    queue: &'a CommandQueue,
    _exchange: MutexGuard<'a, ()>,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.queue.slot().take();
        self.queue.in_flight.store(false, Ordering::SeqCst);
    }
}

// ── Tests ────────────────────────────────────────────────────────
