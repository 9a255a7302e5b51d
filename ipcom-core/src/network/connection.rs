//! Owner of the controller socket.
//!
//! [`ConnectionManager`] is the only type that opens or drops the TCP
//! stream. Loops talk to the wire exclusively through
//! [`write`](ConnectionManager::write) and
//! [`read_next`](ConnectionManager::read_next).

use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Mutex, PoisonError};

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Mutex as AsyncMutex, watch};
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, info, warn};

use crate::codec::FrameCodec;
use crate::config::{ControllerConfig, TimingConfig};
use crate::error::IpcomError;
use crate::frame::{Frame, Message};
use crate::message::FrameKind;
use crate::state::{ConnectionPhase, ConnectionState};

type Reader = FramedRead<OwnedReadHalf, FrameCodec>;
type Writer = FramedWrite<OwnedWriteHalf, FrameCodec>;

/// One unit delivered by [`ConnectionManager::read_next`].
#[derive(Debug)]
pub enum Inbound {
    /// A frame that passed integrity checks.
    Frame(Frame),
    /// A unit that could not be decoded; the stream is still usable.
    Malformed(IpcomError),
}

#[derive(Debug)]
pub struct ConnectionManager {
    controller: ControllerConfig,
    timing: TimingConfig,
    codec: FrameCodec,
    phase: Mutex<ConnectionPhase>,
    state_tx: watch::Sender<ConnectionState>,
    reader: AsyncMutex<Option<Reader>>,
    writer: AsyncMutex<Option<Writer>>,
    /// Set by `close()`; writes are refused and read errors are expected.
    closing: AtomicBool,
    sequence: AtomicU16,
}

impl ConnectionManager {
    pub fn new(controller: ControllerConfig, timing: TimingConfig, codec: FrameCodec) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            controller,
            timing,
            codec,
            phase: Mutex::new(ConnectionPhase::Disconnected),
            state_tx,
            reader: AsyncMutex::new(None),
            writer: AsyncMutex::new(None),
            closing: AtomicBool::new(false),
            sequence: AtomicU16::new(1),
        }
    }

    // ── State ────────────────────────────────────────────────────

    pub fn phase(&self) -> ConnectionPhase {
        self.phase.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected && !self.is_closing()
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    /// Receiver that observes every public state change.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Next command correlation id. Zero is reserved for "uncorrelated".
    pub fn next_sequence(&self) -> u16 {
        loop {
            let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
            if seq != 0 {
                return seq;
            }
        }
    }

    fn transition<F>(&self, f: F) -> Result<(), IpcomError>
    where
        F: FnOnce(&mut ConnectionPhase) -> Result<(), IpcomError>,
    {
        let mut phase = self.phase.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut phase)?;
        debug!("connection phase -> {}", *phase);
        let public = phase.public_state();
        self.state_tx.send_if_modified(|s| {
            let changed = *s != public;
            *s = public;
            changed
        });
        Ok(())
    }

    // ── Open ─────────────────────────────────────────────────────

    /// Connect and log in. No-op when already connected.
    ///
    /// On failure the phase returns to where it came from: `Disconnected`
    /// for a first attempt, `Reconnecting` inside a reconnect cycle.
    pub async fn open(&self) -> Result<(), IpcomError> {
        if self.is_connected() {
            return Ok(());
        }
        let from_reconnect = matches!(self.phase(), ConnectionPhase::Reconnecting);
        self.closing.store(false, Ordering::SeqCst);
        self.transition(ConnectionPhase::begin_connect)?;

        match self.establish().await {
            Ok((reader, writer)) => {
                *self.reader.lock().await = Some(reader);
                *self.writer.lock().await = Some(writer);
                self.transition(ConnectionPhase::complete_handshake)?;
                info!(addr = %self.controller.socket_addr(), "connected to controller");
                Ok(())
            }
            Err(e) => {
                if from_reconnect {
                    self.transition(ConnectionPhase::connection_lost)?;
                } else {
                    self.transition(|p| {
                        p.force_disconnect();
                        Ok(())
                    })?;
                }
                Err(e)
            }
        }
    }

    async fn establish(&self) -> Result<(Reader, Writer), IpcomError> {
        let addr = self.controller.socket_addr();
        let connect = TcpStream::connect(addr.as_str());
        let stream = match tokio::time::timeout(self.timing.connect_timeout(), connect).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => return Err(IpcomError::Connect { addr, source }),
            Err(_) => {
                return Err(IpcomError::Connect {
                    addr,
                    source: std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        "connect timed out",
                    ),
                });
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            debug!("set_nodelay failed: {e}");
        }
        self.transition(ConnectionPhase::begin_handshake)?;

        let (read_half, write_half) = stream.into_split();
        let mut reader = FramedRead::new(read_half, self.codec.clone());
        let mut writer = FramedWrite::new(write_half, self.codec.clone());

        let hello = Frame::hello(
            self.controller.username.as_deref().unwrap_or_default(),
            self.controller.password.as_deref().unwrap_or_default(),
        )?;
        writer.send(hello).await.map_err(|e| network_error(&addr, e))?;

        let reply = tokio::time::timeout(
            self.timing.handshake_timeout(),
            Self::handshake_reply(&mut reader),
        )
        .await
        .map_err(|_| {
            IpcomError::Handshake(format!(
                "no reply within {:?}",
                self.timing.handshake_timeout()
            ))
        })?
        .map_err(|e| network_error(&addr, e))?;

        match reply.parse() {
            Ok(Message::HelloAck) => Ok((reader, writer)),
            Ok(Message::HelloReject { reason }) => Err(IpcomError::Handshake(reason)),
            Ok(_) => Err(IpcomError::Handshake(format!(
                "unexpected {} frame",
                reply.kind()
            ))),
            Err(e) => Err(IpcomError::Handshake(e.to_string())),
        }
    }

    /// First meaningful frame after `Hello`, skipping noise and keep-alives.
    async fn handshake_reply(reader: &mut Reader) -> Result<Frame, IpcomError> {
        loop {
            match reader.next().await {
                None => {
                    return Err(IpcomError::Io(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "controller closed during handshake",
                    )));
                }
                Some(Err(e)) => return Err(e),
                Some(Ok(Err(bad))) => debug!("ignoring malformed frame during handshake: {bad}"),
                Some(Ok(Ok(frame))) if frame.kind() == FrameKind::KeepAlive => {}
                Some(Ok(Ok(frame))) => return Ok(frame),
            }
        }
    }

    // ── Wire access ──────────────────────────────────────────────

    /// Send one frame. Fails with `NotConnected` outside `Connected`.
    pub async fn write(&self, frame: Frame) -> Result<(), IpcomError> {
        if !self.is_connected() {
            return Err(IpcomError::NotConnected);
        }
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(IpcomError::NotConnected)?;
        writer.send(frame).await
    }

    /// Wait for the next inbound unit.
    ///
    /// `Err` means the socket itself failed (including a clean EOF).
    pub async fn read_next(&self) -> Result<Inbound, IpcomError> {
        let mut guard = self.reader.lock().await;
        let reader = guard.as_mut().ok_or(IpcomError::NotConnected)?;
        match reader.next().await {
            Some(Ok(Ok(frame))) => Ok(Inbound::Frame(frame)),
            Some(Ok(Err(bad))) => Ok(Inbound::Malformed(bad)),
            Some(Err(e)) => Err(e),
            None => Err(IpcomError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "controller closed the connection",
            ))),
        }
    }

    // ── Teardown ─────────────────────────────────────────────────

    /// The socket died under a live session: drop it and enter
    /// `Reconnecting`, or `Disconnected` when no reconnect will follow.
    pub async fn mark_lost(&self, will_reconnect: bool) {
        if let Some(up) = self.phase().connected_duration() {
            info!(connected_ms = up.as_millis() as u64, "session lost");
        }
        self.writer.lock().await.take();
        self.reader.lock().await.take();
        let result = if will_reconnect {
            self.transition(ConnectionPhase::connection_lost)
        } else {
            self.transition(|p| {
                p.force_disconnect();
                Ok(())
            })
        };
        if let Err(e) = result {
            debug!("mark_lost ignored: {e}");
        }
    }

    /// Enter `Reconnecting` after a failed first open that is to be retried.
    pub fn schedule_retry(&self) -> Result<(), IpcomError> {
        self.transition(ConnectionPhase::schedule_retry)
    }

    /// Stop taking writes, give the receive loop the grace period to see
    /// the shutdown, then release the socket unconditionally.
    pub async fn close(&self) {
        self.closing.store(true, Ordering::SeqCst);
        let grace = self.timing.close_grace();
        tokio::time::sleep(grace).await;

        if let Some(mut writer) = self.writer.lock().await.take() {
            let flush_limit = grace.max(std::time::Duration::from_millis(10));
            match tokio::time::timeout(flush_limit, writer.close()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!("error flushing socket on close: {e}"),
                Err(_) => debug!("socket flush timed out on close"),
            }
        }
        match tokio::time::timeout(grace, self.reader.lock()).await {
            Ok(mut reader) => {
                reader.take();
            }
            Err(_) => warn!("receive loop still holds the socket after grace period"),
        }

        let _ = self.transition(|p| {
            p.force_disconnect();
            Ok(())
        });
        info!("connection closed");
    }
}

/// I/O failures while connecting are connect errors; anything else the
/// controller sent back is a handshake problem.
fn network_error(addr: &str, e: IpcomError) -> IpcomError {
    match e {
        IpcomError::Io(source) => IpcomError::Connect {
            addr: addr.to_string(),
            source,
        },
        other => IpcomError::Handshake(other.to_string()),
    }
}

// ── Tests ────────────────────────────────────────────────────────
