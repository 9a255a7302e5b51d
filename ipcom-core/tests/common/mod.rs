//! A scripted controller on an ephemeral localhost port.
//!
//! It answers logins, snapshot requests and commands the way a real
//! controller would, records every frame it receives, and can be told to
//! drop its connections or push raw garbage onto the wire.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::StreamExt;
use ipcom_core::{Address, Command, EngineConfig, Frame, FrameCodec, Message, Operation};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::codec::FramedRead;

/// Reserved module carrying a per-snapshot counter: (9,0) high byte,
/// (9,1) low byte.
pub const TICK_MODULE: u8 = 9;

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Hello { accepted: bool },
    KeepAlive,
    SnapshotRequest,
    Command { seq: u16, command: Command },
    AckSent { seq: u16 },
}

#[derive(Debug, Clone)]
struct Behavior {
    accept_login: bool,
    ack_commands: bool,
    ack_delay: Duration,
    reject_code: Option<u8>,
}

impl Default for Behavior {
    fn default() -> Self {
        Self {
            accept_login: true,
            ack_commands: true,
            ack_delay: Duration::ZERO,
            reject_code: None,
        }
    }
}

#[derive(Default)]
struct Inner {
    behavior: Mutex<Behavior>,
    events: Mutex<Vec<Event>>,
    outputs: Mutex<BTreeMap<Address, u8>>,
    connections: AtomicUsize,
    tick: AtomicU16,
}

impl Inner {
    fn record(&self, event: Event) {
        self.events.lock().unwrap().push(event);
    }

    fn behavior(&self) -> Behavior {
        self.behavior.lock().unwrap().clone()
    }

    fn snapshot(&self) -> Frame {
        let tick = self.tick.fetch_add(1, Ordering::SeqCst).wrapping_add(1);
        let mut values: Vec<(Address, u8)> = self
            .outputs
            .lock()
            .unwrap()
            .iter()
            .map(|(a, v)| (*a, *v))
            .collect();
        values.push((Address::new(TICK_MODULE, 0), (tick >> 8) as u8));
        values.push((Address::new(TICK_MODULE, 1), tick as u8));
        Frame::state_snapshot(values).unwrap()
    }

    fn apply(&self, command: &Command) {
        let value = match command.operation {
            Operation::On => 255,
            Operation::Off => 0,
            op => op.wire_level(),
        };
        self.outputs.lock().unwrap().insert(command.target, value);
    }
}

pub struct Controller {
    addr: SocketAddr,
    inner: Arc<Inner>,
    kill: watch::Sender<u64>,
    inject: broadcast::Sender<Vec<u8>>,
    accept: JoinHandle<()>,
}

impl Controller {
    pub async fn spawn() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let inner = Arc::new(Inner::default());
        let (kill, _) = watch::channel(0u64);
        let (inject, _) = broadcast::channel(16);

        let accept = tokio::spawn({
            let inner = inner.clone();
            let kill = kill.clone();
            let inject = inject.clone();
            async move {
                while let Ok((stream, _)) = listener.accept().await {
                    inner.connections.fetch_add(1, Ordering::SeqCst);
                    let kill_rx = kill.subscribe();
                    tokio::spawn(serve(stream, inner.clone(), kill_rx, inject.subscribe()));
                }
            }
        });

        Self {
            addr,
            inner,
            kill,
            inject,
            accept,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Engine settings pointed at this controller, with short periods.
    pub fn config(&self) -> EngineConfig {
        let mut cfg = EngineConfig::for_controller(self.addr.ip().to_string(), self.addr.port());
        cfg.controller.username = Some("tester".into());
        cfg.controller.password = Some("secret".into());
        cfg.timing.poll_interval_ms = 20;
        cfg.timing.keepalive_interval_ms = 100;
        cfg.timing.ack_timeout_ms = 500;
        cfg.timing.handshake_timeout_ms = 500;
        cfg.timing.close_grace_ms = 20;
        cfg.timing.shutdown_timeout_ms = 2_000;
        cfg.reconnect.base_delay_ms = 50;
        cfg.reconnect.max_delay_ms = 400;
        cfg
    }

    pub fn set_accept_login(&self, accept: bool) {
        self.inner.behavior.lock().unwrap().accept_login = accept;
    }

    pub fn set_ack_commands(&self, ack: bool) {
        self.inner.behavior.lock().unwrap().ack_commands = ack;
    }

    pub fn set_ack_delay(&self, delay: Duration) {
        self.inner.behavior.lock().unwrap().ack_delay = delay;
    }

    pub fn set_reject_code(&self, code: Option<u8>) {
        self.inner.behavior.lock().unwrap().reject_code = code;
    }

    /// Close every open connection; new ones are still accepted.
    pub fn drop_connections(&self) {
        self.kill.send_modify(|generation| *generation += 1);
    }

    /// Write raw bytes on every open connection.
    pub fn inject(&self, bytes: Vec<u8>) {
        let _ = self.inject.send(bytes);
    }

    pub fn events(&self) -> Vec<Event> {
        self.inner.events.lock().unwrap().clone()
    }

    pub fn count(&self, pred: impl Fn(&Event) -> bool) -> usize {
        self.events().iter().filter(|e| pred(e)).count()
    }

    /// TCP connections accepted so far.
    pub fn connections(&self) -> usize {
        self.inner.connections.load(Ordering::SeqCst)
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        self.accept.abort();
        self.drop_connections();
    }
}

async fn serve(
    stream: TcpStream,
    inner: Arc<Inner>,
    mut kill: watch::Receiver<u64>,
    mut inject: broadcast::Receiver<Vec<u8>>,
) {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = FramedRead::new(read_half, FrameCodec::default());
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let writer = tokio::spawn(async move {
        while let Some(bytes) = out_rx.recv().await {
            if write_half.write_all(&bytes).await.is_err() {
                break;
            }
        }
    });

    let mut killed = false;
    loop {
        let next = tokio::select! {
            _ = kill.changed() => {
                killed = true;
                break;
            }
            raw = inject.recv() => {
                if let Ok(raw) = raw {
                    let _ = out_tx.send(raw);
                }
                continue;
            }
            next = reader.next() => next,
        };
        let frame = match next {
            Some(Ok(Ok(frame))) => frame,
            Some(Ok(Err(_))) => continue,
            _ => break,
        };
        let behavior = inner.behavior();
        match frame.parse() {
            Ok(Message::Hello { .. }) => {
                inner.record(Event::Hello {
                    accepted: behavior.accept_login,
                });
                if behavior.accept_login {
                    let _ = out_tx.send(encode(Frame::hello_ack()));
                } else {
                    let _ = out_tx.send(encode(Frame::hello_reject("bad credentials").unwrap()));
                    break;
                }
            }
            Ok(Message::KeepAlive) => inner.record(Event::KeepAlive),
            Ok(Message::SnapshotRequest) => {
                inner.record(Event::SnapshotRequest);
                let _ = out_tx.send(encode(inner.snapshot()));
            }
            Ok(Message::Command(command)) => {
                let seq = frame.sequence();
                inner.record(Event::Command {
                    seq,
                    command,
                });
                if !behavior.ack_commands {
                    continue;
                }
                let reply = match behavior.reject_code {
                    Some(code) => Frame::error(seq, code, "refused").unwrap(),
                    None => {
                        inner.apply(&command);
                        Frame::command_ack(seq)
                    }
                };
                let inner = inner.clone();
                let out_tx = out_tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(behavior.ack_delay).await;
                    inner.record(Event::AckSent { seq });
                    let _ = out_tx.send(encode(reply));
                });
            }
            _ => {}
        }
    }
    if killed {
        writer.abort();
        return;
    }
    // Let already queued replies (a login rejection) reach the client.
    drop(out_tx);
    let mut writer = writer;
    if tokio::time::timeout(Duration::from_millis(200), &mut writer).await.is_err() {
        writer.abort();
    }
}

pub fn encode(frame: Frame) -> Vec<u8> {
    FrameCodec::default().encode_frame(frame).unwrap().to_vec()
}

/// Poll `cond` until it holds or `limit` passes.
pub async fn wait_until(limit: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}

/// Decode the counter the controller stamps into each snapshot.
pub fn tick_of(snapshot: &ipcom_core::StateSnapshot) -> u16 {
    let hi = snapshot.value(TICK_MODULE, 0).unwrap_or(0) as u16;
    let lo = snapshot.value(TICK_MODULE, 1).unwrap_or(0) as u16;
    (hi << 8) | lo
}
