//! Engine lifecycle, polling, command round-trips and reconnection against
//! a scripted controller on localhost.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use common::{Controller, Event, encode, tick_of, wait_until};
use ipcom_core::{
    Address, CommandOutcome, CommandResult, ConnectionState, Engine, EngineConfig, Frame,
    IpcomError, Operation, StartOptions,
};
use tokio_test::{assert_err, assert_ok};

const SETTLE: Duration = Duration::from_secs(3);

fn collect_results(engine: &Engine) -> Arc<Mutex<Vec<CommandResult>>> {
    let results = Arc::new(Mutex::new(Vec::new()));
    let sink = results.clone();
    engine.on_command_result(move |r| sink.lock().unwrap().push(r));
    results
}

fn collect_snapshots(engine: &Engine) -> Arc<Mutex<Vec<(u64, u16)>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    engine.on_state_snapshot(move |s| sink.lock().unwrap().push((s.sequence(), tick_of(&s))));
    seen
}

fn collect_states(engine: &Engine) -> Arc<Mutex<Vec<ConnectionState>>> {
    let states = Arc::new(Mutex::new(Vec::new()));
    let sink = states.clone();
    let mut rx = engine.subscribe_state();
    tokio::spawn(async move {
        while rx.changed().await.is_ok() {
            let state = *rx.borrow_and_update();
            sink.lock().unwrap().push(state);
        }
    });
    states
}

fn strictly_increasing<T: PartialOrd>(values: impl IntoIterator<Item = T>) -> bool {
    let values: Vec<T> = values.into_iter().collect();
    values.windows(2).all(|w| w[0] < w[1])
}

/// No snapshot request may reach the controller between a command and
/// its acknowledgement, and commands never overlap.
fn assert_exclusive_exchanges(events: &[Event]) {
    let mut open: Option<u16> = None;
    for event in events {
        match event {
            Event::Command { seq, .. } => {
                assert!(open.is_none(), "command {seq} sent while {open:?} in flight");
                open = Some(*seq);
            }
            Event::AckSent { seq } if open == Some(*seq) => open = None,
            Event::SnapshotRequest => {
                assert!(open.is_none(), "poll sent while command {open:?} in flight")
            }
            _ => {}
        }
    }
}

// ── Lifecycle ────────────────────────────────────────────────────

#[tokio::test]
async fn start_connects_and_publishes_snapshots() {
    let controller = Controller::spawn().await;
    let engine = Engine::new(controller.config());
    let seen = collect_snapshots(&engine);
    let mut latest = engine.subscribe_snapshots();

    assert_ok!(engine.start(true).await);
    assert!(engine.is_connected());
    assert_eq!(engine.connection_state(), ConnectionState::Connected);

    assert!(wait_until(SETTLE, || seen.lock().unwrap().len() >= 5).await);
    assert_ok!(latest.changed().await);
    assert!(latest.borrow().is_some());

    engine.stop().await;
    let seen = seen.lock().unwrap().clone();
    assert!(strictly_increasing(seen.iter().map(|(seq, _)| *seq)));
    assert!(strictly_increasing(seen.iter().map(|(_, tick)| *tick)));
    assert_eq!(seen[0].0, 1);
    assert_eq!(engine.connection_state(), ConnectionState::Disconnected);
    assert_eq!(
        controller.count(|e| matches!(e, Event::Hello { accepted: true })),
        1
    );
}

#[tokio::test]
async fn start_is_idempotent() {
    let controller = Controller::spawn().await;
    let engine = Engine::new(controller.config());
    assert_ok!(engine.start(true).await);
    assert_ok!(engine.start(true).await);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(controller.connections(), 1);
    engine.stop().await;
    engine.stop().await;
    assert!(!engine.is_running().await);
}

#[tokio::test]
async fn start_fails_when_controller_unreachable() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let engine = Engine::new(EngineConfig::for_controller(
        addr.ip().to_string(),
        addr.port(),
    ));
    let err = assert_err!(engine.start(true).await);
    assert!(matches!(err, IpcomError::Connect { .. }));
    assert_eq!(engine.connection_state(), ConnectionState::Disconnected);
    assert!(!engine.is_running().await);
}

#[tokio::test]
async fn start_fails_on_rejected_login() {
    let controller = Controller::spawn().await;
    controller.set_accept_login(false);
    let engine = Engine::new(controller.config());

    let err = assert_err!(engine.start(true).await);
    assert!(matches!(err, IpcomError::Handshake(_)));
    assert_eq!(engine.connection_state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn retry_initial_connects_once_login_is_accepted() {
    let controller = Controller::spawn().await;
    controller.set_accept_login(false);
    let engine = Engine::new(controller.config());

    assert_ok!(
        engine
            .start_with(StartOptions {
                auto_reconnect: true,
                retry_initial: true,
            })
            .await
    );
    assert_eq!(engine.connection_state(), ConnectionState::Reconnecting);

    controller.set_accept_login(true);
    assert!(wait_until(SETTLE, || engine.is_connected()).await);
    engine.stop().await;
}

#[tokio::test]
async fn stop_with_command_in_flight_is_bounded() {
    let controller = Controller::spawn().await;
    controller.set_ack_commands(false);
    let mut config = controller.config();
    config.timing.ack_timeout_ms = 1_000;
    let engine = Engine::new(config);
    let results = collect_results(&engine);

    assert_ok!(engine.start(true).await);
    engine.queue_command(1, 1, Operation::On);
    assert!(
        wait_until(SETTLE, || {
            controller.count(|e| matches!(e, Event::Command { .. })) == 1
        })
        .await
    );

    let started = Instant::now();
    engine.stop().await;
    assert!(started.elapsed() < Duration::from_millis(2_500));
    assert_eq!(engine.connection_state(), ConnectionState::Disconnected);

    // The in-flight command resolved before the loops were joined.
    let results = results.lock().unwrap().clone();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].outcome, CommandOutcome::TimedOut);
}

// ── Commands ─────────────────────────────────────────────────────

#[tokio::test]
async fn command_round_trip_updates_state() {
    let controller = Controller::spawn().await;
    let engine = Engine::new(controller.config());
    let results = collect_results(&engine);
    assert_ok!(engine.start(true).await);

    engine.queue_command(2, 1, Operation::SetLevel(50));
    assert!(wait_until(SETTLE, || results.lock().unwrap().len() == 1).await);
    assert!(results.lock().unwrap()[0].outcome.is_success());

    assert!(wait_until(SETTLE, || engine.value(2, 1) == Some(128)).await);
    let snapshot = engine.latest_snapshot().unwrap();
    let device = snapshot.get(Address::new(2, 1)).unwrap();
    assert_eq!(device.brightness_percent(), 50);
    assert_eq!(engine.module_values(2), vec![(1, 128)]);
    engine.stop().await;
}

#[tokio::test]
async fn commands_queued_before_start_are_sent_in_order() {
    let controller = Controller::spawn().await;
    let engine = Engine::new(controller.config());
    let results = collect_results(&engine);

    engine.queue_command(1, 1, Operation::On);
    engine.queue_command(1, 2, Operation::Off);
    assert_eq!(engine.pending_commands(), 2);

    assert_ok!(engine.start(true).await);
    assert!(wait_until(SETTLE, || results.lock().unwrap().len() == 2).await);
    assert_eq!(engine.pending_commands(), 0);

    let outputs: Vec<u8> = controller
        .events()
        .iter()
        .filter_map(|e| match e {
            Event::Command { command, .. } => Some(command.target.output),
            _ => None,
        })
        .collect();
    assert_eq!(outputs, vec![1, 2]);
    assert!(results.lock().unwrap().iter().all(|r| r.outcome.is_success()));
    engine.stop().await;
}

#[tokio::test]
async fn polls_never_interleave_with_commands() {
    let controller = Controller::spawn().await;
    controller.set_ack_delay(Duration::from_millis(100));
    let mut config = controller.config();
    config.timing.poll_interval_ms = 5;
    let engine = Engine::new(config);
    let results = collect_results(&engine);
    assert_ok!(engine.start(true).await);

    for output in 0..4 {
        engine.queue_command(3, output, Operation::On);
    }
    assert!(wait_until(SETTLE, || results.lock().unwrap().len() == 4).await);
    tokio::time::sleep(Duration::from_millis(50)).await;
    engine.stop().await;

    let events = controller.events();
    assert_exclusive_exchanges(&events);
    assert!(controller.count(|e| *e == Event::SnapshotRequest) > 0);
    assert!(results.lock().unwrap().iter().all(|r| r.outcome.is_success()));
}

#[tokio::test]
async fn unacknowledged_command_times_out_and_queue_moves_on() {
    let controller = Controller::spawn().await;
    controller.set_ack_commands(false);
    let mut config = controller.config();
    config.timing.ack_timeout_ms = 200;
    let engine = Engine::new(config);
    let results = collect_results(&engine);
    assert_ok!(engine.start(true).await);

    engine.queue_command(4, 0, Operation::On);
    assert!(wait_until(SETTLE, || results.lock().unwrap().len() == 1).await);
    assert_eq!(results.lock().unwrap()[0].outcome, CommandOutcome::TimedOut);

    controller.set_ack_commands(true);
    engine.queue_command(4, 1, Operation::On);
    assert!(wait_until(SETTLE, || results.lock().unwrap().len() == 2).await);
    assert_eq!(results.lock().unwrap()[1].outcome, CommandOutcome::Acked);
    assert!(engine.is_connected());
    engine.stop().await;
}

#[tokio::test]
async fn controller_error_rejects_command() {
    let controller = Controller::spawn().await;
    controller.set_reject_code(Some(4));
    let engine = Engine::new(controller.config());
    let results = collect_results(&engine);
    assert_ok!(engine.start(true).await);

    engine.queue_command(5, 5, Operation::Off);
    assert!(wait_until(SETTLE, || results.lock().unwrap().len() == 1).await);
    assert_eq!(
        results.lock().unwrap()[0].outcome,
        CommandOutcome::Rejected {
            code: 4,
            message: "refused".into()
        }
    );
    engine.stop().await;
}

#[tokio::test]
async fn out_of_range_level_is_refused_before_the_wire() {
    let controller = Controller::spawn().await;
    let engine = Engine::new(controller.config());
    let results = collect_results(&engine);
    assert_ok!(engine.start(true).await);

    engine.queue_command(2, 2, Operation::SetLevel(150));
    engine.queue_command(2, 2, Operation::SetLevel(100));
    assert!(wait_until(SETTLE, || results.lock().unwrap().len() == 2).await);

    let results = results.lock().unwrap().clone();
    assert!(matches!(results[0].outcome, CommandOutcome::Invalid(_)));
    assert_eq!(results[1].outcome, CommandOutcome::Acked);
    let sent: Vec<Event> = controller
        .events()
        .into_iter()
        .filter(|e| matches!(e, Event::Command { .. }))
        .collect();
    assert_eq!(sent.len(), 1);
    assert!(matches!(
        &sent[0],
        Event::Command { command, .. } if command.operation == Operation::SetLevel(100)
    ));
    engine.stop().await;
}

// ── Resilience ───────────────────────────────────────────────────

#[tokio::test]
async fn panicking_handlers_do_not_stop_the_session() {
    let controller = Controller::spawn().await;
    let engine = Engine::new(controller.config());
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    engine.on_state_snapshot(move |_| {
        if counter.fetch_add(1, Ordering::SeqCst) == 0 {
            panic!("snapshot consumer failed");
        }
    });
    engine.on_command_result(|_| panic!("result consumer failed"));
    let results = collect_results(&engine);
    assert_ok!(engine.start(true).await);

    // Later snapshots still arrive after the first handler call panicked.
    assert!(wait_until(SETTLE, || calls.load(Ordering::SeqCst) >= 3).await);

    // Acks are still routed, and later result handlers still run.
    engine.queue_command(3, 3, Operation::On);
    assert!(wait_until(SETTLE, || results.lock().unwrap().len() == 1).await);
    assert!(results.lock().unwrap()[0].outcome.is_success());
    assert!(wait_until(SETTLE, || engine.value(3, 3) == Some(255)).await);

    assert_eq!(engine.connection_state(), ConnectionState::Connected);
    assert_eq!(controller.connections(), 1);
    engine.stop().await;
}

#[tokio::test]
async fn malformed_frames_do_not_break_the_session() {
    let controller = Controller::spawn().await;
    let engine = Engine::new(controller.config());
    let published = Arc::new(AtomicUsize::new(0));
    let counter = published.clone();
    engine.on_state_snapshot(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    assert_ok!(engine.start(true).await);
    assert!(wait_until(SETTLE, || published.load(Ordering::SeqCst) > 0).await);
    let mut states = engine.subscribe_state();

    let mut corrupt = encode(Frame::state_snapshot([(Address::new(1, 1), 7)]).unwrap());
    if let Some(last) = corrupt.last_mut() {
        *last ^= 0xFF;
    }
    controller.inject(b"\x00\x01garbage bytes".to_vec());
    controller.inject(corrupt);

    let before = published.load(Ordering::SeqCst);
    assert!(wait_until(SETTLE, || published.load(Ordering::SeqCst) >= before + 3).await);
    assert!(engine.is_connected());
    assert!(!states.has_changed().unwrap());
    assert_eq!(controller.connections(), 1);
    assert_eq!(engine.value(1, 1), None);
    engine.stop().await;
}

#[tokio::test]
async fn keepalives_are_sent_while_connected() {
    let controller = Controller::spawn().await;
    let mut config = controller.config();
    config.timing.keepalive_interval_ms = 30;
    let engine = Engine::new(config);
    assert_ok!(engine.start(true).await);

    assert!(wait_until(SETTLE, || controller.count(|e| *e == Event::KeepAlive) >= 2).await);
    engine.stop().await;
}

#[tokio::test]
async fn reconnects_after_drop_with_monotonic_snapshots() {
    let controller = Controller::spawn().await;
    let config = controller.config();
    let base_delay = Duration::from_millis(config.reconnect.base_delay_ms);
    let engine = Engine::new(config);
    let seen = collect_snapshots(&engine);
    let states = collect_states(&engine);
    assert_ok!(engine.start(true).await);
    assert!(wait_until(SETTLE, || seen.lock().unwrap().len() >= 3).await);

    // The controller stays reachable, so the session must be back within
    // one base delay plus local connect and login time.
    let mut state_rx = engine.subscribe_state();
    let dropped_at = Instant::now();
    controller.drop_connections();
    let back_after = assert_ok!(
        tokio::time::timeout(SETTLE, async {
            let _ = state_rx.wait_for(|s| *s != ConnectionState::Connected).await;
            let _ = state_rx.wait_for(|s| *s == ConnectionState::Connected).await;
            dropped_at.elapsed()
        })
        .await
    );
    assert!(
        back_after <= base_delay + Duration::from_millis(150),
        "reconnected after {back_after:?}"
    );
    assert_eq!(controller.connections(), 2);

    let before = seen.lock().unwrap().len();
    assert!(wait_until(SETTLE, || seen.lock().unwrap().len() >= before + 3).await);
    engine.stop().await;

    let states = states.lock().unwrap().clone();
    let lost = states
        .iter()
        .position(|s| *s == ConnectionState::Reconnecting)
        .expect("Reconnecting was never observed");
    assert!(states[lost..].contains(&ConnectionState::Connected));

    let seen = seen.lock().unwrap().clone();
    assert!(strictly_increasing(seen.iter().map(|(seq, _)| *seq)));
    assert!(strictly_increasing(seen.iter().map(|(_, tick)| *tick)));
}

#[tokio::test]
async fn backoff_keeps_retrying_until_login_succeeds() {
    let controller = Controller::spawn().await;
    let engine = Engine::new(controller.config());
    assert_ok!(engine.start(true).await);

    controller.set_accept_login(false);
    controller.drop_connections();
    assert!(
        wait_until(SETTLE, || {
            controller.count(|e| *e == Event::Hello { accepted: false }) >= 2
                && engine.connection_state() == ConnectionState::Reconnecting
        })
        .await
    );
    assert!(!engine.is_connected());

    controller.set_accept_login(true);
    assert!(wait_until(SETTLE, || engine.is_connected()).await);
    engine.stop().await;
}

#[tokio::test]
async fn without_auto_reconnect_a_drop_disconnects() {
    let controller = Controller::spawn().await;
    let engine = Engine::new(controller.config());
    assert_ok!(engine.start(false).await);

    controller.drop_connections();
    assert!(
        wait_until(SETTLE, || {
            engine.connection_state() == ConnectionState::Disconnected
        })
        .await
    );
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(controller.connections(), 1);
    assert_eq!(engine.connection_state(), ConnectionState::Disconnected);
    engine.stop().await;
}
