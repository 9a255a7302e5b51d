//! Monitor service core logic.
//!
//! Runs one engine session, sends the commands given on the command line
//! and logs output changes and connection state until stopped.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use ipcom_core::{CommandResult, DeviceState, Engine, IpcomError, StateSnapshot};
use tracing::{info, warn};

use crate::command::CommandSpec;
use crate::config::MonitorConfig;

// ── MonitorService ───────────────────────────────────────────────

pub struct MonitorService {
    config: MonitorConfig,
    running: Arc<AtomicBool>,
}

impl MonitorService {
    pub fn new(config: MonitorConfig) -> Self {
        Self {
            config,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Obtain a handle that can be used to stop the service from
    /// another task.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Run until stopped.
    ///
    /// 1. Starts the engine; a failed first connect is returned.
    /// 2. Queues `commands` in order.
    /// 3. Logs changed outputs and state transitions.
    /// 4. Stops the engine when `running` becomes `false`.
    pub async fn run(&self, commands: &[CommandSpec]) -> Result<(), IpcomError> {
        self.running.store(true, Ordering::SeqCst);

        let engine = Engine::new(self.config.engine.clone());
        engine.on_command_result(log_result);
        let mut snapshots = engine.subscribe_snapshots();
        let mut states = engine.subscribe_state();

        engine.start(self.config.engine.reconnect.enabled).await?;
        info!(
            "connected to {}",
            self.config.engine.controller.socket_addr()
        );

        for c in commands {
            engine.queue_command(c.module, c.output, c.operation);
        }

        let mut previous: Option<Arc<StateSnapshot>> = None;
        while self.is_running() {
            tokio::select! {
                changed = snapshots.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let Some(current) = snapshots.borrow_and_update().clone() else {
                        continue;
                    };
                    if self.config.logging.log_every_snapshot {
                        info!(
                            sequence = current.sequence(),
                            devices = current.len(),
                            "snapshot"
                        );
                    }
                    for device in changed_outputs(previous.as_deref(), &current) {
                        info!(
                            "{} -> {} ({}%)",
                            device.address,
                            device.value,
                            device.brightness_percent()
                        );
                    }
                    previous = Some(current);
                }
                changed = states.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let state = *states.borrow_and_update();
                    info!("connection {state}");
                }
                _ = Self::wait_for_stop(&self.running) => break,
            }
        }

        engine.stop().await;
        info!("monitor stopped");
        Ok(())
    }

    async fn wait_for_stop(running: &Arc<AtomicBool>) {
        loop {
            if !running.load(Ordering::SeqCst) {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        }
    }
}

fn log_result(result: CommandResult) {
    if result.outcome.is_success() {
        info!("{} acknowledged", result.command);
    } else {
        warn!("{} failed: {:?}", result.command, result.outcome);
    }
}

/// Outputs that are new or whose value differs from `previous`.
pub fn changed_outputs(previous: Option<&StateSnapshot>, current: &StateSnapshot) -> Vec<DeviceState> {
    current
        .devices()
        .filter(|d| previous.and_then(|p| p.get(d.address)).map(|p| p.value) != Some(d.value))
        .copied()
        .collect()
}

// ── Tests ────────────────────────────────────────────────────────
