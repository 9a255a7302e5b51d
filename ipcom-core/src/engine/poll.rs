use std::sync::Arc;

use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::Shared;
use crate::frame::Frame;

/// Requests a state snapshot every poll period.
///
/// A tick is skipped while a command is in flight so the next frame the
/// controller sends after a command is its reply.
pub(super) async fn run(shared: Arc<Shared>, shutdown: CancellationToken) {
    let period = shared.config.timing.poll_interval();
    let mut ticker = interval_at(Instant::now(), period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }
        if !shared.connection.is_connected() {
            continue;
        }
        let Some(_wire) = shared.queue.try_begin_poll() else {
            trace!("command in flight, poll skipped");
            continue;
        };
        if let Err(e) = shared.connection.write(Frame::snapshot_request()).await {
            debug!("snapshot request failed: {e}");
        }
    }
}
