use std::sync::Arc;

use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tokio_util::sync::CancellationToken;
use tracing::{trace, warn};

use super::Shared;
use crate::frame::Frame;

/// Writes a `KeepAlive` frame every period while connected.
///
/// Keep-alives bypass the exchange lock; the controller does not answer
/// them, so they cannot be mistaken for a command reply.
pub(super) async fn run(shared: Arc<Shared>, shutdown: CancellationToken) {
    let period = shared.config.timing.keepalive_interval();
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }
        if !shared.connection.is_connected() {
            continue;
        }
        match shared.connection.write(Frame::keep_alive()).await {
            Ok(()) => trace!("keep-alive sent"),
            // The receive loop notices a dead socket and reconnects.
            Err(e) => warn!("keep-alive write failed: {e}"),
        }
    }
}
