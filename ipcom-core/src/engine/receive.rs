use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::Shared;
use crate::frame::{Frame, Message};
use crate::network::{Inbound, ReconnectPolicy};
use crate::queue::AckReply;

/// Sole reader of the socket.
///
/// Frames are routed as they arrive; a socket failure outside shutdown
/// enters `Reconnecting` and, with `auto_reconnect`, re-opens the session
/// with exponential backoff.
pub(super) async fn run(
    shared: Arc<Shared>,
    shutdown: CancellationToken,
    stop_reading: CancellationToken,
    auto_reconnect: bool,
) {
    let mut policy = ReconnectPolicy::from_config(&shared.config.reconnect);

    loop {
        if !shared.connection.is_connected() {
            if shutdown.is_cancelled() || !auto_reconnect {
                break;
            }
            if !reconnect(&shared, &mut policy, &shutdown).await {
                break;
            }
            continue;
        }

        let inbound = tokio::select! {
            _ = stop_reading.cancelled() => break,
            inbound = shared.connection.read_next() => inbound,
        };

        match inbound {
            Ok(Inbound::Frame(frame)) => route(&shared, frame),
            Ok(Inbound::Malformed(e)) => warn!("dropping malformed frame: {e}"),
            Err(e) if shutdown.is_cancelled() || shared.connection.is_closing() => {
                debug!("socket error during shutdown: {e}");
                break;
            }
            Err(e) => {
                warn!("connection lost: {e}");
                shared.connection.mark_lost(auto_reconnect).await;
                if !auto_reconnect {
                    break;
                }
            }
        }
    }
}

/// Retry `open` until it succeeds or shutdown is signalled.
///
/// The first attempt waits the base delay; each failure grows the delay.
/// Returns `false` when cancelled.
async fn reconnect(
    shared: &Shared,
    policy: &mut ReconnectPolicy,
    shutdown: &CancellationToken,
) -> bool {
    let mut delay = policy.current_delay();
    loop {
        debug!(delay_ms = delay.as_millis() as u64, "waiting before reconnect");
        tokio::select! {
            _ = shutdown.cancelled() => return false,
            _ = tokio::time::sleep(delay) => {}
        }

        let attempt = tokio::select! {
            _ = shutdown.cancelled() => return false,
            attempt = shared.connection.open() => attempt,
        };
        match attempt {
            Ok(()) => {
                policy.reset();
                info!("reconnected to controller");
                return true;
            }
            Err(e) => {
                delay = policy.next_delay();
                warn!(
                    next_delay_ms = delay.as_millis() as u64,
                    "reconnect attempt failed: {e}"
                );
            }
        }
    }
}

fn route(shared: &Shared, frame: Frame) {
    let sequence = frame.sequence();
    let message = match frame.parse() {
        Ok(message) => message,
        Err(e) => {
            warn!(kind = %frame.kind(), "dropping undecodable frame: {e}");
            return;
        }
    };
    match message {
        Message::StateSnapshot(snapshot) => {
            let published = shared.publisher.publish(snapshot);
            trace!(
                sequence = published.sequence(),
                devices = published.len(),
                "snapshot published"
            );
        }
        Message::CommandAck => {
            if !shared.queue.resolve(sequence, AckReply::Ack) {
                debug!(seq = sequence, "ack with no command waiting");
            }
        }
        Message::Error { code, message } => {
            let reply = AckReply::Rejected {
                code,
                message: message.clone(),
            };
            if !shared.queue.resolve(sequence, reply) {
                warn!(code, %message, "controller reported an error");
            }
        }
        Message::KeepAlive => trace!("keep-alive from controller"),
        _ => debug!(kind = %frame.kind(), "ignoring unexpected frame"),
    }
}
