use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::Shared;
use crate::error::IpcomError;
use crate::frame::Frame;
use crate::message::Command;
use crate::queue::{CommandOutcome, CommandResult};

/// Takes commands off the queue one at a time and waits for each ack.
///
/// Cancellation is only observed between commands; a command already on
/// the wire resolves or times out first.
pub(super) async fn run(shared: Arc<Shared>, shutdown: CancellationToken) {
    loop {
        let command = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            next = shared.queue.next() => match next {
                Some(command) => command,
                None => break,
            },
        };

        let outcome = execute(&shared, &command).await;
        match &outcome {
            CommandOutcome::Acked => info!(%command, "command acknowledged"),
            CommandOutcome::Rejected { code, message } => {
                warn!(%command, code, %message, "command rejected")
            }
            other => warn!(%command, outcome = ?other, "command not acknowledged"),
        }
        shared.report(CommandResult { command, outcome });
    }
    if !shared.queue.is_empty() {
        debug!(left = shared.queue.len(), "dispatch stopped with queued commands");
    }
}

async fn execute(shared: &Shared, command: &Command) -> CommandOutcome {
    if let Err(e) = command.operation.validate() {
        return CommandOutcome::Invalid(e.to_string());
    }
    if !shared.connection.is_connected() {
        return CommandOutcome::NotConnected;
    }
    let sequence = shared.connection.next_sequence();
    let frame = match Frame::command(sequence, command) {
        Ok(frame) => frame,
        Err(e) => return CommandOutcome::Invalid(e.to_string()),
    };
    let (_in_flight, reply) = shared.queue.begin(sequence).await;

    match shared.connection.write(frame).await {
        Ok(()) => debug!(
            module = command.target.module,
            output = command.target.output,
            seq = sequence,
            "command sent: {}",
            command.operation
        ),
        Err(IpcomError::NotConnected) => return CommandOutcome::NotConnected,
        Err(e) => return CommandOutcome::WriteFailed(e.to_string()),
    }

    match tokio::time::timeout(shared.config.timing.ack_timeout(), reply).await {
        Ok(Ok(reply)) => reply.into(),
        // Slot cleared without a reply; treat like silence.
        Ok(Err(_)) | Err(_) => CommandOutcome::TimedOut,
    }
}
