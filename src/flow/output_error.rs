//! Aborting the run when the combined output can no longer be written.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::{abort_on_finish, FlowController, FlowResult};
use crate::output::OutputWriter;
use crate::process::Command;

/// Stops the run when the combined output can no longer be written.
pub struct OutputErrorHandler {
    writer: Arc<OutputWriter>,
    abort: CancellationToken,
}

impl OutputErrorHandler {
    pub fn new(writer: Arc<OutputWriter>, abort: CancellationToken) -> Self {
        Self { writer, abort }
    }
}

impl FlowController for OutputErrorHandler {
    fn handle(&mut self, commands: Vec<Command>) -> FlowResult {
        let mut errors = self.writer.errors().subscribe();
        let abort = self.abort.clone();
        let targets = commands.clone();
        let task = tokio::spawn(async move {
            if let Some(error) = errors.recv().await {
                warn!(%error, "output stream failed, stopping every command");
                for command in &targets {
                    command.kill(None);
                }
                abort.cancel();
            }
        });
        FlowResult::with_finish(commands, abort_on_finish(vec![task]))
    }
}
