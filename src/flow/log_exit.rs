//! Exit logging for every close, restarted attempts included.

use std::sync::Arc;

use super::{FlowController, FlowResult};
use crate::events::CloseEvent;
use crate::logger::Logger;
use crate::process::Command;

/// Logs every exit, restarted attempts included.
pub struct LogExit {
    logger: Arc<Logger>,
}

impl LogExit {
    pub fn new(logger: Arc<Logger>) -> Self {
        Self { logger }
    }
}

impl FlowController for LogExit {
    fn handle(&mut self, commands: Vec<Command>) -> FlowResult {
        for command in &commands {
            let logger = Arc::clone(&self.logger);
            let weak = command.downgrade();
            command.close().tap(move |event: &CloseEvent| {
                let Some(command) = weak.upgrade() else { return };
                logger.log_command_event(
                    &format!("{} exited with code {}", command.command_line(), event.exit_code),
                    &command,
                );
            });
        }
        FlowResult::new(commands)
    }
}
