//! Error logging for commands that failed to spawn or to run.

use std::sync::Arc;

use super::{FlowController, FlowResult};
use crate::logger::Logger;
use crate::process::{Command, SpawnError};

/// Logs spawn and runtime errors of every command.
pub struct LogError {
    logger: Arc<Logger>,
}

impl LogError {
    pub fn new(logger: Arc<Logger>) -> Self {
        Self { logger }
    }
}

impl FlowController for LogError {
    fn handle(&mut self, commands: Vec<Command>) -> FlowResult {
        for command in &commands {
            let logger = Arc::clone(&self.logger);
            let weak = command.downgrade();
            command.errors().tap(move |error: &SpawnError| {
                let Some(command) = weak.upgrade() else { return };
                logger.log_command_event(
                    &format!(
                        "Error occurred when executing command: {}",
                        command.command_line()
                    ),
                    &command,
                );
                logger.log_command_event(&error.message, &command);
            });
        }
        FlowResult::new(commands)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{test_logger, FakeSpawner};

    #[tokio::test(start_paused = true)]
    async fn logs_the_command_and_the_error() {
        let spawner = FakeSpawner::new();
        spawner.fail_next_spawn("spawn sh ENOENT");
        let commands = spawner.commands(&["missing-binary"]);
        let (logger, sink) = test_logger();
        let result = LogError::new(logger).handle(commands);
        result.commands[0].start();
        assert_eq!(
            sink.contents(),
            "[0] Error occurred when executing command: missing-binary\n[0] spawn sh ENOENT\n"
        );
    }
}
