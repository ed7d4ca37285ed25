//! Signal forwarding: SIGINT, SIGTERM and SIGHUP received by corun reach every command.

use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{abort_on_finish, FlowController, FlowResult};
use crate::events::{CloseEvent, ExitCode, ProcessSignal};
use crate::process::Command;
use crate::topic::Topic;

/// Forwards termination signals received by corun to every command.
///
/// Commands ending with SIGINT are reported downstream as exiting with code 0.
pub struct KillOnSignal {
    signals: Topic<ProcessSignal>,
    abort: CancellationToken,
}

impl KillOnSignal {
    pub fn new(signals: Topic<ProcessSignal>, abort: CancellationToken) -> Self {
        Self { signals, abort }
    }
}

impl FlowController for KillOnSignal {
    fn handle(&mut self, commands: Vec<Command>) -> FlowResult {
        let mut signals = self.signals.subscribe();
        let abort = self.abort.clone();
        let targets = commands.clone();
        let task = tokio::spawn(async move {
            while let Some(signal) = signals.recv().await {
                debug!(%signal, "forwarding signal to every command");
                abort.cancel();
                for command in &targets {
                    command.kill(Some(signal));
                }
            }
        });

        let commands = commands
            .iter()
            .map(|command| {
                let close = command.close().derive(|mut event: CloseEvent| {
                    if event.exit_code.is_signal(ProcessSignal::SigInt) {
                        event.exit_code = ExitCode::Code(0);
                    }
                    Some(event)
                });
                command.with_close(close)
            })
            .collect();
        FlowResult::with_finish(commands, abort_on_finish(vec![task]))
    }
}
