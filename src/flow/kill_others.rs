//! Kill-others: the first matching close stops every other command.

use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Error};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{FlowController, FlowResult};
use crate::events::{CloseEvent, ProcessSignal};
use crate::logger::Logger;
use crate::process::{Command, WeakCommand};

/// The kind of close that makes every other command get killed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillCondition {
    Success,
    Failure,
}

impl FromStr for KillCondition {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "success" => Ok(KillCondition::Success),
            "failure" => Ok(KillCondition::Failure),
            _ => Err(anyhow!("invalid kill condition: {}", value)),
        }
    }
}

/// Kills the remaining commands once one closes in a matching way.
///
/// Fires at most once per run. The kill and the abort happen while the close is being
/// emitted, before the scheduler can react to it. With a timeout, commands still
/// alive after it get SIGKILL.
pub struct KillOthers {
    logger: Arc<Logger>,
    conditions: Vec<KillCondition>,
    signal: ProcessSignal,
    timeout: Option<Duration>,
    abort: CancellationToken,
}

impl KillOthers {
    pub fn new(
        logger: Arc<Logger>,
        conditions: Vec<KillCondition>,
        signal: ProcessSignal,
        timeout: Option<Duration>,
        abort: CancellationToken,
    ) -> Self {
        Self {
            logger,
            conditions,
            signal,
            timeout,
            abort,
        }
    }
}

/// State shared by the taps on every command's close stream.
struct Trigger {
    logger: Arc<Logger>,
    conditions: Vec<KillCondition>,
    signal: ProcessSignal,
    timeout: Option<Duration>,
    abort: CancellationToken,
    targets: Vec<WeakCommand>,
    fired: AtomicBool,
    follow_up: Mutex<Option<JoinHandle<()>>>,
}

impl Trigger {
    fn on_close(&self, index: usize, event: &CloseEvent) {
        let condition = if event.exit_code.is_success() {
            KillCondition::Success
        } else {
            KillCondition::Failure
        };
        if !self.conditions.contains(&condition) || self.fired.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(index, ?condition, "kill others triggered");
        self.abort.cancel();

        let killable: Vec<Command> = self
            .targets
            .iter()
            .filter_map(WeakCommand::upgrade)
            .filter(Command::can_kill)
            .collect();
        if killable.is_empty() {
            return;
        }
        self.logger
            .log_global_event(&format!("Sending {} to other processes..", self.signal));
        for command in &killable {
            command.kill(Some(self.signal));
        }

        let Some(timeout) = self.timeout else { return };
        if self.signal == ProcessSignal::SigKill {
            return;
        }
        let logger = Arc::clone(&self.logger);
        let survivors: Vec<WeakCommand> = killable.iter().map(Command::downgrade).collect();
        *self.follow_up.lock() = Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let remaining: Vec<Command> = survivors
                .iter()
                .filter_map(WeakCommand::upgrade)
                .filter(Command::can_kill)
                .collect();
            if remaining.is_empty() {
                return;
            }
            logger.log_global_event(&format!(
                "Sending SIGKILL to {} processes..",
                remaining.len()
            ));
            for command in remaining {
                command.kill(Some(ProcessSignal::SigKill));
            }
        }));
    }
}

impl FlowController for KillOthers {
    fn handle(&mut self, commands: Vec<Command>) -> FlowResult {
        if self.conditions.is_empty() {
            return FlowResult::new(commands);
        }
        let trigger = Arc::new(Trigger {
            logger: Arc::clone(&self.logger),
            conditions: self.conditions.clone(),
            signal: self.signal,
            timeout: self.timeout,
            abort: self.abort.clone(),
            targets: commands.iter().map(Command::downgrade).collect(),
            fired: AtomicBool::new(false),
            follow_up: Mutex::new(None),
        });
        for command in &commands {
            let trigger = Arc::clone(&trigger);
            let index = command.index();
            command
                .close()
                .tap(move |event: &CloseEvent| trigger.on_close(index, event));
        }

        let on_finish = Box::pin(async move {
            if let Some(task) = trigger.follow_up.lock().take() {
                task.abort();
            }
            Ok::<(), anyhow::Error>(())
        });
        FlowResult::with_finish(commands, on_finish)
    }
}
