//! Restarting failed commands, with a fixed or exponential delay.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Error};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{abort_on_finish, FlowController, FlowResult};
use crate::logger::Logger;
use crate::process::Command;
use crate::topic::Topic;

/// Wait before restarting a failed command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartDelay {
    Fixed(Duration),
    /// 1s, 2s, 4s, ... doubling with every attempt.
    Exponential,
}

impl Default for RestartDelay {
    fn default() -> Self {
        RestartDelay::Fixed(Duration::ZERO)
    }
}

impl RestartDelay {
    /// Delay before restart number `attempt`, counting from 0.
    pub fn for_attempt(&self, attempt: u32) -> Duration {
        match self {
            RestartDelay::Fixed(delay) => *delay,
            RestartDelay::Exponential => {
                let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
                Duration::from_millis(factor.saturating_mul(1000))
            }
        }
    }
}

impl FromStr for RestartDelay {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        if value.eq_ignore_ascii_case("exponential") {
            return Ok(RestartDelay::Exponential);
        }
        let ms: u64 = value
            .trim()
            .parse()
            .map_err(|_| anyhow!("invalid restart delay: {}", value))?;
        Ok(RestartDelay::Fixed(Duration::from_millis(ms)))
    }
}

/// Restarts commands that exit with a non-zero code.
///
/// Downstream only sees the final outcome of every command: its first success, or
/// the failure after which no retry is left. Retries stop once the abort token is
/// cancelled, and the pending failure is passed on instead.
pub struct RestartProcess {
    logger: Arc<Logger>,
    /// Negative means unlimited, 0 disables restarts.
    tries: i64,
    delay: RestartDelay,
    abort: CancellationToken,
}

impl RestartProcess {
    pub fn new(
        logger: Arc<Logger>,
        tries: i64,
        delay: RestartDelay,
        abort: CancellationToken,
    ) -> Self {
        Self {
            logger,
            tries,
            delay,
            abort,
        }
    }
}

impl FlowController for RestartProcess {
    fn handle(&mut self, commands: Vec<Command>) -> FlowResult {
        if self.tries == 0 {
            return FlowResult::new(commands);
        }
        let mut tasks = Vec::with_capacity(commands.len());
        let commands = commands
            .into_iter()
            .map(|command| {
                let forward = Topic::new();
                let mut closes = command.close().subscribe();
                let logger = Arc::clone(&self.logger);
                let abort = self.abort.clone();
                let (tries, delay) = (self.tries, self.delay);
                let target = command.clone();
                let output = forward.clone();
                tasks.push(tokio::spawn(async move {
                    let mut attempt: u32 = 0;
                    while let Some(event) = closes.recv().await {
                        let current = attempt;
                        attempt = attempt.saturating_add(1);
                        let exhausted = tries > 0 && i64::from(current) >= tries;
                        if event.exit_code.is_success() || exhausted || abort.is_cancelled() {
                            output.emit(event);
                            continue;
                        }
                        tokio::select! {
                            _ = tokio::time::sleep(delay.for_attempt(current)) => {}
                            _ = abort.cancelled() => {
                                output.emit(event);
                                continue;
                            }
                        }
                        debug!(index = target.index(), attempt = current + 1, "restarting");
                        logger.log_command_event(
                            &format!("{} restarted", target.command_line()),
                            &target,
                        );
                        target.start();
                    }
                }));
                command.with_close(forward)
            })
            .collect();
        FlowResult::with_finish(commands, abort_on_finish(tasks))
    }
}
