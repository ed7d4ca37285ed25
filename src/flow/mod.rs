//! The behavior pipeline.
//!
//! Each flow controller receives the command list produced by the previous one and
//! returns a list of its own, optionally with views whose close stream it replaced,
//! plus an optional hook that runs once the run has settled.
//!
//! Logging and kill-others observe their streams through [`Topic::tap`], on the task
//! that emits each event. Everything else reacts from its own task.
//!
//! [`Topic::tap`]: crate::topic::Topic::tap

use std::future::Future;
use std::pin::Pin;

use tokio::task::JoinHandle;

use crate::process::Command;

mod input;
mod kill_on_signal;
mod kill_others;
mod log_error;
mod log_exit;
mod log_output;
mod log_timings;
mod logger_padding;
mod output_error;
mod restart;
mod teardown;

pub use input::InputHandler;
pub use kill_on_signal::KillOnSignal;
pub use kill_others::{KillCondition, KillOthers};
pub use log_error::LogError;
pub use log_exit::LogExit;
pub use log_output::LogOutput;
pub use log_timings::LogTimings;
pub use logger_padding::LoggerPadding;
pub use output_error::OutputErrorHandler;
pub use restart::{RestartDelay, RestartProcess};
pub use teardown::Teardown;

/// Cleanup that runs after the completion listener settled. Nothing happens until polled.
pub type OnFinish = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;

/// What a flow controller hands to the next one.
pub struct FlowResult {
    pub commands: Vec<Command>,
    pub on_finish: Option<OnFinish>,
}

impl FlowResult {
    pub fn new(commands: Vec<Command>) -> Self {
        Self {
            commands,
            on_finish: None,
        }
    }

    pub fn with_finish(commands: Vec<Command>, on_finish: OnFinish) -> Self {
        Self {
            commands,
            on_finish: Some(on_finish),
        }
    }
}

/// One stage of the behavior pipeline.
///
/// `handle` runs once, synchronously, during setup. Subscriptions it needs must be
/// taken before it returns.
pub trait FlowController: Send {
    fn handle(&mut self, commands: Vec<Command>) -> FlowResult;
}

/// A hook that cancels background work of a controller.
pub(crate) fn abort_on_finish(tasks: Vec<JoinHandle<()>>) -> OnFinish {
    Box::pin(async move {
        for task in tasks {
            task.abort();
        }
        Ok(())
    })
}
