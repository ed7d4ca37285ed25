//! Wiring processes, behaviors, the scheduler and the completion listener together.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::completion::{CompletionListener, RunFailure, SuccessCondition};
use crate::events::CloseEvent;
use crate::flow::FlowController;
use crate::logger::AUTO_COLORS;
use crate::output::OutputWriter;
use crate::process::{Command, ManagedProcess, ProcessSpec};
use crate::scheduler::{ProcessLimit, Scheduler};
use crate::spawn::{Killer, SpawnOptions, Spawner, StdioMode};

/// Problems detected before anything is spawned.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("no commands to run")]
    NoCommands,
}

/// How a run ended when it did not succeed.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error(transparent)]
    Failed(#[from] RunFailure),
    #[error("finish hook failed: {0:#}")]
    Finish(anyhow::Error),
}

pub type RunResult = Pin<Box<dyn Future<Output = Result<Vec<CloseEvent>, RunError>> + Send>>;

/// Everything a run needs besides the commands themselves.
pub struct RunOptions {
    pub spawner: Arc<dyn Spawner>,
    pub killer: Arc<dyn Killer>,
    /// Applied to every command; a command's own cwd and env take precedence.
    pub spawn_options: SpawnOptions,
    pub max_processes: ProcessLimit,
    pub success: SuccessCondition,
    /// Applied in order, each one seeing the commands returned by the previous one.
    pub controllers: Vec<Box<dyn FlowController>>,
    pub abort: Option<CancellationToken>,
    /// Colours assigned by index to commands without one; the last one repeats.
    pub prefix_colors: Vec<String>,
    /// Names or indices of commands whose output is discarded.
    pub hide: Vec<String>,
    /// Released in command order when grouping output.
    pub writer: Option<Arc<OutputWriter>>,
}

impl RunOptions {
    pub fn new(spawner: Arc<dyn Spawner>, killer: Arc<dyn Killer>) -> Self {
        Self {
            spawner,
            killer,
            spawn_options: SpawnOptions::default(),
            max_processes: ProcessLimit::Unbounded,
            success: SuccessCondition::All,
            controllers: Vec::new(),
            abort: None,
            prefix_colors: Vec::new(),
            hide: Vec::new(),
            writer: None,
        }
    }
}

/// A started run.
pub struct Run {
    /// The commands as returned by the last flow controller.
    pub commands: Vec<Command>,
    /// Settles after the completion listener and every finish hook.
    pub result: RunResult,
}

fn prefix_color(colors: &[String], index: usize) -> Option<String> {
    let color = colors.get(index).or_else(|| colors.last())?;
    if color == "auto" {
        return Some(AUTO_COLORS[index % AUTO_COLORS.len()].to_string());
    }
    Some(color.clone())
}

fn is_hidden(hide: &[String], index: usize, spec: &ProcessSpec) -> bool {
    hide.iter()
        .any(|entry| *entry == spec.name || *entry == index.to_string())
}

fn spawn_options_for(base: &SpawnOptions, spec: &ProcessSpec, hidden: bool) -> SpawnOptions {
    let mut env = base.env.clone();
    env.extend(spec.env.iter().map(|(k, v)| (k.clone(), v.clone())));
    SpawnOptions {
        cwd: spec.cwd.clone().or_else(|| base.cwd.clone()),
        env,
        stdio: if hidden {
            StdioMode::Hidden
        } else {
            base.stdio
        },
        force_color: base.force_color,
    }
}

/// Starts running `specs`.
///
/// Fails without spawning anything when `specs` is empty.
pub fn run(specs: Vec<ProcessSpec>, options: RunOptions) -> Result<Run, ConfigError> {
    if specs.is_empty() {
        return Err(ConfigError::NoCommands);
    }
    let RunOptions {
        spawner,
        killer,
        spawn_options,
        max_processes,
        success,
        controllers,
        abort,
        prefix_colors,
        hide,
        writer,
    } = options;

    let mut commands: Vec<Command> = specs
        .into_iter()
        .enumerate()
        .map(|(index, mut spec)| {
            if spec.color.is_none() {
                spec.color = prefix_color(&prefix_colors, index);
            }
            let hidden = is_hidden(&hide, index, &spec);
            let options = spawn_options_for(&spawn_options, &spec, hidden);
            Command::new(ManagedProcess::new(
                index,
                spec,
                options,
                Arc::clone(&spawner),
                Arc::clone(&killer),
            ))
        })
        .collect();

    let mut hooks = Vec::new();
    for mut controller in controllers {
        let result = controller.handle(commands);
        commands = result.commands;
        hooks.extend(result.on_finish);
    }

    if let Some(writer) = &writer {
        writer.track(&commands);
    }
    let completion = CompletionListener::new(success).listen(&commands, abort.clone());
    debug!(commands = commands.len(), limit = %max_processes, "starting run");
    Scheduler::new(commands.clone(), max_processes, abort).start();

    let result = Box::pin(async move {
        let outcome = completion.await;
        let mut hook_error = None;
        for hook in hooks {
            if let Err(err) = hook.await {
                warn!(error = %err, "finish hook failed");
                hook_error.get_or_insert(err);
            }
        }
        if let Some(writer) = writer {
            writer.flush_remaining();
        }
        if let Some(err) = hook_error {
            return Err(RunError::Finish(err));
        }
        outcome.map_err(RunError::from)
    });
    Ok(Run { commands, result })
}
