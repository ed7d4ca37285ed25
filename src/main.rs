//! corun: run several commands concurrently.
//!
//! This is the entry point of the application. It parses command-line arguments,
//! loads configuration, assembles the flow controllers and waits for the run to
//! settle, translating its outcome into the process exit code.

mod completion;
mod config;
mod events;
mod flow;
mod logger;
mod orchestrator;
mod output;
mod process;
mod scheduler;
mod spawn;
#[cfg(test)]
mod testing;
mod topic;

use std::collections::HashMap;
use std::io::{BufRead, IsTerminal};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::builder::styling::{AnsiColor, Effects, Style};
use clap::builder::Styles;
use clap::Parser;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::completion::SuccessCondition;
use crate::config::Config;
use crate::events::ProcessSignal;
use crate::flow::{
    FlowController, InputHandler, KillCondition, KillOnSignal, KillOthers, LogError, LogExit,
    LogOutput, LogTimings, LoggerPadding, OutputErrorHandler, RestartDelay, RestartProcess,
    Teardown,
};
use crate::logger::{Logger, LoggerOptions, DEFAULT_PREFIX_LENGTH, DEFAULT_TIMESTAMP_FORMAT};
use crate::orchestrator::{RunError, RunOptions};
use crate::output::OutputWriter;
use crate::process::ProcessSpec;
use crate::scheduler::ProcessLimit;
use crate::spawn::{ShellSpawner, SpawnOptions, Spawner, StdioMode, TreeKiller};
use crate::topic::Topic;

const DEFAULT_CONFIG_FILE: &str = "corun.toml";

/// Command-line interface definition.
#[derive(Debug, Parser)]
#[command(
    name = "corun",
    version,
    about = "Run commands concurrently",
    styles = help_styles()
)]
struct Cli {
    /// Commands to run, each executed through the shell.
    #[arg(value_name = "COMMAND")]
    commands: Vec<String>,
    /// Names of the commands, separated by --name-separator.
    #[arg(short, long)]
    names: Option<String>,
    /// Separator used to split --names.
    #[arg(long, default_value = ",")]
    name_separator: String,
    /// When the run counts as successful: all, first, last, command-{name|index}, !command-{name|index}.
    #[arg(short, long)]
    success: Option<String>,
    /// How many commands may run at once, e.g. 3 or 50% of the CPUs.
    #[arg(short, long)]
    max_processes: Option<String>,
    /// Kill the other commands once one exits.
    #[arg(short, long)]
    kill_others: bool,
    /// Kill the other commands once one fails.
    #[arg(long)]
    kill_others_on_fail: bool,
    /// Signal sent to the other commands.
    #[arg(long)]
    kill_signal: Option<String>,
    /// Milliseconds to wait before sending SIGKILL to commands that survived the kill signal.
    #[arg(long)]
    kill_timeout: Option<u64>,
    /// Restarts per failing command; -1 restarts forever.
    #[arg(long, allow_negative_numbers = true)]
    restart_tries: Option<i64>,
    /// Delay before restarting: milliseconds or "exponential".
    #[arg(long)]
    restart_after: Option<String>,
    /// Forward stdin lines to the commands ("target:text" picks one).
    #[arg(short = 'i', long)]
    handle_input: bool,
    /// Command receiving stdin lines without a target.
    #[arg(long)]
    default_input_target: Option<String>,
    /// Print command output untouched, without prefixes or events.
    #[arg(short, long)]
    raw: bool,
    /// Disable colours.
    #[arg(long)]
    no_color: bool,
    /// Names or indices of commands whose output is hidden, comma separated.
    #[arg(long)]
    hide: Option<String>,
    /// Print the output of each command together, in command order.
    #[arg(short, long)]
    group: bool,
    /// Prefix style (index, pid, time, command, name, none) or a template like "{index}-{pid}".
    #[arg(short, long)]
    prefix: Option<String>,
    /// Comma separated prefix colours; the last one is used for the remaining commands.
    #[arg(short = 'c', long)]
    prefix_colors: Option<String>,
    /// Width of the "command" prefix.
    #[arg(short = 'l', long)]
    prefix_length: Option<usize>,
    /// Pad every prefix to the width of the longest one.
    #[arg(long)]
    pad_prefix: bool,
    /// chrono format of the "time" prefix and timings.
    #[arg(short, long)]
    timestamp_format: Option<String>,
    /// Print start and stop times of every command plus a summary table.
    #[arg(long)]
    timings: bool,
    /// Command run after everything stopped; repeatable.
    #[arg(long)]
    teardown: Vec<String>,
    /// Working directory of every command.
    #[arg(long)]
    cwd: Option<PathBuf>,
    /// Path to corun.toml configuration file.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Ignore any corun.toml in the current directory.
    #[arg(long)]
    no_config: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    initialize_tracing();
    match run_cli(Cli::parse()).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("corun: {:#}", err);
            ExitCode::FAILURE
        }
    }
}

fn initialize_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .with(filter)
        .try_init();
}

async fn run_cli(cli: Cli) -> Result<ExitCode> {
    let (specs, settings) = load_specs(&cli)?;
    debug!(commands = specs.len(), ?settings, "settings resolved");

    let writer = Arc::new(OutputWriter::stdout(settings.group));
    let color = !settings.no_color && std::io::stdout().is_terminal();
    let logger = Arc::new(Logger::new(
        LoggerOptions {
            prefix: settings.prefix.clone(),
            prefix_length: settings.prefix_length,
            timestamp_format: settings.timestamp_format.clone(),
            raw: settings.raw,
            hide: settings.hide.clone(),
            no_color: !color,
        },
        Arc::clone(&writer),
    ));
    let abort = CancellationToken::new();
    let spawner: Arc<dyn Spawner> = Arc::new(ShellSpawner);
    let spawn_options = SpawnOptions {
        cwd: settings.cwd.clone(),
        env: HashMap::new(),
        stdio: if settings.raw {
            StdioMode::Raw
        } else {
            StdioMode::Normal
        },
        force_color: color,
    };

    let signals = Topic::new();
    spawn_signal_listener(signals.clone());

    let mut controllers: Vec<Box<dyn FlowController>> = vec![Box::new(OutputErrorHandler::new(
        Arc::clone(&writer),
        abort.clone(),
    ))];
    if settings.pad_prefix {
        controllers.push(Box::new(LoggerPadding::new(Arc::clone(&logger))));
    }
    controllers.push(Box::new(LogError::new(Arc::clone(&logger))));
    controllers.push(Box::new(LogOutput::new(Arc::clone(&logger))));
    controllers.push(Box::new(LogExit::new(Arc::clone(&logger))));
    if settings.handle_input {
        let (tx, rx) = mpsc::unbounded_channel();
        spawn_stdin_listener(tx);
        controllers.push(Box::new(InputHandler::new(
            Arc::clone(&logger),
            settings.default_input_target.clone(),
            rx,
        )));
    }
    controllers.push(Box::new(KillOnSignal::new(signals, abort.clone())));
    controllers.push(Box::new(RestartProcess::new(
        Arc::clone(&logger),
        settings.restart_tries,
        settings.restart_delay,
        abort.clone(),
    )));
    controllers.push(Box::new(KillOthers::new(
        Arc::clone(&logger),
        settings.kill_conditions.clone(),
        settings.kill_signal,
        settings.kill_timeout,
        abort.clone(),
    )));
    if settings.timings {
        controllers.push(Box::new(LogTimings::new(
            Arc::clone(&logger),
            settings.timestamp_format.clone(),
        )));
    }
    controllers.push(Box::new(Teardown::new(
        Arc::clone(&logger),
        Arc::clone(&spawner),
        spawn_options.clone(),
        settings.teardown.clone(),
    )));

    let mut options = RunOptions::new(spawner, Arc::new(TreeKiller));
    options.spawn_options = spawn_options;
    options.max_processes = settings.max_processes;
    options.success = settings.success.clone();
    options.controllers = controllers;
    options.abort = Some(abort);
    options.prefix_colors = settings.prefix_colors.clone();
    options.hide = settings.hide.clone();
    options.writer = Some(writer);

    let run = orchestrator::run(specs, options)?;
    match run.result.await {
        Ok(_) => Ok(ExitCode::SUCCESS),
        Err(RunError::Failed(_)) => Ok(ExitCode::FAILURE),
        Err(RunError::Finish(err)) => Err(err),
    }
}

/// Forwards every termination signal corun receives to the `signals` topic.
fn spawn_signal_listener(signals: Topic<ProcessSignal>) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let (mut sigint, mut sigterm, mut sighup) = match (
                signal(SignalKind::interrupt()),
                signal(SignalKind::terminate()),
                signal(SignalKind::hangup()),
            ) {
                (Ok(int), Ok(term), Ok(hup)) => (int, term, hup),
                _ => {
                    warn!("unable to install signal handlers");
                    return;
                }
            };
            loop {
                let received = tokio::select! {
                    Some(()) = sigint.recv() => ProcessSignal::SigInt,
                    Some(()) = sigterm.recv() => ProcessSignal::SigTerm,
                    Some(()) = sighup.recv() => ProcessSignal::SigHup,
                    else => return,
                };
                debug!(signal = %received, "signal received");
                signals.emit(received);
            }
        }
        #[cfg(not(unix))]
        {
            while tokio::signal::ctrl_c().await.is_ok() {
                signals.emit(ProcessSignal::SigInt);
            }
        }
    });
}

fn spawn_stdin_listener(tx: mpsc::UnboundedSender<String>) {
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            let Ok(line) = line else { break };
            if tx.send(line).is_err() {
                break;
            }
        }
    });
}

fn default_config_path() -> Option<PathBuf> {
    let path = Path::new(DEFAULT_CONFIG_FILE);
    if path.exists() {
        Some(path.to_path_buf())
    } else {
        None
    }
}

fn load_specs(cli: &Cli) -> Result<(Vec<ProcessSpec>, RunSettings)> {
    let mut config = Config::default();
    let mut base = PathBuf::new();
    if !cli.no_config {
        if let Some(path) = cli.config.clone().or_else(default_config_path) {
            config = config::load_config(&path)?;
            base = path.parent().map(Path::to_path_buf).unwrap_or_default();
        }
    }
    collect_specs(cli, config, &base)
}

/// Combines file and command-line settings; commands from the file come first.
fn collect_specs(cli: &Cli, mut config: Config, base: &Path) -> Result<(Vec<ProcessSpec>, RunSettings)> {
    let mut specs: Vec<ProcessSpec> = std::mem::take(&mut config.commands)
        .into_iter()
        .map(|entry| entry.into_spec(base))
        .collect();
    let names = cli
        .names
        .as_deref()
        .map(|names| split_list(names, &cli.name_separator))
        .unwrap_or_default();
    specs.extend(cli.commands.iter().enumerate().map(|(index, command)| {
        ProcessSpec::named(names.get(index).cloned().unwrap_or_default(), command.clone())
    }));
    let settings = RunSettings::from_cli(cli, config)?;
    Ok((specs, settings))
}

fn split_list(value: &str, separator: &str) -> Vec<String> {
    value
        .split(separator)
        .map(|item| item.trim().to_string())
        .filter(|item| !item.is_empty())
        .collect()
}

fn help_styles() -> Styles {
    Styles::styled()
        .header(
            Style::new()
                .fg_color(Some(AnsiColor::Cyan.into()))
                .effects(Effects::BOLD),
        )
        .usage(
            Style::new()
                .fg_color(Some(AnsiColor::Green.into()))
                .effects(Effects::BOLD),
        )
        .literal(Style::new().fg_color(Some(AnsiColor::Yellow.into())))
        .placeholder(Style::new().fg_color(Some(AnsiColor::Magenta.into())))
        .valid(Style::new().fg_color(Some(AnsiColor::Green.into())))
        .invalid(
            Style::new()
                .fg_color(Some(AnsiColor::Red.into()))
                .effects(Effects::BOLD),
        )
}

/// Runtime configuration derived from CLI arguments and the config file.
#[derive(Debug, Clone)]
struct RunSettings {
    success: SuccessCondition,
    max_processes: ProcessLimit,
    kill_conditions: Vec<KillCondition>,
    kill_signal: ProcessSignal,
    kill_timeout: Option<Duration>,
    restart_tries: i64,
    restart_delay: RestartDelay,
    handle_input: bool,
    default_input_target: String,
    raw: bool,
    no_color: bool,
    hide: Vec<String>,
    group: bool,
    prefix: Option<String>,
    prefix_colors: Vec<String>,
    prefix_length: usize,
    pad_prefix: bool,
    timestamp_format: String,
    timings: bool,
    teardown: Vec<String>,
    cwd: Option<PathBuf>,
}

impl RunSettings {
    fn from_cli(cli: &Cli, config: Config) -> Result<Self> {
        let success = match cli.success.as_deref().or(config.success.as_deref()) {
            Some(value) => value.parse().context("invalid success condition")?,
            None => SuccessCondition::default(),
        };
        let max_processes = match cli.max_processes.as_deref().or(config.max_processes.as_deref()) {
            Some(value) => value.parse().context("invalid max processes")?,
            None => ProcessLimit::default(),
        };
        let mut kill_conditions = Vec::new();
        if cli.kill_others || config.kill_others.unwrap_or(false) {
            kill_conditions.extend([KillCondition::Success, KillCondition::Failure]);
        } else if cli.kill_others_on_fail || config.kill_others_on_fail.unwrap_or(false) {
            kill_conditions.push(KillCondition::Failure);
        }
        let kill_signal = match cli.kill_signal.as_deref().or(config.kill_signal.as_deref()) {
            Some(value) => value.parse().context("invalid kill signal")?,
            None => ProcessSignal::SigTerm,
        };
        let restart_delay = match cli.restart_after.as_deref().or(config.restart_after.as_deref()) {
            Some(value) => value.parse().context("invalid restart delay")?,
            None => RestartDelay::default(),
        };
        let hide = match &cli.hide {
            Some(value) => split_list(value, ","),
            None => config.hide.unwrap_or_default(),
        };
        let prefix_colors = match &cli.prefix_colors {
            Some(value) => split_list(value, ","),
            None => config.prefix_colors.unwrap_or_default(),
        };
        let teardown = if cli.teardown.is_empty() {
            config.teardown.unwrap_or_default()
        } else {
            cli.teardown.clone()
        };
        Ok(Self {
            success,
            max_processes,
            kill_conditions,
            kill_signal,
            kill_timeout: cli
                .kill_timeout
                .or(config.kill_timeout)
                .map(Duration::from_millis),
            restart_tries: cli.restart_tries.or(config.restart_tries).unwrap_or(0),
            restart_delay,
            handle_input: cli.handle_input || config.handle_input.unwrap_or(false),
            default_input_target: cli
                .default_input_target
                .clone()
                .or(config.default_input_target)
                .unwrap_or_else(|| "0".to_string()),
            raw: cli.raw || config.raw.unwrap_or(false),
            no_color: cli.no_color || config.no_color.unwrap_or(false),
            hide,
            group: cli.group || config.group.unwrap_or(false),
            prefix: cli.prefix.clone().or(config.prefix),
            prefix_colors,
            prefix_length: cli
                .prefix_length
                .or(config.prefix_length)
                .unwrap_or(DEFAULT_PREFIX_LENGTH),
            pad_prefix: cli.pad_prefix || config.pad_prefix.unwrap_or(false),
            timestamp_format: cli
                .timestamp_format
                .clone()
                .or(config.timestamp_format)
                .unwrap_or_else(|| DEFAULT_TIMESTAMP_FORMAT.to_string()),
            timings: cli.timings || config.timings.unwrap_or(false),
            teardown,
            cwd: cli.cwd.clone().or(config.cwd),
        })
    }
}
