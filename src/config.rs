//! Configuration management for corun.
//!
//! This module defines the structure of the `corun.toml` configuration file
//! and provides functionality to load and parse it. Every setting is optional;
//! command-line flags take precedence over the file.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::process::ProcessSpec;

/// Top-level configuration structure corresponding to `corun.toml`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Success condition ("all", "first", "last", "command-{name|index}", "!command-...").
    pub success: Option<String>,
    /// How many commands may run at once: a count or a percentage of CPUs ("50%").
    pub max_processes: Option<String>,
    /// Kill the other commands once one exits successfully.
    pub kill_others: Option<bool>,
    /// Kill the other commands once one fails.
    pub kill_others_on_fail: Option<bool>,
    /// Signal sent to the other commands ("SIGTERM", "SIGINT", ...).
    pub kill_signal: Option<String>,
    /// Milliseconds after which survivors of kill-others get SIGKILL.
    pub kill_timeout: Option<u64>,
    /// Restarts per failing command; negative means unlimited.
    pub restart_tries: Option<i64>,
    /// Delay before restarting: milliseconds or "exponential".
    pub restart_after: Option<String>,
    /// Forward stdin lines to commands.
    pub handle_input: Option<bool>,
    /// Command receiving stdin lines without a target.
    pub default_input_target: Option<String>,
    /// Pass command output through untouched.
    pub raw: Option<bool>,
    pub no_color: Option<bool>,
    /// Names or indices of commands whose output is hidden.
    pub hide: Option<Vec<String>>,
    /// Keep each command's output together, in command order.
    pub group: Option<bool>,
    /// Prefix style or template (e.g. "[{name}]").
    pub prefix: Option<String>,
    pub prefix_colors: Option<Vec<String>>,
    pub prefix_length: Option<usize>,
    pub pad_prefix: Option<bool>,
    pub timestamp_format: Option<String>,
    /// Print start/stop times and a summary table.
    pub timings: Option<bool>,
    /// Commands run one after the other once everything has stopped.
    pub teardown: Option<Vec<String>>,
    /// Working directory for every command.
    pub cwd: Option<PathBuf>,
    /// Commands to run, before any given on the command line.
    #[serde(default, rename = "command")]
    pub commands: Vec<CommandConfig>,
}

/// Configuration for a single command.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CommandConfig {
    /// Display name of the command.
    pub name: Option<String>,
    /// Command line executed through the shell.
    pub command: String,
    /// Working directory for the command.
    pub cwd: Option<PathBuf>,
    /// Prefix colour override.
    pub color: Option<String>,
    /// Environment variables to set for the command.
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl CommandConfig {
    /// Converts the entry into a spec, resolving a relative `cwd` against `base`.
    pub fn into_spec(self, base: &Path) -> ProcessSpec {
        let mut spec = ProcessSpec::named(self.name.unwrap_or_default(), self.command);
        spec.cwd = self.cwd.map(|cwd| base.join(cwd));
        spec.color = self.color;
        spec.env = self.env;
        spec
    }
}

/// Loads and parses the configuration from a file path.
pub fn load_config(path: &Path) -> Result<Config> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let config: Config = toml::from_str(&raw)
        .with_context(|| format!("failed to parse config file {}", path.display()))?;
    Ok(config)
}
