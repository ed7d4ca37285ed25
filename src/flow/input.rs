//! Stdin routing: `target:payload` lines go to the named or indexed command.

use std::sync::Arc;

use regex::Regex;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{abort_on_finish, FlowController, FlowResult};
use crate::logger::Logger;
use crate::process::Command;

/// Routes lines of input to the stdin of commands.
///
/// A line `target:payload` goes to the command named or indexed `target`, and is
/// reported without being forwarded when no such command exists. Lines without a
/// prefix go to the default target, as do lines where the colon is doubled
/// (`1::x`) or the prefix looks like code. A leading `:` sends the rest of the line
/// to the default target.
pub struct InputHandler {
    logger: Arc<Logger>,
    default_target: String,
    input: Option<mpsc::UnboundedReceiver<String>>,
}

impl InputHandler {
    pub fn new(
        logger: Arc<Logger>,
        default_target: impl Into<String>,
        input: mpsc::UnboundedReceiver<String>,
    ) -> Self {
        Self {
            logger,
            default_target: default_target.into(),
            input: Some(input),
        }
    }
}

/// A `target:` prefix: no whitespace or code punctuation, with a payload that does not
/// start with another colon.
const TARGET_PATTERN: &str = r#"(?s)^\s*([^\s:(){}\[\]<>=,;"'`]+):(.+)$"#;

/// Splits a line into an explicit target, if any, and the text to forward.
fn route<'a>(pattern: &Regex, line: &'a str) -> (Option<&'a str>, &'a str) {
    if let Some(rest) = line.strip_prefix(':') {
        return (None, rest);
    }
    let Some(captures) = pattern.captures(line) else {
        return (None, line);
    };
    match (captures.get(1), captures.get(2)) {
        (Some(target), Some(payload)) if !payload.as_str().starts_with(':') => {
            (Some(target.as_str()), payload.as_str())
        }
        _ => (None, line),
    }
}

impl FlowController for InputHandler {
    fn handle(&mut self, commands: Vec<Command>) -> FlowResult {
        let Some(mut input) = self.input.take() else {
            return FlowResult::new(commands);
        };
        let pattern = match Regex::new(TARGET_PATTERN) {
            Ok(pattern) => pattern,
            Err(err) => {
                warn!(error = %err, "input routing disabled");
                return FlowResult::new(commands);
            }
        };
        let logger = Arc::clone(&self.logger);
        let default_target = self.default_target.clone();
        let targets = commands.clone();
        let task = tokio::spawn(async move {
            while let Some(line) = input.recv().await {
                let (target, payload) = route(&pattern, &line);
                let target = target.unwrap_or(default_target.as_str());
                let delivered = targets
                    .iter()
                    .find(|c| c.matches(target))
                    .is_some_and(|c| c.has_stdin() && c.write_stdin(format!("{}\n", payload).into_bytes()));
                if delivered {
                    debug!(%target, "forwarded input");
                } else {
                    logger.log_global_event(&format!(
                        "Unable to find command {}, or it has no stdin open",
                        target
                    ));
                }
            }
        });
        FlowResult::with_finish(commands, abort_on_finish(vec![task]))
    }
}
