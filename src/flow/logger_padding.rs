//! Prefix padding to the widest prefix among the commands.

use std::sync::Arc;

use super::{abort_on_finish, FlowController, FlowResult};
use crate::logger::Logger;
use crate::process::Command;
use crate::topic::merge;

/// Pads every prefix to the width of the longest one.
///
/// Prefixes containing a pid only get their final width once the process starts, so
/// the width is measured again on every start.
pub struct LoggerPadding {
    logger: Arc<Logger>,
}

impl LoggerPadding {
    pub fn new(logger: Arc<Logger>) -> Self {
        Self { logger }
    }
}

fn prefix_width(logger: &Logger, command: &Command) -> usize {
    logger
        .prefix_content(command)
        .map(|content| content.chars().count())
        .unwrap_or(0)
}

impl FlowController for LoggerPadding {
    fn handle(&mut self, commands: Vec<Command>) -> FlowResult {
        let mut width = commands
            .iter()
            .map(|command| prefix_width(&self.logger, command))
            .max()
            .unwrap_or(0);
        self.logger.set_prefix_length(width);

        let timers: Vec<_> = commands.iter().map(|c| c.timer().clone()).collect();
        let mut starts = merge(&timers);
        let logger = Arc::clone(&self.logger);
        let targets = commands.clone();
        let task = tokio::spawn(async move {
            while let Some((slot, event)) = starts.recv().await {
                if event.end_date.is_some() {
                    continue;
                }
                width = width.max(prefix_width(&logger, &targets[slot]));
                logger.set_prefix_length(width);
            }
        });
        FlowResult::with_finish(commands, abort_on_finish(vec![task]))
    }
}
