//! Start and stop times per command, and a summary table once the run settles.

use std::sync::Arc;

use chrono::{DateTime, Local};
use parking_lot::Mutex;

use super::{FlowController, FlowResult};
use crate::events::{CloseEvent, TimerEvent};
use crate::logger::Logger;
use crate::process::Command;

/// Logs when each command started and stopped, and a summary table at the end.
pub struct LogTimings {
    logger: Arc<Logger>,
    timestamp_format: String,
}

impl LogTimings {
    pub fn new(logger: Arc<Logger>, timestamp_format: impl Into<String>) -> Self {
        Self {
            logger,
            timestamp_format: timestamp_format.into(),
        }
    }
}

fn elapsed_ms(start: DateTime<Local>, end: DateTime<Local>) -> i64 {
    (end - start).num_milliseconds()
}

/// Formats a millisecond count with thousands separators, e.g. `12,345`.
fn format_ms(ms: i64) -> String {
    let digits = ms.unsigned_abs().to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3 + 1);
    if ms < 0 {
        out.push('-');
    }
    for (position, digit) in digits.chars().enumerate() {
        if position > 0 && (digits.len() - position) % 3 == 0 {
            out.push(',');
        }
        out.push(digit);
    }
    out
}

fn timing_rows(mut events: Vec<CloseEvent>) -> Vec<Vec<String>> {
    events.sort_by(|a, b| b.timings.duration.cmp(&a.timings.duration));
    events
        .into_iter()
        .map(|event| {
            vec![
                event.command.name.clone(),
                format_ms(elapsed_ms(event.timings.start_date, event.timings.end_date)),
                event.exit_code.to_string(),
                event.killed.to_string(),
                event.command.command.clone(),
            ]
        })
        .collect()
}

impl FlowController for LogTimings {
    fn handle(&mut self, commands: Vec<Command>) -> FlowResult {
        let closed = Arc::new(Mutex::new(Vec::new()));
        for command in &commands {
            let logger = Arc::clone(&self.logger);
            let format = self.timestamp_format.clone();
            let weak = command.downgrade();
            command.timer().tap(move |event: &TimerEvent| {
                let Some(command) = weak.upgrade() else { return };
                let text = match event.end_date {
                    None => format!(
                        "{} started at {}",
                        command.command_line(),
                        event.start_date.format(&format)
                    ),
                    Some(end_date) => format!(
                        "{} stopped at {} after {}ms",
                        command.command_line(),
                        end_date.format(&format),
                        format_ms(elapsed_ms(event.start_date, end_date))
                    ),
                };
                logger.log_command_event(&text, &command);
            });

            let closed = Arc::clone(&closed);
            command
                .close()
                .tap(move |event: &CloseEvent| closed.lock().push(event.clone()));
        }

        let logger = Arc::clone(&self.logger);
        let expected = commands.len();
        let on_finish = Box::pin(async move {
            let mut events = std::mem::take(&mut *closed.lock());
            if events.len() >= expected {
                events.truncate(expected);
                logger.log_global_event("Timings:");
                logger.log_table(
                    &["name", "duration", "exit code", "killed", "command"],
                    &timing_rows(events),
                );
            }
            Ok::<(), anyhow::Error>(())
        });
        FlowResult::with_finish(commands, on_finish)
    }
}
