//! Prefixing and colouring of everything corun prints.

use std::sync::Arc;

use chrono::Local;
use parking_lot::Mutex;

use crate::output::OutputWriter;
use crate::process::Command;

pub const DEFAULT_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";
pub const DEFAULT_PREFIX_LENGTH: usize = 10;

/// Colours handed out, in order, for `auto` prefix colours.
pub const AUTO_COLORS: [&str; 8] = [
    "cyan", "yellow", "green", "magenta", "blue", "red", "white", "gray",
];

/// Presentation settings of a [`Logger`].
#[derive(Debug, Clone)]
pub struct LoggerOptions {
    /// `index`, `pid`, `time`, `command`, `name`, `none` or a template.
    pub prefix: Option<String>,
    /// Maximum width of the `command` prefix.
    pub prefix_length: usize,
    pub timestamp_format: String,
    /// Pass command output through untouched.
    pub raw: bool,
    /// Names or indices of commands whose output is suppressed.
    pub hide: Vec<String>,
    pub no_color: bool,
}

impl Default for LoggerOptions {
    fn default() -> Self {
        Self {
            prefix: None,
            prefix_length: DEFAULT_PREFIX_LENGTH,
            timestamp_format: DEFAULT_TIMESTAMP_FORMAT.to_string(),
            raw: false,
            hide: Vec::new(),
            no_color: false,
        }
    }
}

#[derive(Debug, Default)]
struct LastWrite {
    index: Option<usize>,
    ended_line: bool,
}

#[derive(Debug, Default)]
struct LoggerState {
    last: Option<LastWrite>,
    padding: usize,
}

/// Turns command output and events into prefixed lines on an [`OutputWriter`].
pub struct Logger {
    options: LoggerOptions,
    writer: Arc<OutputWriter>,
    state: Mutex<LoggerState>,
}

impl Logger {
    pub fn new(options: LoggerOptions, writer: Arc<OutputWriter>) -> Self {
        Self {
            options,
            writer,
            state: Mutex::new(LoggerState::default()),
        }
    }

    pub fn is_hidden(&self, command: &Command) -> bool {
        self.options.hide.iter().any(|hide| command.matches(hide))
    }

    /// Pads every prefix to at least `length` characters.
    pub fn set_prefix_length(&self, length: usize) {
        self.state.lock().padding = length;
    }

    /// The unpadded, uncoloured prefix text, or `None` for the `none` style.
    pub fn prefix_content(&self, command: &Command) -> Option<String> {
        let style = match &self.options.prefix {
            Some(style) => style.as_str(),
            None if command.name().is_empty() => "index",
            None => "name",
        };
        let pid = command.pid().map(|pid| pid.to_string()).unwrap_or_default();
        let time = Local::now()
            .format(&self.options.timestamp_format)
            .to_string();
        let shortened = shorten(command.command_line(), self.options.prefix_length);
        let index = command.index().to_string();
        let value = match style {
            "none" => return None,
            "index" => index,
            "pid" => pid,
            "time" => time,
            "command" => shortened,
            "name" => command.name().to_string(),
            template => {
                return Some(
                    template
                        .replace("{index}", &index)
                        .replace("{pid}", &pid)
                        .replace("{time}", &time)
                        .replace("{command}", &shortened)
                        .replace("{name}", command.name()),
                )
            }
        };
        Some(format!("[{}]", value))
    }

    fn prefix(&self, command: &Command) -> String {
        let Some(content) = self.prefix_content(command) else {
            return String::new();
        };
        let padding = self.state.lock().padding;
        let padded = if content.chars().count() < padding {
            let mut padded = content;
            // Pad inside the brackets of the default styles.
            let closing = padded.ends_with(']') && padded.starts_with('[');
            if closing {
                padded.pop();
            }
            let width = padding - padded.chars().count() - usize::from(closing);
            padded.push_str(&" ".repeat(width));
            if closing {
                padded.push(']');
            }
            padded
        } else {
            content
        };
        if self.options.no_color {
            padded
        } else {
            colorize(&padded, command.spec().color.as_deref())
        }
    }

    /// Logs a chunk of a command's output.
    pub fn log_command_text(&self, text: &str, command: &Command) {
        if self.is_hidden(command) {
            return;
        }
        if self.options.raw {
            self.emit(Some(command.index()), text);
            return;
        }
        let prefix = self.prefix(command);
        let prefix = if prefix.is_empty() {
            prefix
        } else {
            format!("{} ", prefix)
        };
        self.log(&prefix, text, Some(command.index()));
    }

    /// Logs a line about a command, such as its exit.
    pub fn log_command_event(&self, text: &str, command: &Command) {
        if self.options.raw || self.is_hidden(command) {
            return;
        }
        self.log_command_text(&format!("{}\n", text), command);
    }

    /// Logs a line that belongs to no command.
    pub fn log_global_event(&self, text: &str) {
        if self.options.raw {
            return;
        }
        let arrow = if self.options.no_color {
            "-->".to_string()
        } else {
            colorize("-->", Some("gray"))
        };
        self.log(&format!("{} ", arrow), &format!("{}\n", text), None);
    }

    /// Logs a table as a series of global events.
    pub fn log_table(&self, headers: &[&str], rows: &[Vec<String>]) {
        if self.options.raw || rows.is_empty() {
            return;
        }
        for line in render_table(headers, rows) {
            self.log_global_event(&line);
        }
    }

    fn log(&self, prefix: &str, text: &str, index: Option<usize>) {
        let mut output = String::new();
        let mut line_break = None;
        {
            let mut state = self.state.lock();
            let continues_line = match &state.last {
                Some(last) if !last.ended_line => {
                    if last.index != index {
                        // Another source is mid-line, finish its line first.
                        line_break = Some(last.index);
                        false
                    } else {
                        true
                    }
                }
                _ => false,
            };

            let lines: Vec<&str> = text.split('\n').collect();
            let count = lines.len();
            for (position, line) in lines.into_iter().enumerate() {
                if position > 0 {
                    output.push('\n');
                }
                let skip_prefix = (position == 0 && continues_line)
                    || (position == count - 1 && line.is_empty());
                if !skip_prefix {
                    output.push_str(prefix);
                }
                output.push_str(line);
            }
            state.last = Some(LastWrite {
                index,
                ended_line: text.ends_with('\n'),
            });
            if let Some(previous) = line_break {
                self.emit(previous, "\n");
            }
            self.emit(index, &output);
        }
    }

    fn emit(&self, index: Option<usize>, text: &str) {
        self.writer.write(index, text);
    }
}

/// Shortens `text` to `length` characters by replacing its middle with `..`.
fn shorten(text: &str, length: usize) -> String {
    let chars: Vec<char> = text.chars().collect();
    if chars.len() <= length {
        return text.to_string();
    }
    let kept = length.saturating_sub(2);
    let end = kept / 2;
    let beginning = kept - end;
    let mut out: String = chars[..beginning].iter().collect();
    out.push_str("..");
    out.extend(&chars[chars.len() - end..]);
    out
}

fn color_code(name: &str) -> Option<String> {
    let code = match name.to_lowercase().as_str() {
        "black" => "30",
        "red" => "31",
        "green" => "32",
        "yellow" => "33",
        "blue" => "34",
        "magenta" => "35",
        "cyan" => "36",
        "white" => "37",
        "gray" | "grey" => "90",
        "redbright" => "91",
        "greenbright" => "92",
        "yellowbright" => "93",
        "bluebright" => "94",
        "magentabright" => "95",
        "cyanbright" => "96",
        "whitebright" => "97",
        "bgblack" => "40",
        "bgred" => "41",
        "bggreen" => "42",
        "bgyellow" => "43",
        "bgblue" => "44",
        "bgmagenta" => "45",
        "bgcyan" => "46",
        "bgwhite" => "47",
        "bold" => "1",
        "dim" => "2",
        "italic" => "3",
        "underline" => "4",
        "inverse" => "7",
        hex if hex.starts_with('#') && hex.len() == 7 && hex.is_ascii() => {
            let channel = |range: std::ops::Range<usize>| u8::from_str_radix(&hex[range], 16).ok();
            let (r, g, b) = (channel(1..3)?, channel(3..5)?, channel(5..7)?);
            return Some(format!("38;2;{};{};{}", r, g, b));
        }
        _ => return None,
    };
    Some(code.to_string())
}

/// Wraps `text` in the ANSI codes of a colour spec such as `red` or `bgBlue.bold`.
pub fn colorize(text: &str, color: Option<&str>) -> String {
    let codes: Vec<String> = color
        .unwrap_or("")
        .split('.')
        .filter_map(color_code)
        .collect();
    if codes.is_empty() {
        text.to_string()
    } else {
        format!("\u{1b}[{}m{}\u{1b}[0m", codes.join(";"), text)
    }
}

fn render_table(headers: &[&str], rows: &[Vec<String>]) -> Vec<String> {
    let mut widths: Vec<usize> = headers.iter().map(|h| h.chars().count()).collect();
    for row in rows {
        for (column, cell) in row.iter().enumerate() {
            if let Some(width) = widths.get_mut(column) {
                *width = (*width).max(cell.chars().count());
            }
        }
    }
    let border = |left: &str, mid: &str, right: &str| {
        let bars: Vec<String> = widths.iter().map(|w| "─".repeat(w + 2)).collect();
        format!("{}{}{}", left, bars.join(mid), right)
    };
    let row_line = |cells: Vec<&str>| {
        let padded: Vec<String> = cells
            .iter()
            .zip(&widths)
            .map(|(cell, width)| format!(" {}{} ", cell, " ".repeat(width - cell.chars().count())))
            .collect();
        format!("│{}│", padded.join("│"))
    };

    let mut lines = vec![border("┌", "┬", "┐"), row_line(headers.to_vec())];
    lines.push(border("├", "┼", "┤"));
    for row in rows {
        lines.push(row_line(row.iter().map(String::as_str).collect()));
    }
    lines.push(border("└", "┴", "┘"));
    lines
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::ProcessSpec;
    use crate::testing::{FakeSpawner, SharedBuffer};

    fn make_logger(options: LoggerOptions) -> (Logger, SharedBuffer) {
        let sink = SharedBuffer::new();
        let writer = Arc::new(OutputWriter::new(Box::new(sink.clone()), false));
        (Logger::new(options, writer), sink)
    }

    fn plain() -> LoggerOptions {
        LoggerOptions {
            no_color: true,
            ..LoggerOptions::default()
        }
    }

    #[test]
    fn default_prefix_is_name_or_index() {
        let spawner = FakeSpawner::new();
        let named = spawner.command(0, ProcessSpec::named("api", "run api"));
        let unnamed = spawner.command(1, ProcessSpec::new("run web"));
        let (logger, sink) = make_logger(plain());
        logger.log_command_text("up\n", &named);
        logger.log_command_text("up\n", &unnamed);
        assert_eq!(sink.contents(), "[api] up\n[1] up\n");
    }

    #[test]
    fn templates_and_command_style() {
        let spawner = FakeSpawner::new();
        let command = spawner.command(2, ProcessSpec::named("db", "postgres -D /var/lib/pg"));
        let (logger, _) = make_logger(LoggerOptions {
            prefix: Some("{index}-{name}".into()),
            ..plain()
        });
        assert_eq!(logger.prefix_content(&command).as_deref(), Some("2-db"));

        let (logger, _) = make_logger(LoggerOptions {
            prefix: Some("command".into()),
            ..plain()
        });
        assert_eq!(logger.prefix_content(&command).as_deref(), Some("[post..b/pg]"));

        let (logger, _) = make_logger(LoggerOptions {
            prefix: Some("none".into()),
            ..plain()
        });
        assert_eq!(logger.prefix_content(&command), None);
    }

    #[test]
    fn shorten_keeps_both_ends() {
        assert_eq!(shorten("short", 10), "short");
        assert_eq!(shorten("abcdefghijkl", 6), "ab..kl");
        assert_eq!(shorten("abcdefghijkl", 7), "abc..kl");
    }

    #[test]
    fn partial_lines_are_broken_when_another_command_writes() {
        let spawner = FakeSpawner::new();
        let a = spawner.command(0, ProcessSpec::named("a", "a"));
        let b = spawner.command(1, ProcessSpec::named("b", "b"));
        let (logger, sink) = make_logger(plain());
        logger.log_command_text("foo", &a);
        logger.log_command_text("bar\n", &a);
        logger.log_command_text("half", &b);
        logger.log_command_text("one\ntwo\n", &a);
        assert_eq!(sink.contents(), "[a] foobar\n[b] half\n[a] one\n[a] two\n");
    }

    #[test]
    fn events_are_suppressed_in_raw_mode_and_for_hidden_commands() {
        let spawner = FakeSpawner::new();
        let a = spawner.command(0, ProcessSpec::named("a", "a"));
        let b = spawner.command(1, ProcessSpec::named("b", "b"));
        let (logger, sink) = make_logger(LoggerOptions {
            hide: vec!["1".into()],
            ..plain()
        });
        logger.log_command_event("a exited with code 0", &a);
        logger.log_command_text("secret\n", &b);
        logger.log_global_event("done");
        assert_eq!(sink.contents(), "[a] a exited with code 0\n--> done\n");

        let (logger, sink) = make_logger(LoggerOptions { raw: true, ..plain() });
        logger.log_command_text("raw text", &a);
        logger.log_command_event("a exited with code 0", &a);
        logger.log_global_event("ignored");
        assert_eq!(sink.contents(), "raw text");
    }

    #[test]
    fn padding_applies_inside_brackets() {
        let spawner = FakeSpawner::new();
        let a = spawner.command(0, ProcessSpec::named("a", "a"));
        let (logger, sink) = make_logger(plain());
        logger.set_prefix_length(5);
        logger.log_command_text("x\n", &a);
        assert_eq!(sink.contents(), "[a  ] x\n");
    }

    #[test]
    fn colors_compose_and_unknown_names_are_ignored() {
        assert_eq!(colorize("p", Some("red")), "\u{1b}[31mp\u{1b}[0m");
        assert_eq!(colorize("p", Some("bgBlue.bold")), "\u{1b}[44;1mp\u{1b}[0m");
        assert_eq!(colorize("p", Some("#ff0000")), "\u{1b}[38;2;255;0;0mp\u{1b}[0m");
        assert_eq!(colorize("p", Some("reset")), "p");
        assert_eq!(colorize("p", None), "p");
    }

    #[test]
    fn multibyte_hex_colors_are_ignored() {
        assert_eq!(color_code("#aé123"), None);
        assert_eq!(colorize("p", Some("#aé123")), "p");
    }

    #[test]
    fn tables_use_box_drawing() {
        let lines = render_table(&["name", "code"], &[vec!["api".into(), "0".into()]]);
        assert_eq!(
            lines,
            vec![
                "┌──────┬──────┐",
                "│ name │ code │",
                "├──────┼──────┤",
                "│ api  │ 0    │",
                "└──────┴──────┘",
            ]
        );
    }
}
