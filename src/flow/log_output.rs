//! Output logging: every stdout and stderr chunk goes through the logger.

use std::sync::Arc;

use parking_lot::Mutex;

use super::{FlowController, FlowResult};
use crate::logger::Logger;
use crate::process::Command;

/// Logs everything commands write to stdout and stderr.
///
/// Chunks are logged on the reader task that emits them, so everything a command
/// printed is in the output before its close event goes out.
pub struct LogOutput {
    logger: Arc<Logger>,
}

impl LogOutput {
    pub fn new(logger: Arc<Logger>) -> Self {
        Self { logger }
    }
}

/// Decodes UTF-8 across chunk boundaries.
#[derive(Debug, Default)]
struct TextDecoder {
    pending: Vec<u8>,
}

impl TextDecoder {
    fn decode(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        match std::str::from_utf8(&self.pending) {
            Ok(text) => {
                let text = text.to_string();
                self.pending.clear();
                text
            }
            // An incomplete character at the end waits for the next chunk.
            Err(err) if err.error_len().is_none() => {
                let valid = err.valid_up_to();
                let text = String::from_utf8_lossy(&self.pending[..valid]).to_string();
                self.pending.drain(..valid);
                text
            }
            Err(_) => {
                let text = String::from_utf8_lossy(&self.pending).to_string();
                self.pending.clear();
                text
            }
        }
    }
}

impl FlowController for LogOutput {
    fn handle(&mut self, commands: Vec<Command>) -> FlowResult {
        for command in &commands {
            for stream in [command.stdout(), command.stderr()] {
                let logger = Arc::clone(&self.logger);
                let weak = command.downgrade();
                let decoder = Mutex::new(TextDecoder::default());
                stream.tap(move |bytes: &Vec<u8>| {
                    let text = decoder.lock().decode(bytes);
                    if text.is_empty() {
                        return;
                    }
                    if let Some(command) = weak.upgrade() {
                        logger.log_command_text(&text, &command);
                    }
                });
            }
        }
        FlowResult::new(commands)
    }
}
