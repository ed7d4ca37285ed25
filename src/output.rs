//! The combined output sink.
//!
//! Every line corun prints goes through an `OutputWriter`. In group mode the output of
//! a command is held back until every command before it has exited, so each
//! command's output appears as one contiguous block.

use std::io::Write;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::process::Command;
use crate::topic::{merge, Topic};

struct WriterState {
    sink: Box<dyn Write + Send>,
    group: bool,
    buffers: Vec<Vec<u8>>,
    closed: Vec<bool>,
    /// Commands up to this index write straight to the sink.
    active: usize,
}

impl WriterState {
    fn write_sink(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        self.sink.write_all(bytes)?;
        self.sink.flush()
    }

    fn buffer_for(&mut self, index: usize) -> &mut Vec<u8> {
        if self.buffers.len() <= index {
            self.buffers.resize_with(index + 1, Vec::new);
            self.closed.resize(index + 1, false);
        }
        &mut self.buffers[index]
    }

    /// Moves `active` past every closed command, releasing what became live.
    fn advance(&mut self) -> std::io::Result<()> {
        while self.active < self.closed.len() && self.closed[self.active] {
            self.active += 1;
            if self.active < self.buffers.len() {
                let pending = std::mem::take(&mut self.buffers[self.active]);
                if !pending.is_empty() {
                    self.write_sink(&pending)?;
                }
            }
        }
        Ok(())
    }
}

/// Writes text to the combined sink, optionally grouped per command.
pub struct OutputWriter {
    state: Mutex<WriterState>,
    errors: Topic<String>,
}

impl OutputWriter {
    pub fn new(sink: Box<dyn Write + Send>, group: bool) -> Self {
        Self {
            state: Mutex::new(WriterState {
                sink,
                group,
                buffers: Vec::new(),
                closed: Vec::new(),
                active: 0,
            }),
            errors: Topic::new(),
        }
    }

    pub fn stdout(group: bool) -> Self {
        Self::new(Box::new(std::io::stdout()), group)
    }

    /// Write failures of the sink, in order.
    pub fn errors(&self) -> &Topic<String> {
        &self.errors
    }

    /// Writes `text` on behalf of the command at `index`, or globally when `None`.
    pub fn write(&self, index: Option<usize>, text: &str) {
        let result = {
            let mut state = self.state.lock();
            match index {
                Some(index) if state.group && index > state.active => {
                    state.buffer_for(index).extend_from_slice(text.as_bytes());
                    Ok(())
                }
                _ => state.write_sink(text.as_bytes()),
            }
        };
        if let Err(err) = result {
            self.report(err);
        }
    }

    /// Releases buffered output as `commands` close.
    pub fn track(self: &Arc<Self>, commands: &[Command]) {
        if !self.state.lock().group || commands.is_empty() {
            return;
        }
        let topics: Vec<_> = commands.iter().map(|c| c.close().clone()).collect();
        let indices: Vec<usize> = commands.iter().map(Command::index).collect();
        {
            let mut state = self.state.lock();
            if let Some(max) = indices.iter().max() {
                state.buffer_for(*max);
            }
        }
        let mut closes = merge(&topics);
        let writer = Arc::clone(self);
        tokio::spawn(async move {
            while let Some((slot, _)) = closes.recv().await {
                writer.mark_closed(indices[slot]);
            }
        });
    }

    fn mark_closed(&self, index: usize) {
        let result = {
            let mut state = self.state.lock();
            state.buffer_for(index);
            state.closed[index] = true;
            state.advance()
        };
        if let Err(err) = result {
            self.report(err);
        }
    }

    /// Writes out everything still buffered, in command order.
    pub fn flush_remaining(&self) {
        let result = {
            let mut state = self.state.lock();
            let pending: Vec<u8> = state.buffers.iter_mut().flat_map(std::mem::take).collect();
            state.active = state.closed.len();
            if pending.is_empty() {
                Ok(())
            } else {
                state.write_sink(&pending)
            }
        };
        if let Err(err) = result {
            self.report(err);
        }
    }

    fn report(&self, err: std::io::Error) {
        debug!(error = %err, "output write failed");
        self.errors.emit(err.to_string());
    }
}
