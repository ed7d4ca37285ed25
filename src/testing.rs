//! Test fixtures: an in-memory spawner/killer and helpers shared by the unit tests.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use chrono::Local;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::{mpsc, oneshot};

use crate::events::{CloseEvent, ExitCode, ProcessSignal, Timings};
use crate::logger::{Logger, LoggerOptions};
use crate::output::OutputWriter;
use crate::process::{Command, ManagedProcess, ProcessSpec};
use crate::spawn::{ExitStatus, Killer, ProcessHandle, SpawnOptions, Spawner};

/// Lets every runnable task make progress. Requires a paused clock.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

/// A colourless logger writing into a buffer.
pub fn test_logger() -> (Arc<Logger>, SharedBuffer) {
    let sink = SharedBuffer::new();
    let writer = Arc::new(OutputWriter::new(Box::new(sink.clone()), false));
    let options = LoggerOptions {
        no_color: true,
        ..LoggerOptions::default()
    };
    (Arc::new(Logger::new(options, writer)), sink)
}

pub fn close_event(index: usize, name: &str, exit_code: ExitCode) -> CloseEvent {
    let now = Local::now();
    CloseEvent {
        command: ProcessSpec::named(name, format!("cmd-{}", index)),
        index,
        killed: false,
        exit_code,
        timings: Timings {
            start_date: now,
            end_date: now,
            duration: Duration::ZERO,
        },
    }
}

struct ChannelReader {
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
    pending: Vec<u8>,
}

impl AsyncRead for ChannelReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.pending.is_empty() {
            match self.rx.poll_recv(cx) {
                Poll::Ready(Some(bytes)) => self.pending = bytes,
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => return Poll::Pending,
            }
        }
        let n = self.pending.len().min(buf.remaining());
        buf.put_slice(&self.pending[..n]);
        self.pending.drain(..n);
        Poll::Ready(Ok(()))
    }
}

struct ChannelWriter {
    tx: mpsc::UnboundedSender<Vec<u8>>,
}

impl AsyncWrite for ChannelWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.tx.send(buf.to_vec()) {
            Ok(()) => Poll::Ready(Ok(buf.len())),
            Err(_) => Poll::Ready(Err(io::ErrorKind::BrokenPipe.into())),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

struct FakeIo {
    stdout: Option<mpsc::UnboundedSender<Vec<u8>>>,
    stderr: Option<mpsc::UnboundedSender<Vec<u8>>>,
    exit: Option<oneshot::Sender<io::Result<ExitStatus>>>,
}

/// The test side of one fake spawn.
#[derive(Clone)]
pub struct FakeProcess {
    pub pid: u32,
    pub command: String,
    io: Arc<Mutex<FakeIo>>,
    stdin: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>>,
}

impl FakeProcess {
    pub fn write_stdout(&self, bytes: &[u8]) {
        if let Some(tx) = &self.io.lock().stdout {
            let _ = tx.send(bytes.to_vec());
        }
    }

    pub fn write_stderr(&self, bytes: &[u8]) {
        if let Some(tx) = &self.io.lock().stderr {
            let _ = tx.send(bytes.to_vec());
        }
    }

    pub fn exit(&self, code: i32) {
        self.finish(Ok(ExitStatus {
            code: Some(code),
            signal: None,
        }));
    }

    pub fn exit_signal(&self, signal: &str) {
        self.finish(Ok(ExitStatus {
            code: None,
            signal: Some(signal.to_string()),
        }));
    }

    pub fn error(&self, message: &str) {
        self.finish(Err(io::Error::other(message.to_string())));
    }

    pub fn is_running(&self) -> bool {
        self.io.lock().exit.is_some()
    }

    pub async fn read_stdin(&self) -> String {
        let bytes = self.stdin.lock().await.recv().await.unwrap_or_default();
        String::from_utf8_lossy(&bytes).to_string()
    }

    fn finish(&self, result: io::Result<ExitStatus>) {
        let mut io = self.io.lock();
        io.stdout = None;
        io.stderr = None;
        if let Some(tx) = io.exit.take() {
            let _ = tx.send(result);
        }
    }
}

#[derive(Default)]
struct FakeState {
    processes: Vec<FakeProcess>,
    kills: Vec<(u32, ProcessSignal)>,
    fail_next: Option<String>,
    exit_on_kill: bool,
}

/// Spawner and killer that never touch the OS.
#[derive(Clone, Default)]
pub struct FakeSpawner {
    state: Arc<Mutex<FakeState>>,
}

impl FakeSpawner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn command(&self, index: usize, spec: ProcessSpec) -> Command {
        Command::new(ManagedProcess::new(
            index,
            spec,
            SpawnOptions::default(),
            Arc::new(self.clone()),
            Arc::new(self.clone()),
        ))
    }

    pub fn commands(&self, lines: &[&str]) -> Vec<Command> {
        lines
            .iter()
            .enumerate()
            .map(|(index, line)| self.command(index, ProcessSpec::new(*line)))
            .collect()
    }

    /// Kills end the fake process with the signal's name, like a real process would.
    pub fn exit_on_kill(&self) {
        self.state.lock().exit_on_kill = true;
    }

    pub fn fail_next_spawn(&self, message: &str) {
        self.state.lock().fail_next = Some(message.to_string());
    }

    pub fn last(&self) -> FakeProcess {
        self.state
            .lock()
            .processes
            .last()
            .cloned()
            .expect("nothing was spawned")
    }

    /// The most recent spawn of `command`.
    pub fn process(&self, command: &str) -> FakeProcess {
        self.state
            .lock()
            .processes
            .iter()
            .rev()
            .find(|p| p.command == command)
            .cloned()
            .unwrap_or_else(|| panic!("{} was never spawned", command))
    }

    pub fn spawned(&self) -> Vec<String> {
        self.state
            .lock()
            .processes
            .iter()
            .map(|p| p.command.clone())
            .collect()
    }

    pub fn running(&self) -> usize {
        self.state
            .lock()
            .processes
            .iter()
            .filter(|p| p.is_running())
            .count()
    }

    pub fn kills(&self) -> Vec<(u32, ProcessSignal)> {
        self.state.lock().kills.clone()
    }
}

impl Spawner for FakeSpawner {
    fn spawn(&self, command_line: &str, _options: &SpawnOptions) -> io::Result<ProcessHandle> {
        let mut state = self.state.lock();
        if let Some(message) = state.fail_next.take() {
            return Err(io::Error::new(io::ErrorKind::NotFound, message));
        }
        let pid = 1000 + state.processes.len() as u32;
        let (stdout_tx, stdout_rx) = mpsc::unbounded_channel();
        let (stderr_tx, stderr_rx) = mpsc::unbounded_channel();
        let (stdin_tx, stdin_rx) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = oneshot::channel();
        state.processes.push(FakeProcess {
            pid,
            command: command_line.to_string(),
            io: Arc::new(Mutex::new(FakeIo {
                stdout: Some(stdout_tx),
                stderr: Some(stderr_tx),
                exit: Some(exit_tx),
            })),
            stdin: Arc::new(tokio::sync::Mutex::new(stdin_rx)),
        });
        Ok(ProcessHandle {
            pid: Some(pid),
            stdin: Some(Box::new(ChannelWriter { tx: stdin_tx })),
            stdout: Some(Box::new(ChannelReader {
                rx: stdout_rx,
                pending: Vec::new(),
            })),
            stderr: Some(Box::new(ChannelReader {
                rx: stderr_rx,
                pending: Vec::new(),
            })),
            exit: exit_rx,
        })
    }
}

impl Killer for FakeSpawner {
    fn kill(&self, pid: u32, signal: ProcessSignal) {
        let target = {
            let mut state = self.state.lock();
            state.kills.push((pid, signal));
            if state.exit_on_kill {
                state.processes.iter().find(|p| p.pid == pid).cloned()
            } else {
                None
            }
        };
        if let Some(process) = target {
            process.exit_signal(signal.label());
        }
    }
}

/// A clonable in-memory sink for output tests.
#[derive(Clone, Default)]
pub struct SharedBuffer {
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl SharedBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.bytes.lock()).to_string()
    }
}

impl std::io::Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.bytes.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// A sink whose writes always fail, e.g. a closed pipe.
pub struct BrokenSink;

impl std::io::Write for BrokenSink {
    fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
        Err(io::ErrorKind::BrokenPipe.into())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
