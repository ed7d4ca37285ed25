//! Managed processes and their wrappable views.
//!
//! `ManagedProcess` owns one command's lifecycle: it spawns the OS process through a
//! [`Spawner`], forwards output chunks onto multicast topics and emits a
//! [`CloseEvent`] when the process ends. Behaviors never hold a `ManagedProcess`
//! directly; they receive [`Command`] views, which can substitute the close stream
//! while sharing everything else with the process they wrap.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::Instant;

use chrono::Local;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::events::{CloseEvent, ExitCode, ProcessSignal, TimerEvent, Timings};
use crate::spawn::{BoxedReader, BoxedWriter, Killer, SpawnOptions, Spawner};
use crate::topic::Topic;

const READ_CHUNK: usize = 8 * 1024;

/// Specification for a command to be run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessSpec {
    /// Friendly name, possibly empty and not necessarily unique.
    pub name: String,
    /// The literal command line.
    pub command: String,
    /// Working directory.
    pub cwd: Option<PathBuf>,
    /// Extra environment variables.
    pub env: HashMap<String, String>,
    /// Color to use for the prefix of this command's lines.
    pub color: Option<String>,
}

impl ProcessSpec {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Self::default()
        }
    }

    pub fn named(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            ..Self::default()
        }
    }
}

/// Lifecycle state of a managed process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// Never started.
    Stopped,
    /// Currently running.
    Started,
    /// Failed to spawn or failed while running; no close event follows.
    Errored,
    /// Produced an exit code or terminating signal.
    Exited,
}

/// Error reported on a process's error stream.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct SpawnError {
    pub message: String,
}

#[derive(Debug)]
struct Runtime {
    state: ProcessState,
    pid: Option<u32>,
    alive: bool,
    killed: bool,
    stdin: Option<mpsc::UnboundedSender<Vec<u8>>>,
    generation: u64,
}

/// One command and its OS process.
pub struct ManagedProcess {
    index: usize,
    spec: ProcessSpec,
    spawn_options: SpawnOptions,
    spawner: Arc<dyn Spawner>,
    killer: Arc<dyn Killer>,
    runtime: Mutex<Runtime>,
    stdout: Topic<Vec<u8>>,
    stderr: Topic<Vec<u8>>,
    errors: Topic<SpawnError>,
    close: Topic<CloseEvent>,
    timer: Topic<TimerEvent>,
}

impl fmt::Debug for ManagedProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedProcess")
            .field("index", &self.index)
            .field("spec", &self.spec)
            .field("runtime", &*self.runtime.lock())
            .finish()
    }
}

impl ManagedProcess {
    pub fn new(
        index: usize,
        spec: ProcessSpec,
        spawn_options: SpawnOptions,
        spawner: Arc<dyn Spawner>,
        killer: Arc<dyn Killer>,
    ) -> Arc<Self> {
        Arc::new(Self {
            index,
            spec,
            spawn_options,
            spawner,
            killer,
            runtime: Mutex::new(Runtime {
                state: ProcessState::Stopped,
                pid: None,
                alive: false,
                killed: false,
                stdin: None,
                generation: 0,
            }),
            stdout: Topic::new(),
            stderr: Topic::new(),
            errors: Topic::new(),
            close: Topic::new(),
            timer: Topic::new(),
        })
    }

    /// Spawns the OS process.
    ///
    /// Output chunks are forwarded onto the stdout/stderr topics. The close event of
    /// a spawn is emitted after both output streams reached end of file.
    pub fn start(self: &Arc<Self>) {
        let start_date = Local::now();
        let started_at = Instant::now();
        let generation = {
            let mut runtime = self.runtime.lock();
            runtime.generation += 1;
            runtime.state = ProcessState::Started;
            runtime.killed = false;
            runtime.generation
        };
        self.timer.emit(TimerEvent {
            start_date,
            end_date: None,
        });

        let handle = match self.spawner.spawn(&self.spec.command, &self.spawn_options) {
            Ok(handle) => handle,
            Err(err) => {
                debug!(index = self.index, error = %err, "spawn failed");
                self.fail(generation, start_date, err.to_string());
                return;
            }
        };

        let stdin = handle.stdin.map(spawn_stdin_writer);
        {
            let mut runtime = self.runtime.lock();
            runtime.pid = handle.pid;
            runtime.alive = true;
            runtime.stdin = stdin;
        }

        let readers: Vec<JoinHandle<()>> = [
            handle.stdout.map(|out| spawn_reader(out, self.stdout.clone())),
            handle.stderr.map(|err| spawn_reader(err, self.stderr.clone())),
        ]
        .into_iter()
        .flatten()
        .collect();

        let process = Arc::clone(self);
        let exit = handle.exit;
        tokio::spawn(async move {
            let outcome = exit.await;
            for reader in readers {
                let _ = reader.await;
            }
            match outcome {
                Ok(Ok(status)) => {
                    let exit_code = ExitCode::from_parts(status.code, status.signal);
                    process.exit(generation, start_date, started_at, exit_code);
                }
                Ok(Err(err)) => process.fail(generation, start_date, err.to_string()),
                Err(_) => process.fail(
                    generation,
                    start_date,
                    "process handle dropped before exiting".to_string(),
                ),
            }
        });
    }

    fn exit(
        &self,
        generation: u64,
        start_date: chrono::DateTime<Local>,
        started_at: Instant,
        exit_code: ExitCode,
    ) {
        let killed = {
            let mut runtime = self.runtime.lock();
            if runtime.generation != generation {
                warn!(index = self.index, "ignoring close of an outdated spawn");
                return;
            }
            runtime.alive = false;
            runtime.stdin = None;
            if runtime.state != ProcessState::Errored {
                runtime.state = ProcessState::Exited;
            }
            runtime.killed
        };
        let end_date = Local::now();
        self.timer.emit(TimerEvent {
            start_date,
            end_date: Some(end_date),
        });
        self.close.emit(CloseEvent {
            command: self.spec.clone(),
            index: self.index,
            killed,
            exit_code,
            timings: Timings {
                start_date,
                end_date,
                duration: started_at.elapsed(),
            },
        });
    }

    fn fail(&self, generation: u64, start_date: chrono::DateTime<Local>, message: String) {
        {
            let mut runtime = self.runtime.lock();
            if runtime.generation != generation {
                return;
            }
            runtime.alive = false;
            runtime.stdin = None;
            runtime.state = ProcessState::Errored;
        }
        self.timer.emit(TimerEvent {
            start_date,
            end_date: Some(Local::now()),
        });
        self.errors.emit(SpawnError { message });
    }

    /// Requests termination of the live process, marking it as killed by corun.
    ///
    /// Does nothing when there is no live process.
    pub fn kill(&self, signal: Option<ProcessSignal>) {
        let pid = {
            let mut runtime = self.runtime.lock();
            match runtime.pid {
                Some(pid) if runtime.alive => {
                    runtime.killed = true;
                    pid
                }
                _ => return,
            }
        };
        self.killer
            .kill(pid, signal.unwrap_or(ProcessSignal::SigTerm));
    }

    /// Whether the process has both a pid and a live handle.
    pub fn can_kill(&self) -> bool {
        let runtime = self.runtime.lock();
        runtime.alive && runtime.pid.is_some()
    }

    /// Queues bytes for the process's stdin. Returns `false` without an open stdin.
    pub fn write_stdin(&self, bytes: Vec<u8>) -> bool {
        let runtime = self.runtime.lock();
        match &runtime.stdin {
            Some(tx) => tx.send(bytes).is_ok(),
            None => false,
        }
    }

    pub fn has_stdin(&self) -> bool {
        self.runtime
            .lock()
            .stdin
            .as_ref()
            .is_some_and(|tx| !tx.is_closed())
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn spec(&self) -> &ProcessSpec {
        &self.spec
    }

    pub fn state(&self) -> ProcessState {
        self.runtime.lock().state
    }

    pub fn pid(&self) -> Option<u32> {
        self.runtime.lock().pid
    }

    pub fn killed(&self) -> bool {
        self.runtime.lock().killed
    }
}

fn spawn_reader(mut reader: BoxedReader, topic: Topic<Vec<u8>>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut buffer = vec![0u8; READ_CHUNK];
        loop {
            match reader.read(&mut buffer).await {
                Ok(0) | Err(_) => break,
                Ok(n) => topic.emit(buffer[..n].to_vec()),
            }
        }
    })
}

fn spawn_stdin_writer(mut writer: BoxedWriter) -> mpsc::UnboundedSender<Vec<u8>> {
    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
    tokio::spawn(async move {
        while let Some(bytes) = rx.recv().await {
            if writer.write_all(&bytes).await.is_err() || writer.flush().await.is_err() {
                break;
            }
        }
    });
    tx
}

/// A view of a managed process as seen by one stage of the behavior pipeline.
///
/// Everything but the close stream is forwarded to the underlying process.
#[derive(Clone)]
pub struct Command {
    process: Arc<ManagedProcess>,
    close: Topic<CloseEvent>,
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command")
            .field("index", &self.index())
            .field("name", &self.name())
            .field("command", &self.command_line())
            .finish()
    }
}

impl Command {
    pub fn new(process: Arc<ManagedProcess>) -> Self {
        let close = process.close.clone();
        Self { process, close }
    }

    /// A new view of the same process whose close stream is `close`.
    pub fn with_close(&self, close: Topic<CloseEvent>) -> Self {
        Self {
            process: Arc::clone(&self.process),
            close,
        }
    }

    pub fn process(&self) -> &Arc<ManagedProcess> {
        &self.process
    }

    pub fn index(&self) -> usize {
        self.process.index()
    }

    pub fn name(&self) -> &str {
        &self.process.spec().name
    }

    pub fn command_line(&self) -> &str {
        &self.process.spec().command
    }

    pub fn spec(&self) -> &ProcessSpec {
        self.process.spec()
    }

    pub fn pid(&self) -> Option<u32> {
        self.process.pid()
    }

    pub fn state(&self) -> ProcessState {
        self.process.state()
    }

    pub fn start(&self) {
        self.process.start();
    }

    pub fn kill(&self, signal: Option<ProcessSignal>) {
        self.process.kill(signal);
    }

    pub fn can_kill(&self) -> bool {
        self.process.can_kill()
    }

    pub fn write_stdin(&self, bytes: Vec<u8>) -> bool {
        self.process.write_stdin(bytes)
    }

    pub fn has_stdin(&self) -> bool {
        self.process.has_stdin()
    }

    pub fn close(&self) -> &Topic<CloseEvent> {
        &self.close
    }

    pub fn stdout(&self) -> &Topic<Vec<u8>> {
        &self.process.stdout
    }

    pub fn stderr(&self) -> &Topic<Vec<u8>> {
        &self.process.stderr
    }

    pub fn errors(&self) -> &Topic<SpawnError> {
        &self.process.errors
    }

    pub fn timer(&self) -> &Topic<TimerEvent> {
        &self.process.timer
    }

    /// Whether `name_or_index` identifies this command.
    pub fn matches(&self, name_or_index: &str) -> bool {
        self.name() == name_or_index || self.index().to_string() == name_or_index
    }

    /// A handle for observers stored on the process's own topics.
    pub fn downgrade(&self) -> WeakCommand {
        WeakCommand(Arc::downgrade(&self.process))
    }
}

/// A [`Command`] reference that does not keep its process alive.
#[derive(Debug, Clone)]
pub struct WeakCommand(Weak<ManagedProcess>);

impl WeakCommand {
    /// The upgraded view carries the process's own close stream.
    pub fn upgrade(&self) -> Option<Command> {
        self.0.upgrade().map(Command::new)
    }
}
