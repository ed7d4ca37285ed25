//! Spawn and kill capabilities.
//!
//! The orchestration core never touches `tokio::process` directly: it asks a
//! [`Spawner`] for a [`ProcessHandle`] and a [`Killer`] to terminate a process tree.
//! [`ShellSpawner`] and [`TreeKiller`] are the real implementations used by the binary.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::Command as ShellCommand;
use tokio::sync::oneshot;
use tracing::debug;

use crate::events::ProcessSignal;

/// How the standard streams of a spawned process are wired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StdioMode {
    /// stdin, stdout and stderr are piped to corun.
    #[default]
    Normal,
    /// stdin is piped, output is discarded.
    Hidden,
    /// All streams are inherited from corun.
    Raw,
}

/// Options passed to the spawner for every start of a process.
#[derive(Debug, Clone, Default)]
pub struct SpawnOptions {
    pub cwd: Option<PathBuf>,
    pub env: HashMap<String, String>,
    pub stdio: StdioMode,
    /// Ask children to keep colouring their output even though it is piped.
    pub force_color: bool,
}

/// Raw close notification of a process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitStatus {
    pub code: Option<i32>,
    pub signal: Option<String>,
}

impl From<std::process::ExitStatus> for ExitStatus {
    fn from(status: std::process::ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal().map(signal_name)
        };
        #[cfg(not(unix))]
        let signal = None;
        Self {
            code: status.code(),
            signal,
        }
    }
}

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// A freshly spawned process.
///
/// `exit` resolves once with the close notification, or with an error when the
/// process failed asynchronously.
pub struct ProcessHandle {
    pub pid: Option<u32>,
    pub stdin: Option<BoxedWriter>,
    pub stdout: Option<BoxedReader>,
    pub stderr: Option<BoxedReader>,
    pub exit: oneshot::Receiver<io::Result<ExitStatus>>,
}

impl fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("pid", &self.pid)
            .field("stdin", &self.stdin.is_some())
            .field("stdout", &self.stdout.is_some())
            .field("stderr", &self.stderr.is_some())
            .finish()
    }
}

/// Spawns a command line.
pub trait Spawner: Send + Sync {
    fn spawn(&self, command_line: &str, options: &SpawnOptions) -> io::Result<ProcessHandle>;
}

/// Terminates the process tree rooted at `pid`.
pub trait Killer: Send + Sync {
    fn kill(&self, pid: u32, signal: ProcessSignal);
}

/// Runs command lines through `/bin/sh -c` (or `cmd.exe /s /c` on Windows).
#[derive(Debug, Clone, Copy, Default)]
pub struct ShellSpawner;

impl Spawner for ShellSpawner {
    fn spawn(&self, command_line: &str, options: &SpawnOptions) -> io::Result<ProcessHandle> {
        let mut command = shell_command(command_line);
        if let Some(cwd) = &options.cwd {
            command.current_dir(cwd);
        }
        if options.force_color {
            command.env("FORCE_COLOR", "1");
        }
        if !options.env.is_empty() {
            command.envs(&options.env);
        }
        match options.stdio {
            StdioMode::Normal => {
                command
                    .stdin(Stdio::piped())
                    .stdout(Stdio::piped())
                    .stderr(Stdio::piped());
            }
            StdioMode::Hidden => {
                command
                    .stdin(Stdio::piped())
                    .stdout(Stdio::null())
                    .stderr(Stdio::null());
            }
            StdioMode::Raw => {
                command
                    .stdin(Stdio::inherit())
                    .stdout(Stdio::inherit())
                    .stderr(Stdio::inherit());
            }
        }

        // Own process group, so the whole tree can be signalled at once. Raw commands
        // stay in the terminal's group to keep reading from it.
        #[cfg(unix)]
        if options.stdio != StdioMode::Raw {
            unsafe {
                command.pre_exec(|| {
                    let _ = libc::setpgid(0, 0);
                    Ok(())
                });
            }
        }

        #[cfg(windows)]
        {
            const CREATE_NEW_PROCESS_GROUP: u32 = 0x00000200;
            command.creation_flags(CREATE_NEW_PROCESS_GROUP);
        }

        let mut child = command.spawn()?;
        let pid = child.id();
        debug!(?pid, command = command_line, "spawned");

        let stdin = child.stdin.take().map(|s| Box::new(s) as BoxedWriter);
        let stdout = child.stdout.take().map(|s| Box::new(s) as BoxedReader);
        let stderr = child.stderr.take().map(|s| Box::new(s) as BoxedReader);

        let (exit_tx, exit) = oneshot::channel();
        tokio::spawn(async move {
            let status = child.wait().await.map(ExitStatus::from);
            let _ = exit_tx.send(status);
        });

        Ok(ProcessHandle {
            pid,
            stdin,
            stdout,
            stderr,
            exit,
        })
    }
}

fn shell_command(command_line: &str) -> ShellCommand {
    #[cfg(windows)]
    {
        let mut command = ShellCommand::new("cmd.exe");
        command.raw_arg(format!("/s /c \"{}\"", command_line));
        command
    }
    #[cfg(not(windows))]
    {
        let mut command = ShellCommand::new("/bin/sh");
        command.arg("-c").arg(command_line);
        command
    }
}

/// Kills a process and everything it spawned.
#[derive(Debug, Clone, Copy, Default)]
pub struct TreeKiller;

impl Killer for TreeKiller {
    fn kill(&self, pid: u32, signal: ProcessSignal) {
        debug!(pid, %signal, "sending signal");
        send_os_signal(pid, signal);
    }
}

#[cfg(unix)]
fn send_os_signal(pid: u32, signal: ProcessSignal) {
    let sig = match signal {
        ProcessSignal::SigInt => libc::SIGINT,
        ProcessSignal::SigTerm => libc::SIGTERM,
        ProcessSignal::SigHup => libc::SIGHUP,
        ProcessSignal::SigKill => libc::SIGKILL,
    };
    let pid = pid as i32;
    unsafe {
        let _ = libc::kill(-pid, sig);
        let _ = libc::kill(pid, sig);
    }
}

#[cfg(windows)]
fn send_os_signal(pid: u32, signal: ProcessSignal) {
    use windows_sys::Win32::System::Console::GenerateConsoleCtrlEvent;
    use windows_sys::Win32::System::Console::CTRL_BREAK_EVENT;
    if signal == ProcessSignal::SigInt {
        // CTRL_BREAK is the closest console signal to SIGINT.
        unsafe {
            let _ = GenerateConsoleCtrlEvent(CTRL_BREAK_EVENT, pid);
        }
        return;
    }
    let _ = std::process::Command::new("taskkill")
        .args(["/pid", &pid.to_string(), "/T", "/F"])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
}

#[cfg(all(not(unix), not(windows)))]
fn send_os_signal(_pid: u32, _signal: ProcessSignal) {}

#[cfg(unix)]
fn signal_name(signal: i32) -> String {
    let name = match signal {
        libc::SIGHUP => "SIGHUP",
        libc::SIGINT => "SIGINT",
        libc::SIGQUIT => "SIGQUIT",
        libc::SIGILL => "SIGILL",
        libc::SIGABRT => "SIGABRT",
        libc::SIGFPE => "SIGFPE",
        libc::SIGKILL => "SIGKILL",
        libc::SIGSEGV => "SIGSEGV",
        libc::SIGPIPE => "SIGPIPE",
        libc::SIGALRM => "SIGALRM",
        libc::SIGTERM => "SIGTERM",
        libc::SIGUSR1 => "SIGUSR1",
        libc::SIGUSR2 => "SIGUSR2",
        _ => return format!("SIG{}", signal),
    };
    name.to_string()
}
