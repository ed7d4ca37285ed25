//! Concurrency-limited start queue.

use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;

use anyhow::{anyhow, Error};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::process::Command;
use crate::topic::merge;

/// How many processes may run at the same time.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum ProcessLimit {
    #[default]
    Unbounded,
    Count(usize),
    /// Percentage of the available CPU cores.
    Percent(f64),
}

impl ProcessLimit {
    /// Number of processes allowed to run at once out of `total`. Never below 1.
    pub fn resolve(&self, total: usize) -> usize {
        self.resolve_with_cpus(total, num_cpus::get())
    }

    fn resolve_with_cpus(&self, total: usize, cpus: usize) -> usize {
        let limit = match *self {
            ProcessLimit::Unbounded => total,
            ProcessLimit::Count(0) => total,
            ProcessLimit::Count(count) => count,
            ProcessLimit::Percent(percent) => (cpus as f64 * percent / 100.0).round() as usize,
        };
        limit.max(1)
    }
}

impl FromStr for ProcessLimit {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let value = value.trim();
        if value.is_empty() {
            return Ok(ProcessLimit::Unbounded);
        }
        if let Some(percent) = value.strip_suffix('%') {
            let percent: f64 = percent
                .trim()
                .parse()
                .map_err(|_| anyhow!("invalid max processes: {}", value))?;
            if !percent.is_finite() || percent < 0.0 {
                return Err(anyhow!("invalid max processes: {}", value));
            }
            return Ok(ProcessLimit::Percent(percent));
        }
        let count: i64 = value
            .parse()
            .map_err(|_| anyhow!("invalid max processes: {}", value))?;
        if count <= 0 {
            Ok(ProcessLimit::Unbounded)
        } else {
            Ok(ProcessLimit::Count(count as usize))
        }
    }
}

impl fmt::Display for ProcessLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessLimit::Unbounded => f.write_str("unbounded"),
            ProcessLimit::Count(count) => write!(f, "{}", count),
            ProcessLimit::Percent(percent) => write!(f, "{}%", percent),
        }
    }
}

/// Starts commands in index order, never more than the limit at once.
pub struct Scheduler {
    commands: Vec<Command>,
    limit: ProcessLimit,
    abort: CancellationToken,
}

impl Scheduler {
    pub fn new(commands: Vec<Command>, limit: ProcessLimit, abort: Option<CancellationToken>) -> Self {
        Self {
            commands,
            limit,
            abort: abort.unwrap_or_default(),
        }
    }

    /// Starts the first batch right away.
    ///
    /// Each close of a running command starts the next queued one, unless the abort
    /// token was cancelled. Returns the backfill task when something was queued.
    pub fn start(self) -> Option<JoinHandle<()>> {
        let limit = self.limit.resolve(self.commands.len());
        let closes: Vec<_> = self.commands.iter().map(|c| c.close().clone()).collect();
        let mut queue: VecDeque<Command> = self.commands.into();
        let closed = (queue.len() > limit).then(|| merge(&closes));

        for _ in 0..limit {
            if self.abort.is_cancelled() {
                break;
            }
            match queue.pop_front() {
                Some(command) => command.start(),
                None => break,
            }
        }
        debug!(limit, queued = queue.len(), "scheduler started initial batch");

        let mut closed = closed?;
        if queue.is_empty() {
            return None;
        }
        let abort = self.abort;
        Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = abort.cancelled() => {
                        debug!(queued = queue.len(), "scheduler aborted");
                        break;
                    }
                    event = closed.recv() => {
                        if event.is_none() {
                            break;
                        }
                        if abort.is_cancelled() {
                            break;
                        }
                        let Some(next) = queue.pop_front() else { break };
                        debug!(index = next.index(), "starting queued command");
                        next.start();
                        if queue.is_empty() {
                            break;
                        }
                    }
                }
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{settle, FakeSpawner};

    #[test]
    fn parses_limits() {
        assert_eq!("".parse::<ProcessLimit>().unwrap(), ProcessLimit::Unbounded);
        assert_eq!("0".parse::<ProcessLimit>().unwrap(), ProcessLimit::Unbounded);
        assert_eq!("-1".parse::<ProcessLimit>().unwrap(), ProcessLimit::Unbounded);
        assert_eq!("3".parse::<ProcessLimit>().unwrap(), ProcessLimit::Count(3));
        assert_eq!("50%".parse::<ProcessLimit>().unwrap(), ProcessLimit::Percent(50.0));
        assert!("lots".parse::<ProcessLimit>().is_err());
        assert!("x%".parse::<ProcessLimit>().is_err());
    }

    #[test]
    fn resolves_percent_of_cores_with_floor_of_one() {
        assert_eq!(ProcessLimit::Percent(50.0).resolve_with_cpus(10, 8), 4);
        assert_eq!(ProcessLimit::Percent(30.0).resolve_with_cpus(10, 5), 2);
        assert_eq!(ProcessLimit::Percent(1.0).resolve_with_cpus(10, 4), 1);
        assert_eq!(ProcessLimit::Unbounded.resolve_with_cpus(5, 4), 5);
        assert_eq!(ProcessLimit::Unbounded.resolve_with_cpus(0, 4), 1);
        assert_eq!(ProcessLimit::Count(2).resolve_with_cpus(5, 4), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn unbounded_starts_everything() {
        let spawner = FakeSpawner::new();
        let commands = spawner.commands(&["a", "b", "c"]);
        assert!(Scheduler::new(commands, ProcessLimit::Unbounded, None)
            .start()
            .is_none());
        assert_eq!(spawner.spawned(), vec!["a", "b", "c"]);
    }

    #[tokio::test(start_paused = true)]
    async fn backfills_in_index_order_as_slots_free_up() {
        let spawner = FakeSpawner::new();
        let commands = spawner.commands(&["a", "b", "c", "d"]);
        Scheduler::new(commands, ProcessLimit::Count(2), None).start();
        assert_eq!(spawner.spawned(), vec!["a", "b"]);

        spawner.process("b").exit(0);
        settle().await;
        assert_eq!(spawner.spawned(), vec!["a", "b", "c"]);
        assert_eq!(spawner.running(), 2);

        spawner.process("a").exit(1);
        settle().await;
        assert_eq!(spawner.spawned(), vec!["a", "b", "c", "d"]);
        assert_eq!(spawner.running(), 2);

        spawner.process("c").exit(0);
        spawner.process("d").exit(0);
        settle().await;
        assert_eq!(spawner.spawned().len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn abort_stops_further_starts() {
        let spawner = FakeSpawner::new();
        let commands = spawner.commands(&["a", "b", "c"]);
        let abort = CancellationToken::new();
        let task = Scheduler::new(commands, ProcessLimit::Count(1), Some(abort.clone()))
            .start()
            .unwrap();
        abort.cancel();
        spawner.process("a").exit(0);
        settle().await;
        assert_eq!(spawner.spawned(), vec!["a"]);
        assert!(task.is_finished());
    }

    #[tokio::test(start_paused = true)]
    async fn pre_cancelled_abort_starts_nothing() {
        let spawner = FakeSpawner::new();
        let commands = spawner.commands(&["a", "b"]);
        let abort = CancellationToken::new();
        abort.cancel();
        Scheduler::new(commands, ProcessLimit::Count(1), Some(abort)).start();
        assert!(spawner.spawned().is_empty());
    }
}
