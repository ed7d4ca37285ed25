//! Deciding when a run is over and whether it succeeded.

use std::fmt;
use std::future::Future;
use std::str::FromStr;

use anyhow::{anyhow, Error};
use regex::Regex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::events::CloseEvent;
use crate::process::{Command, ProcessState};
use crate::topic::merge;

/// Which commands must exit with code 0 for the run to succeed.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SuccessCondition {
    /// The first specified command.
    First,
    /// The last specified command.
    Last,
    #[default]
    All,
    /// `command-{name|index}`, or every other command when negated (`!command-...`).
    Command { target: String, negate: bool },
}

impl FromStr for SuccessCondition {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "first" => return Ok(SuccessCondition::First),
            "last" => return Ok(SuccessCondition::Last),
            "all" => return Ok(SuccessCondition::All),
            _ => {}
        }
        let pattern = Regex::new(r"^(!)?command-(.+)$")?;
        let captures = pattern
            .captures(value)
            .ok_or_else(|| anyhow!("invalid success condition: {}", value))?;
        Ok(SuccessCondition::Command {
            target: captures[2].to_string(),
            negate: captures.get(1).is_some(),
        })
    }
}

impl fmt::Display for SuccessCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SuccessCondition::First => f.write_str("first"),
            SuccessCondition::Last => f.write_str("last"),
            SuccessCondition::All => f.write_str("all"),
            SuccessCondition::Command { target, negate } => {
                if *negate {
                    f.write_str("!")?;
                }
                write!(f, "command-{}", target)
            }
        }
    }
}

impl SuccessCondition {
    /// Evaluates the condition over the final close events of a run.
    pub fn is_success(&self, events: &[CloseEvent]) -> bool {
        match self {
            SuccessCondition::All => events.iter().all(|e| e.exit_code.is_success()),
            SuccessCondition::First => events
                .iter()
                .min_by_key(|e| e.index)
                .map_or(true, |e| e.exit_code.is_success()),
            SuccessCondition::Last => events
                .iter()
                .max_by_key(|e| e.index)
                .map_or(true, |e| e.exit_code.is_success()),
            SuccessCondition::Command { target, negate } => {
                let matches = |e: &CloseEvent| {
                    e.command.name == *target || e.index.to_string() == *target
                };
                if *negate {
                    !events.iter().any(|e| matches(e))
                        || events
                            .iter()
                            .all(|e| matches(e) || e.exit_code.is_success())
                } else {
                    let mut targeted = events.iter().filter(|e| matches(e)).peekable();
                    targeted.peek().is_some() && targeted.all(|e| e.exit_code.is_success())
                }
            }
        }
    }
}

/// The run finished but the success condition was not met.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("success condition not met by {} close events", events.len())]
pub struct RunFailure {
    /// Close events sorted by end date.
    pub events: Vec<CloseEvent>,
}

/// Waits for every command to finish and applies the success condition.
#[derive(Debug, Clone, Default)]
pub struct CompletionListener {
    condition: SuccessCondition,
}

impl CompletionListener {
    pub fn new(condition: SuccessCondition) -> Self {
        Self { condition }
    }

    /// Returns a future resolving once every command has reported its latest close.
    ///
    /// Subscriptions are taken before this returns, so the listener must be set up
    /// before the commands start. After `abort` is cancelled, commands that never
    /// started are left out of the result. Commands that did start are still waited
    /// for.
    pub fn listen(
        &self,
        commands: &[Command],
        abort: Option<CancellationToken>,
    ) -> impl Future<Output = Result<Vec<CloseEvent>, RunFailure>> + Send + 'static {
        let condition = self.condition.clone();
        let commands = commands.to_vec();
        let topics: Vec<_> = commands.iter().map(|c| c.close().clone()).collect();
        let mut closes = merge(&topics);
        let abort = abort.unwrap_or_default();

        async move {
            let mut latest: Vec<Option<CloseEvent>> = vec![None; commands.len()];
            let mut absent = vec![false; commands.len()];
            let mut aborted = false;

            while !is_settled(&commands, &latest, &absent) {
                tokio::select! {
                    biased;
                    _ = abort.cancelled(), if !aborted => {
                        aborted = true;
                        for (slot, command) in commands.iter().enumerate() {
                            if latest[slot].is_none() && command.state() == ProcessState::Stopped {
                                absent[slot] = true;
                            }
                        }
                        debug!(
                            absent = absent.iter().filter(|a| **a).count(),
                            "completion aborted"
                        );
                    }
                    event = closes.recv() => match event {
                        Some((slot, event)) if !absent[slot] => latest[slot] = Some(event),
                        Some(_) => {}
                        None => break,
                    }
                }
            }

            let events = sorted_events(latest);
            debug!(%condition, events = events.len(), "run settled");
            if condition.is_success(&events) {
                Ok(events)
            } else {
                Err(RunFailure { events })
            }
        }
    }
}

fn is_settled(commands: &[Command], latest: &[Option<CloseEvent>], absent: &[bool]) -> bool {
    let resolved = latest
        .iter()
        .zip(absent)
        .all(|(event, absent)| event.is_some() || *absent);
    resolved
        && commands
            .iter()
            .all(|command| command.state() != ProcessState::Started)
}

fn sorted_events(latest: Vec<Option<CloseEvent>>) -> Vec<CloseEvent> {
    let mut events: Vec<CloseEvent> = latest.into_iter().flatten().collect();
    events.sort_by_key(|event| event.timings.end_date);
    events
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::ExitCode;
    use crate::testing::{close_event, settle, FakeSpawner};

    fn codes(codes: &[i32]) -> Vec<CloseEvent> {
        codes
            .iter()
            .enumerate()
            .map(|(index, code)| close_event(index, &format!("p{}", index), ExitCode::Code(*code)))
            .collect()
    }

    fn condition(value: &str) -> SuccessCondition {
        value.parse().unwrap()
    }

    #[test]
    fn parses_conditions() {
        assert_eq!(condition("all"), SuccessCondition::All);
        assert_eq!(
            condition("!command-api"),
            SuccessCondition::Command {
                target: "api".into(),
                negate: true
            }
        );
        assert_eq!(condition("command-2").to_string(), "command-2");
        assert!("some".parse::<SuccessCondition>().is_err());
        assert!("command-".parse::<SuccessCondition>().is_err());
    }

    #[test]
    fn all_requires_every_code_to_be_zero() {
        assert!(condition("all").is_success(&codes(&[0, 0])));
        assert!(!condition("all").is_success(&codes(&[0, 1])));
        let mut events = codes(&[0]);
        events.push(close_event(1, "b", ExitCode::Signal("SIGTERM".into())));
        assert!(!condition("all").is_success(&events));
    }

    #[test]
    fn first_and_last_use_specified_order_not_finish_order() {
        let mut events = codes(&[1, 0, 0]);
        events.reverse();
        assert!(!condition("first").is_success(&events));
        assert!(condition("last").is_success(&events));

        let events = codes(&[0, 0, 1]);
        assert!(condition("first").is_success(&events));
        assert!(!condition("last").is_success(&events));
    }

    #[test]
    fn command_condition_by_index_and_negation() {
        let events = codes(&[1, 0, 1]);
        assert!(condition("command-1").is_success(&events));
        assert!(!condition("!command-1").is_success(&events));
        assert!(condition("!command-0").is_success(&codes(&[1, 0, 0])));
    }

    #[test]
    fn command_condition_by_name_requires_all_matches() {
        let mut events = codes(&[0, 0]);
        events[0].command.name = "web".into();
        events[1].command.name = "web".into();
        assert!(condition("command-web").is_success(&events));
        events[1].exit_code = ExitCode::Code(2);
        assert!(!condition("command-web").is_success(&events));
    }

    #[test]
    fn zero_matches() {
        assert!(!condition("command-nope").is_success(&codes(&[0, 0])));
        assert!(!condition("command-nope").is_success(&[]));
        assert!(condition("!command-nope").is_success(&codes(&[0, 0])));
        assert!(condition("!command-nope").is_success(&[]));
        assert!(condition("!command-nope").is_success(&codes(&[1, 0])));
    }

    #[test]
    fn events_are_sorted_by_end_date_stably() {
        let mut events = codes(&[0, 0, 0]);
        let base = events[0].timings.end_date;
        events[0].timings.end_date = base + chrono::Duration::milliseconds(20);
        events[1].timings.end_date = base + chrono::Duration::milliseconds(10);
        events[2].timings.end_date = base + chrono::Duration::milliseconds(20);
        let sorted = sorted_events(events.into_iter().map(Some).collect());
        let order: Vec<usize> = sorted.iter().map(|e| e.index).collect();
        assert_eq!(order, vec![1, 0, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn resolves_once_every_command_closed() {
        let spawner = FakeSpawner::new();
        let commands = spawner.commands(&["echo foo", "echo bar"]);
        let result = tokio::spawn(CompletionListener::default().listen(&commands, None));
        for command in &commands {
            command.start();
        }
        spawner.process("echo foo").exit(0);
        settle().await;
        assert!(!result.is_finished());

        spawner.process("echo bar").exit(0);
        let events = result.await.unwrap().unwrap();
        assert_eq!(events.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn rejects_with_the_events_on_failure() {
        let spawner = FakeSpawner::new();
        let commands = spawner.commands(&["echo foo", "exit 1"]);
        let result = tokio::spawn(CompletionListener::default().listen(&commands, None));
        commands.iter().for_each(Command::start);
        spawner.process("exit 1").exit(1);
        spawner.process("echo foo").exit(0);
        let failure = result.await.unwrap().unwrap_err();
        assert_eq!(failure.events.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn only_the_latest_close_of_a_restarted_command_counts() {
        let spawner = FakeSpawner::new();
        let commands = spawner.commands(&["flaky", "steady"]);
        let result = tokio::spawn(CompletionListener::default().listen(&commands, None));
        commands.iter().for_each(Command::start);

        spawner.process("flaky").exit(1);
        settle().await;
        commands[0].start();
        spawner.process("steady").exit(0);
        settle().await;
        assert!(!result.is_finished());

        spawner.process("flaky").exit(0);
        let events = result.await.unwrap().unwrap();
        assert!(events.iter().all(|e| e.exit_code.is_success()));
    }

    #[tokio::test(start_paused = true)]
    async fn abort_drops_commands_that_never_started() {
        let spawner = FakeSpawner::new();
        let commands = spawner.commands(&["a", "b"]);
        let abort = CancellationToken::new();
        let result = tokio::spawn(
            CompletionListener::new(condition("command-1")).listen(&commands, Some(abort.clone())),
        );
        commands[0].start();
        abort.cancel();
        settle().await;
        assert!(!result.is_finished());

        spawner.process("a").exit(0);
        let failure = result.await.unwrap().unwrap_err();
        assert_eq!(failure.events.len(), 1);
        assert_eq!(failure.events[0].index, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn late_closes_of_absent_commands_are_ignored() {
        let spawner = FakeSpawner::new();
        let commands = spawner.commands(&["a", "b"]);
        let abort = CancellationToken::new();
        let result =
            tokio::spawn(CompletionListener::default().listen(&commands, Some(abort.clone())));
        commands[0].start();
        abort.cancel();
        spawner.process("a").exit(0);
        let events = result.await.unwrap().unwrap();
        assert_eq!(events.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_command_list_resolves_immediately() {
        let events = CompletionListener::default().listen(&[], None).await.unwrap();
        assert!(events.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn errored_command_keeps_the_listener_waiting() {
        let spawner = FakeSpawner::new();
        spawner.fail_next_spawn("not found");
        let commands = spawner.commands(&["missing"]);
        let result = tokio::spawn(CompletionListener::default().listen(&commands, None));
        commands[0].start();
        settle().await;
        assert_eq!(commands[0].state(), ProcessState::Errored);
        assert!(!result.is_finished());
    }
}
