//! Teardown commands run one after another once everything has stopped.

use std::sync::Arc;

use anyhow::anyhow;

use super::{FlowController, FlowResult};
use crate::events::{ExitCode, ProcessSignal};
use crate::logger::Logger;
use crate::process::Command;
use crate::spawn::{SpawnOptions, Spawner, StdioMode};

/// Runs cleanup commands one after the other once the run is over.
pub struct Teardown {
    logger: Arc<Logger>,
    spawner: Arc<dyn Spawner>,
    options: SpawnOptions,
    commands: Vec<String>,
}

impl Teardown {
    pub fn new(
        logger: Arc<Logger>,
        spawner: Arc<dyn Spawner>,
        options: SpawnOptions,
        commands: Vec<String>,
    ) -> Self {
        Self {
            logger,
            spawner,
            options: SpawnOptions {
                stdio: StdioMode::Raw,
                ..options
            },
            commands,
        }
    }
}

impl FlowController for Teardown {
    fn handle(&mut self, commands: Vec<Command>) -> FlowResult {
        if self.commands.is_empty() {
            return FlowResult::new(commands);
        }
        let logger = Arc::clone(&self.logger);
        let spawner = Arc::clone(&self.spawner);
        let options = self.options.clone();
        let teardown = self.commands.clone();
        let on_finish = Box::pin(async move {
            for command in &teardown {
                logger.log_global_event(&format!("Running teardown command \"{}\"", command));
                let outcome = match spawner.spawn(command, &options) {
                    Ok(handle) => match handle.exit.await {
                        Ok(result) => result,
                        Err(_) => Err(std::io::Error::other("teardown process handle dropped")),
                    },
                    Err(err) => Err(err),
                };
                match outcome {
                    Ok(status) => {
                        let exit_code = ExitCode::from_parts(status.code, status.signal);
                        logger.log_global_event(&format!(
                            "Teardown command \"{}\" exited with code {}",
                            command, exit_code
                        ));
                        if exit_code.is_signal(ProcessSignal::SigInt) {
                            break;
                        }
                    }
                    Err(err) => {
                        logger.log_global_event(&format!("Teardown command \"{}\" errored:", command));
                        logger.log_global_event(&err.to_string());
                        return Err(anyhow!("teardown command \"{}\" failed: {}", command, err));
                    }
                }
            }
            Ok(())
        });
        FlowResult::with_finish(commands, on_finish)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{settle, test_logger, FakeSpawner};

    fn teardown(spawner: &FakeSpawner, logger: Arc<Logger>, commands: &[&str]) -> Teardown {
        Teardown::new(
            logger,
            Arc::new(spawner.clone()),
            SpawnOptions::default(),
            commands.iter().map(|c| c.to_string()).collect(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn runs_commands_in_sequence_after_the_run() {
        let spawner = FakeSpawner::new();
        let (logger, sink) = test_logger();
        let result = teardown(&spawner, logger, &["stop db", "rm tmp"]).handle(Vec::new());
        assert!(spawner.spawned().is_empty());

        let finish = tokio::spawn(result.on_finish.unwrap());
        settle().await;
        assert_eq!(spawner.spawned(), vec!["stop db"]);
        spawner.last().exit(0);
        settle().await;
        assert_eq!(spawner.spawned(), vec!["stop db", "rm tmp"]);
        spawner.last().exit(3);
        finish.await.unwrap().unwrap();
        assert_eq!(
            sink.contents(),
            "--> Running teardown command \"stop db\"\n\
             --> Teardown command \"stop db\" exited with code 0\n\
             --> Running teardown command \"rm tmp\"\n\
             --> Teardown command \"rm tmp\" exited with code 3\n"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn sigint_stops_the_teardown() {
        let spawner = FakeSpawner::new();
        let (logger, _) = test_logger();
        let result = teardown(&spawner, logger, &["first", "second"]).handle(Vec::new());
        let finish = tokio::spawn(result.on_finish.unwrap());
        settle().await;
        spawner.last().exit_signal("SIGINT");
        finish.await.unwrap().unwrap();
        assert_eq!(spawner.spawned(), vec!["first"]);
    }

    #[tokio::test(start_paused = true)]
    async fn spawn_errors_fail_the_hook() {
        let spawner = FakeSpawner::new();
        spawner.fail_next_spawn("no shell");
        let (logger, sink) = test_logger();
        let result = teardown(&spawner, logger, &["cleanup", "never"]).handle(Vec::new());
        assert!(result.on_finish.unwrap().await.is_err());
        assert!(sink.contents().contains("--> Teardown command \"cleanup\" errored:\n--> no shell\n"));
        assert!(spawner.spawned().is_empty());
    }

    #[test]
    fn nothing_to_do_without_commands() {
        let spawner = FakeSpawner::new();
        let (logger, _) = test_logger();
        assert!(teardown(&spawner, logger, &[]).handle(Vec::new()).on_finish.is_none());
    }
}
