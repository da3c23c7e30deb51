use super::artifacts::{CommandInput, CommandResult};
use crate::artifact::{ArtifactKind, ArtifactStore};
use crate::error::PipelineError;
use crate::sandbox::{Command, ExitClassification, LimitKind};
use crate::step::{BuildContext, BuildStep, StepFlow};
use crate::task_manager::{TaskManager, TimeoutKind, Unit};
use async_trait::async_trait;
use judgekit_common::types::{Problem, TestCase};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, instrument};

/// Extra time the task manager allows past the executor's own deadline,
/// covering process kill and pipe drain.
const UNIT_GRACE: Duration = Duration::from_secs(1);

/// Per-test deadline: test case override, then problem, then config.
pub fn test_deadline(test: &TestCase, problem: Option<&Problem>, default_ms: u64) -> Duration {
    let ms = test
        .timeout_ms
        .or_else(|| problem.and_then(|p| p.test_timeout_ms))
        .unwrap_or(default_ms);
    Duration::from_millis(ms)
}

/// Runs every test command in the sandbox under the task manager.
pub struct ExecuteCommands;

#[async_trait]
impl BuildStep for ExecuteCommands {
    fn id(&self) -> &'static str {
        "execute_commands"
    }

    fn requires(&self) -> Vec<ArtifactKind> {
        vec![
            ArtifactKind::of::<Vec<Command>>(),
            ArtifactKind::of::<Vec<CommandInput>>(),
            ArtifactKind::of::<Vec<TestCase>>(),
        ]
    }

    fn produces(&self) -> Vec<ArtifactKind> {
        vec![ArtifactKind::of::<Vec<CommandResult>>()]
    }

    #[instrument(skip_all, fields(submission_id = %ctx.submission_id))]
    async fn execute(
        &self,
        store: &mut ArtifactStore,
        ctx: &BuildContext,
    ) -> Result<StepFlow, PipelineError> {
        let commands = store.require::<Vec<Command>>(self.id())?;
        let inputs = store.require::<Vec<CommandInput>>(self.id())?;
        let tests = store.require::<Vec<TestCase>>(self.id())?;
        if commands.len() != tests.len() || inputs.len() != tests.len() {
            return Err(PipelineError::step(
                self.id(),
                format!(
                    "{} commands and {} inputs for {} test cases",
                    commands.len(),
                    inputs.len(),
                    tests.len()
                ),
            ));
        }

        let problem = store.get::<Problem>();
        let total_timeout = problem
            .and_then(|p| p.total_timeout_ms)
            .or(ctx.config.total_timeout_ms)
            .map(Duration::from_millis);
        let manager = TaskManager::new(ctx.config.test_concurrency, total_timeout);

        let profiles: Vec<_> = commands.iter().map(|c| c.profile).collect();
        let deadlines: Vec<Duration> = tests
            .iter()
            .map(|t| test_deadline(t, problem, ctx.config.test_timeout_ms))
            .collect();
        let admission = ctx.executor.admission();
        let units = commands
            .iter()
            .zip(inputs)
            .zip(&deadlines)
            .map(|((command, input), &deadline)| {
                let executor = Arc::clone(&ctx.executor);
                let command = command.clone();
                let input = input.0.clone();
                Unit::new(deadline + UNIT_GRACE, async move {
                    let report = executor.run_admitted(&command, &input, deadline).await;
                    CommandResult::from_report(report, command.profile)
                })
                .admitted_by(Arc::clone(&admission))
            })
            .collect();

        let started = Instant::now();
        let results = manager
            .run(
                units,
                |index, kind| match kind {
                    TimeoutKind::Batch { started: false } => CommandResult::not_started(profiles[index]),
                    TimeoutKind::Unit | TimeoutKind::Batch { started: true } => CommandResult::synthesized(
                        ExitClassification::LimitExceeded(LimitKind::WallClock),
                        deadlines[index].as_millis() as u64,
                        profiles[index],
                    ),
                },
                |index, message| {
                    CommandResult::synthesized(
                        ExitClassification::SetupFailure(format!("test execution panicked: {}", message)),
                        0,
                        profiles[index],
                    )
                },
            )
            .await;

        info!(
            tests = results.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "test commands finished"
        );

        store.add(results);
        Ok(StepFlow::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::SandboxProfile;
    use judgekit_common::config::BuilderConfig;
    use judgekit_common::types::ProblemType;

    fn sh(script: &str) -> Command {
        Command::new("/bin/sh", std::env::temp_dir(), SandboxProfile::Native).args(["-c", script])
    }

    #[test]
    fn test_deadline_precedence() {
        let mut test = TestCase::new("t", "", "");
        let mut problem = Problem::new(ProblemType::CProgram, "");
        assert_eq!(test_deadline(&test, Some(&problem), 500), Duration::from_millis(500));

        problem.test_timeout_ms = Some(700);
        assert_eq!(test_deadline(&test, Some(&problem), 500), Duration::from_millis(700));

        test.timeout_ms = Some(900);
        assert_eq!(test_deadline(&test, Some(&problem), 500), Duration::from_millis(900));
    }

    #[tokio::test]
    async fn test_timeout_is_isolated_to_one_test() {
        let ctx = crate::test_support::context();
        let mut store = ArtifactStore::new();
        let mut slow = TestCase::new("slow", "", "");
        slow.timeout_ms = Some(300);
        store.add(vec![TestCase::new("a", "", ""), slow, TestCase::new("c", "", "")]);
        store.add(vec![sh("cat"), sh("while :; do :; done"), sh("echo ok")]);
        store.add(vec![
            CommandInput("hello\n".into()),
            CommandInput::default(),
            CommandInput::default(),
        ]);

        ExecuteCommands.execute(&mut store, &ctx).await.unwrap();

        let results = store.get::<Vec<CommandResult>>().unwrap();
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].classification, ExitClassification::Exited(0));
        assert_eq!(results[0].stdout.text, "hello\n");
        assert_eq!(
            results[1].classification,
            ExitClassification::LimitExceeded(LimitKind::WallClock)
        );
        assert_eq!(results[2].stdout.text, "ok\n");
    }

    #[tokio::test]
    async fn test_batch_timeout_marks_unstarted_commands() {
        let config = BuilderConfig {
            sandbox_enabled: false,
            test_concurrency: 1,
            total_timeout_ms: Some(400),
            ..BuilderConfig::default()
        };
        let ctx = crate::test_support::context_with(config);
        let mut store = ArtifactStore::new();
        store.add(vec![TestCase::new("a", "", ""), TestCase::new("b", "", "")]);
        store.add(vec![sh("sleep 5"), sh("echo never")]);
        store.add(vec![CommandInput::default(), CommandInput::default()]);

        ExecuteCommands.execute(&mut store, &ctx).await.unwrap();

        let results = store.get::<Vec<CommandResult>>().unwrap();
        assert_eq!(
            results[0].classification,
            ExitClassification::LimitExceeded(LimitKind::WallClock)
        );
        assert!(!results[0].not_started);
        assert!(results[1].not_started);
    }

    #[tokio::test]
    async fn test_waiting_for_a_sandbox_does_not_time_out() {
        let config = BuilderConfig {
            sandbox_enabled: false,
            test_concurrency: 2,
            max_sandboxes: Some(1),
            test_timeout_ms: 3000,
            ..BuilderConfig::default()
        };
        let ctx = crate::test_support::context_with(config);
        let mut store = ArtifactStore::new();
        store.add(vec![TestCase::new("a", "", ""), TestCase::new("b", "", "")]);
        store.add(vec![sh("sleep 2.5; echo ok"), sh("sleep 2.5; echo ok")]);
        store.add(vec![CommandInput::default(), CommandInput::default()]);

        ExecuteCommands.execute(&mut store, &ctx).await.unwrap();

        let results = store.get::<Vec<CommandResult>>().unwrap();
        for result in results {
            assert_eq!(result.classification, ExitClassification::Exited(0));
            assert_eq!(result.stdout.text, "ok\n");
        }
        assert_eq!(ctx.executor.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_mismatched_lengths_are_rejected() {
        let ctx = crate::test_support::context();
        let mut store = ArtifactStore::new();
        store.add(vec![TestCase::new("a", "", "")]);
        store.add(Vec::<Command>::new());
        store.add(Vec::<CommandInput>::new());

        let err = ExecuteCommands.execute(&mut store, &ctx).await.unwrap_err();

        assert!(matches!(err, PipelineError::Step { step: "execute_commands", .. }));
    }
}
