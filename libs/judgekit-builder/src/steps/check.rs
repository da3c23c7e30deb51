use super::artifacts::{CommandResult, SecretCodes};
use crate::artifact::{ArtifactKind, ArtifactStore};
use crate::error::PipelineError;
use crate::evaluator::{evaluate_function, evaluate_output};
use crate::step::{BuildContext, BuildStep, StepFlow};
use async_trait::async_trait;
use judgekit_common::types::{Problem, TestCase, TestResult};
use tracing::debug;

fn aligned<'a>(
    step: &'static str,
    tests: &'a [TestCase],
    results: &'a [CommandResult],
) -> Result<impl Iterator<Item = (&'a TestCase, &'a CommandResult)>, PipelineError> {
    if tests.len() != results.len() {
        return Err(PipelineError::step(
            step,
            format!("{} command results for {} test cases", results.len(), tests.len()),
        ));
    }
    Ok(tests.iter().zip(results))
}

fn log_results(step: &'static str, results: &[TestResult]) {
    let passed = results.iter().filter(|r| r.passed()).count();
    debug!(step, passed, total = results.len(), "test results checked");
}

/// Program problems: compare each command's stdout with the expected output.
pub struct CheckOutput;

#[async_trait]
impl BuildStep for CheckOutput {
    fn id(&self) -> &'static str {
        "check_output"
    }

    fn requires(&self) -> Vec<ArtifactKind> {
        vec![
            ArtifactKind::of::<Problem>(),
            ArtifactKind::of::<Vec<TestCase>>(),
            ArtifactKind::of::<Vec<CommandResult>>(),
        ]
    }

    fn produces(&self) -> Vec<ArtifactKind> {
        vec![ArtifactKind::of::<Vec<TestResult>>()]
    }

    async fn execute(
        &self,
        store: &mut ArtifactStore,
        _ctx: &BuildContext,
    ) -> Result<StepFlow, PipelineError> {
        let problem = store.require::<Problem>(self.id())?;
        let tests = store.require::<Vec<TestCase>>(self.id())?;
        let commands = store.require::<Vec<CommandResult>>(self.id())?;

        let results: Vec<TestResult> = aligned(self.id(), tests, commands)?
            .map(|(test, command)| evaluate_output(problem, test, command))
            .collect();
        log_results(self.id(), &results);

        store.add(results);
        Ok(StepFlow::Continue)
    }
}

/// Function problems: read the verdict from the driver's exit code.
pub struct CheckFunctionResults;

#[async_trait]
impl BuildStep for CheckFunctionResults {
    fn id(&self) -> &'static str {
        "check_function_results"
    }

    fn requires(&self) -> Vec<ArtifactKind> {
        vec![
            ArtifactKind::of::<Problem>(),
            ArtifactKind::of::<Vec<TestCase>>(),
            ArtifactKind::of::<Vec<CommandResult>>(),
            ArtifactKind::of::<SecretCodes>(),
        ]
    }

    fn produces(&self) -> Vec<ArtifactKind> {
        vec![ArtifactKind::of::<Vec<TestResult>>()]
    }

    async fn execute(
        &self,
        store: &mut ArtifactStore,
        _ctx: &BuildContext,
    ) -> Result<StepFlow, PipelineError> {
        let problem = store.require::<Problem>(self.id())?;
        let tests = store.require::<Vec<TestCase>>(self.id())?;
        let commands = store.require::<Vec<CommandResult>>(self.id())?;
        let codes = *store.require::<SecretCodes>(self.id())?;

        let results: Vec<TestResult> = aligned(self.id(), tests, commands)?
            .map(|(test, command)| evaluate_function(problem, test, command, codes))
            .collect();
        log_results(self.id(), &results);

        store.add(results);
        Ok(StepFlow::Continue)
    }
}
