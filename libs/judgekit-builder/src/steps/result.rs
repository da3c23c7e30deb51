use crate::artifact::{ArtifactKind, ArtifactStore};
use crate::error::PipelineError;
use crate::step::{BuildContext, BuildStep, StepFlow};
use async_trait::async_trait;
use judgekit_common::types::{CompilationResult, SubmissionResult, TestResult};

/// Final step: combine compilation and test results into the verdict.
pub struct AssembleResult;

#[async_trait]
impl BuildStep for AssembleResult {
    fn id(&self) -> &'static str {
        "assemble_result"
    }

    fn requires(&self) -> Vec<ArtifactKind> {
        vec![
            ArtifactKind::of::<CompilationResult>(),
            ArtifactKind::of::<Vec<TestResult>>(),
        ]
    }

    fn produces(&self) -> Vec<ArtifactKind> {
        vec![ArtifactKind::of::<SubmissionResult>()]
    }

    async fn execute(
        &self,
        store: &mut ArtifactStore,
        _ctx: &BuildContext,
    ) -> Result<StepFlow, PipelineError> {
        let compilation = store.require::<CompilationResult>(self.id())?.clone();
        let tests = store
            .take::<Vec<TestResult>>()
            .ok_or(PipelineError::MissingArtifact {
                step: self.id(),
                artifact: std::any::type_name::<Vec<TestResult>>(),
            })?;

        store.add(SubmissionResult::new(compilation, tests));
        Ok(StepFlow::Continue)
    }
}
