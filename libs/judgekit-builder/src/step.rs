use crate::artifact::{ArtifactKind, ArtifactStore};
use crate::error::PipelineError;
use crate::sandbox::SandboxedExecutor;
use async_trait::async_trait;
use judgekit_common::config::BuilderConfig;
use judgekit_common::types::SubmissionId;
use std::sync::Arc;

/// What the sequence does after a step returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepFlow {
    Continue,
    /// The verdict is already decided (e.g. compilation failed).
    Halt,
}

/// Shared, read-only services available to every step of a run.
#[derive(Clone)]
pub struct BuildContext {
    pub submission_id: SubmissionId,
    pub config: Arc<BuilderConfig>,
    pub executor: Arc<SandboxedExecutor>,
}

impl BuildContext {
    pub fn new(
        submission_id: SubmissionId,
        config: Arc<BuilderConfig>,
        executor: Arc<SandboxedExecutor>,
    ) -> Self {
        Self {
            submission_id,
            config,
            executor,
        }
    }
}

/// One stage of a testing pipeline.
///
/// A step reads the artifacts it declares in `requires`, writes the ones in
/// `produces`, and may read further artifacts optionally through
/// [`ArtifactStore::get`]. The declarations are checked when a tester is
/// assembled, so an ordering mistake fails at startup.
#[async_trait]
pub trait BuildStep: Send + Sync {
    /// Stable identifier used in tester mappings.
    fn id(&self) -> &'static str;

    fn requires(&self) -> Vec<ArtifactKind>;

    fn produces(&self) -> Vec<ArtifactKind>;

    async fn execute(
        &self,
        store: &mut ArtifactStore,
        ctx: &BuildContext,
    ) -> Result<StepFlow, PipelineError>;
}
