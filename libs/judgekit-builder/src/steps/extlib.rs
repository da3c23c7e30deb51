use super::artifacts::ExternalLibrary;
use crate::artifact::{ArtifactKind, ArtifactStore};
use crate::error::PipelineError;
use crate::step::{BuildContext, BuildStep, StepFlow};
use async_trait::async_trait;
use judgekit_common::types::Problem;
use tracing::debug;

/// Makes the problem's jar or shared library available to later steps.
/// Produces nothing when the problem has no external library.
pub struct ResolveExternalLibrary;

#[async_trait]
impl BuildStep for ResolveExternalLibrary {
    fn id(&self) -> &'static str {
        "resolve_external_library"
    }

    fn requires(&self) -> Vec<ArtifactKind> {
        vec![ArtifactKind::of::<Problem>()]
    }

    fn produces(&self) -> Vec<ArtifactKind> {
        vec![ArtifactKind::of::<ExternalLibrary>()]
    }

    async fn execute(
        &self,
        store: &mut ArtifactStore,
        _ctx: &BuildContext,
    ) -> Result<StepFlow, PipelineError> {
        let Some(path) = store.require::<Problem>(self.id())?.external_library.clone() else {
            return Ok(StepFlow::Continue);
        };

        let path = tokio::fs::canonicalize(&path).await.map_err(|e| {
            PipelineError::step(
                self.id(),
                format!("external library {} is not accessible: {}", path.display(), e),
            )
        })?;
        debug!(library = %path.display(), "resolved external library");

        store.add(ExternalLibrary { path });
        Ok(StepFlow::Continue)
    }
}
