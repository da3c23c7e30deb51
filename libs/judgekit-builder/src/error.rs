use thiserror::Error;

/// Errors that abort a step sequence.
///
/// These are builder defects or host problems, never verdicts about the
/// submission. The tester turns them into an `INTERNAL_ERROR` result.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("step '{step}' requires artifact {artifact}, which was never produced")]
    MissingArtifact {
        step: &'static str,
        artifact: &'static str,
    },

    #[error("step '{step}' failed: {message}")]
    Step { step: &'static str, message: String },

    #[error("I/O error in step '{step}': {source}")]
    Io {
        step: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to render scaffolding: {0}")]
    Template(#[from] handlebars::RenderError),
}

impl PipelineError {
    pub fn step(step: &'static str, message: impl Into<String>) -> Self {
        PipelineError::Step {
            step,
            message: message.into(),
        }
    }

    pub fn io(step: &'static str, source: std::io::Error) -> Self {
        PipelineError::Io { step, source }
    }
}
