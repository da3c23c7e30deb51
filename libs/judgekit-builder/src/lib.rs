pub mod artifact;
pub mod error;
pub mod evaluator;
pub mod metrics;
pub mod pool;
pub mod sandbox;
pub mod step;
pub mod steps;
pub mod task_manager;
pub mod tester;


#[cfg(test)]
pub(crate) mod test_support {
    use crate::sandbox::SandboxedExecutor;
    use crate::step::BuildContext;
    use judgekit_common::config::BuilderConfig;
    use judgekit_common::types::SubmissionId;
    use std::sync::Arc;

    /// Context with the sandbox disabled, so tests run without seccomp.
    pub fn context() -> BuildContext {
        context_with(BuilderConfig {
            sandbox_enabled: false,
            ..BuilderConfig::default()
        })
    }

    pub fn context_with(config: BuilderConfig) -> BuildContext {
        let config = Arc::new(config);
        let executor = Arc::new(SandboxedExecutor::new(Arc::clone(&config)));
        BuildContext::new(SubmissionId::new(), config, executor)
    }
}
