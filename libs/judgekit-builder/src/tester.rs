/// Testers - Step Sequences per Problem Type
///
/// **Core Responsibility:**
/// Map each problem type to an ordered list of build steps and drive a
/// submission through it.
///
/// **Critical Properties:**
/// - Mappings are data: built-in defaults, optionally overridden per
///   problem type from a JSON file
/// - Every sequence is checked when the registry is built: unknown step ids
///   and steps whose required artifacts nothing earlier produces are
///   rejected at startup, not when a student submits
/// - [`Tester::test`] never fails: pipeline errors become an
///   `INTERNAL_ERROR` verdict with one result per test case

use crate::artifact::{ArtifactKind, ArtifactStore};
use crate::error::PipelineError;
use crate::sandbox::SandboxedExecutor;
use crate::step::{BuildContext, BuildStep, StepFlow};
use crate::steps::{step_by_id, ProgramSource, Workspace};
use judgekit_common::config::BuilderConfig;
use judgekit_common::types::{Problem, ProblemType, SubmissionRequest, SubmissionResult, TestCase};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, error, info, instrument};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("failed to read tester mapping {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse tester mapping {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("unknown step '{step}' in the sequence for {problem_type}")]
    UnknownStep {
        problem_type: ProblemType,
        step: String,
    },

    #[error("step '{step}' for {problem_type} requires {artifact}, which no earlier step produces")]
    Unsatisfied {
        problem_type: ProblemType,
        step: &'static str,
        artifact: &'static str,
    },

    #[error("the sequence for {0} never produces a submission result")]
    NoResult(ProblemType),

    #[error("no tester for problem type {0}")]
    NoTester(ProblemType),
}

/// Artifacts present before the first step runs.
fn seed_kinds() -> Vec<ArtifactKind> {
    vec![
        ArtifactKind::of::<Problem>(),
        ArtifactKind::of::<Vec<TestCase>>(),
        ArtifactKind::of::<ProgramSource>(),
        ArtifactKind::of::<Workspace>(),
    ]
}

/// Built-in step sequences.
pub fn default_sequences() -> HashMap<ProblemType, Vec<String>> {
    const RUN_AND_CHECK_OUTPUT: [&str; 5] = [
        "translate_diagnostics",
        "create_test_commands",
        "execute_commands",
        "check_output",
        "assemble_result",
    ];
    const RUN_AND_CHECK_FUNCTION: [&str; 5] = [
        "translate_diagnostics",
        "create_test_commands",
        "execute_commands",
        "check_function_results",
        "assemble_result",
    ];

    let sequence = |head: &[&str], tail: &[&str]| -> Vec<String> {
        head.iter().chain(tail).map(|s| s.to_string()).collect()
    };

    let native_program = sequence(&["compile_native"], &RUN_AND_CHECK_OUTPUT);
    let native_function = sequence(&["add_function_scaffolding", "compile_native"], &RUN_AND_CHECK_FUNCTION);
    let script_function = sequence(&["add_function_scaffolding", "check_script_syntax"], &RUN_AND_CHECK_FUNCTION);

    HashMap::from([
        (ProblemType::CProgram, native_program.clone()),
        (ProblemType::CPlusPlusProgram, native_program),
        (ProblemType::CFunction, native_function.clone()),
        (ProblemType::CPlusPlusFunction, native_function),
        (
            ProblemType::JavaProgram,
            sequence(&["resolve_external_library", "compile_java"], &RUN_AND_CHECK_OUTPUT),
        ),
        (
            ProblemType::JavaMethod,
            sequence(
                &["resolve_external_library", "add_function_scaffolding", "compile_java"],
                &RUN_AND_CHECK_FUNCTION,
            ),
        ),
        (ProblemType::PythonFunction, script_function.clone()),
        (ProblemType::RubyMethod, script_function),
    ])
}

/// An ordered, validated step sequence for one problem type.
pub struct Tester {
    problem_type: ProblemType,
    steps: Vec<Arc<dyn BuildStep>>,
}

impl std::fmt::Debug for Tester {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tester")
            .field("problem_type", &self.problem_type)
            .field("steps", &self.step_ids())
            .finish()
    }
}

impl Tester {
    /// Assemble a tester, checking that every step's inputs are available.
    pub fn new(problem_type: ProblemType, steps: Vec<Arc<dyn BuildStep>>) -> Result<Self, RegistryError> {
        let mut available: HashSet<ArtifactKind> = seed_kinds().into_iter().collect();
        for step in &steps {
            if let Some(missing) = step.requires().into_iter().find(|k| !available.contains(k)) {
                return Err(RegistryError::Unsatisfied {
                    problem_type,
                    step: step.id(),
                    artifact: missing.name(),
                });
            }
            available.extend(step.produces());
        }
        if !available.contains(&ArtifactKind::of::<SubmissionResult>()) {
            return Err(RegistryError::NoResult(problem_type));
        }
        Ok(Self { problem_type, steps })
    }

    pub fn from_ids(problem_type: ProblemType, ids: &[String]) -> Result<Self, RegistryError> {
        let steps = ids
            .iter()
            .map(|id| {
                step_by_id(id).ok_or_else(|| RegistryError::UnknownStep {
                    problem_type,
                    step: id.clone(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(problem_type, steps)
    }

    pub fn problem_type(&self) -> ProblemType {
        self.problem_type
    }

    pub fn step_ids(&self) -> Vec<&'static str> {
        self.steps.iter().map(|s| s.id()).collect()
    }

    /// Run the submission through every step and return its verdict.
    #[instrument(skip_all, fields(submission_id = %ctx.submission_id, problem_type = %self.problem_type))]
    pub async fn test(&self, request: &SubmissionRequest, ctx: &BuildContext) -> SubmissionResult {
        let started = Instant::now();
        match self.run(request, ctx).await {
            Ok(result) => {
                info!(
                    compilation = %result.compilation.outcome,
                    passed = result.passed_count(),
                    total = request.test_cases.len(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "submission tested"
                );
                result
            }
            Err(e) => {
                error!(error = %e, "pipeline failed");
                SubmissionResult::internal_error(&request.test_cases, e.to_string())
            }
        }
    }

    async fn run(&self, request: &SubmissionRequest, ctx: &BuildContext) -> Result<SubmissionResult, PipelineError> {
        let workspace = Workspace::create(&ctx.config.temp_dir)
            .map_err(|e| PipelineError::io("create_workspace", e))?;

        // Dropping the store at the end removes the workspace.
        let mut store = ArtifactStore::new();
        store.add(request.problem.clone());
        store.add(request.test_cases.clone());
        store.add(ProgramSource::new(request.program_text.clone()));
        store.add(workspace);

        for step in &self.steps {
            debug!(step = step.id(), "running step");
            if step.execute(&mut store, ctx).await? == StepFlow::Halt {
                debug!(step = step.id(), "sequence halted");
                break;
            }
        }

        store
            .take::<SubmissionResult>()
            .ok_or_else(|| PipelineError::step("tester", "sequence finished without a submission result"))
    }
}

/// Testers for every problem type.
#[derive(Debug)]
pub struct TesterRegistry {
    testers: HashMap<ProblemType, Tester>,
}

impl TesterRegistry {
    pub fn from_sequences(sequences: &HashMap<ProblemType, Vec<String>>) -> Result<Self, RegistryError> {
        let testers = sequences
            .iter()
            .map(|(&problem_type, ids)| Ok((problem_type, Tester::from_ids(problem_type, ids)?)))
            .collect::<Result<HashMap<_, _>, RegistryError>>()?;
        Ok(Self { testers })
    }

    pub fn with_defaults() -> Result<Self, RegistryError> {
        Self::from_sequences(&default_sequences())
    }

    /// Defaults, with sequences from `path` replacing them per problem type.
    pub fn load(path: Option<&Path>) -> Result<Self, RegistryError> {
        let mut sequences = default_sequences();
        if let Some(path) = path {
            let text = std::fs::read_to_string(path).map_err(|source| RegistryError::Read {
                path: path.to_path_buf(),
                source,
            })?;
            let overrides: HashMap<ProblemType, Vec<String>> =
                serde_json::from_str(&text).map_err(|source| RegistryError::Parse {
                    path: path.to_path_buf(),
                    source,
                })?;
            info!(path = %path.display(), overrides = overrides.len(), "loaded tester mapping");
            sequences.extend(overrides);
        }
        Self::from_sequences(&sequences)
    }

    /// Install `tester` for its problem type, returning the one it replaces.
    pub fn register(&mut self, tester: Tester) -> Option<Tester> {
        self.testers.insert(tester.problem_type(), tester)
    }

    pub fn get(&self, problem_type: ProblemType) -> Result<&Tester, RegistryError> {
        self.testers
            .get(&problem_type)
            .ok_or(RegistryError::NoTester(problem_type))
    }

    /// Step ids per problem type, in problem type order.
    pub fn sequences(&self) -> BTreeMap<ProblemType, Vec<&'static str>> {
        self.testers
            .iter()
            .map(|(&problem_type, tester)| (problem_type, tester.step_ids()))
            .collect()
    }
}

/// Everything needed to judge a submission: testers, config and the
/// shared sandbox executor.
pub struct Judge {
    registry: Arc<TesterRegistry>,
    config: Arc<BuilderConfig>,
    executor: Arc<SandboxedExecutor>,
}

impl Judge {
    pub fn new(registry: Arc<TesterRegistry>, config: Arc<BuilderConfig>) -> Self {
        let executor = Arc::new(SandboxedExecutor::new(Arc::clone(&config)));
        Self {
            registry,
            config,
            executor,
        }
    }

    pub fn executor(&self) -> &SandboxedExecutor {
        &self.executor
    }

    pub async fn judge(&self, request: &SubmissionRequest) -> SubmissionResult {
        let tester = match self.registry.get(request.problem.problem_type) {
            Ok(tester) => tester,
            Err(e) => {
                error!(submission_id = %request.id, error = %e, "cannot test submission");
                return SubmissionResult::internal_error(&request.test_cases, e.to_string());
            }
        };
        let ctx = BuildContext::new(request.id, Arc::clone(&self.config), Arc::clone(&self.executor));
        tester.test(request, &ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use judgekit_common::types::{CompilationOutcome, TestOutcome};

    struct Failing;

    #[async_trait]
    impl BuildStep for Failing {
        fn id(&self) -> &'static str {
            "failing"
        }

        fn requires(&self) -> Vec<ArtifactKind> {
            vec![ArtifactKind::of::<ProgramSource>()]
        }

        fn produces(&self) -> Vec<ArtifactKind> {
            vec![ArtifactKind::of::<SubmissionResult>()]
        }

        async fn execute(
            &self,
            _store: &mut ArtifactStore,
            _ctx: &BuildContext,
        ) -> Result<StepFlow, PipelineError> {
            Err(PipelineError::step("failing", "boom"))
        }
    }

    struct Verdict;

    #[async_trait]
    impl BuildStep for Verdict {
        fn id(&self) -> &'static str {
            "verdict"
        }

        fn requires(&self) -> Vec<ArtifactKind> {
            vec![ArtifactKind::of::<Workspace>()]
        }

        fn produces(&self) -> Vec<ArtifactKind> {
            vec![ArtifactKind::of::<SubmissionResult>()]
        }

        async fn execute(
            &self,
            store: &mut ArtifactStore,
            _ctx: &BuildContext,
        ) -> Result<StepFlow, PipelineError> {
            let workspace = store.require::<Workspace>(self.id())?;
            assert!(workspace.path().is_dir());
            store.add(SubmissionResult::new(
                judgekit_common::types::CompilationResult::success(),
                Vec::new(),
            ));
            Ok(StepFlow::Continue)
        }
    }

    fn request() -> SubmissionRequest {
        SubmissionRequest::new(
            Problem::new(ProblemType::CProgram, ""),
            vec![TestCase::new("a", "", ""), TestCase::new("b", "", "")],
            "int main() {}",
        )
    }

    #[test]
    fn test_defaults_cover_every_problem_type() {
        let registry = TesterRegistry::with_defaults().unwrap();
        for problem_type in ProblemType::ALL {
            let steps = registry.get(problem_type).unwrap().step_ids();
            assert_eq!(steps.last(), Some(&"assemble_result"));
        }
        assert_eq!(
            registry.get(ProblemType::JavaMethod).unwrap().step_ids()[..3],
            ["resolve_external_library", "add_function_scaffolding", "compile_java"]
        );
    }

    #[test]
    fn test_unknown_step_is_rejected() {
        let sequences = HashMap::from([(ProblemType::CProgram, vec!["compile_cobol".to_string()])]);
        let err = TesterRegistry::from_sequences(&sequences).unwrap_err();
        assert!(matches!(err, RegistryError::UnknownStep { step, .. } if step == "compile_cobol"));
    }

    #[test]
    fn test_misordered_sequence_is_rejected() {
        let ids: Vec<String> = ["create_test_commands", "compile_native", "translate_diagnostics"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let err = Tester::from_ids(ProblemType::CProgram, &ids).unwrap_err();
        assert!(matches!(
            err,
            RegistryError::Unsatisfied { step: "create_test_commands", .. }
        ));
    }

    #[test]
    fn test_function_checker_needs_scaffolding() {
        let ids: Vec<String> = [
            "compile_native",
            "translate_diagnostics",
            "create_test_commands",
            "execute_commands",
            "check_function_results",
            "assemble_result",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        let err = Tester::from_ids(ProblemType::CFunction, &ids).unwrap_err();
        assert!(matches!(
            err,
            RegistryError::Unsatisfied { step: "check_function_results", .. }
        ));
    }

    #[test]
    fn test_sequence_without_result_is_rejected() {
        let ids = vec!["compile_native".to_string()];
        let err = Tester::from_ids(ProblemType::CProgram, &ids).unwrap_err();
        assert!(matches!(err, RegistryError::NoResult(ProblemType::CProgram)));
    }

    #[test]
    fn test_load_overrides_one_problem_type() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("testers.json");
        std::fs::write(
            &path,
            r#"{"C_PROGRAM": ["compile_native", "translate_diagnostics", "create_test_commands",
                "execute_commands", "check_output", "assemble_result"]}"#,
        )
        .unwrap();

        let registry = TesterRegistry::load(Some(&path)).unwrap();

        assert_eq!(registry.sequences().len(), ProblemType::ALL.len());
        assert_eq!(registry.get(ProblemType::CProgram).unwrap().step_ids().len(), 6);
    }

    #[test]
    fn test_shipped_mapping_matches_defaults() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../config/testers.json");
        let shipped = TesterRegistry::load(Some(&path)).unwrap();
        let defaults = TesterRegistry::with_defaults().unwrap();

        assert_eq!(shipped.sequences(), defaults.sequences());
    }

    #[test]
    fn test_load_reports_bad_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("testers.json");
        std::fs::write(&path, "{not json").unwrap();

        assert!(matches!(
            TesterRegistry::load(Some(&path)).unwrap_err(),
            RegistryError::Parse { .. }
        ));
    }

    #[tokio::test]
    async fn test_step_error_becomes_internal_error() {
        let tester = Tester::new(ProblemType::CProgram, vec![Arc::new(Failing)]).unwrap();
        let ctx = crate::test_support::context();

        let result = tester.test(&request(), &ctx).await;

        assert_eq!(result.compilation.outcome, CompilationOutcome::BuilderError);
        assert_eq!(result.test_results.len(), 2);
        assert!(result
            .test_results
            .iter()
            .all(|r| r.outcome == TestOutcome::InternalError && r.message.contains("boom")));
    }

    #[tokio::test]
    async fn test_workspace_is_removed_after_run() {
        let temp = tempfile::tempdir().unwrap();
        let config = BuilderConfig {
            sandbox_enabled: false,
            temp_dir: temp.path().to_path_buf(),
            ..BuilderConfig::default()
        };
        let ctx = crate::test_support::context_with(config);
        let tester = Tester::new(ProblemType::CProgram, vec![Arc::new(Verdict)]).unwrap();

        let result = tester.test(&request(), &ctx).await;

        assert!(result.compilation.succeeded());
        assert_eq!(std::fs::read_dir(temp.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_judge_without_tester_is_internal_error() {
        let registry = TesterRegistry::from_sequences(&HashMap::new()).unwrap();
        let judge = Judge::new(Arc::new(registry), Arc::new(BuilderConfig::default()));

        let result = judge.judge(&request()).await;

        assert_eq!(result.test_results.len(), 2);
        assert_eq!(result.test_results[0].outcome, TestOutcome::InternalError);
    }
}
