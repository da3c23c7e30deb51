// Compilation and syntax-check steps, one per toolchain family.

use super::artifacts::{Executable, ExternalLibrary, ProgramSource, Workspace};
use super::diagnostics::parse_diagnostics;
use crate::artifact::{ArtifactKind, ArtifactStore};
use crate::error::PipelineError;
use crate::sandbox::capture::clip_lines;
use crate::sandbox::executor::signal_name;
use crate::sandbox::{Command, ExecutionReport, ExitClassification, SandboxProfile};
use crate::step::{BuildContext, BuildStep, StepFlow};
use async_trait::async_trait;
use judgekit_common::types::{
    CompilationOutcome, CompilationResult, CompilerDiagnostic, Language, Problem,
};
use regex::Regex;
use std::path::Path;
use std::sync::OnceLock;
use std::time::Duration;
use tracing::{info, warn};

fn compilation_requirements() -> Vec<ArtifactKind> {
    vec![
        ArtifactKind::of::<Problem>(),
        ArtifactKind::of::<ProgramSource>(),
        ArtifactKind::of::<Workspace>(),
    ]
}

fn compilation_products() -> Vec<ArtifactKind> {
    vec![
        ArtifactKind::of::<CompilationResult>(),
        ArtifactKind::of::<Executable>(),
    ]
}

async fn write_source(step: &'static str, dir: &Path, file: &str, text: &str) -> Result<(), PipelineError> {
    tokio::fs::write(dir.join(file), text)
        .await
        .map_err(|e| PipelineError::io(step, e))
}

/// Classify a toolchain run.
///
/// A non-zero exit is a compile failure attributed to the submission.
/// Anything else that is not a clean exit is the toolchain's fault.
pub fn compilation_from_report(language: Language, report: &ExecutionReport) -> CompilationResult {
    match &report.classification {
        ExitClassification::Exited(0) => CompilationResult::success(),
        ExitClassification::Exited(_) => {
            let output = if report.stderr.text.trim().is_empty() {
                &report.stdout.text
            } else {
                &report.stderr.text
            };
            let diagnostics = parse_diagnostics(language, output);
            if diagnostics.is_empty() {
                let (summary, _) = clip_lines(output.trim(), 20, 200);
                CompilationResult::failure(vec![CompilerDiagnostic::new(1, 1, summary)])
            } else {
                CompilationResult::failure(diagnostics)
            }
        }
        ExitClassification::LimitExceeded(kind) => CompilationResult::with_outcome(
            CompilationOutcome::UnexpectedCompilerError,
            format!("compiler exceeded its {:?} limit", kind),
        ),
        ExitClassification::Signaled(sig) => CompilationResult::with_outcome(
            CompilationOutcome::UnexpectedCompilerError,
            format!("compiler killed by {}", signal_name(*sig)),
        ),
        ExitClassification::SecurityViolation => CompilationResult::with_outcome(
            CompilationOutcome::UnexpectedCompilerError,
            "compiler killed by the syscall filter",
        ),
        ExitClassification::SetupFailure(reason) => CompilationResult::with_outcome(
            CompilationOutcome::UnexpectedCompilerError,
            format!("could not run compiler: {}", reason),
        ),
    }
}

fn compile_deadline(ctx: &BuildContext) -> Duration {
    Duration::from_millis(ctx.config.compile_timeout_ms)
}

fn log_compilation(step: &'static str, ctx: &BuildContext, result: &CompilationResult, report: &ExecutionReport) {
    if result.outcome == CompilationOutcome::UnexpectedCompilerError {
        warn!(
            step,
            submission_id = %ctx.submission_id,
            classification = ?report.classification,
            "toolchain did not finish normally"
        );
    } else {
        info!(
            step,
            submission_id = %ctx.submission_id,
            outcome = %result.outcome,
            diagnostics = result.diagnostics.len(),
            elapsed_ms = report.elapsed.as_millis() as u64,
            "compilation finished"
        );
    }
}

/// gcc / g++ for C and C++ problems.
pub struct CompileNative;

#[async_trait]
impl BuildStep for CompileNative {
    fn id(&self) -> &'static str {
        "compile_native"
    }

    fn requires(&self) -> Vec<ArtifactKind> {
        compilation_requirements()
    }

    fn produces(&self) -> Vec<ArtifactKind> {
        compilation_products()
    }

    async fn execute(
        &self,
        store: &mut ArtifactStore,
        ctx: &BuildContext,
    ) -> Result<StepFlow, PipelineError> {
        let language = store.require::<Problem>(self.id())?.problem_type.language();
        let dir = store.require::<Workspace>(self.id())?.path().to_path_buf();
        let (compiler, file) = match language {
            Language::C => (ctx.config.toolchain.cc.clone(), "program.c"),
            Language::CPlusPlus => (ctx.config.toolchain.cxx.clone(), "program.cpp"),
            other => {
                return Err(PipelineError::step(
                    self.id(),
                    format!("cannot compile {} natively", other),
                ))
            }
        };

        let text = &store.require::<ProgramSource>(self.id())?.text;
        write_source(self.id(), &dir, file, text).await?;

        let mut command = Command::new(compiler, &dir, SandboxProfile::Toolchain)
            .args(["-o", "program", file]);
        if let Some(library) = store.get::<ExternalLibrary>() {
            command = command.arg(library.path.display().to_string());
        }
        command = command.arg("-lm");

        let report = ctx.executor.run(&command, "", compile_deadline(ctx)).await;
        let result = compilation_from_report(language, &report);
        log_compilation(self.id(), ctx, &result, &report);

        if result.succeeded() {
            store.add(Executable::Native {
                path: dir.join("program"),
            });
        }
        store.add(result);
        Ok(StepFlow::Continue)
    }
}

fn public_class_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"public\s+(?:final\s+)?class\s+(\w+)").expect("class pattern is valid")
    })
}

/// Name of the first public class, which javac requires to match the file name.
pub fn main_class_name(text: &str) -> String {
    public_class_pattern()
        .captures(text)
        .map(|caps| caps[1].to_string())
        .unwrap_or_else(|| "Main".to_string())
}

/// javac for Java programs and scaffolded Java methods.
pub struct CompileJava;

#[async_trait]
impl BuildStep for CompileJava {
    fn id(&self) -> &'static str {
        "compile_java"
    }

    fn requires(&self) -> Vec<ArtifactKind> {
        compilation_requirements()
    }

    fn produces(&self) -> Vec<ArtifactKind> {
        compilation_products()
    }

    async fn execute(
        &self,
        store: &mut ArtifactStore,
        ctx: &BuildContext,
    ) -> Result<StepFlow, PipelineError> {
        let dir = store.require::<Workspace>(self.id())?.path().to_path_buf();
        let text = &store.require::<ProgramSource>(self.id())?.text;
        let main_class = main_class_name(text);
        let file = format!("{}.java", main_class);
        write_source(self.id(), &dir, &file, text).await?;

        let class_dir = dir.join("classes");
        tokio::fs::create_dir_all(&class_dir)
            .await
            .map_err(|e| PipelineError::io(self.id(), e))?;

        let mut command = Command::new(ctx.config.toolchain.javac.clone(), &dir, SandboxProfile::Toolchain)
            .args(["-encoding", "UTF-8", "-d", "classes", file.as_str()]);
        if let Some(library) = store.get::<ExternalLibrary>() {
            command = command.classpath(&library.path);
        }

        let report = ctx.executor.run(&command, "", compile_deadline(ctx)).await;
        let result = compilation_from_report(Language::Java, &report);
        log_compilation(self.id(), ctx, &result, &report);

        if result.succeeded() {
            store.add(Executable::Jvm {
                class_dir,
                main_class,
            });
        }
        store.add(result);
        Ok(StepFlow::Continue)
    }
}

/// Syntax check for interpreted languages. Produces a script launcher.
pub struct CheckScriptSyntax;

#[async_trait]
impl BuildStep for CheckScriptSyntax {
    fn id(&self) -> &'static str {
        "check_script_syntax"
    }

    fn requires(&self) -> Vec<ArtifactKind> {
        compilation_requirements()
    }

    fn produces(&self) -> Vec<ArtifactKind> {
        compilation_products()
    }

    async fn execute(
        &self,
        store: &mut ArtifactStore,
        ctx: &BuildContext,
    ) -> Result<StepFlow, PipelineError> {
        let language = store.require::<Problem>(self.id())?.problem_type.language();
        let dir = store.require::<Workspace>(self.id())?.path().to_path_buf();
        let toolchain = &ctx.config.toolchain;
        let (interpreter, file, check_args, flags): (&str, &str, Vec<&str>, Vec<String>) = match language {
            Language::Python => (
                toolchain.python.as_str(),
                "program.py",
                vec!["-B", "-m", "py_compile", "program.py"],
                vec!["-B".to_string(), "-I".to_string()],
            ),
            Language::Ruby => (toolchain.ruby.as_str(), "program.rb", vec!["-c", "program.rb"], Vec::new()),
            other => {
                return Err(PipelineError::step(
                    self.id(),
                    format!("{} is not an interpreted language", other),
                ))
            }
        };

        let text = &store.require::<ProgramSource>(self.id())?.text;
        write_source(self.id(), &dir, file, text).await?;

        let command = Command::new(interpreter, &dir, SandboxProfile::Toolchain).args(check_args);
        let report = ctx.executor.run(&command, "", compile_deadline(ctx)).await;
        let result = compilation_from_report(language, &report);
        log_compilation(self.id(), ctx, &result, &report);

        if result.succeeded() {
            store.add(Executable::Script {
                interpreter: interpreter.to_string(),
                flags,
                path: dir.join(file),
            });
        }
        store.add(result);
        Ok(StepFlow::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::{CapturedOutput, LimitKind};
    use judgekit_common::types::ProblemType;

    fn report(classification: ExitClassification, stderr: &str) -> ExecutionReport {
        ExecutionReport {
            classification,
            stdout: CapturedOutput::default(),
            stderr: CapturedOutput {
                text: stderr.to_string(),
                truncated: false,
            },
            elapsed: Duration::from_millis(5),
        }
    }

    #[test]
    fn test_main_class_detection() {
        assert_eq!(main_class_name("public class Hello {\n}"), "Hello");
        assert_eq!(main_class_name("public final  class Solver { }"), "Solver");
        assert_eq!(main_class_name("class Hidden {}"), "Main");
    }

    #[test]
    fn test_nonzero_exit_is_compile_failure() {
        let result = compilation_from_report(
            Language::C,
            &report(ExitClassification::Exited(1), "program.c:4:1: error: expected ';'\n"),
        );
        assert_eq!(result.outcome, CompilationOutcome::Failure);
        assert_eq!(result.diagnostics[0].start_line, 4);
    }

    #[test]
    fn test_unparsed_failure_keeps_compiler_output() {
        let result = compilation_from_report(
            Language::C,
            &report(ExitClassification::Exited(1), "collect2: ld returned 1 exit status\n"),
        );
        assert_eq!(result.outcome, CompilationOutcome::Failure);
        assert_eq!(result.diagnostics.len(), 1);
        assert!(result.diagnostics[0].message.contains("ld returned 1"));
    }

    #[test]
    fn test_toolchain_trouble_is_unexpected() {
        for classification in [
            ExitClassification::LimitExceeded(LimitKind::WallClock),
            ExitClassification::Signaled(libc::SIGSEGV),
            ExitClassification::SetupFailure("no such file".into()),
        ] {
            let result = compilation_from_report(Language::Java, &report(classification, ""));
            assert_eq!(result.outcome, CompilationOutcome::UnexpectedCompilerError);
        }
    }

    #[tokio::test]
    async fn test_missing_compiler_yields_unexpected_error() {
        let mut config = judgekit_common::config::BuilderConfig {
            sandbox_enabled: false,
            ..Default::default()
        };
        config.toolchain.cc = "/nonexistent/judgekit-cc".to_string();
        let ctx = crate::test_support::context_with(config);
        let workspace = Workspace::create(&std::env::temp_dir()).unwrap();
        let mut store = ArtifactStore::new();
        store.add(Problem::new(ProblemType::CProgram, ""));
        store.add(ProgramSource::new("int main(void) { return 0; }\n"));
        store.add(workspace);

        CompileNative.execute(&mut store, &ctx).await.unwrap();

        let result = store.get::<CompilationResult>().unwrap();
        assert_eq!(result.outcome, CompilationOutcome::UnexpectedCompilerError);
        assert!(!store.contains::<Executable>());
    }

    #[tokio::test]
    #[ignore] // Requires gcc on the host
    async fn test_compile_native_produces_executable() {
        let ctx = crate::test_support::context();
        let mut store = ArtifactStore::new();
        store.add(Problem::new(ProblemType::CProgram, ""));
        store.add(ProgramSource::new("int main(void) { return 0; }\n"));
        store.add(Workspace::create(&std::env::temp_dir()).unwrap());

        CompileNative.execute(&mut store, &ctx).await.unwrap();

        assert!(store.get::<CompilationResult>().unwrap().succeeded());
        let Some(Executable::Native { path }) = store.get::<Executable>() else {
            panic!("expected a native executable");
        };
        assert!(path.exists());
    }
}
