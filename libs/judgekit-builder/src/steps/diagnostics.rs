// Compiler output parsing and line translation.

use super::artifacts::ProgramSource;
use crate::artifact::{ArtifactKind, ArtifactStore};
use crate::error::PipelineError;
use crate::step::{BuildContext, BuildStep, StepFlow};
use async_trait::async_trait;
use judgekit_common::types::{CompilationResult, CompilerDiagnostic, Language, SubmissionResult};
use regex::Regex;
use std::sync::OnceLock;
use tracing::debug;

fn gcc_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[^:\n]+:(\d+):(?:(\d+):)?\s*(?:fatal )?error:\s*(.*)$")
            .expect("gcc diagnostic pattern is valid")
    })
}

fn javac_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[^:\n]+\.java:(\d+):\s*error:\s*(.*)$").expect("javac diagnostic pattern is valid")
    })
}

fn python_line_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r#"^\s*File "[^"]*", line (\d+)"#).expect("python location pattern is valid")
    })
}

fn python_error_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^(\w*Error): (.*)$").expect("python error pattern is valid")
    })
}

fn ruby_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[^:\n]+\.rb:(\d+):\s*(.*)$").expect("ruby diagnostic pattern is valid")
    })
}

/// Extract error diagnostics from compiler or syntax-checker output.
pub fn parse_diagnostics(language: Language, output: &str) -> Vec<CompilerDiagnostic> {
    match language {
        Language::C | Language::CPlusPlus => output
            .lines()
            .filter_map(|line| {
                let caps = gcc_pattern().captures(line)?;
                let line_no = caps[1].parse().ok()?;
                let column = caps.get(2).and_then(|c| c.as_str().parse().ok()).unwrap_or(1);
                Some(CompilerDiagnostic::new(line_no, column, caps[3].trim()))
            })
            .collect(),
        Language::Java => output
            .lines()
            .filter_map(|line| {
                let caps = javac_pattern().captures(line)?;
                let line_no = caps[1].parse().ok()?;
                Some(CompilerDiagnostic::new(line_no, 1, caps[2].trim()))
            })
            .collect(),
        Language::Python => parse_python(output).into_iter().collect(),
        Language::Ruby => output
            .lines()
            .filter_map(|line| {
                let caps = ruby_pattern().captures(line)?;
                let line_no = caps[1].parse().ok()?;
                Some(CompilerDiagnostic::new(line_no, 1, caps[2].trim()))
            })
            .collect(),
    }
}

fn parse_python(output: &str) -> Option<CompilerDiagnostic> {
    let line_no = output
        .lines()
        .filter_map(|line| python_line_pattern().captures(line))
        .filter_map(|caps| caps[1].parse().ok())
        .last()?;
    let message = output
        .lines()
        .rev()
        .find_map(|line| {
            python_error_pattern()
                .captures(line.trim())
                .map(|caps| format!("{}: {}", &caps[1], &caps[2]))
        })
        .unwrap_or_else(|| "syntax error".to_string());
    Some(CompilerDiagnostic::new(line_no, 1, message))
}

/// Shift diagnostics from scaffolded lines back to the student's lines.
pub fn translate(diagnostics: &mut [CompilerDiagnostic], source: &ProgramSource) {
    for diagnostic in diagnostics {
        diagnostic.start_line = source.original_line(diagnostic.start_line);
        diagnostic.end_line = source.original_line(diagnostic.end_line);
    }
}

/// Translates diagnostic lines and stops the sequence when compilation failed.
pub struct TranslateDiagnostics;

#[async_trait]
impl BuildStep for TranslateDiagnostics {
    fn id(&self) -> &'static str {
        "translate_diagnostics"
    }

    fn requires(&self) -> Vec<ArtifactKind> {
        vec![
            ArtifactKind::of::<CompilationResult>(),
            ArtifactKind::of::<ProgramSource>(),
        ]
    }

    fn produces(&self) -> Vec<ArtifactKind> {
        vec![
            ArtifactKind::of::<CompilationResult>(),
            ArtifactKind::of::<SubmissionResult>(),
        ]
    }

    async fn execute(
        &self,
        store: &mut ArtifactStore,
        _ctx: &BuildContext,
    ) -> Result<StepFlow, PipelineError> {
        let source = store.require::<ProgramSource>(self.id())?.clone();
        let compilation = store.require_mut::<CompilationResult>(self.id())?;
        translate(&mut compilation.diagnostics, &source);

        if compilation.succeeded() {
            return Ok(StepFlow::Continue);
        }

        debug!(
            outcome = %compilation.outcome,
            diagnostics = compilation.diagnostics.len(),
            "compilation did not succeed, skipping execution"
        );
        let result = SubmissionResult::compile_failure(compilation.clone());
        store.add(result);
        Ok(StepFlow::Halt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use judgekit_common::types::CompilationOutcome;

    #[test]
    fn test_parse_gcc_errors() {
        let output = "\
program.c: In function 'main':
program.c:5:5: error: expected ';' before 'return'
program.c:3:9: warning: unused variable 'x' [-Wunused-variable]
program.c:9:1: fatal error: missing.h: No such file or directory";

        let diagnostics = parse_diagnostics(Language::C, output);

        assert_eq!(diagnostics.len(), 2);
        assert_eq!(diagnostics[0].start_line, 5);
        assert_eq!(diagnostics[0].start_column, 5);
        assert_eq!(diagnostics[0].message, "expected ';' before 'return'");
        assert_eq!(diagnostics[1].start_line, 9);
    }

    #[test]
    fn test_parse_javac_errors() {
        let output = "\
Test.java:7: error: cannot find symbol
        return y;
               ^
1 error";

        let diagnostics = parse_diagnostics(Language::Java, output);

        assert_eq!(diagnostics.len(), 1);
        assert_eq!(diagnostics[0].start_line, 7);
        assert_eq!(diagnostics[0].message, "cannot find symbol");
    }

    #[test]
    fn test_parse_python_syntax_error() {
        let output = r#"  File "program.py", line 4
    def f(
         ^
SyntaxError: '(' was never closed"#;

        let diagnostics = parse_diagnostics(Language::Python, output);

        assert_eq!(diagnostics.len(), 1);
        assert_eq!(diagnostics[0].start_line, 4);
        assert_eq!(diagnostics[0].message, "SyntaxError: '(' was never closed");
    }

    #[test]
    fn test_parse_ruby_syntax_error() {
        let output = "program.rb:3: syntax error, unexpected end-of-input";
        let diagnostics = parse_diagnostics(Language::Ruby, output);
        assert_eq!(diagnostics[0].start_line, 3);
        assert!(diagnostics[0].message.starts_with("syntax error"));
    }

    #[test]
    fn test_translate_subtracts_prologue() {
        let source = ProgramSource::wrapped("a\nb\nc\nd\ne\nf\n", 3, 1);
        let mut diagnostics = vec![CompilerDiagnostic::new(5, 2, "x")];

        translate(&mut diagnostics, &source);

        assert_eq!(diagnostics[0].start_line, 2);
        assert_eq!(diagnostics[0].end_line, 2);
        assert_eq!(diagnostics[0].start_column, 2);
    }

    #[tokio::test]
    async fn test_step_halts_on_failure() {
        let ctx = crate::test_support::context();
        let mut store = ArtifactStore::new();
        store.add(ProgramSource::wrapped("p\np\np\nbad\n", 3, 0));
        store.add(CompilationResult::failure(vec![CompilerDiagnostic::new(4, 1, "oops")]));

        let flow = TranslateDiagnostics.execute(&mut store, &ctx).await.unwrap();

        assert_eq!(flow, StepFlow::Halt);
        let result = store.get::<SubmissionResult>().unwrap();
        assert_eq!(result.compilation.outcome, CompilationOutcome::Failure);
        assert_eq!(result.compilation.diagnostics[0].start_line, 1);
        assert!(result.test_results.is_empty());
    }

    #[tokio::test]
    async fn test_step_continues_on_success() {
        let ctx = crate::test_support::context();
        let mut store = ArtifactStore::new();
        store.add(ProgramSource::new("int main() {}"));
        store.add(CompilationResult::success());

        let flow = TranslateDiagnostics.execute(&mut store, &ctx).await.unwrap();

        assert_eq!(flow, StepFlow::Continue);
        assert!(!store.contains::<SubmissionResult>());
    }
}
