use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use uuid::Uuid;

/// Identity of one submission, used to correlate results with requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubmissionId(pub Uuid);

impl SubmissionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SubmissionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SubmissionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    C,
    #[serde(rename = "cpp")]
    CPlusPlus,
    Java,
    Python,
    Ruby,
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Language::C => "c",
            Language::CPlusPlus => "cpp",
            Language::Java => "java",
            Language::Python => "python",
            Language::Ruby => "ruby",
        };
        f.write_str(name)
    }
}

/// Problem type tag. Selects the step sequence a submission runs through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProblemType {
    CProgram,
    CFunction,
    #[serde(rename = "CPLUSPLUS_PROGRAM")]
    CPlusPlusProgram,
    #[serde(rename = "CPLUSPLUS_FUNCTION")]
    CPlusPlusFunction,
    JavaProgram,
    JavaMethod,
    PythonFunction,
    RubyMethod,
}

impl ProblemType {
    pub const ALL: [ProblemType; 8] = [
        ProblemType::CProgram,
        ProblemType::CFunction,
        ProblemType::CPlusPlusProgram,
        ProblemType::CPlusPlusFunction,
        ProblemType::JavaProgram,
        ProblemType::JavaMethod,
        ProblemType::PythonFunction,
        ProblemType::RubyMethod,
    ];

    pub fn language(&self) -> Language {
        match self {
            ProblemType::CProgram | ProblemType::CFunction => Language::C,
            ProblemType::CPlusPlusProgram | ProblemType::CPlusPlusFunction => Language::CPlusPlus,
            ProblemType::JavaProgram | ProblemType::JavaMethod => Language::Java,
            ProblemType::PythonFunction => Language::Python,
            ProblemType::RubyMethod => Language::Ruby,
        }
    }

    /// Function and method problems are judged by a generated driver
    /// that compares literal return values, not program output.
    pub fn is_function_style(&self) -> bool {
        !matches!(
            self,
            ProblemType::CProgram | ProblemType::CPlusPlusProgram | ProblemType::JavaProgram
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProblemType::CProgram => "C_PROGRAM",
            ProblemType::CFunction => "C_FUNCTION",
            ProblemType::CPlusPlusProgram => "CPLUSPLUS_PROGRAM",
            ProblemType::CPlusPlusFunction => "CPLUSPLUS_FUNCTION",
            ProblemType::JavaProgram => "JAVA_PROGRAM",
            ProblemType::JavaMethod => "JAVA_METHOD",
            ProblemType::PythonFunction => "PYTHON_FUNCTION",
            ProblemType::RubyMethod => "RUBY_METHOD",
        }
    }
}

impl fmt::Display for ProblemType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProblemType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ProblemType::ALL
            .iter()
            .copied()
            .find(|ty| ty.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown problem type '{}'", s))
    }
}

/// How program output is compared against the expected output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputMatch {
    /// Trimmed, case-sensitive string equality.
    Exact,
    /// Expected output is a regular expression matched against each line.
    #[default]
    Regex,
}

/// Problem descriptor. Read-only inside the builder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Problem {
    pub problem_type: ProblemType,
    /// Function or method name for function-style problems.
    #[serde(default)]
    pub testname: String,
    /// Handlebars template replacing the built-in scaffolding.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scaffold_template: Option<String>,
    #[serde(default)]
    pub output_match: OutputMatch,
    /// Jar or shared library made available to the compiler and program.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_library: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_timeout_ms: Option<u64>,
}

impl Problem {
    pub fn new(problem_type: ProblemType, testname: impl Into<String>) -> Self {
        Self {
            problem_type,
            testname: testname.into(),
            scaffold_template: None,
            output_match: OutputMatch::default(),
            external_library: None,
            test_timeout_ms: None,
            total_timeout_ms: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestCase {
    pub name: String,
    pub input: String,
    pub expected_output: String,
    /// Secret test cases never reveal input or output to the student.
    #[serde(default)]
    pub secret: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl TestCase {
    pub fn new(
        name: impl Into<String>,
        input: impl Into<String>,
        expected_output: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            input: input.into(),
            expected_output: expected_output.into(),
            secret: false,
            timeout_ms: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TestOutcome {
    Passed,
    Failed,
    FailedWithException,
    FailedFromTimeout,
    FailedBySecurityManager,
    InternalError,
}

impl TestOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            TestOutcome::Passed => "PASSED",
            TestOutcome::Failed => "FAILED",
            TestOutcome::FailedWithException => "FAILED_WITH_EXCEPTION",
            TestOutcome::FailedFromTimeout => "FAILED_FROM_TIMEOUT",
            TestOutcome::FailedBySecurityManager => "FAILED_BY_SECURITY_MANAGER",
            TestOutcome::InternalError => "INTERNAL_ERROR",
        }
    }
}

impl fmt::Display for TestOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestResult {
    pub outcome: TestOutcome,
    pub message: String,
    pub stdout: String,
    pub stderr: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual_output: Option<String>,
    #[serde(default)]
    pub output_truncated: bool,
    pub elapsed_ms: u64,
}

impl TestResult {
    pub fn new(outcome: TestOutcome, message: impl Into<String>) -> Self {
        Self {
            outcome,
            message: message.into(),
            stdout: String::new(),
            stderr: String::new(),
            input: None,
            expected_output: None,
            actual_output: None,
            output_truncated: false,
            elapsed_ms: 0,
        }
    }

    pub fn passed(&self) -> bool {
        self.outcome == TestOutcome::Passed
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CompilationOutcome {
    Success,
    Failure,
    BuilderError,
    UnexpectedCompilerError,
}

impl CompilationOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompilationOutcome::Success => "SUCCESS",
            CompilationOutcome::Failure => "FAILURE",
            CompilationOutcome::BuilderError => "BUILDER_ERROR",
            CompilationOutcome::UnexpectedCompilerError => "UNEXPECTED_COMPILER_ERROR",
        }
    }
}

impl fmt::Display for CompilationOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Compiler diagnostic. Lines and columns are 1-based.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompilerDiagnostic {
    pub start_line: u32,
    pub end_line: u32,
    pub start_column: u32,
    pub end_column: u32,
    pub message: String,
}

impl CompilerDiagnostic {
    pub fn new(line: u32, column: u32, message: impl Into<String>) -> Self {
        Self {
            start_line: line,
            end_line: line,
            start_column: column,
            end_column: column,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompilationResult {
    pub outcome: CompilationOutcome,
    #[serde(default)]
    pub diagnostics: Vec<CompilerDiagnostic>,
}

impl CompilationResult {
    pub fn success() -> Self {
        Self {
            outcome: CompilationOutcome::Success,
            diagnostics: Vec::new(),
        }
    }

    pub fn failure(diagnostics: Vec<CompilerDiagnostic>) -> Self {
        Self {
            outcome: CompilationOutcome::Failure,
            diagnostics,
        }
    }

    pub fn with_outcome(outcome: CompilationOutcome, message: impl Into<String>) -> Self {
        Self {
            outcome,
            diagnostics: vec![CompilerDiagnostic::new(1, 1, message)],
        }
    }

    pub fn succeeded(&self) -> bool {
        self.outcome == CompilationOutcome::Success
    }
}

/// Verdict for one submission.
///
/// `test_results` is aligned positionally with the request's test cases.
/// It is empty when compilation failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmissionResult {
    pub compilation: CompilationResult,
    pub test_results: Vec<TestResult>,
    pub completed_at: DateTime<Utc>,
}

impl SubmissionResult {
    pub fn new(compilation: CompilationResult, test_results: Vec<TestResult>) -> Self {
        Self {
            compilation,
            test_results,
            completed_at: Utc::now(),
        }
    }

    pub fn compile_failure(compilation: CompilationResult) -> Self {
        Self::new(compilation, Vec::new())
    }

    /// Result for a submission the builder itself could not judge.
    /// One `INTERNAL_ERROR` per test case keeps the positional alignment.
    pub fn internal_error(test_cases: &[TestCase], message: impl Into<String>) -> Self {
        let message = message.into();
        let test_results = test_cases
            .iter()
            .map(|_| TestResult::new(TestOutcome::InternalError, message.clone()))
            .collect();
        Self::new(
            CompilationResult::with_outcome(CompilationOutcome::BuilderError, message),
            test_results,
        )
    }

    pub fn passed_count(&self) -> usize {
        self.test_results.iter().filter(|r| r.passed()).count()
    }

    pub fn all_passed(&self) -> bool {
        self.compilation.succeeded() && self.test_results.iter().all(TestResult::passed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmissionRequest {
    #[serde(default)]
    pub id: SubmissionId,
    pub problem: Problem,
    pub test_cases: Vec<TestCase>,
    pub program_text: String,
    #[serde(default = "Utc::now")]
    pub submitted_at: DateTime<Utc>,
}

impl SubmissionRequest {
    pub fn new(problem: Problem, test_cases: Vec<TestCase>, program_text: impl Into<String>) -> Self {
        Self {
            id: SubmissionId::new(),
            problem,
            test_cases,
            program_text: program_text.into(),
            submitted_at: Utc::now(),
        }
    }
}

/// A finished submission as published on the result channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletedSubmission {
    pub id: SubmissionId,
    pub result: SubmissionResult,
}
