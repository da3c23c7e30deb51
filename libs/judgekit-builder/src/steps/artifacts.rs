// Artifact types passed between build steps.

use crate::sandbox::{CapturedOutput, ExecutionReport, ExitClassification, LimitKind, SandboxProfile};
use std::io;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Program text plus the number of scaffolding lines wrapped around the
/// student's code, used to map diagnostics back to the original lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgramSource {
    pub text: String,
    pub prologue_lines: u32,
    pub epilogue_lines: u32,
}

impl ProgramSource {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            prologue_lines: 0,
            epilogue_lines: 0,
        }
    }

    pub fn wrapped(text: impl Into<String>, prologue_lines: u32, epilogue_lines: u32) -> Self {
        Self {
            text: text.into(),
            prologue_lines,
            epilogue_lines,
        }
    }

    fn line_count(&self) -> u32 {
        self.text.lines().count() as u32
    }

    /// Map a line of the full text to a line of the student's code.
    /// Lines inside the scaffolding clamp to the first or last student line.
    pub fn original_line(&self, line: u32) -> u32 {
        let student_lines = self
            .line_count()
            .saturating_sub(self.prologue_lines + self.epilogue_lines)
            .max(1);
        line.saturating_sub(self.prologue_lines).clamp(1, student_lines)
    }
}

/// Scratch directory for one run. Removed when the artifact store drops.
#[derive(Debug)]
pub struct Workspace {
    dir: TempDir,
}

impl Workspace {
    pub fn create(parent: &Path) -> io::Result<Self> {
        std::fs::create_dir_all(parent)?;
        let dir = tempfile::Builder::new().prefix("judgekit-").tempdir_in(parent)?;
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }
}

/// What compilation produced and how to launch it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Executable {
    Native {
        path: PathBuf,
    },
    Jvm {
        class_dir: PathBuf,
        main_class: String,
    },
    Script {
        interpreter: String,
        flags: Vec<String>,
        path: PathBuf,
    },
}

/// Exit codes the generated driver uses to report pass or fail.
/// Chosen per submission so candidate code cannot guess them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SecretCodes {
    pub success: i32,
    pub failure: i32,
}

/// Driver exit code for a test name it does not know.
pub const UNKNOWN_TEST_EXIT: i32 = 99;

impl SecretCodes {
    pub fn generate() -> Self {
        // 2..=97 stays clear of 0, 1 and UNKNOWN_TEST_EXIT.
        let bytes = uuid::Uuid::new_v4().into_bytes();
        let success = 2 + i32::from(bytes[0] % 96);
        let mut failure = 2 + i32::from(bytes[1] % 96);
        if failure == success {
            failure = 2 + (failure - 1) % 96;
        }
        Self { success, failure }
    }
}

/// A jar or shared library made available to compiler and program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalLibrary {
    pub path: PathBuf,
}

/// Text written to a command's stdin.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommandInput(pub String);

/// Outcome of running one test command.
#[derive(Debug, Clone)]
pub struct CommandResult {
    pub classification: ExitClassification,
    pub stdout: CapturedOutput,
    pub stderr: CapturedOutput,
    pub elapsed_ms: u64,
    pub profile: SandboxProfile,
    /// The batch deadline expired before this command could start.
    pub not_started: bool,
}

impl CommandResult {
    pub fn from_report(report: ExecutionReport, profile: SandboxProfile) -> Self {
        Self {
            classification: report.classification,
            stdout: report.stdout,
            stderr: report.stderr,
            elapsed_ms: report.elapsed.as_millis() as u64,
            profile,
            not_started: false,
        }
    }

    /// A result synthesized without output, e.g. after a forced kill.
    pub fn synthesized(classification: ExitClassification, elapsed_ms: u64, profile: SandboxProfile) -> Self {
        Self {
            classification,
            stdout: CapturedOutput::default(),
            stderr: CapturedOutput::default(),
            elapsed_ms,
            profile,
            not_started: false,
        }
    }

    pub fn not_started(profile: SandboxProfile) -> Self {
        Self {
            not_started: true,
            ..Self::synthesized(ExitClassification::LimitExceeded(LimitKind::WallClock), 0, profile)
        }
    }
}
