/// Sandboxed Executor - Run One Untrusted Process Under Limits
///
/// **Core Responsibility:**
/// Spawn a single command, feed it stdin, capture bounded output, and
/// classify how it ended.
///
/// **Isolation Layers (when the sandbox is enabled):**
/// - Own process group, killed as a whole on deadline or exit
/// - Parent-death signal so nothing outlives the worker
/// - rlimits: CPU seconds, address space, file size, stack, open files
/// - seccomp-BPF syscall policy chosen by the command's profile
/// - Optional preload allocator with a fixed heap for native code
///
/// With the sandbox disabled only the deadline and group kill remain.

pub mod capture;
pub mod executor;
pub mod limits;
pub mod seccomp;

pub use capture::CapturedOutput;
pub use executor::{ExecutionReport, ExitClassification, LimitKind, SandboxedExecutor};

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("sandbox admission is closed")]
    AdmissionClosed,
}

/// Which system calls a sandboxed process may make.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyscallPolicy {
    /// No filter. Only for trusted toolchain processes.
    Unrestricted,
    /// Threads allowed; new processes, sockets and tracing are fatal.
    NoSubprocess,
    /// Like `NoSubprocess`, and thread creation is fatal too.
    SingleProcess,
}

/// Kind of process being launched. Drives limits and syscall policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxProfile {
    /// Compilers and syntax checkers.
    Toolchain,
    /// Natively compiled candidate program.
    Native,
    /// Candidate script run by an interpreter.
    Interpreter,
    /// Candidate bytecode run by the JVM; memory bounded by `-Xmx`.
    Jvm,
}

impl SandboxProfile {
    pub fn syscall_policy(&self) -> SyscallPolicy {
        match self {
            SandboxProfile::Toolchain => SyscallPolicy::Unrestricted,
            SandboxProfile::Native => SyscallPolicy::SingleProcess,
            SandboxProfile::Interpreter | SandboxProfile::Jvm => SyscallPolicy::NoSubprocess,
        }
    }

    /// Runtimes that report an uncaught exception through a non-zero exit.
    pub fn reports_exceptions_by_exit(&self) -> bool {
        matches!(self, SandboxProfile::Interpreter | SandboxProfile::Jvm)
    }
}

/// An executable invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    pub env: Vec<(String, String)>,
    /// Exported as `LD_LIBRARY_PATH`.
    pub library_path: Vec<PathBuf>,
    /// Exported as `CLASSPATH`.
    pub classpath: Vec<PathBuf>,
    pub profile: SandboxProfile,
}

impl Command {
    pub fn new(
        program: impl Into<String>,
        working_dir: impl Into<PathBuf>,
        profile: SandboxProfile,
    ) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: working_dir.into(),
            env: Vec::new(),
            library_path: Vec::new(),
            classpath: Vec::new(),
            profile,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn library_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.library_path.push(path.into());
        self
    }

    pub fn classpath(mut self, path: impl Into<PathBuf>) -> Self {
        self.classpath.push(path.into());
        self
    }

    /// Shell-like rendering for logs.
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}
