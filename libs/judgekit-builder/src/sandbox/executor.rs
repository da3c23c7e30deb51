use super::capture::{capture, CapturedOutput};
use super::limits::ResourceLimits;
use super::{seccomp, Command, SandboxError, SandboxProfile};
use judgekit_common::config::BuilderConfig;
use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::ffi::OsString;
use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::process::Child;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, instrument, warn};

const DEFAULT_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

/// How long to wait for output pipes to close once the group is dead.
const DRAIN_GRACE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitKind {
    WallClock,
    CpuTime,
    FileSize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitClassification {
    Exited(i32),
    LimitExceeded(LimitKind),
    /// Killed by the syscall filter.
    SecurityViolation,
    Signaled(i32),
    /// The process could not be started or observed.
    SetupFailure(String),
}

#[derive(Debug, Clone)]
pub struct ExecutionReport {
    pub classification: ExitClassification,
    pub stdout: CapturedOutput,
    pub stderr: CapturedOutput,
    pub elapsed: Duration,
}

impl ExecutionReport {
    pub fn setup_failure(reason: impl Into<String>, elapsed: Duration) -> Self {
        Self {
            classification: ExitClassification::SetupFailure(reason.into()),
            stdout: CapturedOutput::default(),
            stderr: CapturedOutput::default(),
            elapsed,
        }
    }

    pub fn exit_code(&self) -> Option<i32> {
        match self.classification {
            ExitClassification::Exited(code) => Some(code),
            _ => None,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.exit_code() == Some(0)
    }
}

/// Kills the whole process group unless disarmed. Covers the case where
/// the future driving a run is dropped before the child is reaped.
struct ProcessGroup {
    pgid: Option<Pid>,
}

impl ProcessGroup {
    fn new(pid: Option<u32>) -> Self {
        Self {
            pgid: pid.map(|pid| Pid::from_raw(pid as i32)),
        }
    }

    fn kill(&self) {
        let Some(pgid) = self.pgid else { return };
        match killpg(pgid, Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(e) => warn!(pgid = pgid.as_raw(), error = %e, "failed to kill process group"),
        }
    }

    fn disarm(mut self) {
        self.pgid = None;
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        self.kill();
    }
}

/// Runs commands one process at a time, bounded by a shared admission
/// semaphore across all callers.
pub struct SandboxedExecutor {
    config: Arc<BuilderConfig>,
    permits: Arc<Semaphore>,
    capacity: usize,
}

impl SandboxedExecutor {
    pub fn new(config: Arc<BuilderConfig>) -> Self {
        let capacity = config.sandbox_permits();
        Self {
            config,
            permits: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    pub fn config(&self) -> &BuilderConfig {
        &self.config
    }

    /// Sandboxes currently running.
    pub fn in_flight(&self) -> usize {
        self.capacity - self.permits.available_permits()
    }

    /// The admission semaphore, for callers that want to wait for a slot
    /// before starting their own clock. Pair with [`Self::run_admitted`].
    pub fn admission(&self) -> Arc<Semaphore> {
        Arc::clone(&self.permits)
    }

    /// Run `command` with `stdin` as input, killing it after `deadline`.
    ///
    /// Never fails: problems starting the process are reported as
    /// [`ExitClassification::SetupFailure`].
    pub async fn run(&self, command: &Command, stdin: &str, deadline: Duration) -> ExecutionReport {
        let _permit = match self.permits.acquire().await {
            Ok(permit) => permit,
            Err(_) => {
                return ExecutionReport::setup_failure(
                    SandboxError::AdmissionClosed.to_string(),
                    Duration::ZERO,
                )
            }
        };
        self.run_admitted(command, stdin, deadline).await
    }

    /// Like [`Self::run`], for a caller already holding a permit from
    /// [`Self::admission`].
    #[instrument(skip_all, fields(program = %command.program, deadline_ms = deadline.as_millis() as u64))]
    pub async fn run_admitted(&self, command: &Command, stdin: &str, deadline: Duration) -> ExecutionReport {
        let started = Instant::now();
        let mut child = match self.spawn(command) {
            Ok(child) => child,
            Err(e) => {
                warn!(error = %e, "sandbox setup failed");
                return ExecutionReport::setup_failure(e.to_string(), started.elapsed());
            }
        };
        let group = ProcessGroup::new(child.id());

        let feeder = child.stdin.take().map(|mut pipe| {
            let input = stdin.as_bytes().to_vec();
            tokio::spawn(async move {
                if let Err(e) = pipe.write_all(&input).await {
                    debug!(error = %e, "stdin not fully consumed");
                }
            })
        });
        let limits = self.config.output;
        let stdout = child.stdout.take().map(|out| tokio::spawn(capture(out, limits)));
        let stderr = child.stderr.take().map(|err| tokio::spawn(capture(err, limits)));

        let mut timed_out = false;
        let status = match tokio::time::timeout(deadline, child.wait()).await {
            Ok(Ok(status)) => Some(status),
            Ok(Err(e)) => {
                warn!(error = %e, "failed to wait for sandboxed process");
                group.kill();
                child.wait().await.ok()
            }
            Err(_) => {
                timed_out = true;
                debug!("deadline expired, killing process group");
                group.kill();
                child.wait().await.ok()
            }
        };
        let elapsed = started.elapsed();

        // Anything the program left behind in its group goes too.
        group.kill();
        group.disarm();
        if let Some(feeder) = feeder {
            feeder.abort();
        }

        let stdout = drain(stdout).await;
        let stderr = drain(stderr).await;
        let classification = classify(status, timed_out, self.config.sandbox_enabled);

        debug!(
            classification = ?classification,
            elapsed_ms = elapsed.as_millis() as u64,
            stdout_truncated = stdout.truncated,
            "sandboxed process finished"
        );

        ExecutionReport {
            classification,
            stdout,
            stderr,
            elapsed,
        }
    }

    fn spawn(&self, command: &Command) -> Result<Child, SandboxError> {
        let mut cmd = tokio::process::Command::new(&command.program);
        cmd.args(&command.args)
            .current_dir(&command.working_dir)
            .env_clear()
            .env("PATH", DEFAULT_PATH)
            .env("LANG", "C.UTF-8")
            .env("HOME", &command.working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .process_group(0);

        if !command.library_path.is_empty() {
            cmd.env("LD_LIBRARY_PATH", join_paths(&command.library_path));
        }
        if !command.classpath.is_empty() {
            cmd.env("CLASSPATH", join_paths(&command.classpath));
        }
        for (key, value) in &command.env {
            cmd.env(key, value);
        }

        if self.config.sandbox_enabled {
            if command.profile == SandboxProfile::Native {
                if let Some(preload) = &self.config.preload_library {
                    cmd.env("LD_PRELOAD", preload);
                    cmd.env("EASYSANDBOX_HEAPSIZE", self.config.heap_size_bytes.to_string());
                }
            }
            let limits = ResourceLimits::for_profile(&self.config, command.profile);
            let filter = seccomp::build_filter(command.profile.syscall_policy());
            // SAFETY: the closure only makes async-signal-safe syscalls and
            // does not allocate; the filter was built before fork.
            unsafe {
                cmd.pre_exec(move || {
                    nix::sys::prctl::set_pdeathsig(Signal::SIGKILL)?;
                    limits.apply()?;
                    if let Some(filter) = &filter {
                        seccomp::install(filter)?;
                    }
                    Ok(())
                });
            }
        } else {
            // SAFETY: prctl is async-signal-safe.
            unsafe {
                cmd.pre_exec(|| {
                    nix::sys::prctl::set_pdeathsig(Signal::SIGKILL)?;
                    Ok(())
                });
            }
        }

        cmd.spawn().map_err(|source| SandboxError::Spawn {
            program: command.program.clone(),
            source,
        })
    }
}

fn join_paths(paths: &[std::path::PathBuf]) -> OsString {
    let mut joined = OsString::new();
    for (index, path) in paths.iter().enumerate() {
        if index > 0 {
            joined.push(":");
        }
        joined.push(path);
    }
    joined
}

async fn drain(handle: Option<JoinHandle<CapturedOutput>>) -> CapturedOutput {
    let Some(mut handle) = handle else {
        return CapturedOutput::default();
    };
    match tokio::time::timeout(DRAIN_GRACE, &mut handle).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => {
            warn!(error = %e, "output capture task failed");
            CapturedOutput::lost()
        }
        Err(_) => {
            handle.abort();
            warn!("output pipe still open after process group was killed");
            CapturedOutput::lost()
        }
    }
}

fn classify(status: Option<ExitStatus>, timed_out: bool, sandboxed: bool) -> ExitClassification {
    if timed_out {
        return ExitClassification::LimitExceeded(LimitKind::WallClock);
    }
    let Some(status) = status else {
        return ExitClassification::SetupFailure("exit status unavailable".to_string());
    };
    if let Some(code) = status.code() {
        return ExitClassification::Exited(code);
    }
    match status.signal() {
        // SIGKILL without a wall-clock timeout comes from the CPU hard limit.
        Some(sig) if sandboxed && (sig == libc::SIGXCPU || sig == libc::SIGKILL) => {
            ExitClassification::LimitExceeded(LimitKind::CpuTime)
        }
        Some(libc::SIGXFSZ) => ExitClassification::LimitExceeded(LimitKind::FileSize),
        Some(libc::SIGSYS) if sandboxed => ExitClassification::SecurityViolation,
        Some(sig) => ExitClassification::Signaled(sig),
        None => ExitClassification::SetupFailure(format!("unrecognised exit status {status}")),
    }
}

/// Human-readable signal name, e.g. `SIGSEGV`.
pub fn signal_name(sig: i32) -> String {
    Signal::try_from(sig)
        .map(|s| s.as_str().to_string())
        .unwrap_or_else(|_| format!("signal {}", sig))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn executor(sandbox_enabled: bool) -> SandboxedExecutor {
        let config = BuilderConfig {
            sandbox_enabled,
            ..BuilderConfig::default()
        };
        SandboxedExecutor::new(Arc::new(config))
    }

    fn sh(script: &str, profile: SandboxProfile) -> Command {
        Command::new("/bin/sh", std::env::temp_dir(), profile).args(["-c", script])
    }

    /// A pid counts as gone once it no longer exists or is a zombie.
    fn process_alive(pid: i32) -> bool {
        match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
            Ok(stat) => {
                let state = stat
                    .rsplit_once(')')
                    .and_then(|(_, rest)| rest.trim_start().chars().next());
                !matches!(state, Some('Z') | Some('X') | None)
            }
            Err(_) => false,
        }
    }

    #[tokio::test]
    async fn test_run_echoes_stdin() {
        let report = executor(false)
            .run(
                &sh("read x; echo \"got $x\"", SandboxProfile::Native),
                "42\n",
                Duration::from_secs(5),
            )
            .await;

        assert_eq!(report.classification, ExitClassification::Exited(0));
        assert_eq!(report.stdout.text, "got 42\n");
        assert!(report.succeeded());
    }

    #[tokio::test]
    async fn test_run_reports_exit_code_and_stderr() {
        let report = executor(false)
            .run(&sh("echo oops >&2; exit 3", SandboxProfile::Native), "", Duration::from_secs(5))
            .await;

        assert_eq!(report.exit_code(), Some(3));
        assert_eq!(report.stderr.text, "oops\n");
    }

    #[tokio::test]
    async fn test_infinite_loop_hits_wall_clock() {
        let deadline = Duration::from_millis(300);
        let report = executor(false)
            .run(&sh("while :; do :; done", SandboxProfile::Native), "", deadline)
            .await;

        assert_eq!(
            report.classification,
            ExitClassification::LimitExceeded(LimitKind::WallClock)
        );
        assert!(report.elapsed < deadline + Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_timeout_kills_background_children() {
        let report = executor(false)
            .run(
                &sh("sleep 30 & echo $!; wait", SandboxProfile::Native),
                "",
                Duration::from_millis(300),
            )
            .await;

        assert_eq!(
            report.classification,
            ExitClassification::LimitExceeded(LimitKind::WallClock)
        );
        let pid: i32 = report.stdout.text.trim().parse().unwrap();
        let mut alive = process_alive(pid);
        for _ in 0..20 {
            if !alive {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
            alive = process_alive(pid);
        }
        assert!(!alive, "background child {pid} survived the sandbox");
    }

    #[tokio::test]
    async fn test_output_is_truncated() {
        let script = "i=0; while [ $i -lt 200 ]; do echo line$i; i=$((i+1)); done";
        let report = executor(false)
            .run(&sh(script, SandboxProfile::Native), "", Duration::from_secs(5))
            .await;

        assert!(report.stdout.truncated);
        assert_eq!(report.stdout.text.lines().count(), 50);
        assert_eq!(report.stdout.text.lines().next(), Some("line0"));
    }

    #[tokio::test]
    async fn test_missing_program_is_setup_failure() {
        let command = Command::new(
            "/nonexistent/judgekit-program",
            PathBuf::from("/"),
            SandboxProfile::Native,
        );
        let report = executor(false).run(&command, "", Duration::from_secs(1)).await;

        assert!(matches!(report.classification, ExitClassification::SetupFailure(_)));
    }

    #[tokio::test]
    async fn test_fatal_signal_is_reported() {
        let report = executor(false)
            .run(&sh("kill -TERM $$", SandboxProfile::Native), "", Duration::from_secs(5))
            .await;

        assert_eq!(report.classification, ExitClassification::Signaled(libc::SIGTERM));
        assert_eq!(signal_name(libc::SIGSEGV), "SIGSEGV");
    }

    #[tokio::test]
    async fn test_permits_released_after_run() {
        let executor = executor(false);
        executor
            .run(&sh("true", SandboxProfile::Native), "", Duration::from_secs(5))
            .await;
        assert_eq!(executor.in_flight(), 0);
    }

    #[tokio::test]
    #[ignore] // Requires seccomp support in the host kernel
    async fn test_subprocess_is_security_violation() {
        let report = executor(true)
            .run(&sh("/bin/true; echo done", SandboxProfile::Native), "", Duration::from_secs(5))
            .await;

        assert_eq!(report.classification, ExitClassification::SecurityViolation);
        assert!(report.stdout.text.is_empty());
    }

    #[tokio::test]
    #[ignore] // Requires seccomp support in the host kernel
    async fn test_cpu_limit_is_enforced() {
        let config = BuilderConfig {
            cpu_time_secs: 1,
            ..BuilderConfig::default()
        };
        let executor = SandboxedExecutor::new(Arc::new(config));
        let report = executor
            .run(&sh("while :; do :; done", SandboxProfile::Native), "", Duration::from_secs(10))
            .await;

        assert_eq!(
            report.classification,
            ExitClassification::LimitExceeded(LimitKind::CpuTime)
        );
    }

    #[test]
    fn test_classify_timeout_wins() {
        let status = ExitStatus::from_raw(0);
        assert_eq!(
            classify(Some(status), true, true),
            ExitClassification::LimitExceeded(LimitKind::WallClock)
        );
    }

    #[test]
    fn test_classify_signals() {
        let by_signal = |sig: i32| ExitStatus::from_raw(sig);
        assert_eq!(
            classify(Some(by_signal(libc::SIGXCPU)), false, true),
            ExitClassification::LimitExceeded(LimitKind::CpuTime)
        );
        assert_eq!(
            classify(Some(by_signal(libc::SIGXFSZ)), false, true),
            ExitClassification::LimitExceeded(LimitKind::FileSize)
        );
        assert_eq!(
            classify(Some(by_signal(libc::SIGSYS)), false, true),
            ExitClassification::SecurityViolation
        );
        assert_eq!(
            classify(Some(by_signal(libc::SIGSYS)), false, false),
            ExitClassification::Signaled(libc::SIGSYS)
        );
        assert_eq!(
            classify(Some(by_signal(libc::SIGKILL)), false, false),
            ExitClassification::Signaled(libc::SIGKILL)
        );
    }

    #[test]
    fn test_classify_exit_code() {
        // wait(2) encodes exit codes in the high byte.
        let status = ExitStatus::from_raw(7 << 8);
        assert_eq!(classify(Some(status), false, true), ExitClassification::Exited(7));
    }
}
