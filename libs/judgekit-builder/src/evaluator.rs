/// Test Evaluator - Turn Command Results into Test Results
///
/// **Core Responsibility:**
/// Decide the outcome of one test case from how its command ended and
/// what it printed, and build the student-facing [`TestResult`].
///
/// **Critical Properties:**
/// - Knows nothing about processes or sandboxes, only their classified results
/// - Pure functions: (problem, test case, command result) → test result
/// - Abnormal exits are classified before any output comparison
/// - Secret test cases never reveal input, expected output or captured output
///
/// **Output Matching Rules:**
/// - `Exact`: leading and trailing whitespace trimmed, case-sensitive
/// - `Regex`: the expected output is a pattern that must match a whole
///   line of stdout. A trailing `$i` makes it case-insensitive, `$j`
///   joins all output lines with single spaces first. Empty stdout is
///   one empty line.

use crate::sandbox::executor::signal_name;
use crate::sandbox::{ExitClassification, LimitKind};
use crate::steps::artifacts::{CommandResult, SecretCodes, UNKNOWN_TEST_EXIT};
use judgekit_common::types::{OutputMatch, Problem, TestCase, TestOutcome, TestResult};
use regex::{Regex, RegexBuilder};
use std::sync::OnceLock;
use tracing::warn;

pub const SECRET_OUTPUT: &str = "Secret test - output is not revealed";

pub const TIMEOUT_MESSAGE: &str =
    "Took too long! Check for infinite loops, or recursion without a proper base case";

pub const NOT_STARTED_MESSAGE: &str =
    "Not run: the time limit for the whole submission was exceeded";

/// Normalize output string for comparison
///
/// **Normalization Rules:**
/// - Trim leading whitespace
/// - Trim trailing whitespace
/// - Removes differences in line endings (\r\n vs \n) at the ends
///
/// **Preserves:**
/// - Internal whitespace
/// - Case sensitivity
pub fn normalize_output(output: &str) -> &str {
    output.trim()
}

pub fn short_message(outcome: TestOutcome) -> &'static str {
    match outcome {
        TestOutcome::Passed => "Passed",
        TestOutcome::Failed => "Failed",
        TestOutcome::FailedWithException => "Failed with exception",
        TestOutcome::FailedFromTimeout => "Failed from timeout",
        TestOutcome::FailedBySecurityManager => "Failed by security manager",
        TestOutcome::InternalError => "Internal error",
    }
}

fn regex_options() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\$([ij]+)$").expect("regex option pattern is valid"))
}

/// Expected output parsed as a line pattern.
#[derive(Debug, Clone)]
pub struct OutputPattern {
    regex: Regex,
    join_lines: bool,
}

impl OutputPattern {
    pub fn parse(expected: &str) -> Result<Self, regex::Error> {
        let (body, options) = match regex_options().captures(expected) {
            Some(caps) => {
                let start = caps.get(0).map_or(expected.len(), |m| m.start());
                (&expected[..start], caps[1].to_string())
            }
            None => (expected, String::new()),
        };

        // Anchored so the pattern must cover the whole line.
        let regex = RegexBuilder::new(&format!("^(?:{})$", body))
            .case_insensitive(options.contains('i'))
            .build()?;

        Ok(Self {
            regex,
            join_lines: options.contains('j'),
        })
    }

    /// True when some line of `stdout` matches.
    pub fn matches(&self, stdout: &str) -> bool {
        let mut lines: Vec<&str> = stdout.lines().collect();
        if lines.is_empty() {
            lines.push("");
        }
        if self.join_lines {
            let joined = lines.join(" ");
            return self.regex.is_match(&joined);
        }
        lines.iter().any(|line| self.regex.is_match(line))
    }
}

/// Compare program output with the expected output.
pub fn output_matches(mode: OutputMatch, expected: &str, stdout: &str) -> Result<bool, regex::Error> {
    match mode {
        OutputMatch::Exact => Ok(normalize_output(stdout) == normalize_output(expected)),
        OutputMatch::Regex => Ok(OutputPattern::parse(expected)?.matches(stdout)),
    }
}

/// Outcome and detail for a command that did not exit normally.
pub fn classify_abnormal(result: &CommandResult) -> Option<(TestOutcome, String)> {
    if result.not_started {
        return Some((TestOutcome::FailedFromTimeout, NOT_STARTED_MESSAGE.to_string()));
    }
    match &result.classification {
        ExitClassification::Exited(_) => None,
        ExitClassification::LimitExceeded(LimitKind::WallClock | LimitKind::CpuTime) => {
            Some((TestOutcome::FailedFromTimeout, TIMEOUT_MESSAGE.to_string()))
        }
        ExitClassification::LimitExceeded(LimitKind::FileSize) => Some((
            TestOutcome::FailedBySecurityManager,
            "File size limit exceeded".to_string(),
        )),
        ExitClassification::SecurityViolation => Some((
            TestOutcome::FailedBySecurityManager,
            "Program attempted a forbidden operation".to_string(),
        )),
        ExitClassification::Signaled(sig) => Some((
            TestOutcome::FailedWithException,
            format!("Program terminated by {}", signal_name(*sig)),
        )),
        ExitClassification::SetupFailure(reason) => {
            warn!(reason = %reason, "test command could not be run");
            Some((TestOutcome::InternalError, "The test failed to execute".to_string()))
        }
    }
}

/// Build the student-facing result for one test case.
///
/// ## Arguments
/// * `detail` - why the command ended abnormally, appended to the message
/// * `command` - source of captured output, if the test ran
/// * `actual` - the value the program produced, if known
pub fn build_result(
    outcome: TestOutcome,
    detail: Option<&str>,
    problem: &Problem,
    test: &TestCase,
    command: Option<&CommandResult>,
    actual: Option<&str>,
) -> TestResult {
    let literal = problem.problem_type.is_function_style();
    let mut message = short_message(outcome).to_string();

    if !test.secret {
        message.push_str(&format!(" for input ({})", test.input));
        if literal {
            message.push_str(&format!(", expected output={}", test.expected_output));
            if let Some(actual) = actual.filter(|_| outcome != TestOutcome::Passed) {
                message.push_str(&format!(", actual output={}", actual));
            }
        }
    }
    if let Some(detail) = detail {
        message.push_str(" - ");
        message.push_str(detail);
    }

    let mut result = TestResult::new(outcome, message);
    if !test.secret {
        result.input = Some(test.input.clone());
        result.expected_output = Some(test.expected_output.clone());
        result.actual_output = actual.map(str::to_string);
    }

    if let Some(command) = command {
        result.elapsed_ms = command.elapsed_ms;
        result.output_truncated = command.stdout.truncated || command.stderr.truncated;
        if test.secret {
            result.stdout = SECRET_OUTPUT.to_string();
            result.stderr = SECRET_OUTPUT.to_string();
        } else {
            result.stdout = command.stdout.text.clone();
            result.stderr = command.stderr.text.clone();
        }
    }

    result
}

/// Evaluate a program problem: classify the exit, then compare stdout.
pub fn evaluate_output(problem: &Problem, test: &TestCase, command: &CommandResult) -> TestResult {
    if let Some((outcome, detail)) = classify_abnormal(command) {
        return build_result(outcome, Some(&detail), problem, test, Some(command), None);
    }

    let actual = normalize_output(&command.stdout.text);
    if let ExitClassification::Exited(code) = command.classification {
        if code != 0 && command.profile.reports_exceptions_by_exit() {
            let detail = format!("exit code {}", code);
            return build_result(
                TestOutcome::FailedWithException,
                Some(&detail),
                problem,
                test,
                Some(command),
                Some(actual),
            );
        }
    }

    match output_matches(problem.output_match, &test.expected_output, &command.stdout.text) {
        Ok(true) => build_result(TestOutcome::Passed, None, problem, test, Some(command), Some(actual)),
        Ok(false) => build_result(TestOutcome::Failed, None, problem, test, Some(command), Some(actual)),
        Err(e) => {
            warn!(test_case = %test.name, error = %e, "expected output is not a valid pattern");
            build_result(
                TestOutcome::InternalError,
                Some("expected output is not a valid pattern"),
                problem,
                test,
                Some(command),
                None,
            )
        }
    }
}

/// Evaluate a function problem run through a generated driver.
///
/// The driver's exit code carries the verdict; the last line of stdout is
/// the value the function returned.
pub fn evaluate_function(
    problem: &Problem,
    test: &TestCase,
    command: &CommandResult,
    codes: SecretCodes,
) -> TestResult {
    if let Some((outcome, detail)) = classify_abnormal(command) {
        return build_result(outcome, Some(&detail), problem, test, Some(command), None);
    }

    let actual = command.stdout.text.lines().last().map(str::trim_end);
    let code = match command.classification {
        ExitClassification::Exited(code) => code,
        _ => return build_result(TestOutcome::InternalError, None, problem, test, Some(command), None),
    };

    if code == codes.success {
        build_result(TestOutcome::Passed, None, problem, test, Some(command), actual)
    } else if code == codes.failure {
        build_result(TestOutcome::Failed, None, problem, test, Some(command), actual)
    } else if code == UNKNOWN_TEST_EXIT {
        warn!(test_case = %test.name, "driver did not recognise the test case");
        build_result(
            TestOutcome::InternalError,
            Some("The test failed to execute"),
            problem,
            test,
            Some(command),
            None,
        )
    } else {
        let detail = format!("exit code {}", code);
        build_result(
            TestOutcome::FailedWithException,
            Some(&detail),
            problem,
            test,
            Some(command),
            None,
        )
    }
}
