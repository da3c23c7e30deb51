// CLI commands for batch judging and tester inspection
use anyhow::{bail, Context, Result};
use judgekit_builder::metrics::PoolMetrics;
use judgekit_builder::pool::SubmissionPool;
use judgekit_builder::tester::{Judge, TesterRegistry};
use judgekit_common::config::BuilderConfig;
use judgekit_common::types::{Problem, SubmissionRequest, SubmissionResult, TestCase};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// A problem with its test cases, as stored in an exercise file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Exercise {
    pub problem: Problem,
    pub test_cases: Vec<TestCase>,
}

/// Load an exercise file
pub fn load_exercise(path: &Path) -> Result<Exercise> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read exercise {}", path.display()))?;
    let exercise: Exercise = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse exercise {}", path.display()))?;
    if exercise.test_cases.is_empty() {
        bail!("Exercise {} has no test cases", path.display());
    }
    Ok(exercise)
}

/// Read a list of source files, one per line. Blank lines and `#` comments
/// are skipped; relative paths resolve against the list's directory.
pub fn read_source_list(path: &Path) -> Result<Vec<PathBuf>> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read source list {}", path.display()))?;
    let base = path.parent().unwrap_or_else(|| Path::new("."));

    Ok(content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(|line| base.join(line))
        .collect())
}

/// `<file>:<COMPILATION_OUTCOME>,<case>=<true|false>,...`
///
/// Cases without a result (e.g. after a compile failure) are `false`.
pub fn summary_line(file: &str, tests: &[TestCase], result: &SubmissionResult) -> String {
    let mut line = format!("{}:{}", file, result.compilation.outcome);
    for (index, test) in tests.iter().enumerate() {
        let passed = result
            .test_results
            .get(index)
            .map(|r| r.passed())
            .unwrap_or(false);
        let _ = write!(line, ",{}={}", test.name, passed);
    }
    line
}

/// Human-readable report for a submission that did not pass everything.
pub fn failure_report(file: &str, tests: &[TestCase], result: &SubmissionResult) -> Option<String> {
    if result.all_passed() {
        return None;
    }

    let mut report = format!("File: {}\n", file);
    if !result.compilation.succeeded() {
        report.push_str("Did not compile\n");
        for diagnostic in &result.compilation.diagnostics {
            let _ = writeln!(
                report,
                "  line {}:{}: {}",
                diagnostic.start_line, diagnostic.start_column, diagnostic.message
            );
        }
    }
    for (test, test_result) in tests.iter().zip(&result.test_results) {
        if test_result.passed() {
            continue;
        }
        let _ = writeln!(report, "{}: {}", test.name, test_result.message);
        if !test_result.stdout.is_empty() {
            report.push_str(&test_result.stdout);
            if !test_result.stdout.ends_with('\n') {
                report.push('\n');
            }
        }
    }
    Some(report)
}

/// Judge every source against the exercise and print one summary line per
/// source, in input order. Returns whether every submission passed.
pub async fn run_batch(exercise_path: &Path, sources: &[PathBuf], config: BuilderConfig) -> Result<bool> {
    let exercise = load_exercise(exercise_path)?;
    let registry = TesterRegistry::load(config.testers_path.as_deref()).context("Invalid tester mapping")?;

    let config = Arc::new(config);
    let judge = Arc::new(Judge::new(Arc::new(registry), Arc::clone(&config)));
    let metrics = Arc::new(PoolMetrics::new(&prometheus::Registry::new())?);
    let (pool, mut completions) = SubmissionPool::start(judge, &config, Arc::clone(&metrics));
    info!(
        problem_type = %exercise.problem.problem_type,
        sources = sources.len(),
        test_cases = exercise.test_cases.len(),
        "judging batch"
    );

    let mut pending = Vec::with_capacity(sources.len());
    for source in sources {
        let program_text = fs::read_to_string(source)
            .with_context(|| format!("Failed to read source {}", source.display()))?;
        let request = SubmissionRequest::new(exercise.problem.clone(), exercise.test_cases.clone(), program_text);
        let id = pool.submit(request).await?;
        pending.push((source, id));
    }

    let mut results = HashMap::with_capacity(pending.len());
    while results.len() < pending.len() {
        let Some(completed) = completions.recv().await else {
            bail!("Worker pool stopped before all submissions finished");
        };
        results.insert(completed.id, completed.result);
    }
    pool.shutdown(Duration::from_secs(1)).await;
    info!(completed = metrics.snapshot().completed, "batch finished");

    let mut all_passed = true;
    for (source, id) in &pending {
        let file = source.display().to_string();
        let Some(result) = results.get(id) else {
            bail!("No result for {}", file);
        };
        println!("{}", summary_line(&file, &exercise.test_cases, result));
        if let Some(report) = failure_report(&file, &exercise.test_cases, result) {
            eprint!("{}", report);
            all_passed = false;
        }
    }
    Ok(all_passed)
}

/// Step sequence of every problem type, one per line.
pub fn list_testers(path: Option<&Path>) -> Result<String> {
    let registry = TesterRegistry::load(path).context("Invalid tester mapping")?;
    let mut listing = String::new();
    for (problem_type, steps) in registry.sequences() {
        let _ = writeln!(listing, "{}: {}", problem_type, steps.join(" -> "));
    }
    Ok(listing)
}
