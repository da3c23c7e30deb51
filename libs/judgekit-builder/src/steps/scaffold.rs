/// Function Scaffolding - Wrap a Student Function in a Test Driver
///
/// **Core Responsibility:**
/// Turn a bare function or method into a runnable program whose entry point
/// is `<program> <test-name>`, with `<success-code> <failure-code>` as the
/// first line of stdin.
///
/// The driver reads the codes before any student code gets control, so they
/// never appear in argv, `/proc/<pid>/cmdline` or the environment, and stdin
/// is exhausted by the time the function runs. It then calls the function
/// with the test case input, prints the actual value on stdout and exits
/// with the success code when it equals the expected value, the failure
/// code otherwise. An unknown test name or missing codes exit with
/// [`UNKNOWN_TEST_EXIT`].
///
/// Templates are rendered with a sentinel in place of the student code, so
/// the number of lines the driver adds before the code is known exactly and
/// diagnostics can be mapped back.

use super::artifacts::{ProgramSource, SecretCodes, UNKNOWN_TEST_EXIT};
use crate::artifact::{ArtifactKind, ArtifactStore};
use crate::error::PipelineError;
use crate::step::{BuildContext, BuildStep, StepFlow};
use async_trait::async_trait;
use handlebars::Handlebars;
use judgekit_common::types::{Language, Problem, TestCase};
use regex::Regex;
use serde_json::json;
use std::sync::OnceLock;
use tracing::debug;

const SOURCE_SENTINEL: &str = "__JUDGEKIT_STUDENT_SOURCE__";

const C_TEMPLATE: &str = r#"#include <string.h>
#include <stdlib.h>
#include <stdio.h>
{{source}}
#define eq(a,b) ((a) == (b))
#ifdef __cplusplus
#include <iostream>
#define judgekit_print(x) (std::cout << (x) << std::endl)
#else
static void judgekit_print_int(long long v) { printf("%lld\n", v); }
static void judgekit_print_uint(unsigned long long v) { printf("%llu\n", v); }
static void judgekit_print_double(double v) { printf("%g\n", v); }
static void judgekit_print_char(int v) { printf("%c\n", v); }
static void judgekit_print_str(const char *v) { printf("%s\n", v ? v : "(null)"); }
static void judgekit_print_none(int v) { (void) v; }
#define judgekit_value(x) _Generic((x), \
    char: (x), short: (x), int: (x), long: (x), long long: (x), \
    unsigned short: (x), unsigned int: (x), unsigned long: (x), unsigned long long: (x), \
    float: (x), double: (x), char *: (x), const char *: (x), \
    default: 0)
#define judgekit_print(x) _Generic((x), \
    char: judgekit_print_char, \
    short: judgekit_print_int, int: judgekit_print_int, \
    long: judgekit_print_int, long long: judgekit_print_int, \
    unsigned short: judgekit_print_uint, unsigned int: judgekit_print_uint, \
    unsigned long: judgekit_print_uint, unsigned long long: judgekit_print_uint, \
    float: judgekit_print_double, double: judgekit_print_double, \
    char *: judgekit_print_str, const char *: judgekit_print_str, \
    default: judgekit_print_none)(judgekit_value(x))
#endif
#define judgekit_check(call, expected) do { \
    __typeof__(call) judgekit_actual = (call); \
    judgekit_print(judgekit_actual); \
    fflush(stdout); \
    return eq(judgekit_actual, (expected)) ? judgekit_codes[0] : judgekit_codes[1]; \
} while (0)
static int judgekit_codes[2] = { -1, -1 };
__attribute__((constructor(101))) static void judgekit_read_codes(void) {
    if (scanf("%d %d", &judgekit_codes[0], &judgekit_codes[1]) != 2) {
        judgekit_codes[0] = -1;
    }
}
int main(int argc, char **argv) {
    if (argc != 2 || judgekit_codes[0] < 0) {
        return {{unknown}};
    }
{{#each tests}}
    if (strcmp(argv[1], "{{name}}") == 0) {
        judgekit_check({{../testname}}({{input}}), {{expected}});
    }
{{/each}}
    return {{unknown}};
}
"#;

const JAVA_TEMPLATE: &str = r#"import java.util.*;

public class Test {
    private static final int[] JUDGEKIT_CODES = judgekitReadCodes();
{{source}}
    private static int[] judgekitReadCodes() {
        try {
            java.io.BufferedReader in = new java.io.BufferedReader(new java.io.InputStreamReader(System.in));
            String line = in.readLine();
            String[] parts = line == null ? new String[0] : line.trim().split("\\s+");
            if (parts.length == 2) {
                return new int[] { Integer.parseInt(parts[0]), Integer.parseInt(parts[1]) };
            }
        } catch (java.io.IOException | NumberFormatException e) {
            // fall through to the unknown-test exit
        }
        return null;
    }

    private static boolean judgekitEqual(Object a, Object b) {
        if (a instanceof Double || a instanceof Float || b instanceof Double || b instanceof Float) {
            return Math.abs(((Number) a).doubleValue() - ((Number) b).doubleValue()) < 1e-5;
        }
        return Objects.deepEquals(a, b);
    }

    public static void main(String[] args) {
        if (args.length != 1 || JUDGEKIT_CODES == null) {
            System.exit({{unknown}});
            return;
        }
        int success = JUDGEKIT_CODES[0];
        int failure = JUDGEKIT_CODES[1];
        Test instance = new Test();
        Object actual;
        Object expected;
        switch (args[0]) {
{{#each tests}}
            case "{{name}}":
                actual = instance.{{../testname}}({{input}});
                expected = {{expected}};
                break;
{{/each}}
            default:
                System.exit({{unknown}});
                return;
        }
        System.out.println(String.valueOf(actual));
        System.out.flush();
        System.exit(judgekitEqual(actual, expected) ? success : failure);
    }
}
"#;

const PYTHON_TEMPLATE: &str = r#"import sys
import math
_judgekit_codes = sys.stdin.readline().split()
{{source}}

def _judgekit_equal(a, b):
    if isinstance(a, float) or isinstance(b, float):
        try:
            return abs(a - b) < 1e-5
        except TypeError:
            return False
    return a == b

_judgekit_cases = {
{{#each tests}}
    "{{name}}": (lambda: {{../testname}}({{input}}), lambda: ({{expected}})),
{{/each}}
}

if __name__ == "__main__":
    if len(sys.argv) != 2 or sys.argv[1] not in _judgekit_cases or len(_judgekit_codes) != 2:
        sys.exit({{unknown}})
    _success, _failure = int(_judgekit_codes[0]), int(_judgekit_codes[1])
    _call, _expect = _judgekit_cases[sys.argv[1]]
    _actual = _call()
    print(repr(_actual))
    sys.stdout.flush()
    sys.exit(_success if _judgekit_equal(_actual, _expect()) else _failure)
"#;

const RUBY_TEMPLATE: &str = r#"__judgekit_codes = $stdin.gets.to_s.split.map(&:to_i)
{{source}}

__judgekit_cases = {
{{#each tests}}
  "{{name}}" => [lambda { {{../testname}}({{input}}) }, lambda { ({{expected}}) }],
{{/each}}
}

__judgekit_case = __judgekit_cases[ARGV[0]]
exit!({{unknown}}) if ARGV.length != 1 || __judgekit_case.nil? || __judgekit_codes.length != 2
__judgekit_success, __judgekit_failure = __judgekit_codes
__judgekit_actual = __judgekit_case[0].call
puts __judgekit_actual.inspect
$stdout.flush
exit!(__judgekit_actual == __judgekit_case[1].call ? __judgekit_success : __judgekit_failure)
"#;

/// Built-in driver template for a language.
pub fn default_template(language: Language) -> &'static str {
    match language {
        Language::C | Language::CPlusPlus => C_TEMPLATE,
        Language::Java => JAVA_TEMPLATE,
        Language::Python => PYTHON_TEMPLATE,
        Language::Ruby => RUBY_TEMPLATE,
    }
}

fn identifier_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("identifier pattern is valid"))
}

fn test_name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z0-9_-]+$").expect("test name pattern is valid"))
}

/// Render `template` around `source`.
///
/// The template must reference `{{source}}` exactly once.
pub fn render_scaffold(
    template: &str,
    source: &str,
    problem: &Problem,
    tests: &[TestCase],
    codes: SecretCodes,
) -> Result<ProgramSource, PipelineError> {
    const STEP: &str = "add_function_scaffolding";

    if !identifier_pattern().is_match(&problem.testname) {
        return Err(PipelineError::step(
            STEP,
            format!("'{}' is not a valid function name", problem.testname),
        ));
    }
    if let Some(bad) = tests.iter().find(|t| !test_name_pattern().is_match(&t.name)) {
        return Err(PipelineError::step(
            STEP,
            format!("test case name '{}' may only contain letters, digits, '_' and '-'", bad.name),
        ));
    }

    let data = json!({
        "source": SOURCE_SENTINEL,
        "testname": problem.testname,
        "success": codes.success,
        "failure": codes.failure,
        "unknown": UNKNOWN_TEST_EXIT,
        "tests": tests
            .iter()
            .map(|t| json!({
                "name": t.name,
                "input": t.input,
                "expected": t.expected_output,
            }))
            .collect::<Vec<_>>(),
    });

    let mut handlebars = Handlebars::new();
    handlebars.set_strict_mode(true);
    handlebars.register_escape_fn(handlebars::no_escape);
    let rendered = handlebars.render_template(template, &data)?;

    let mut parts = rendered.split(SOURCE_SENTINEL);
    let (Some(before), Some(after), None) = (parts.next(), parts.next(), parts.next()) else {
        return Err(PipelineError::step(
            STEP,
            "scaffold template must reference {{source}} exactly once",
        ));
    };

    let after = after.strip_prefix('\n').unwrap_or(after);
    let prologue_lines = before.matches('\n').count() as u32;
    let epilogue_lines = after.lines().count() as u32;

    let mut text = String::with_capacity(before.len() + source.len() + after.len() + 1);
    text.push_str(before);
    text.push_str(source);
    if !source.ends_with('\n') {
        text.push('\n');
    }
    text.push_str(after);

    Ok(ProgramSource::wrapped(text, prologue_lines, epilogue_lines))
}

pub struct AddFunctionScaffolding;

#[async_trait]
impl BuildStep for AddFunctionScaffolding {
    fn id(&self) -> &'static str {
        "add_function_scaffolding"
    }

    fn requires(&self) -> Vec<ArtifactKind> {
        vec![
            ArtifactKind::of::<Problem>(),
            ArtifactKind::of::<Vec<TestCase>>(),
            ArtifactKind::of::<ProgramSource>(),
        ]
    }

    fn produces(&self) -> Vec<ArtifactKind> {
        vec![
            ArtifactKind::of::<ProgramSource>(),
            ArtifactKind::of::<SecretCodes>(),
        ]
    }

    async fn execute(
        &self,
        store: &mut ArtifactStore,
        _ctx: &BuildContext,
    ) -> Result<StepFlow, PipelineError> {
        let problem = store.require::<Problem>(self.id())?;
        let tests = store.require::<Vec<TestCase>>(self.id())?;
        let source = store.require::<ProgramSource>(self.id())?;

        let template = problem
            .scaffold_template
            .as_deref()
            .unwrap_or_else(|| default_template(problem.problem_type.language()));
        let codes = SecretCodes::generate();
        let scaffolded = render_scaffold(template, &source.text, problem, tests, codes)?;

        debug!(
            testname = %problem.testname,
            prologue_lines = scaffolded.prologue_lines,
            epilogue_lines = scaffolded.epilogue_lines,
            "added function scaffolding"
        );

        store.add(scaffolded);
        store.add(codes);
        Ok(StepFlow::Continue)
    }
}
