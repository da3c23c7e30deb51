/// Build Step Catalog
///
/// Every step a tester mapping can name, looked up by its stable id.
/// Language front ends differ only in their compile and scaffolding
/// steps; execution, checking and result assembly are shared.

pub mod artifacts;
pub mod check;
pub mod commands;
pub mod compile;
pub mod diagnostics;
pub mod execute;
pub mod extlib;
pub mod result;
pub mod scaffold;

pub use artifacts::{
    CommandInput, CommandResult, Executable, ExternalLibrary, ProgramSource, SecretCodes, Workspace,
};

use crate::step::BuildStep;
use std::sync::Arc;

/// Ids of all known steps.
pub const STEP_IDS: [&str; 11] = [
    "resolve_external_library",
    "add_function_scaffolding",
    "compile_native",
    "compile_java",
    "check_script_syntax",
    "translate_diagnostics",
    "create_test_commands",
    "execute_commands",
    "check_output",
    "check_function_results",
    "assemble_result",
];

pub fn step_by_id(id: &str) -> Option<Arc<dyn BuildStep>> {
    let step: Arc<dyn BuildStep> = match id {
        "resolve_external_library" => Arc::new(extlib::ResolveExternalLibrary),
        "add_function_scaffolding" => Arc::new(scaffold::AddFunctionScaffolding),
        "compile_native" => Arc::new(compile::CompileNative),
        "compile_java" => Arc::new(compile::CompileJava),
        "check_script_syntax" => Arc::new(compile::CheckScriptSyntax),
        "translate_diagnostics" => Arc::new(diagnostics::TranslateDiagnostics),
        "create_test_commands" => Arc::new(commands::CreateTestCommands),
        "execute_commands" => Arc::new(execute::ExecuteCommands),
        "check_output" => Arc::new(check::CheckOutput),
        "check_function_results" => Arc::new(check::CheckFunctionResults),
        "assemble_result" => Arc::new(result::AssembleResult),
        _ => return None,
    };
    Some(step)
}
