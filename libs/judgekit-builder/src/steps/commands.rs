use super::artifacts::{CommandInput, Executable, ExternalLibrary, SecretCodes};
use crate::artifact::{ArtifactKind, ArtifactStore};
use crate::error::PipelineError;
use crate::sandbox::{Command, SandboxProfile};
use crate::step::{BuildContext, BuildStep, StepFlow};
use async_trait::async_trait;
use judgekit_common::config::BuilderConfig;
use judgekit_common::types::TestCase;
use std::path::Path;

/// Launch command for an executable, without per-test arguments.
pub fn launch_command(
    executable: &Executable,
    library: Option<&ExternalLibrary>,
    config: &BuilderConfig,
) -> Command {
    match executable {
        Executable::Native { path } => {
            let dir = path.parent().unwrap_or_else(|| Path::new("/"));
            let mut command = Command::new(path.display().to_string(), dir, SandboxProfile::Native);
            if let Some(lib_dir) = library.and_then(|l| l.path.parent()) {
                command = command.library_path(lib_dir);
            }
            command
        }
        Executable::Jvm {
            class_dir,
            main_class,
        } => {
            let dir = class_dir.parent().unwrap_or(class_dir.as_path());
            let mut command = Command::new(config.toolchain.java.clone(), dir, SandboxProfile::Jvm)
                .arg(format!("-Xmx{}m", config.jvm_heap_mb))
                .args(["-XX:+UseSerialGC", "-XX:-UsePerfData", "-XX:TieredStopAtLevel=1"])
                .arg(main_class.clone())
                .classpath(class_dir);
            if let Some(library) = library {
                command = command.classpath(&library.path);
            }
            command
        }
        Executable::Script {
            interpreter,
            flags,
            path,
        } => {
            let dir = path.parent().unwrap_or_else(|| Path::new("/"));
            Command::new(interpreter.clone(), dir, SandboxProfile::Interpreter)
                .args(flags.iter().cloned())
                .arg(path.display().to_string())
        }
    }
}

/// Builds one command and one stdin per test case.
///
/// With [`SecretCodes`] present the program is a generated driver: it gets
/// the test name as its only argument and `<success> <failure>` on stdin.
/// Otherwise the test input is fed on stdin.
pub struct CreateTestCommands;

#[async_trait]
impl BuildStep for CreateTestCommands {
    fn id(&self) -> &'static str {
        "create_test_commands"
    }

    fn requires(&self) -> Vec<ArtifactKind> {
        vec![
            ArtifactKind::of::<Executable>(),
            ArtifactKind::of::<Vec<TestCase>>(),
        ]
    }

    fn produces(&self) -> Vec<ArtifactKind> {
        vec![
            ArtifactKind::of::<Vec<Command>>(),
            ArtifactKind::of::<Vec<CommandInput>>(),
        ]
    }

    async fn execute(
        &self,
        store: &mut ArtifactStore,
        ctx: &BuildContext,
    ) -> Result<StepFlow, PipelineError> {
        let executable = store.require::<Executable>(self.id())?;
        let tests = store.require::<Vec<TestCase>>(self.id())?;
        let codes = store.get::<SecretCodes>().copied();
        let base = launch_command(executable, store.get::<ExternalLibrary>(), &ctx.config);

        let (commands, inputs): (Vec<Command>, Vec<CommandInput>) = tests
            .iter()
            .map(|test| match codes {
                Some(codes) => (
                    base.clone().arg(test.name.clone()),
                    CommandInput(format!("{} {}\n", codes.success, codes.failure)),
                ),
                None => (base.clone(), CommandInput(test.input.clone())),
            })
            .unzip();

        store.add(commands);
        store.add(inputs);
        Ok(StepFlow::Continue)
    }
}
