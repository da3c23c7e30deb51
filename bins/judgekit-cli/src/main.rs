mod commands;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use judgekit_common::config::BuilderConfig;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "judgekit-cli")]
#[command(about = "judgekit CLI - Judge submissions in batch and inspect testers", long_about = None)]
struct Cli {
    /// JSON configuration file (environment variables still override it)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Judge source files against one exercise. Exits with status 1 unless
    /// every submission passes.
    Batch {
        /// Exercise file with the problem and its test cases
        exercise: PathBuf,

        /// Source files to judge
        sources: Vec<PathBuf>,

        /// File listing source files, one per line
        #[arg(short, long)]
        source_list: Option<PathBuf>,

        /// Run without resource limits or syscall filtering
        #[arg(long, default_value = "false")]
        no_sandbox: bool,
    },

    /// Show the step sequence used for each problem type
    Testers {
        /// Tester mapping overriding the built-in sequences
        #[arg(short, long)]
        testers: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"))
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let mut config = BuilderConfig::from_env(cli.config.as_deref())?;

    match cli.command {
        Commands::Batch {
            exercise,
            mut sources,
            source_list,
            no_sandbox,
        } => {
            if let Some(list) = source_list {
                sources.extend(commands::read_source_list(&list)?);
            }
            if sources.is_empty() {
                bail!("No source files given");
            }
            if no_sandbox {
                config.sandbox_enabled = false;
            }
            if !commands::run_batch(&exercise, &sources, config).await? {
                return Ok(ExitCode::FAILURE);
            }
        }
        Commands::Testers { testers } => {
            let path = testers.or(config.testers_path);
            print!("{}", commands::list_testers(path.as_deref())?);
        }
    }

    Ok(ExitCode::SUCCESS)
}
