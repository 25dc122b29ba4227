//! Stagebox - sandboxed multi-stage job runner
//!
//! ## Commands
//!
//! - `run`: execute a job descriptor and emit its result as JSON
//! - `ping`: check that the container daemon is reachable

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{info, Level};

use stagebox_core::{Job, JobResult, Pipeline, SandboxEngine, TempScratch};
use stagebox_docker::{DockerConfig, DockerEngine};

#[derive(Parser)]
#[command(name = "stagebox")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Run multi-stage jobs in resource-limited container sandboxes", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    /// Docker daemon socket (default: DOCKER_HOST or the platform default)
    #[arg(long, global = true, env = "STAGEBOX_DOCKER_SOCKET")]
    docker_socket: Option<PathBuf>,

    /// Directory job scratch directories are created in
    #[arg(long, global = true, env = "STAGEBOX_SCRATCH_ROOT")]
    scratch_root: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a job and print its result
    Run {
        #[command(flatten)]
        input: JobInput,

        /// Write the result JSON here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Exit non-zero when any stage fails
        #[arg(long)]
        fail_on_error: bool,
    },

    /// Check connectivity to the container daemon
    Ping,
}

#[derive(Args)]
#[group(required = true, multiple = false)]
struct JobInput {
    /// Job descriptor as inline JSON
    #[arg(long)]
    job: Option<String>,

    /// Path to a job descriptor JSON file
    #[arg(long)]
    job_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    stagebox_core::init_tracing(cli.json, level);

    let engine = connect_engine(cli.docker_socket.as_deref())?;

    match cli.command {
        Commands::Run {
            input,
            output,
            fail_on_error,
        } => {
            let job = load_job(&input)?;
            let mut scratch = TempScratch::new();
            if let Some(root) = cli.scratch_root {
                scratch = scratch.with_root(root);
            }
            let pipeline = Pipeline::new(Arc::new(engine), Arc::new(scratch));
            let result = cmd_run(&pipeline, &job, output.as_deref()).await?;
            if should_fail(&result, fail_on_error) {
                Ok(ExitCode::FAILURE)
            } else {
                Ok(ExitCode::SUCCESS)
            }
        }
        Commands::Ping => {
            cmd_ping(&engine).await?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn connect_engine(socket: Option<&Path>) -> Result<DockerEngine> {
    let mut config = DockerConfig::from_env().context("Invalid Docker configuration")?;
    if let Some(socket) = socket {
        config = config.with_socket(socket);
    }
    DockerEngine::connect(&config).context("Failed to configure Docker client")
}

fn load_job(input: &JobInput) -> Result<Job> {
    let raw = match (&input.job, &input.job_file) {
        (Some(json), _) => json.clone(),
        (None, Some(path)) => std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read job file {}", path.display()))?,
        (None, None) => anyhow::bail!("either --job or --job-file is required"),
    };
    Job::from_json(&raw).context("Invalid job descriptor")
}

async fn cmd_run(pipeline: &Pipeline, job: &Job, output: Option<&Path>) -> Result<JobResult> {
    let result = pipeline.run(job).await.context("Job could not be run")?;

    let rendered = serde_json::to_string_pretty(&result)?;
    info!("Job result:\n{}", rendered);

    match output {
        Some(path) => {
            std::fs::write(path, &rendered)
                .with_context(|| format!("Failed to write result to {}", path.display()))?;
            info!(path = %path.display(), "Result written");
        }
        None => println!("{}", rendered),
    }
    Ok(result)
}

async fn cmd_ping(engine: &dyn SandboxEngine) -> Result<()> {
    engine
        .ping()
        .await
        .context("Container daemon is not reachable")?;
    println!("Container daemon is reachable");
    Ok(())
}

/// Stage failures only affect the exit status when asked to.
fn should_fail(result: &JobResult, fail_on_error: bool) -> bool {
    fail_on_error && !result.success
}
