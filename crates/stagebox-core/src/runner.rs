//! Single-sandbox execution.
//!
//! Lifecycle per stage: create -> attach -> start -> race(exit, timeout) ->
//! inspect -> remove. Every failure is folded into the returned
//! [`StageResult`]; nothing escapes this module as an error.

use std::path::PathBuf;
use std::time::Duration;

use futures::StreamExt;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn, Instrument};

use crate::engine::{BindMount, OutputStream, Sandbox, SandboxEngine, SandboxSpec};
use crate::error::{EngineError, EngineResult};
use crate::job::StageResult;
use crate::limits::ResourceLimits;

/// Where the job scratch directory appears inside every sandbox.
pub const JOB_MOUNT_PATH: &str = "/job";

/// How long output forwarding may lag behind process exit.
const LOG_DRAIN_GRACE: Duration = Duration::from_secs(1);

/// Per-stage inputs to [`run_sandbox`].
#[derive(Debug, Clone, PartialEq)]
pub struct SandboxOptions {
    pub image: String,
    pub command: Option<Vec<String>>,
    pub timeout: Duration,
    /// Resolved `KEY=VALUE` list.
    pub env: Vec<String>,
    pub scratch_dir: PathBuf,
    pub enable_networking: bool,
    pub host_name: Option<String>,
    pub capabilities: Vec<String>,
}

impl SandboxOptions {
    /// Engine-level spec with the standard limits applied.
    pub fn to_spec(&self) -> SandboxSpec {
        SandboxSpec {
            hostname: self.host_name.clone(),
            image: self.image.clone(),
            command: self.command.clone(),
            env: self.env.clone(),
            binds: vec![BindMount {
                host_path: self.scratch_dir.clone(),
                sandbox_path: JOB_MOUNT_PATH.to_string(),
            }],
            network_disabled: !self.enable_networking,
            limits: ResourceLimits::STANDARD,
            cap_add: self.capabilities.clone(),
        }
    }
}

/// How a started sandbox finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Finish {
    Exited(i64),
    TimedOut,
}

/// Which side of the exit/timeout race settled first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Race {
    Exited,
    TimedOut,
}

/// Run one stage in a fresh sandbox and report how it went.
pub async fn run_sandbox(engine: &dyn SandboxEngine, options: &SandboxOptions) -> StageResult {
    let started = Instant::now();

    let sandbox = match engine.create_sandbox(&options.to_spec()).await {
        Ok(sandbox) => sandbox,
        Err(e) => {
            error!(image = %options.image, error = %e, "Failed to create sandbox");
            return StageResult::errored(e.to_string(), elapsed_secs(started));
        }
    };
    debug!(sandbox = sandbox.id(), image = %options.image, "Created sandbox");

    let finish = supervise(sandbox.as_ref(), options.timeout).await;

    if let Err(e) = sandbox.remove().await {
        warn!(sandbox = sandbox.id(), error = %e, "Failed to remove sandbox");
    }

    let duration = elapsed_secs(started);
    match finish {
        Ok(Finish::Exited(code)) => {
            let result = StageResult::exited(code, duration);
            if result.succeeded {
                info!("{}", result.message);
            } else {
                error!("{}", result.message);
            }
            result
        }
        Ok(Finish::TimedOut) => {
            let result = StageResult::timed_out(duration);
            error!("{}", result.message);
            result
        }
        Err(e) => {
            error!(sandbox = sandbox.id(), error = %e, "Sandbox lifecycle failed");
            StageResult::errored(e.to_string(), duration)
        }
    }
}

/// Attach, start, race exit against the timer, and read the exit code.
async fn supervise(sandbox: &dyn Sandbox, limit: Duration) -> EngineResult<Finish> {
    let output = sandbox.attach().await?;
    let mut forwarder: JoinHandle<()> =
        tokio::spawn(forward_output(output).instrument(tracing::Span::current()));

    let finish = start_and_wait(sandbox, limit).await;

    if tokio::time::timeout(LOG_DRAIN_GRACE, &mut forwarder)
        .await
        .is_err()
    {
        forwarder.abort();
    }
    finish
}

async fn start_and_wait(sandbox: &dyn Sandbox, limit: Duration) -> EngineResult<Finish> {
    sandbox.start().await?;
    info!("Waiting for container to complete");
    match race_exit(sandbox, limit).await? {
        Race::Exited => {
            let state = sandbox.inspect().await?;
            let code = state.exit_code.ok_or_else(|| EngineError::MissingExitCode {
                id: sandbox.id().to_string(),
            })?;
            Ok(Finish::Exited(code))
        }
        Race::TimedOut => Ok(Finish::TimedOut),
    }
}

/// First of: natural exit, or the timer firing (which kills the sandbox).
///
/// The losing branch is dropped, so a won exit disarms the timer and a fired
/// timer abandons the wait.
async fn race_exit(sandbox: &dyn Sandbox, limit: Duration) -> EngineResult<Race> {
    tokio::select! {
        biased;
        exited = sandbox.wait() => exited.map(|()| Race::Exited),
        () = tokio::time::sleep(limit) => {
            if let Err(e) = sandbox.kill().await {
                warn!(sandbox = sandbox.id(), error = %e, "Failed to kill timed-out sandbox");
            }
            Ok(Race::TimedOut)
        }
    }
}

async fn forward_output(mut output: OutputStream) {
    let mut lines = LineBuffer::default();
    while let Some(chunk) = output.next().await {
        match chunk {
            Ok(bytes) => {
                for line in lines.push(&bytes) {
                    info!("container> {}", line);
                }
            }
            Err(e) => {
                warn!(error = %e, "Sandbox output stream failed");
                break;
            }
        }
    }
    if let Some(line) = lines.finish() {
        info!("container> {}", line);
    }
}

fn elapsed_secs(started: Instant) -> u64 {
    started.elapsed().as_secs_f64().round() as u64
}

/// Reassembles newline-terminated lines from arbitrary byte chunks.
#[derive(Debug, Default)]
struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    /// Append a chunk and return every line it completed.
    fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            lines.push(decode_line(&line[..line.len() - 1]));
        }
        lines
    }

    /// Whatever is left once the stream has ended.
    fn finish(self) -> Option<String> {
        if self.pending.is_empty() {
            None
        } else {
            Some(decode_line(&self.pending))
        }
    }
}

/// TTY output terminates lines with `\r\n`.
fn decode_line(bytes: &[u8]) -> String {
    let bytes = bytes.strip_suffix(b"\r").unwrap_or(bytes);
    String::from_utf8_lossy(bytes).into_owned()
}
