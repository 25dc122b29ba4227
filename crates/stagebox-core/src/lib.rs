//! Stagebox Core
//!
//! Runs multi-stage jobs where every stage executes inside a throwaway,
//! resource-limited container sandbox. Stages share one scratch directory
//! mounted at `/job` and run strictly in order; the first failing stage
//! aborts the job.
//!
//! The container daemon and the scratch filesystem sit behind the
//! [`SandboxEngine`] and [`ScratchStorage`] traits. In-memory fakes for both
//! live in [`fakes`].

pub mod engine;
pub mod env;
pub mod error;
pub mod fakes;
pub mod images;
pub mod job;
pub mod limits;
pub mod orchestrator;
pub mod runner;
pub mod scratch;
pub mod sequencer;
pub mod telemetry;

pub use engine::{
    BindMount, ImageRef, OutputStream, ProgressStream, PullProgress, Sandbox, SandboxEngine,
    SandboxSpec, SandboxState,
};
pub use env::JobEnv;
pub use error::{EngineError, EngineResult, JobInputError, PipelineError};
pub use images::{distinct_images, prepare_images, ImagePreparation};
pub use job::{
    Job, JobResult, Stage, StageResult, DEFAULT_STAGE_TIMEOUT_SECS, TIMED_OUT_MESSAGE,
};
pub use limits::ResourceLimits;
pub use orchestrator::{Pipeline, ROSTER_FILE};
pub use runner::{run_sandbox, SandboxOptions, JOB_MOUNT_PATH};
pub use scratch::{ScratchStorage, TempScratch};
pub use sequencer::{run_stages, stage_options};
pub use telemetry::init_tracing;
