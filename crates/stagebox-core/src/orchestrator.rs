//! Top-level job execution.
//!
//! A job run goes: connectivity check -> image preparation -> scratch
//! directory -> stages -> scratch release. The scratch directory is released
//! exactly once on every exit path once it has been acquired.

use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::sync::Arc;

use futures::FutureExt;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::engine::SandboxEngine;
use crate::env::JobEnv;
use crate::error::PipelineError;
use crate::images::prepare_images;
use crate::job::{Job, JobResult};
use crate::scratch::ScratchStorage;
use crate::sequencer::run_stages;

/// File the job's roster payload is written to inside the scratch directory.
pub const ROSTER_FILE: &str = "roster.json";

/// Runs jobs against one engine and one scratch storage.
#[derive(Clone)]
pub struct Pipeline {
    engine: Arc<dyn SandboxEngine>,
    scratch: Arc<dyn ScratchStorage>,
}

impl Pipeline {
    pub fn new(engine: Arc<dyn SandboxEngine>, scratch: Arc<dyn ScratchStorage>) -> Self {
        Self { engine, scratch }
    }

    /// Execute `job` and aggregate its stage results.
    ///
    /// Only an invalid job, an unreachable engine, or a scratch directory
    /// failure is returned as an error; stage failures are reported in the
    /// [`JobResult`].
    pub async fn run(&self, job: &Job) -> Result<JobResult, PipelineError> {
        let job_id = job
            .job_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        self.run_job(job)
            .instrument(info_span!("job", job_id = %job_id))
            .await
    }

    async fn run_job(&self, job: &Job) -> Result<JobResult, PipelineError> {
        job.validate()?;
        info!(stages = job.stages.len(), "Starting job");

        self.engine
            .ping()
            .await
            .map_err(PipelineError::Connectivity)?;

        let preparation = prepare_images(self.engine.as_ref(), &job.stages).await;
        info!(
            fetched = preparation.fetched.len(),
            failed = preparation.failed.len(),
            "Images prepared"
        );

        let job_env = JobEnv::from_entries(&job.env);

        let scratch_dir = self
            .scratch
            .acquire_directory()
            .await
            .map_err(PipelineError::ScratchUnavailable)?;
        info!(path = %scratch_dir.display(), "Created scratch directory");

        let outcome = AssertUnwindSafe(self.run_in_scratch(job, &job_env, &scratch_dir))
            .catch_unwind()
            .await;

        if let Err(e) = self.scratch.release_directory(&scratch_dir).await {
            warn!(path = %scratch_dir.display(), error = %e, "Failed to release scratch directory");
        }

        match outcome {
            Ok(result) => result,
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }

    async fn run_in_scratch(
        &self,
        job: &Job,
        job_env: &JobEnv,
        scratch_dir: &Path,
    ) -> Result<JobResult, PipelineError> {
        if let Some(students) = &job.students {
            let contents = serde_json::to_vec(students)?;
            let path = scratch_dir.join(ROSTER_FILE);
            self.scratch
                .write_file(&path, &contents)
                .await
                .map_err(|source| PipelineError::ScratchWrite { path, source })?;
            info!("Roster saved in scratch directory");
        }

        let results = run_stages(self.engine.as_ref(), &job.stages, job_env, scratch_dir).await;
        let result = JobResult::from_results(results);
        if result.success {
            info!(stages = result.results.len(), "Job succeeded");
        } else {
            warn!(
                attempted = result.results.len(),
                total = job.stages.len(),
                "Job failed"
            );
        }
        Ok(result)
    }
}
