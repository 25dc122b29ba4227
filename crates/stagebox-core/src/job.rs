//! Job descriptors and result records.
//!
//! Input follows the grading-job wire shape (`entry_point`, `enable_networking`,
//! `host_name`, with camelCase aliases accepted). Results serialise in camelCase
//! (`timedOut`, `exitCode`).

use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize};

use crate::error::JobInputError;

/// Stage timeout applied when a stage declares none (or zero).
pub const DEFAULT_STAGE_TIMEOUT_SECS: u64 = 30;

/// Message recorded for a stage killed by its timer.
pub const TIMED_OUT_MESSAGE: &str = "Container timed out!";

/// Treat an explicit JSON `null` like a missing field.
fn nullable<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// One pipeline step, executed inside its own sandbox.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Stage {
    /// Image reference, e.g. `alpine` or `registry:5000/grader:v2`.
    pub image: String,

    /// Command to run; the image default is used when absent.
    #[serde(default, alias = "entryPoint", skip_serializing_if = "Option::is_none")]
    pub entry_point: Option<Vec<String>>,

    /// Timeout in seconds; fractions are allowed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<f64>,

    /// `KEY=VALUE` pairs or bare `KEY`s inherited from the job.
    #[serde(default, deserialize_with = "nullable")]
    pub env: Vec<String>,

    #[serde(default, alias = "enableNetworking", deserialize_with = "nullable")]
    pub enable_networking: bool,

    #[serde(default, alias = "hostName", skip_serializing_if = "Option::is_none")]
    pub host_name: Option<String>,

    /// Linux capabilities added to the sandbox.
    #[serde(default, deserialize_with = "nullable")]
    pub capabilities: Vec<String>,
}

impl Stage {
    /// Create a stage running `command` in `image` with default settings.
    pub fn new(image: impl Into<String>, command: Vec<String>) -> Self {
        Self {
            image: image.into(),
            entry_point: Some(command),
            timeout: None,
            env: Vec::new(),
            enable_networking: false,
            host_name: None,
            capabilities: Vec::new(),
        }
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout = Some(secs as f64);
        self
    }

    pub fn with_env(mut self, env: Vec<String>) -> Self {
        self.env = env;
        self
    }

    /// Effective timeout; zero, negative and out-of-range values count as unset.
    pub fn timeout_duration(&self) -> Duration {
        self.timeout
            .filter(|secs| *secs > 0.0)
            .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
            .unwrap_or(Duration::from_secs(DEFAULT_STAGE_TIMEOUT_SECS))
    }
}

/// A full pipeline execution request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Job {
    /// Identifier assigned by the submitter, used only for log context.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,

    pub stages: Vec<Stage>,

    /// Job-wide `KEY=VALUE` defaults.
    #[serde(default, deserialize_with = "nullable")]
    pub env: Vec<String>,

    /// Opaque roster payload, written to `roster.json` in the scratch directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub students: Option<serde_json::Value>,
}

impl Job {
    pub fn new(stages: Vec<Stage>) -> Self {
        Self {
            job_id: None,
            stages,
            env: Vec::new(),
            students: None,
        }
    }

    pub fn with_env(mut self, env: Vec<String>) -> Self {
        self.env = env;
        self
    }

    /// Parse and validate a job descriptor.
    pub fn from_json(input: &str) -> Result<Self, JobInputError> {
        let job: Job = serde_json::from_str(input)?;
        job.validate()?;
        Ok(job)
    }

    /// Check the structural requirements the engine relies on.
    pub fn validate(&self) -> Result<(), JobInputError> {
        if self.stages.is_empty() {
            return Err(JobInputError::NoStages);
        }
        if let Some(index) = self.stages.iter().position(|s| s.image.trim().is_empty()) {
            return Err(JobInputError::EmptyImage { index });
        }
        Ok(())
    }
}

/// Outcome of one sandbox run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StageResult {
    pub succeeded: bool,
    pub timed_out: bool,
    pub message: String,

    /// Present only when the process ran to completion.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i64>,

    /// Elapsed wall-clock seconds, rounded.
    pub duration: u64,
}

impl StageResult {
    /// The process exited on its own with `code`.
    pub fn exited(code: i64, duration: u64) -> Self {
        Self {
            succeeded: code == 0,
            timed_out: false,
            message: format!("Container exited with exit code {code}"),
            exit_code: Some(code),
            duration,
        }
    }

    /// The timer fired before the process exited.
    pub fn timed_out(duration: u64) -> Self {
        Self {
            succeeded: false,
            timed_out: true,
            message: TIMED_OUT_MESSAGE.to_string(),
            exit_code: None,
            duration,
        }
    }

    /// A lifecycle step failed before an outcome was known.
    pub fn errored(message: impl Into<String>, duration: u64) -> Self {
        Self {
            succeeded: false,
            timed_out: false,
            message: message.into(),
            exit_code: None,
            duration,
        }
    }
}

/// Aggregate outcome of a job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobResult {
    /// Conjunction of every attempted stage's `succeeded`.
    pub success: bool,

    /// One entry per attempted stage, in order.
    pub results: Vec<StageResult>,
}

impl JobResult {
    pub fn from_results(results: Vec<StageResult>) -> Self {
        Self {
            success: results.iter().all(|r| r.succeeded),
            results,
        }
    }

    /// Number of stages that succeeded.
    pub fn passed_count(&self) -> usize {
        self.results.iter().filter(|r| r.succeeded).count()
    }

    /// The failing stage's result, if any.
    pub fn failure(&self) -> Option<&StageResult> {
        self.results.iter().find(|r| !r.succeeded)
    }
}
