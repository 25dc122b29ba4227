//! Error types for stagebox-core

use std::path::PathBuf;

use thiserror::Error;

/// Errors reported by a sandbox engine adapter.
#[derive(Error, Debug)]
pub enum EngineError {
    /// The engine could not be reached
    #[error("engine unreachable: {0}")]
    Unreachable(String),

    /// An engine API call failed
    #[error("{operation} failed: {reason}")]
    Api {
        operation: &'static str,
        reason: String,
    },

    /// The engine did not report an exit code for a finished sandbox
    #[error("sandbox {id} reported no exit code")]
    MissingExitCode { id: String },

    /// Reading an output or progress stream failed
    #[error("stream error: {0}")]
    Stream(String),
}

impl EngineError {
    /// Shorthand for an [`EngineError::Api`] failure.
    pub fn api(operation: &'static str, reason: impl Into<String>) -> Self {
        EngineError::Api {
            operation,
            reason: reason.into(),
        }
    }
}

/// Errors that escape a job run.
///
/// Everything that goes wrong inside a single stage is folded into that
/// stage's [`StageResult`](crate::job::StageResult) instead.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Connectivity check against the engine failed
    #[error("sandbox engine connectivity check failed: {0}")]
    Connectivity(#[source] EngineError),

    /// Job descriptor failed validation
    #[error("invalid job: {0}")]
    InvalidJob(#[from] JobInputError),

    /// No scratch directory could be acquired
    #[error("failed to acquire scratch directory: {0}")]
    ScratchUnavailable(#[source] std::io::Error),

    /// Writing into the scratch directory failed
    #[error("failed to write {path:?}: {source}")]
    ScratchWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The auxiliary payload could not be serialised
    #[error("failed to serialise job payload: {0}")]
    Payload(#[from] serde_json::Error),
}

/// Errors raised while loading a job descriptor.
#[derive(Error, Debug)]
pub enum JobInputError {
    /// Descriptor is not valid JSON for a job
    #[error("malformed job descriptor: {0}")]
    Malformed(#[from] serde_json::Error),

    /// Job has no stages
    #[error("job must declare at least one stage")]
    NoStages,

    /// A stage has an empty image reference
    #[error("stage {index} has an empty image reference")]
    EmptyImage { index: usize },
}

/// Result type for engine operations
pub type EngineResult<T> = std::result::Result<T, EngineError>;
