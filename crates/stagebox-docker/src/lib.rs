//! Docker Engine adapter for stagebox.
//!
//! [`DockerEngine`] implements [`stagebox_core::SandboxEngine`] with one
//! container per sandbox, using the `bollard` client.

pub mod config;
pub mod convert;
pub mod engine;

pub use config::{ConfigError, DockerConfig, DEFAULT_TIMEOUT_SECS};
pub use engine::{DockerEngine, DockerSandbox};
