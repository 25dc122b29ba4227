//! Sandbox engine capability traits
//!
//! These traits are the only surface the pipeline engine depends on:
//! - `SandboxEngine`: connectivity, image fetch, sandbox creation
//! - `Sandbox`: lifecycle of one created sandbox (attach/start/kill/wait/inspect/remove)
//!
//! Adapters live outside this crate (see `stagebox-docker`). In-memory fakes
//! are provided for testing via the `fakes` module.

use std::fmt;
use std::path::PathBuf;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::EngineResult;
use crate::limits::ResourceLimits;

/// Combined stdout/stderr of a sandbox, as raw byte chunks.
pub type OutputStream = BoxStream<'static, EngineResult<Vec<u8>>>;

/// Progress events of an image fetch.
pub type ProgressStream<'a> = BoxStream<'a, EngineResult<PullProgress>>;

/// A parsed image reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageRef {
    pub repository: String,
    pub tag: Option<String>,
    pub digest: Option<String>,
}

impl ImageRef {
    /// Parse `repository[:tag][@digest]`.
    ///
    /// A `:` only introduces a tag when it follows the last `/`, so registry
    /// ports (`localhost:5000/app`) stay part of the repository.
    pub fn parse(reference: &str) -> Self {
        let reference = reference.trim();
        let (name, digest) = match reference.split_once('@') {
            Some((name, digest)) => (name, Some(digest.to_string())),
            None => (reference, None),
        };

        let last_slash = name.rfind('/').map(|i| i + 1).unwrap_or(0);
        let (repository, tag) = match name[last_slash..].rfind(':') {
            Some(i) => {
                let split = last_slash + i;
                (&name[..split], Some(name[split + 1..].to_string()))
            }
            None => (name, None),
        };

        Self {
            repository: repository.to_string(),
            tag: tag.filter(|t| !t.is_empty()),
            digest,
        }
    }

    /// Tag to fetch; `latest` when none was given.
    pub fn tag_or_latest(&self) -> &str {
        self.tag.as_deref().unwrap_or("latest")
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.digest {
            Some(digest) => write!(f, "{}@{}", self.repository, digest),
            None => write!(f, "{}:{}", self.repository, self.tag_or_latest()),
        }
    }
}

/// One progress event reported while fetching an image.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PullProgress {
    pub id: Option<String>,
    pub status: Option<String>,
    pub progress: Option<String>,
}

impl fmt::Display for PullProgress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<&str> = [&self.id, &self.status, &self.progress]
            .into_iter()
            .filter_map(|p| p.as_deref())
            .collect();
        write!(f, "{}", parts.join(" "))
    }
}

/// Host directory mounted into a sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindMount {
    pub host_path: PathBuf,
    pub sandbox_path: String,
}

impl BindMount {
    /// `host:sandbox` form used by container engines.
    pub fn to_bind_string(&self) -> String {
        format!("{}:{}", self.host_path.display(), self.sandbox_path)
    }
}

/// Everything an engine needs to create one sandbox.
#[derive(Debug, Clone, PartialEq)]
pub struct SandboxSpec {
    pub hostname: Option<String>,
    pub image: String,
    pub command: Option<Vec<String>>,
    pub env: Vec<String>,
    pub binds: Vec<BindMount>,
    pub network_disabled: bool,
    pub limits: ResourceLimits,
    pub cap_add: Vec<String>,
}

/// State read back from a finished sandbox.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SandboxState {
    pub exit_code: Option<i64>,
}

/// A container engine able to run sandboxes.
#[async_trait]
pub trait SandboxEngine: Send + Sync {
    /// Verify the engine is reachable.
    async fn ping(&self) -> EngineResult<()>;

    /// Fetch an image, streaming progress. Errors may surface either as a
    /// stream item or by the stream ending early.
    fn fetch_image(&self, image: &ImageRef) -> ProgressStream<'_>;

    /// Create (but do not start) a sandbox.
    async fn create_sandbox(&self, spec: &SandboxSpec) -> EngineResult<Box<dyn Sandbox>>;
}

/// Handle to one created sandbox.
#[async_trait]
pub trait Sandbox: Send + Sync {
    /// Engine-assigned identifier.
    fn id(&self) -> &str;

    /// Attach to combined output. Must be called before `start` to see all output.
    async fn attach(&self) -> EngineResult<OutputStream>;

    async fn start(&self) -> EngineResult<()>;

    /// Forcibly stop the sandbox.
    async fn kill(&self) -> EngineResult<()>;

    /// Resolve once the process has exited, whatever its exit code.
    async fn wait(&self) -> EngineResult<()>;

    async fn inspect(&self) -> EngineResult<SandboxState>;

    /// Delete the sandbox, stopping it first if needed.
    async fn remove(&self) -> EngineResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_repository() {
        let image = ImageRef::parse("alpine");
        assert_eq!(image.repository, "alpine");
        assert_eq!(image.tag, None);
        assert_eq!(image.tag_or_latest(), "latest");
        assert_eq!(image.to_string(), "alpine:latest");
    }

    #[test]
    fn test_parse_tagged() {
        let image = ImageRef::parse("x:1");
        assert_eq!(image.repository, "x");
        assert_eq!(image.tag_or_latest(), "1");
    }

    #[test]
    fn test_parse_registry_port_is_not_a_tag() {
        let image = ImageRef::parse("localhost:5000/grader/build");
        assert_eq!(image.repository, "localhost:5000/grader/build");
        assert_eq!(image.tag, None);

        let tagged = ImageRef::parse("localhost:5000/grader/build:v2");
        assert_eq!(tagged.repository, "localhost:5000/grader/build");
        assert_eq!(tagged.tag.as_deref(), Some("v2"));
    }

    #[test]
    fn test_parse_digest() {
        let image = ImageRef::parse("alpine@sha256:abcd");
        assert_eq!(image.repository, "alpine");
        assert_eq!(image.digest.as_deref(), Some("sha256:abcd"));
        assert_eq!(image.to_string(), "alpine@sha256:abcd");
    }

    #[test]
    fn test_trailing_colon_means_latest() {
        assert_eq!(ImageRef::parse("alpine:").tag_or_latest(), "latest");
    }

    #[test]
    fn test_pull_progress_display_skips_missing_parts() {
        let progress = PullProgress {
            id: Some("3f4a".into()),
            status: Some("Downloading".into()),
            progress: None,
        };
        assert_eq!(progress.to_string(), "3f4a Downloading");
    }

    #[test]
    fn test_bind_string() {
        let bind = BindMount {
            host_path: PathBuf::from("/tmp/stagebox-1"),
            sandbox_path: "/job".into(),
        };
        assert_eq!(bind.to_bind_string(), "/tmp/stagebox-1:/job");
    }
}
