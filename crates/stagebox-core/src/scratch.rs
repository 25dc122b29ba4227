//! Job-scoped scratch directories.
//!
//! A scratch directory is bind-mounted into every stage of a job so stages can
//! hand artifacts to each other. The orchestrator acquires one per job and
//! releases it on every exit path.

use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;

/// Storage backing job scratch directories.
#[async_trait]
pub trait ScratchStorage: Send + Sync {
    /// Create a fresh, exclusive directory.
    async fn acquire_directory(&self) -> io::Result<PathBuf>;

    /// Recursively delete a directory returned by `acquire_directory`.
    async fn release_directory(&self, path: &Path) -> io::Result<()>;

    async fn write_file(&self, path: &Path, contents: &[u8]) -> io::Result<()>;
}

/// Scratch directories created under the system temp dir (or a chosen root).
#[derive(Debug, Clone, Default)]
pub struct TempScratch {
    root: Option<PathBuf>,
}

impl TempScratch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create directories under `root` instead of the system temp dir.
    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = Some(root.into());
        self
    }

    /// Directory new scratch directories are created in.
    pub fn root(&self) -> PathBuf {
        self.root.clone().unwrap_or_else(std::env::temp_dir)
    }
}

#[async_trait]
impl ScratchStorage for TempScratch {
    async fn acquire_directory(&self) -> io::Result<PathBuf> {
        let root = self.root();
        tokio::task::spawn_blocking(move || -> io::Result<PathBuf> {
            let dir = tempfile::Builder::new()
                .prefix("stagebox-")
                .tempdir_in(&root)?;
            // Lifetime is managed by release_directory, not by drop.
            Ok(dir.keep())
        })
        .await
        .map_err(io::Error::other)?
    }

    async fn release_directory(&self, path: &Path) -> io::Result<()> {
        tokio::fs::remove_dir_all(path).await
    }

    async fn write_file(&self, path: &Path, contents: &[u8]) -> io::Result<()> {
        tokio::fs::write(path, contents).await
    }
}
