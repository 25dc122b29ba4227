//! In-memory fakes for the collaborator traits (testing only)
//!
//! Provides `FakeEngine` and `MemoryScratch` that satisfy the engine and
//! scratch-storage contracts without a container daemon or a filesystem.
//!
//! Unless a rule says otherwise, a `FakeEngine` sandbox behaves like its
//! command: `false` exits 1, `sleep N` exits 0 after N seconds (tokio time,
//! so paused-clock tests stay instant), `exit N` exits N, anything else exits 0.

use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};

use crate::engine::{
    ImageRef, OutputStream, ProgressStream, PullProgress, Sandbox, SandboxEngine, SandboxSpec,
    SandboxState,
};
use crate::error::{EngineError, EngineResult};
use crate::scratch::ScratchStorage;

/// Exit code reported for a killed sandbox (SIGKILL).
const KILLED_EXIT_CODE: i64 = 137;

// ---------------------------------------------------------------------------
// FakeEngine
// ---------------------------------------------------------------------------

/// Scripted behaviour of a fake sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FakeBehavior {
    /// Exit with `code` after `after` has elapsed.
    Exit { code: i64, after: Duration },
    /// Never exit on its own.
    Hang,
    CreateFails(String),
    AttachFails(String),
    StartFails(String),
    /// Exit at once, then fail inspection.
    InspectFails(String),
    /// Exit at once, but report no exit code on inspection.
    ExitUnreported,
}

impl FakeBehavior {
    pub fn exit(code: i64) -> Self {
        FakeBehavior::Exit {
            code,
            after: Duration::ZERO,
        }
    }

    /// Behaviour implied by a command line.
    fn from_command(command: Option<&[String]>) -> Self {
        let args: Vec<&str> = command
            .unwrap_or_default()
            .iter()
            .map(String::as_str)
            .collect();
        match args.as_slice() {
            ["false", ..] => FakeBehavior::exit(1),
            ["exit", code, ..] => FakeBehavior::exit(code.parse().unwrap_or(1)),
            ["sleep", secs, ..] => FakeBehavior::Exit {
                code: 0,
                after: Duration::from_secs(secs.parse().unwrap_or(0)),
            },
            _ => FakeBehavior::exit(0),
        }
    }
}

#[derive(Debug, Clone)]
enum Matcher {
    Image(String),
    Command(String),
}

impl Matcher {
    fn matches(&self, spec: &SandboxSpec) -> bool {
        match self {
            Matcher::Image(image) => &spec.image == image,
            Matcher::Command(command) => spec
                .command
                .as_ref()
                .map(|c| &c.join(" ") == command)
                .unwrap_or(false),
        }
    }
}

#[derive(Debug, Default)]
struct EngineState {
    rules: Vec<(Matcher, FakeBehavior)>,
    output: Vec<(String, Vec<String>)>,
    pull_failures: HashSet<String>,
    ping_failure: Option<String>,
    remove_fails: bool,
    pulls: Vec<String>,
    created: Vec<SandboxSpec>,
    started: Vec<String>,
    kills: Vec<String>,
    removals: Vec<String>,
}

/// Scripted in-memory sandbox engine.
#[derive(Debug, Default)]
pub struct FakeEngine {
    state: Arc<Mutex<EngineState>>,
    next_id: AtomicU64,
}

impl FakeEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use `behavior` for every sandbox created from `image`.
    pub fn on_image(self, image: impl Into<String>, behavior: FakeBehavior) -> Self {
        self.lock().rules.push((Matcher::Image(image.into()), behavior));
        self
    }

    /// Use `behavior` for every sandbox whose command joins to `command`.
    pub fn on_command(self, command: impl Into<String>, behavior: FakeBehavior) -> Self {
        self.lock()
            .rules
            .push((Matcher::Command(command.into()), behavior));
        self
    }

    /// Sandboxes from `image` print `lines` on their output stream.
    pub fn with_output(self, image: impl Into<String>, lines: Vec<String>) -> Self {
        self.lock().output.push((image.into(), lines));
        self
    }

    /// Fetching any tag of `repository` fails.
    pub fn with_pull_failure(self, repository: impl Into<String>) -> Self {
        self.lock().pull_failures.insert(repository.into());
        self
    }

    pub fn with_ping_failure(self, reason: impl Into<String>) -> Self {
        self.lock().ping_failure = Some(reason.into());
        self
    }

    pub fn with_remove_failure(self) -> Self {
        self.lock().remove_fails = true;
        self
    }

    /// Images fetched so far, as `repository:tag`.
    pub fn pulls(&self) -> Vec<String> {
        self.lock().pulls.clone()
    }

    /// Specs of every sandbox created so far.
    pub fn created(&self) -> Vec<SandboxSpec> {
        self.lock().created.clone()
    }

    /// Ids of started sandboxes.
    pub fn started(&self) -> Vec<String> {
        self.lock().started.clone()
    }

    /// Ids of killed sandboxes.
    pub fn kills(&self) -> Vec<String> {
        self.lock().kills.clone()
    }

    /// Ids of sandboxes whose removal was requested.
    pub fn removals(&self) -> Vec<String> {
        self.lock().removals.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, EngineState> {
        self.state.lock().unwrap()
    }
}

#[async_trait]
impl SandboxEngine for FakeEngine {
    async fn ping(&self) -> EngineResult<()> {
        match &self.lock().ping_failure {
            Some(reason) => Err(EngineError::Unreachable(reason.clone())),
            None => Ok(()),
        }
    }

    fn fetch_image(&self, image: &ImageRef) -> ProgressStream<'_> {
        let mut state = self.lock();
        state.pulls.push(image.to_string());
        if state.pull_failures.contains(&image.repository) {
            let err = EngineError::api(
                "create_image",
                format!("pull access denied for {}", image.repository),
            );
            return stream::iter(vec![Err(err)]).boxed();
        }
        let events = vec![
            Ok(PullProgress {
                id: Some(image.tag_or_latest().to_string()),
                status: Some("Pulling from library".into()),
                progress: None,
            }),
            Ok(PullProgress {
                status: Some(format!("Status: Image is up to date for {image}")),
                ..Default::default()
            }),
        ];
        stream::iter(events).boxed()
    }

    async fn create_sandbox(&self, spec: &SandboxSpec) -> EngineResult<Box<dyn Sandbox>> {
        let mut state = self.lock();
        let behavior = state
            .rules
            .iter()
            .find(|(matcher, _)| matcher.matches(spec))
            .map(|(_, behavior)| behavior.clone())
            .unwrap_or_else(|| FakeBehavior::from_command(spec.command.as_deref()));

        if let FakeBehavior::CreateFails(reason) = &behavior {
            return Err(EngineError::api("create_container", reason.clone()));
        }

        state.created.push(spec.clone());
        let output = state
            .output
            .iter()
            .find(|(image, _)| image == &spec.image)
            .map(|(_, lines)| lines.clone())
            .unwrap_or_default();
        let id = format!("fake-{}", self.next_id.fetch_add(1, Ordering::Relaxed));

        Ok(Box::new(FakeSandbox {
            id,
            behavior,
            output,
            state: Arc::clone(&self.state),
        }))
    }
}

struct FakeSandbox {
    id: String,
    behavior: FakeBehavior,
    output: Vec<String>,
    state: Arc<Mutex<EngineState>>,
}

impl FakeSandbox {
    fn lock(&self) -> std::sync::MutexGuard<'_, EngineState> {
        self.state.lock().unwrap()
    }

    fn was_killed(&self) -> bool {
        self.lock().kills.contains(&self.id)
    }
}

#[async_trait]
impl Sandbox for FakeSandbox {
    fn id(&self) -> &str {
        &self.id
    }

    async fn attach(&self) -> EngineResult<OutputStream> {
        if let FakeBehavior::AttachFails(reason) = &self.behavior {
            return Err(EngineError::api("attach_container", reason.clone()));
        }
        let chunks: Vec<EngineResult<Vec<u8>>> = self
            .output
            .iter()
            .map(|line| Ok(format!("{line}\r\n").into_bytes()))
            .collect();
        Ok(stream::iter(chunks).boxed())
    }

    async fn start(&self) -> EngineResult<()> {
        if let FakeBehavior::StartFails(reason) = &self.behavior {
            return Err(EngineError::api("start_container", reason.clone()));
        }
        self.lock().started.push(self.id.clone());
        Ok(())
    }

    async fn kill(&self) -> EngineResult<()> {
        self.lock().kills.push(self.id.clone());
        Ok(())
    }

    async fn wait(&self) -> EngineResult<()> {
        match &self.behavior {
            FakeBehavior::Exit { after, .. } => {
                tokio::time::sleep(*after).await;
                Ok(())
            }
            FakeBehavior::InspectFails(_) | FakeBehavior::ExitUnreported => Ok(()),
            _ => std::future::pending().await,
        }
    }

    async fn inspect(&self) -> EngineResult<SandboxState> {
        if let FakeBehavior::InspectFails(reason) = &self.behavior {
            return Err(EngineError::api("inspect_container", reason.clone()));
        }
        if self.was_killed() {
            return Ok(SandboxState {
                exit_code: Some(KILLED_EXIT_CODE),
            });
        }
        let exit_code = match &self.behavior {
            FakeBehavior::Exit { code, .. } => Some(*code),
            _ => None,
        };
        Ok(SandboxState { exit_code })
    }

    async fn remove(&self) -> EngineResult<()> {
        let mut state = self.lock();
        state.removals.push(self.id.clone());
        if state.remove_fails {
            return Err(EngineError::api("remove_container", "device or resource busy"));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MemoryScratch
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct ScratchState {
    acquire_fails: bool,
    write_fails: bool,
    acquired: Vec<PathBuf>,
    released: Vec<PathBuf>,
    files: Vec<(PathBuf, Vec<u8>)>,
}

/// Scratch storage that hands out virtual paths and records every call.
#[derive(Debug, Default)]
pub struct MemoryScratch {
    state: Mutex<ScratchState>,
}

impl MemoryScratch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_acquire_failure(self) -> Self {
        self.lock().acquire_fails = true;
        self
    }

    pub fn with_write_failure(self) -> Self {
        self.lock().write_fails = true;
        self
    }

    pub fn acquired(&self) -> Vec<PathBuf> {
        self.lock().acquired.clone()
    }

    pub fn released(&self) -> Vec<PathBuf> {
        self.lock().released.clone()
    }

    /// Contents written to `path`, if any.
    pub fn file(&self, path: &Path) -> Option<Vec<u8>> {
        self.lock()
            .files
            .iter()
            .find(|(p, _)| p == path)
            .map(|(_, contents)| contents.clone())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ScratchState> {
        self.state.lock().unwrap()
    }
}

#[async_trait]
impl ScratchStorage for MemoryScratch {
    async fn acquire_directory(&self) -> io::Result<PathBuf> {
        let mut state = self.lock();
        if state.acquire_fails {
            return Err(io::Error::new(io::ErrorKind::PermissionDenied, "read-only file system"));
        }
        let path = PathBuf::from(format!("/scratch/job-{}", state.acquired.len()));
        state.acquired.push(path.clone());
        Ok(path)
    }

    async fn release_directory(&self, path: &Path) -> io::Result<()> {
        self.lock().released.push(path.to_path_buf());
        Ok(())
    }

    async fn write_file(&self, path: &Path, contents: &[u8]) -> io::Result<()> {
        let mut state = self.lock();
        if state.write_fails {
            return Err(io::Error::other("no space left on device"));
        }
        state.files.push((path.to_path_buf(), contents.to_vec()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(image: &str, command: &[&str]) -> SandboxSpec {
        SandboxSpec {
            hostname: None,
            image: image.into(),
            command: Some(command.iter().map(|s| s.to_string()).collect()),
            env: Vec::new(),
            binds: Vec::new(),
            network_disabled: true,
            limits: Default::default(),
            cap_add: Vec::new(),
        }
    }

    #[test]
    fn test_behavior_from_command() {
        let cmd = |args: &[&str]| -> Vec<String> { args.iter().map(|s| s.to_string()).collect() };
        assert_eq!(FakeBehavior::from_command(None), FakeBehavior::exit(0));
        assert_eq!(
            FakeBehavior::from_command(Some(cmd(&["false"]).as_slice())),
            FakeBehavior::exit(1)
        );
        assert_eq!(
            FakeBehavior::from_command(Some(cmd(&["exit", "3"]).as_slice())),
            FakeBehavior::exit(3)
        );
        assert_eq!(
            FakeBehavior::from_command(Some(cmd(&["sleep", "60"]).as_slice())),
            FakeBehavior::Exit {
                code: 0,
                after: Duration::from_secs(60)
            }
        );
    }

    #[tokio::test]
    async fn test_rules_take_precedence_over_command() {
        let engine = FakeEngine::new().on_command("true", FakeBehavior::exit(9));
        let sandbox = engine.create_sandbox(&spec("alpine", &["true"])).await.unwrap();
        sandbox.wait().await.unwrap();
        assert_eq!(sandbox.inspect().await.unwrap().exit_code, Some(9));
    }

    #[tokio::test]
    async fn test_inspect_failure_after_exit() {
        let engine = FakeEngine::new().on_image("broken", FakeBehavior::InspectFails("gone".into()));
        let sandbox = engine.create_sandbox(&spec("broken", &["true"])).await.unwrap();
        sandbox.wait().await.unwrap();
        assert!(sandbox.inspect().await.is_err());
    }

    #[tokio::test]
    async fn test_output_lines_are_streamed() {
        let engine = FakeEngine::new().with_output("alpine", vec!["hello".into()]);
        let sandbox = engine.create_sandbox(&spec("alpine", &["true"])).await.unwrap();
        let chunks: Vec<_> = sandbox.attach().await.unwrap().collect().await;
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].as_ref().unwrap(), b"hello\r\n");
    }

    #[tokio::test]
    async fn test_memory_scratch_records_calls() {
        let scratch = MemoryScratch::new();
        let dir = scratch.acquire_directory().await.unwrap();
        scratch.write_file(&dir.join("a"), b"x").await.unwrap();
        scratch.release_directory(&dir).await.unwrap();

        assert_eq!(scratch.acquired(), vec![dir.clone()]);
        assert_eq!(scratch.released(), vec![dir.clone()]);
        assert_eq!(scratch.file(&dir.join("a")), Some(b"x".to_vec()));
    }
}
