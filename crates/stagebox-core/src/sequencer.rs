//! Ordered stage execution with abort-on-first-failure.

use std::path::Path;

use tracing::{error, info, info_span, Instrument};

use crate::engine::SandboxEngine;
use crate::env::JobEnv;
use crate::job::{Stage, StageResult};
use crate::runner::{run_sandbox, SandboxOptions};

/// Sandbox options for one stage of a job.
pub fn stage_options(stage: &Stage, job_env: &JobEnv, scratch_dir: &Path) -> SandboxOptions {
    SandboxOptions {
        image: stage.image.clone(),
        command: stage.entry_point.clone(),
        timeout: stage.timeout_duration(),
        env: job_env.resolve(&stage.env),
        scratch_dir: scratch_dir.to_path_buf(),
        enable_networking: stage.enable_networking,
        host_name: stage.host_name.clone(),
        capabilities: stage.capabilities.clone(),
    }
}

/// Run `stages` in order, stopping after the first one that fails.
///
/// Returns one result per attempted stage; stages after a failure are never
/// attempted and have no entry.
pub async fn run_stages(
    engine: &dyn SandboxEngine,
    stages: &[Stage],
    job_env: &JobEnv,
    scratch_dir: &Path,
) -> Vec<StageResult> {
    let mut results = Vec::with_capacity(stages.len());

    for (i, stage) in stages.iter().enumerate() {
        info!(stage = i, image = %stage.image, "Beginning pipeline stage");
        let options = stage_options(stage, job_env, scratch_dir);
        let result = run_sandbox(engine, &options)
            .instrument(info_span!("stage", index = i))
            .await;

        let succeeded = result.succeeded;
        results.push(result);
        if !succeeded {
            error!(stage = i, "Pipeline stage failed; aborting job");
            break;
        }
    }

    results
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::{FakeBehavior, FakeEngine};
    use crate::job::DEFAULT_STAGE_TIMEOUT_SECS;
    use std::path::PathBuf;
    use std::time::Duration;

    fn stage(command: &[&str]) -> Stage {
        Stage::new("alpine", command.iter().map(|s| s.to_string()).collect())
    }

    #[test]
    fn test_stage_options_resolve_env_and_defaults() {
        let job_env = JobEnv::from_entries(&["TOKEN=abc".to_string()]);
        let mut s = stage(&["make"]).with_env(vec!["TOKEN".into(), "MODE=ci".into()]);
        s.host_name = Some("builder".into());
        s.capabilities = vec!["NET_ADMIN".into()];

        let options = stage_options(&s, &job_env, Path::new("/scratch/job-0"));

        assert_eq!(options.env, vec!["TOKEN=abc", "MODE=ci"]);
        assert_eq!(options.timeout, Duration::from_secs(30));
        assert_eq!(options.scratch_dir, PathBuf::from("/scratch/job-0"));
        assert_eq!(options.host_name.as_deref(), Some("builder"));
        assert_eq!(options.capabilities, vec!["NET_ADMIN"]);
        assert!(!options.enable_networking);
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_stages_run_when_all_succeed() {
        let engine = FakeEngine::new();
        let stages = vec![stage(&["true"]), stage(&["true"]), stage(&["true"])];

        let results = run_stages(&engine, &stages, &JobEnv::default(), Path::new("/s")).await;

        assert_eq!(results.len(), 3);
        assert!(results.iter().all(|r| r.succeeded));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stops_at_first_failure() {
        let engine = FakeEngine::new();
        let stages = vec![
            stage(&["true"]),
            stage(&["false"]),
            stage(&["true"]),
            stage(&["true"]),
        ];

        let results = run_stages(&engine, &stages, &JobEnv::default(), Path::new("/s")).await;

        assert_eq!(results.len(), 2);
        assert!(results[0].succeeded);
        assert!(!results[1].succeeded);
        assert_eq!(engine.created().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_creation_failure_aborts_without_retry() {
        let engine = FakeEngine::new().on_command(
            "build",
            FakeBehavior::CreateFails("no such image".into()),
        );
        let stages = vec![stage(&["build"]), stage(&["true"])];

        let results = run_stages(&engine, &stages, &JobEnv::default(), Path::new("/s")).await;

        assert_eq!(results.len(), 1);
        assert!(results[0].message.contains("no such image"));
        assert!(engine.created().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_stage_hits_default_timeout() {
        let engine = FakeEngine::new().on_command("serve", FakeBehavior::Hang);
        let stages = vec![stage(&["serve"]), stage(&["true"])];

        let results = run_stages(&engine, &stages, &JobEnv::default(), Path::new("/s")).await;

        assert_eq!(results.len(), 1);
        assert!(results[0].timed_out);
        assert_eq!(results[0].duration, DEFAULT_STAGE_TIMEOUT_SECS);
        assert_eq!(results[0].exit_code, None);
        assert_eq!(engine.started().len(), 1);
        assert_eq!(engine.kills().len(), 1);
        assert_eq!(engine.removals().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_every_stage_sees_same_scratch_dir() {
        let engine = FakeEngine::new();
        let stages = vec![stage(&["true"]), stage(&["true"])];

        run_stages(&engine, &stages, &JobEnv::default(), Path::new("/scratch/job-7")).await;

        for spec in engine.created() {
            assert_eq!(spec.binds[0].host_path, PathBuf::from("/scratch/job-7"));
        }
    }
}
