//! Translation between stagebox types and Docker API models.

use std::collections::HashMap;

use bollard::container::{Config, LogOutput};
use bollard::errors::Error as DockerError;
use bollard::image::CreateImageOptions;
use bollard::models::{CreateImageInfo, HostConfig};

use stagebox_core::{EngineError, ImageRef, PullProgress, SandboxSpec};

/// Container configuration for `spec`.
pub fn container_config(spec: &SandboxSpec, enforce_disk_quota: bool) -> Config<String> {
    let limits = &spec.limits;
    let storage_opt = enforce_disk_quota.then(|| {
        HashMap::from([("size".to_string(), limits.disk_quota_bytes.to_string())])
    });

    let host_config = HostConfig {
        binds: Some(spec.binds.iter().map(|b| b.to_bind_string()).collect()),
        memory: Some(limits.memory_bytes),
        memory_swap: Some(limits.memory_swap_bytes),
        ipc_mode: Some(limits.ipc_mode.to_string()),
        cpu_period: Some(limits.cpu_period_micros),
        cpu_quota: Some(limits.cpu_quota_micros),
        pids_limit: Some(limits.pids_limit),
        cap_add: Some(spec.cap_add.clone()),
        storage_opt,
        ..Default::default()
    };

    Config {
        hostname: spec.hostname.clone(),
        image: Some(spec.image.clone()),
        cmd: spec.command.clone(),
        env: Some(spec.env.clone()),
        attach_stdout: Some(true),
        attach_stderr: Some(true),
        tty: Some(true),
        network_disabled: Some(spec.network_disabled),
        host_config: Some(host_config),
        ..Default::default()
    }
}

/// Standard limits the daemon is not asked to enforce.
///
/// Kernel memory is never forwarded, and the disk quota only when enabled.
pub fn unenforced_limits(enforce_disk_quota: bool) -> Vec<&'static str> {
    let mut limits = vec!["kernel_memory"];
    if !enforce_disk_quota {
        limits.push("disk_quota");
    }
    limits
}

/// Pull options for `image`: by digest when pinned, otherwise by tag.
pub fn pull_options(image: &ImageRef) -> CreateImageOptions<'static, String> {
    match &image.digest {
        Some(digest) => CreateImageOptions {
            from_image: format!("{}@{}", image.repository, digest),
            ..Default::default()
        },
        None => CreateImageOptions {
            from_image: image.repository.clone(),
            tag: image.tag_or_latest().to_string(),
            ..Default::default()
        },
    }
}

/// Convert one pull progress record, surfacing daemon-reported errors.
pub fn pull_progress(info: CreateImageInfo) -> Result<PullProgress, EngineError> {
    if let Some(error) = info.error {
        return Err(EngineError::api("create_image", error));
    }
    Ok(PullProgress {
        id: info.id,
        status: info.status,
        progress: info.progress,
    })
}

/// Raw bytes of an attached output frame.
pub fn output_bytes(output: LogOutput) -> Vec<u8> {
    match output {
        LogOutput::StdOut { message }
        | LogOutput::StdErr { message }
        | LogOutput::StdIn { message }
        | LogOutput::Console { message } => message.to_vec(),
    }
}

/// Map a client error to an engine error for `operation`.
pub fn api_error(operation: &'static str) -> impl Fn(DockerError) -> EngineError {
    move |err| match err {
        DockerError::DockerResponseServerError {
            status_code,
            message,
        } => EngineError::api(operation, format!("{message} (status {status_code})")),
        other => EngineError::api(operation, other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stagebox_core::{BindMount, ResourceLimits};
    use std::path::PathBuf;

    fn spec() -> SandboxSpec {
        SandboxSpec {
            hostname: Some("grader".into()),
            image: "alpine:3.19".into(),
            command: Some(vec!["sh".into(), "-c".into(), "make".into()]),
            env: vec!["A=1".into()],
            binds: vec![BindMount {
                host_path: PathBuf::from("/tmp/stagebox-x"),
                sandbox_path: "/job".into(),
            }],
            network_disabled: true,
            limits: ResourceLimits::STANDARD,
            cap_add: vec!["SYS_PTRACE".into()],
        }
    }

    #[test]
    fn test_container_config_carries_limits() {
        let config = container_config(&spec(), false);
        let host = config.host_config.unwrap();

        assert_eq!(config.hostname.as_deref(), Some("grader"));
        assert_eq!(config.tty, Some(true));
        assert_eq!(config.network_disabled, Some(true));
        assert_eq!(config.env, Some(vec!["A=1".to_string()]));
        assert_eq!(host.binds, Some(vec!["/tmp/stagebox-x:/job".to_string()]));
        assert_eq!(host.memory, Some(1024 * 1024 * 1024));
        assert_eq!(host.memory_swap, Some(1024 * 1024 * 1024));
        assert_eq!(host.cpu_period, Some(100_000));
        assert_eq!(host.cpu_quota, Some(90_000));
        assert_eq!(host.pids_limit, Some(1024));
        assert_eq!(host.ipc_mode.as_deref(), Some("private"));
        assert_eq!(host.cap_add, Some(vec!["SYS_PTRACE".to_string()]));
        assert!(host.storage_opt.is_none());
    }

    #[test]
    fn test_disk_quota_as_storage_opt() {
        let host = container_config(&spec(), true).host_config.unwrap();
        let opts = host.storage_opt.unwrap();
        assert_eq!(opts.get("size").map(String::as_str), Some("1073741824"));
    }

    #[test]
    fn test_image_default_command_left_unset() {
        let mut spec = spec();
        spec.command = None;
        assert!(container_config(&spec, false).cmd.is_none());
    }

    #[test]
    fn test_unenforced_limits() {
        assert_eq!(unenforced_limits(false), vec!["kernel_memory", "disk_quota"]);
        assert_eq!(unenforced_limits(true), vec!["kernel_memory"]);
    }

    #[test]
    fn test_pull_options() {
        let tagged = pull_options(&ImageRef::parse("localhost:5000/grader"));
        assert_eq!(tagged.from_image, "localhost:5000/grader");
        assert_eq!(tagged.tag, "latest");

        let pinned = pull_options(&ImageRef::parse("alpine@sha256:abc"));
        assert_eq!(pinned.from_image, "alpine@sha256:abc");
        assert!(pinned.tag.is_empty());
    }

    #[test]
    fn test_pull_progress_error_surfaces() {
        let info = CreateImageInfo {
            error: Some("manifest unknown".into()),
            ..Default::default()
        };
        let err = pull_progress(info).unwrap_err();
        assert!(err.to_string().contains("manifest unknown"));
    }

    #[test]
    fn test_output_bytes() {
        let frame = LogOutput::Console {
            message: "hi\r\n".into(),
        };
        assert_eq!(output_bytes(frame), b"hi\r\n");
    }
}
