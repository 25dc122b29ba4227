//! `SandboxEngine` implementation backed by the Docker Engine API.

use async_trait::async_trait;
use bollard::container::{
    AttachContainerOptions, CreateContainerOptions, InspectContainerOptions,
    KillContainerOptions, RemoveContainerOptions, StartContainerOptions, WaitContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::Docker;
use futures::StreamExt;
use tracing::{debug, warn};

use stagebox_core::{
    EngineError, EngineResult, ImageRef, OutputStream, ProgressStream, Sandbox, SandboxEngine,
    SandboxSpec, SandboxState,
};

use crate::config::DockerConfig;
use crate::convert::{
    api_error, container_config, output_bytes, pull_options, pull_progress, unenforced_limits,
};

/// Docker-backed sandbox engine.
#[derive(Debug, Clone)]
pub struct DockerEngine {
    docker: Docker,
    enforce_disk_quota: bool,
}

impl DockerEngine {
    /// Wrap an existing client.
    pub fn new(docker: Docker) -> Self {
        Self {
            docker,
            enforce_disk_quota: false,
        }
    }

    /// Open a client as described by `config`.
    pub fn connect(config: &DockerConfig) -> EngineResult<Self> {
        let docker = config.connect()?;
        debug!(
            socket = ?config.socket,
            timeout_secs = config.timeout_secs,
            "Docker client configured"
        );
        Ok(Self {
            docker,
            enforce_disk_quota: config.enforce_disk_quota,
        })
    }

    pub fn with_disk_quota(mut self, enforce: bool) -> Self {
        self.enforce_disk_quota = enforce;
        self
    }
}

#[async_trait]
impl SandboxEngine for DockerEngine {
    async fn ping(&self) -> EngineResult<()> {
        self.docker
            .ping()
            .await
            .map(|_| ())
            .map_err(|e| EngineError::Unreachable(e.to_string()))
    }

    fn fetch_image(&self, image: &ImageRef) -> ProgressStream<'_> {
        self.docker
            .create_image(Some(pull_options(image)), None, None)
            .map(|item| item.map_err(api_error("create_image")).and_then(pull_progress))
            .boxed()
    }

    async fn create_sandbox(&self, spec: &SandboxSpec) -> EngineResult<Box<dyn Sandbox>> {
        let config = container_config(spec, self.enforce_disk_quota);
        let response = self
            .docker
            .create_container(None::<CreateContainerOptions<String>>, config)
            .await
            .map_err(api_error("create_container"))?;

        for warning in &response.warnings {
            warn!(sandbox = %response.id, "Docker: {}", warning);
        }
        warn!(
            sandbox = %response.id,
            unenforced = ?unenforced_limits(self.enforce_disk_quota),
            "Sandbox created without some standard resource limits"
        );

        Ok(Box::new(DockerSandbox {
            docker: self.docker.clone(),
            id: response.id,
        }))
    }
}

/// One Docker container.
#[derive(Debug)]
pub struct DockerSandbox {
    docker: Docker,
    id: String,
}

#[async_trait]
impl Sandbox for DockerSandbox {
    fn id(&self) -> &str {
        &self.id
    }

    async fn attach(&self) -> EngineResult<OutputStream> {
        let options = AttachContainerOptions::<String> {
            stdout: Some(true),
            stderr: Some(true),
            stream: Some(true),
            ..Default::default()
        };
        let attached = self
            .docker
            .attach_container(&self.id, Some(options))
            .await
            .map_err(api_error("attach_container"))?;

        Ok(attached
            .output
            .map(|frame| {
                frame
                    .map(output_bytes)
                    .map_err(|e| EngineError::Stream(e.to_string()))
            })
            .boxed())
    }

    async fn start(&self) -> EngineResult<()> {
        self.docker
            .start_container(&self.id, None::<StartContainerOptions<String>>)
            .await
            .map_err(api_error("start_container"))
    }

    async fn kill(&self) -> EngineResult<()> {
        self.docker
            .kill_container(&self.id, None::<KillContainerOptions<String>>)
            .await
            .map_err(api_error("kill_container"))
    }

    async fn wait(&self) -> EngineResult<()> {
        let options = WaitContainerOptions {
            condition: "not-running",
        };
        let mut responses = self.docker.wait_container(&self.id, Some(options));
        match responses.next().await {
            Some(Ok(_)) | None => Ok(()),
            // A non-zero exit is reported as an error but is a normal completion.
            Some(Err(DockerError::DockerContainerWaitError { .. })) => Ok(()),
            Some(Err(e)) => Err(api_error("wait_container")(e)),
        }
    }

    async fn inspect(&self) -> EngineResult<SandboxState> {
        let response = self
            .docker
            .inspect_container(&self.id, None::<InspectContainerOptions>)
            .await
            .map_err(api_error("inspect_container"))?;
        Ok(SandboxState {
            exit_code: response.state.and_then(|state| state.exit_code),
        })
    }

    async fn remove(&self) -> EngineResult<()> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        self.docker
            .remove_container(&self.id, Some(options))
            .await
            .map_err(api_error("remove_container"))
    }
}
