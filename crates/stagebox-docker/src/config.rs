//! Connection settings for the Docker daemon.

use std::path::{Path, PathBuf};

use bollard::{Docker, API_DEFAULT_VERSION};
use thiserror::Error;

use stagebox_core::EngineError;

/// Default request timeout, in seconds.
pub const DEFAULT_TIMEOUT_SECS: u64 = 120;

pub const SOCKET_VAR: &str = "STAGEBOX_DOCKER_SOCKET";
pub const TIMEOUT_VAR: &str = "STAGEBOX_DOCKER_TIMEOUT";
pub const DISK_QUOTA_VAR: &str = "STAGEBOX_ENFORCE_DISK_QUOTA";

/// Invalid configuration value.
#[derive(Error, Debug, PartialEq, Eq)]
#[error("invalid value for {name}: {value:?}")]
pub struct ConfigError {
    pub name: &'static str,
    pub value: String,
}

/// Docker daemon configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DockerConfig {
    /// Unix socket path; `None` uses the local defaults (honours `DOCKER_HOST`)
    pub socket: Option<PathBuf>,
    /// Request timeout in seconds
    pub timeout_secs: u64,
    /// Pass the disk quota as a storage option.
    ///
    /// Only storage drivers backed by xfs with project quotas accept it;
    /// elsewhere container creation fails.
    pub enforce_disk_quota: bool,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            socket: None,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            enforce_disk_quota: false,
        }
    }
}

impl DockerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a config from `STAGEBOX_DOCKER_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(socket) = lookup(SOCKET_VAR).filter(|s| !s.is_empty()) {
            config.socket = Some(PathBuf::from(socket));
        }
        if let Some(value) = lookup(TIMEOUT_VAR) {
            config.timeout_secs = value.trim().parse().map_err(|_| ConfigError {
                name: TIMEOUT_VAR,
                value: value.clone(),
            })?;
        }
        if let Some(value) = lookup(DISK_QUOTA_VAR) {
            config.enforce_disk_quota = parse_flag(&value).ok_or(ConfigError {
                name: DISK_QUOTA_VAR,
                value,
            })?;
        }
        Ok(config)
    }

    pub fn with_socket(mut self, socket: impl AsRef<Path>) -> Self {
        self.socket = Some(socket.as_ref().to_path_buf());
        self
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    pub fn with_disk_quota(mut self, enforce: bool) -> Self {
        self.enforce_disk_quota = enforce;
        self
    }

    /// Open a client for the configured daemon.
    ///
    /// No request is made; reachability is checked by `ping`.
    pub fn connect(&self) -> Result<Docker, EngineError> {
        let docker = match &self.socket {
            Some(socket) => Docker::connect_with_socket(
                &socket.to_string_lossy(),
                self.timeout_secs,
                API_DEFAULT_VERSION,
            ),
            None => Docker::connect_with_local_defaults()
                .map(|docker| docker.with_timeout(std::time::Duration::from_secs(self.timeout_secs))),
        };
        docker.map_err(|e| EngineError::Unreachable(e.to_string()))
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" | "" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = DockerConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, DockerConfig::default());
        assert_eq!(config.timeout_secs, 120);
        assert!(!config.enforce_disk_quota);
    }

    #[test]
    fn test_env_overrides() {
        let config = DockerConfig::from_lookup(lookup(&[
            (SOCKET_VAR, "/run/user/1000/docker.sock"),
            (TIMEOUT_VAR, "30"),
            (DISK_QUOTA_VAR, "true"),
        ]))
        .unwrap();

        assert_eq!(config.socket, Some(PathBuf::from("/run/user/1000/docker.sock")));
        assert_eq!(config.timeout_secs, 30);
        assert!(config.enforce_disk_quota);
    }

    #[test]
    fn test_invalid_timeout_rejected() {
        let err = DockerConfig::from_lookup(lookup(&[(TIMEOUT_VAR, "soon")])).unwrap_err();
        assert_eq!(err.name, TIMEOUT_VAR);
    }

    #[test]
    fn test_invalid_flag_rejected() {
        assert!(DockerConfig::from_lookup(lookup(&[(DISK_QUOTA_VAR, "maybe")])).is_err());
    }

    #[test]
    fn test_builders() {
        let config = DockerConfig::new()
            .with_socket("/var/run/docker.sock")
            .with_timeout(5)
            .with_disk_quota(true);
        assert_eq!(config.socket, Some(PathBuf::from("/var/run/docker.sock")));
        assert_eq!(config.timeout_secs, 5);
        assert!(config.enforce_disk_quota);
    }
}
