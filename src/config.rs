//! Backend configuration.
//!
//! Plain serde structs with environment-aware defaults. A [`BackendConfig`]
//! can be loaded from JSON, which is how the CLI's `--config` flag works:
//!
//! ```json
//! { "containerd": { "rootless_mode": "enabled", "namespace": "ci" } }
//! ```

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::constants::{DEFAULT_CONTAINERD_NAMESPACE, DEFAULT_SNAPSHOTTER};
use crate::error::Result;
use crate::types::{BackendType, RootlessMode};

/// Environment variable naming the Docker daemon address.
pub const DOCKER_HOST_ENV: &str = "DOCKER_HOST";

/// Docker backend configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DockerConfig {
    /// Daemon address (`unix://`, `tcp://`, `http://`). Falls back to `DOCKER_HOST`.
    pub host: Option<String>,
    /// Pin the API version (`MAJOR.MINOR`) instead of negotiating.
    pub api_version: Option<String>,
}

impl DockerConfig {
    /// Returns the configured host, else `DOCKER_HOST`, else `None`.
    #[must_use]
    pub fn effective_host(&self) -> Option<String> {
        self.host
            .clone()
            .filter(|h| !h.is_empty())
            .or_else(|| std::env::var(DOCKER_HOST_ENV).ok().filter(|h| !h.is_empty()))
    }
}

/// containerd backend configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerdConfig {
    pub rootless_mode: RootlessMode,
    /// Explicit containerd binary; PATH lookup otherwise.
    pub containerd_path: Option<PathBuf>,
    /// Explicit rootlesskit binary; PATH lookup otherwise.
    pub rootlesskit_path: Option<PathBuf>,
    /// Explicit fuse-overlayfs binary; PATH lookup otherwise.
    pub fuse_overlayfs_path: Option<PathBuf>,
    /// Launch a rootless daemon when none is reachable.
    pub auto_start: bool,
    /// Explicit control socket; derived from the rootless mode otherwise.
    pub socket_path: Option<PathBuf>,
    /// containerd namespace for all resources.
    pub namespace: String,
    /// Snapshotter used for container rootfs.
    pub snapshotter: String,
}

impl Default for ContainerdConfig {
    fn default() -> Self {
        Self {
            rootless_mode: RootlessMode::Auto,
            containerd_path: None,
            rootlesskit_path: None,
            fuse_overlayfs_path: None,
            auto_start: true,
            socket_path: None,
            namespace: DEFAULT_CONTAINERD_NAMESPACE.to_string(),
            snapshotter: DEFAULT_SNAPSHOTTER.to_string(),
        }
    }
}

/// Configuration for one backend, tagged by type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendConfig {
    Docker(DockerConfig),
    Containerd(ContainerdConfig),
}

impl BackendConfig {
    /// Default configuration for a backend type.
    #[must_use]
    pub fn default_for(backend: BackendType) -> Self {
        match backend {
            BackendType::Docker => Self::Docker(DockerConfig::default()),
            BackendType::Containerd => Self::Containerd(ContainerdConfig::default()),
        }
    }

    /// Parses a JSON document such as `{"docker": {"host": "unix:///run/docker.sock"}}`.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Returns the backend type this config targets.
    #[must_use]
    pub fn backend_type(&self) -> BackendType {
        match self {
            Self::Docker(_) => BackendType::Docker,
            Self::Containerd(_) => BackendType::Containerd,
        }
    }
}
