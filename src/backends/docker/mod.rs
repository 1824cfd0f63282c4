//! # Docker Backend
//!
//! Drives containers through the Docker engine API (bollard).
//!
//! ## ID Mapping
//!
//! Containers are created under their [`ContainerId`] as the engine-side
//! name. The engine's own ID is cached per backend; a cache miss (for
//! example after a process restart) falls back to a name-filtered listing
//! and repopulates the cache:
//!
//! ```text
//!   ContainerId ──► cache hit? ── yes ──► native ID
//!                       │ no
//!                       ▼
//!            list_containers(name=<id>, all) ──► exact name match ──► cache + native ID
//!                       │ none
//!                       ▼
//!               ContainerNotFound
//! ```
//!
//! ## Connection
//!
//! `host` (or `DOCKER_HOST`) may be `unix://`, `tcp://` or `http://`. The
//! API version is negotiated with the engine unless pinned in the config.
//! Construction pings the engine before returning.

pub mod image;
pub mod translate;

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bollard::container::LogOutput;
use bollard::errors::Error as DockerError;
use bollard::models::HostConfig;
use bollard::query_parameters::{
    CreateContainerOptions, InspectContainerOptions, ListContainersOptions, ListImagesOptions,
    LogsOptions, RemoveContainerOptions, RemoveImageOptions, StartContainerOptions,
    StopContainerOptions, WaitContainerOptions,
};
use bollard::{ClientVersion, Docker};
use chrono::{DateTime, Datelike, Utc};
use futures_util::{StreamExt, TryStreamExt};
use tokio_util::io::StreamReader;
use tracing::{debug, info, warn};

use self::image::DockerImage;
use self::translate::translate;
use crate::backend::{Backend, Image, LogStream};
use crate::config::DockerConfig;
use crate::constants::{
    DEFAULT_DOCKER_HOST, DOCKER_CLIENT_TIMEOUT_SECS, DOCKER_STOP_TIMEOUT_SECS,
    DOCKER_WAIT_CONDITION,
};
use crate::error::{Error, Result};
use crate::types::{
    BackendCapabilities, BackendType, ContainerConfig, ContainerId, ContainerInfo, ResourceLimits,
};

/// Docker backend.
pub struct DockerBackend {
    config: DockerConfig,
    client: Docker,
    /// [`ContainerId`] to engine container ID.
    ids: Mutex<HashMap<ContainerId, String>>,
}

impl std::fmt::Debug for DockerBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DockerBackend")
            .field("host", &self.config.effective_host())
            .finish_non_exhaustive()
    }
}

impl DockerBackend {
    /// Connects to the engine and checks that it answers.
    ///
    /// # Errors
    /// Fails on an unsupported host scheme, a malformed pinned API version,
    /// or an engine that does not respond to ping.
    pub async fn connect(config: DockerConfig) -> Result<Self> {
        let host = config
            .effective_host()
            .unwrap_or_else(|| DEFAULT_DOCKER_HOST.to_string());
        let pinned = config
            .api_version
            .as_deref()
            .filter(|v| !v.is_empty())
            .map(parse_api_version)
            .transpose()?;
        let version = pinned.as_ref().unwrap_or(bollard::API_DEFAULT_VERSION);

        let client = client_for(&host, version)?;
        let client = if pinned.is_some() {
            client
        } else {
            client
                .negotiate_version()
                .await
                .map_err(|e| unavailable(format!("Docker daemon not responding: {e}")))?
        };

        let backend = Self::from_client(config, client);
        backend.health_check().await?;
        info!("Connected to Docker at {}", host);
        Ok(backend)
    }

    /// Wraps an existing client without probing it.
    #[must_use]
    pub fn from_client(config: DockerConfig, client: Docker) -> Self {
        Self {
            config,
            client,
            ids: Mutex::new(HashMap::new()),
        }
    }

    fn lock_ids(&self) -> MutexGuard<'_, HashMap<ContainerId, String>> {
        self.ids.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Resolves the engine-side ID, consulting the cache first.
    async fn docker_id(&self, id: &ContainerId) -> Result<String> {
        if let Some(native) = self.lock_ids().get(id).cloned() {
            return Ok(native);
        }

        let opts = ListContainersOptions {
            all: true,
            filters: Some(HashMap::from([(
                "name".to_string(),
                vec![id.to_string()],
            )])),
            ..Default::default()
        };
        let containers = self.client.list_containers(Some(opts)).await?;

        // The engine's name filter matches substrings.
        let native = containers
            .into_iter()
            .find(|c| {
                c.names
                    .iter()
                    .flatten()
                    .any(|name| name.trim_start_matches('/') == id.as_str())
            })
            .and_then(|c| c.id)
            .ok_or_else(|| Error::ContainerNotFound(id.to_string()))?;

        debug!("Resolved {} to {} by name", id, native);
        self.lock_ids().insert(id.clone(), native.clone());
        Ok(native)
    }

    /// Force-removes images older than `max_age` that match `filters`
    /// (engine filter syntax, e.g. `{"dangling": ["true"]}`), pruning
    /// untagged parents.
    ///
    /// Returns how many images were removed. Individual failures do not stop
    /// the sweep; they are reported together at the end.
    pub async fn clean_images(
        &self,
        max_age: Duration,
        filters: HashMap<String, Vec<String>>,
    ) -> Result<usize> {
        let opts = ListImagesOptions {
            filters: Some(filters),
            ..Default::default()
        };
        let images = self.client.list_images(Some(opts)).await?;

        let age = i64::try_from(max_age.as_secs()).unwrap_or(i64::MAX);
        let cutoff = Utc::now().timestamp().saturating_sub(age);

        let mut removed = 0;
        let mut failures = Vec::new();
        for image in images.into_iter().filter(|i| i.created < cutoff) {
            let opts = RemoveImageOptions {
                force: true,
                noprune: false,
                ..Default::default()
            };
            match self.client.remove_image(&image.id, Some(opts), None).await {
                Ok(_) => {
                    debug!("Removed image {} {:?}", image.id, image.repo_tags);
                    removed += 1;
                }
                Err(e) => {
                    warn!("Failed to remove image {}: {}", image.id, e);
                    failures.push(format!("{}: {e}", image.id));
                }
            }
        }

        if failures.is_empty() {
            info!("Removed {} image(s) older than {:?}", removed, max_age);
            Ok(removed)
        } else {
            Err(Error::ImageCleanupFailed {
                count: failures.len(),
                failures: failures.join("; "),
            })
        }
    }
}

#[async_trait]
impl Backend for DockerBackend {
    fn backend_type(&self) -> BackendType {
        BackendType::Docker
    }

    fn image(&self, name: &str) -> Box<dyn Image> {
        Box::new(DockerImage::new(self.client.clone(), name))
    }

    async fn create(&self, config: &ContainerConfig) -> Result<ContainerId> {
        config.validate()?;
        let body = translate(config)?;

        let id = ContainerId::generate();
        let opts = CreateContainerOptions {
            name: Some(id.to_string()),
            ..Default::default()
        };
        let response = self
            .client
            .create_container(Some(opts), body)
            .await
            .map_err(|e| match e {
                DockerError::DockerResponseServerError {
                    status_code: 404, ..
                } => Error::ImageNotFound(config.image.clone()),
                other => Error::CreateFailed {
                    id: id.to_string(),
                    reason: other.to_string(),
                },
            })?;

        for warning in &response.warnings {
            warn!("Docker create {}: {}", id, warning);
        }
        self.lock_ids().insert(id.clone(), response.id);
        info!("Created container {} from {}", id, config.image);
        Ok(id)
    }

    async fn start(&self, id: &ContainerId) -> Result<()> {
        let native = self.docker_id(id).await?;
        self.client
            .start_container(&native, None::<StartContainerOptions>)
            .await
            .map_err(|e| lifecycle_error(id, e, |reason| Error::StartFailed {
                id: id.to_string(),
                reason,
            }))?;
        info!("Started container {}", id);
        Ok(())
    }

    async fn stop(&self, id: &ContainerId) -> Result<()> {
        let native = self.docker_id(id).await?;
        let opts = StopContainerOptions {
            t: Some(DOCKER_STOP_TIMEOUT_SECS),
            signal: None,
        };
        match self.client.stop_container(&native, Some(opts)).await {
            Ok(()) => {}
            // Not modified: already stopped.
            Err(DockerError::DockerResponseServerError {
                status_code: 304, ..
            }) => debug!("Container {} already stopped", id),
            Err(e) => {
                return Err(lifecycle_error(id, e, |reason| Error::StopFailed {
                    id: id.to_string(),
                    reason,
                }))
            }
        }
        info!("Stopped container {}", id);
        Ok(())
    }

    async fn remove(&self, id: &ContainerId) -> Result<()> {
        let native = self.docker_id(id).await?;
        self.client
            .remove_container(&native, None::<RemoveContainerOptions>)
            .await
            .map_err(|e| lifecycle_error(id, e, |reason| Error::DeleteFailed {
                id: id.to_string(),
                reason,
            }))?;
        self.lock_ids().remove(id);
        info!("Removed container {}", id);
        Ok(())
    }

    async fn wait(&self, id: &ContainerId) -> Result<()> {
        let native = self.docker_id(id).await?;
        let opts = WaitContainerOptions {
            condition: DOCKER_WAIT_CONDITION.to_string(),
        };
        let mut stream = self.client.wait_container(&native, Some(opts));

        let code = match stream.next().await {
            Some(Ok(response)) => response.status_code,
            // bollard reports a non-zero exit as an error record.
            Some(Err(DockerError::DockerContainerWaitError { code, .. })) => code,
            Some(Err(DockerError::DockerResponseServerError {
                status_code: 404, ..
            })) => return Err(Error::ContainerNotFound(id.to_string())),
            Some(Err(e)) => return Err(e.into()),
            None => 0,
        };

        match code {
            0 => Ok(()),
            code => Err(Error::NonZeroExit {
                id: id.to_string(),
                code,
            }),
        }
    }

    async fn logs(&self, id: &ContainerId) -> Result<LogStream> {
        let native = self.docker_id(id).await?;
        let opts = LogsOptions {
            stdout: true,
            stderr: true,
            follow: false,
            ..Default::default()
        };
        let stream = self
            .client
            .logs(&native, Some(opts))
            .map_ok(LogOutput::into_bytes)
            .map_err(std::io::Error::other);
        Ok(Box::pin(StreamReader::new(stream)))
    }

    async fn inspect(&self, id: &ContainerId) -> Result<ContainerInfo> {
        let native = self.docker_id(id).await?;
        let details = self
            .client
            .inspect_container(&native, None::<InspectContainerOptions>)
            .await
            .map_err(|e| match e {
                DockerError::DockerResponseServerError {
                    status_code: 404, ..
                } => Error::ContainerNotFound(id.to_string()),
                other => other.into(),
            })?;

        let state = details.state.unwrap_or_default();
        let mut info = ContainerInfo::new(
            id.clone(),
            state.status.map(|s| s.to_string()).unwrap_or_default(),
        );
        info.exit_code = state.exit_code.unwrap_or_default();
        info.started_at = state.started_at.as_deref().and_then(parse_started_at);
        info.image = details
            .config
            .and_then(|c| c.image)
            .unwrap_or_default();
        info.resources = details.host_config.as_ref().and_then(resources_from_host);
        Ok(info)
    }

    async fn health_check(&self) -> Result<()> {
        self.client
            .ping()
            .await
            .map_err(|e| unavailable(format!("Docker daemon not responding: {e}")))?;
        Ok(())
    }

    fn capabilities(&self) -> BackendCapabilities {
        BackendCapabilities {
            supports_memory: true,
            supports_cpu: true,
            supports_storage: true,
            supports_pids: true,
            supports_memory_swap: true,
            supports_build: true,
            supports_oci: true,
            supports_networking: true,
            supports_volumes: true,
        }
    }
}

/// Builds an (unconnected) client for a `unix://`, `tcp://` or `http://` host.
fn client_for(host: &str, version: &ClientVersion) -> Result<Docker> {
    let client = match host.split_once("://").map(|(scheme, _)| scheme) {
        Some("unix") => Docker::connect_with_unix(host, DOCKER_CLIENT_TIMEOUT_SECS, version),
        Some("tcp" | "http") => Docker::connect_with_http(host, DOCKER_CLIENT_TIMEOUT_SECS, version),
        _ => {
            return Err(Error::InvalidConfig(format!(
                "unsupported Docker host '{host}' (expected unix://, tcp:// or http://)"
            )))
        }
    };
    client.map_err(|e| unavailable(format!("failed to create Docker client for {host}: {e}")))
}

fn unavailable(reason: String) -> Error {
    Error::BackendUnavailable {
        backend: BackendType::Docker,
        reason,
    }
}

/// 404 becomes [`Error::ContainerNotFound`]; anything else goes to `other`.
fn lifecycle_error(
    id: &ContainerId,
    e: DockerError,
    other: impl FnOnce(String) -> Error,
) -> Error {
    match e {
        DockerError::DockerResponseServerError {
            status_code: 404, ..
        } => Error::ContainerNotFound(id.to_string()),
        e => other(e.to_string()),
    }
}

/// Parses a pinned `MAJOR.MINOR` API version.
pub fn parse_api_version(version: &str) -> Result<ClientVersion> {
    let invalid = || Error::InvalidConfig(format!("invalid Docker API version '{version}'"));
    let (major, minor) = version
        .trim_start_matches('v')
        .split_once('.')
        .ok_or_else(invalid)?;
    Ok(ClientVersion {
        major_version: major.parse().map_err(|_| invalid())?,
        minor_version: minor.parse().map_err(|_| invalid())?,
    })
}

/// Parses the engine's `StartedAt`. The zero time of a never-started
/// container maps to `None`.
fn parse_started_at(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|t| t.with_timezone(&Utc))
        .filter(|t| t.year() > 1)
}

/// Limits as the engine reports them. Only reported when a memory limit is
/// set.
fn resources_from_host(host: &HostConfig) -> Option<ResourceLimits> {
    let memory = host.memory.filter(|m| *m > 0)?;
    Some(ResourceLimits {
        memory,
        memory_swap: host.memory_swap.unwrap_or_default(),
        cpu_quota: host.cpu_quota.unwrap_or_default(),
        cpu_period: host.cpu_period.unwrap_or_default(),
        cpu_shares: host.cpu_shares.unwrap_or_default(),
        storage: host
            .storage_opt
            .as_ref()
            .and_then(|opts| opts.get("size"))
            .and_then(|size| size.parse().ok())
            .unwrap_or_default(),
        pids: host.pids_limit.unwrap_or_default(),
    })
}
