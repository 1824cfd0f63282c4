//! # containerd Backend
//!
//! Drives containers through containerd's gRPC services, against either the
//! system daemon or a per-user rootless daemon this crate supervises.
//!
//! ## Connection Policy
//!
//! ```text
//!   rootless_mode ──resolve(euid)──► rootless?
//!        │
//!        ▼
//!   socket: explicit ─► $XDG_RUNTIME_DIR/tau/containerd/containerd.sock ─► /run/containerd/containerd.sock
//!        │
//!        ▼
//!   socket answers? ── yes ──────────────────────────────► connect + Version
//!        │ no
//!        ├─ rootful ──────────► "please start containerd system-wide"
//!        ├─ rootless + auto_start ──► Daemon::start() ──► connect + Version
//!        └─ rootless ─────────► "socket not found ... auto_start is disabled"
//! ```
//!
//! ## Container Resources
//!
//! | Resource | Created by | Removed by |
//! |----------|-----------|------------|
//! | container record (spec, runtime, snapshot key) | `create` | `remove` |
//! | snapshot `<id>-snapshot` | `create` | `remove` |
//! | task + FIFOs | `start` | `stop` / `remove` |

pub mod daemon;
pub mod image;
pub mod io;
pub mod spec;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use containerd_client::services::v1::container::Runtime;
use containerd_client::services::v1::containers_client::ContainersClient;
use containerd_client::services::v1::snapshots::snapshots_client::SnapshotsClient;
use containerd_client::services::v1::snapshots::{
    MountsRequest, PrepareSnapshotRequest, RemoveSnapshotRequest,
};
use containerd_client::services::v1::tasks_client::TasksClient;
use containerd_client::services::v1::version_client::VersionClient;
use containerd_client::services::v1::{
    Container, CreateContainerRequest, CreateTaskRequest, DeleteContainerRequest,
    DeleteTaskRequest, GetContainerRequest, GetRequest, KillRequest, StartRequest, WaitRequest,
};
use nix::sys::signal::Signal;
use tokio::sync::Mutex;
use tonic::metadata::{AsciiMetadataValue, MetadataValue};
use tonic::transport::Channel;
use tracing::{debug, info, warn};

use self::daemon::{socket_ready, Daemon, DaemonPaths};
use self::image::ContainerdImage;
use self::io::TaskIo;
use self::spec::{build_spec, OciSpec};
use crate::backend::{Backend, Image, LogStream};
use crate::config::ContainerdConfig;
use crate::constants::{
    CONTAINERD_RUNTIME, SNAPSHOT_KEY_SUFFIX, TASK_STOP_TIMEOUT,
};
use crate::error::{Error, Result};
use crate::platform::Platform;
use crate::rootless::{self, Identity, RootlessTools, SubIdValidator};
use crate::types::{
    BackendCapabilities, BackendType, ContainerConfig, ContainerId, ContainerInfo,
};

/// gRPC metadata key selecting the containerd namespace.
const NAMESPACE_HEADER: &str = "containerd-namespace";

// =============================================================================
// Client
// =============================================================================

/// A channel plus the namespace every request is scoped to.
#[derive(Debug, Clone)]
pub(crate) struct Client {
    channel: Channel,
    namespace: AsciiMetadataValue,
}

impl Client {
    fn new(channel: Channel, namespace: &str) -> Result<Self> {
        let namespace = MetadataValue::try_from(namespace)
            .map_err(|e| Error::InvalidConfig(format!("invalid namespace '{namespace}': {e}")))?;
        Ok(Self { channel, namespace })
    }

    pub(crate) fn channel(&self) -> Channel {
        self.channel.clone()
    }

    /// Wraps `message` in a request scoped to the namespace.
    pub(crate) fn request<T>(&self, message: T) -> tonic::Request<T> {
        let mut request = tonic::Request::new(message);
        request
            .metadata_mut()
            .insert(NAMESPACE_HEADER, self.namespace.clone());
        request
    }
}

// =============================================================================
// Backend
// =============================================================================

/// containerd backend.
pub struct ContainerdBackend {
    config: ContainerdConfig,
    client: Client,
    rootless: bool,
    socket_path: PathBuf,
    daemon: Option<Arc<Daemon>>,
    validator: Option<SubIdValidator>,
    platform: Platform,
    /// IO of tasks started through this backend.
    tasks: Mutex<HashMap<ContainerId, TaskIo>>,
}

impl std::fmt::Debug for ContainerdBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContainerdBackend")
            .field("namespace", &self.config.namespace)
            .field("rootless", &self.rootless)
            .field("socket_path", &self.socket_path)
            .finish_non_exhaustive()
    }
}

impl ContainerdBackend {
    /// Connects to containerd, starting a rootless daemon if configured to.
    ///
    /// # Errors
    /// Fails on an invalid rootless configuration, an unreachable daemon
    /// that may not be auto-started, or a failing `Version` call.
    pub async fn connect(config: ContainerdConfig) -> Result<Self> {
        let rootless = config.rootless_mode.resolve(rootless::is_root())?;
        let socket_path = socket_path_for(&config, rootless);
        let platform = Platform::detect();

        let daemon = if rootless && config.auto_start {
            if !platform.supports_rootless() {
                warn!("User namespaces look unavailable; rootless containerd may fail to start");
            }
            Some(Arc::new(Daemon::new(config.clone())?))
        } else {
            None
        };

        let validator = if rootless {
            Some(SubIdValidator::new(
                Identity::current()?,
                RootlessTools::detect(&config),
            ))
        } else {
            None
        };

        ensure_running(rootless, &socket_path, daemon.as_deref()).await?;

        let channel = containerd_client::connect(&socket_path)
            .await
            .map_err(|e| Error::BackendUnavailable {
                backend: BackendType::Containerd,
                reason: format!(
                    "failed to connect to containerd at {}: {e}",
                    socket_path.display()
                ),
            })?;

        let backend = Self {
            client: Client::new(channel, &config.namespace)?,
            config,
            rootless,
            socket_path,
            daemon,
            validator,
            platform,
            tasks: Mutex::new(HashMap::new()),
        };

        let version = backend.version().await?;
        info!(
            "Connected to containerd {} at {} (namespace {}, rootless {})",
            version,
            backend.socket_path.display(),
            backend.config.namespace,
            backend.rootless
        );
        Ok(backend)
    }

    /// Creates a backend over an existing channel, without probing it.
    ///
    /// Rootless mode is resolved but no daemon is supervised.
    pub fn from_channel(config: ContainerdConfig, channel: Channel) -> Result<Self> {
        let rootless = config.rootless_mode.resolve(rootless::is_root())?;
        let validator = if rootless {
            Some(SubIdValidator::new(
                Identity::current()?,
                RootlessTools::detect(&config),
            ))
        } else {
            None
        };

        Ok(Self {
            client: Client::new(channel, &config.namespace)?,
            socket_path: socket_path_for(&config, rootless),
            config,
            rootless,
            daemon: None,
            validator,
            platform: Platform::detect(),
            tasks: Mutex::new(HashMap::new()),
        })
    }

    #[must_use]
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    #[must_use]
    pub fn is_rootless(&self) -> bool {
        self.rootless
    }

    /// The supervised daemon, when auto-start applies.
    #[must_use]
    pub fn daemon(&self) -> Option<&Daemon> {
        self.daemon.as_deref()
    }

    /// Checks that the caller has subuid and subgid ranges. A no-op unless
    /// rootless.
    pub fn validate_uid_gid_mapping(&self) -> Result<()> {
        match &self.validator {
            Some(validator) => validator.validate_uid_gid_mapping(),
            None => Ok(()),
        }
    }

    /// Checks that the control socket exists and accepts a connection.
    pub async fn test_socket_connection(&self) -> Result<()> {
        if !self.socket_path.exists() {
            return Err(Error::BackendUnavailable {
                backend: BackendType::Containerd,
                reason: format!("socket file does not exist: {}", self.socket_path.display()),
            });
        }
        tokio::net::UnixStream::connect(&self.socket_path)
            .await
            .map_err(|e| Error::BackendUnavailable {
                backend: BackendType::Containerd,
                reason: format!("failed to connect to socket: {e}"),
            })?;
        Ok(())
    }

    /// Returns the daemon's version string.
    pub async fn version(&self) -> Result<String> {
        let mut client = VersionClient::new(self.client.channel());
        let response = client.version(()).await?.into_inner();
        Ok(response.version)
    }

    fn containerd_image(&self, name: &str) -> ContainerdImage {
        ContainerdImage::new(self.client.clone(), name, self.platform.clone())
    }

    async fn get_container(&self, id: &ContainerId) -> Result<Container> {
        let mut containers = ContainersClient::new(self.client.channel());
        let response = containers
            .get(self.client.request(GetContainerRequest {
                id: id.to_string(),
            }))
            .await
            .map_err(|status| not_found_or(id, status))?;

        response
            .into_inner()
            .container
            .ok_or_else(|| Error::ContainerNotFound(id.to_string()))
    }

    /// Kills the task, waits for it to exit, and deletes it. A task that
    /// does not exist is fine.
    async fn kill_and_delete_task(&self, id: &ContainerId) -> Result<()> {
        let mut tasks = TasksClient::new(self.client.channel());

        let kill = tasks
            .kill(self.client.request(KillRequest {
                container_id: id.to_string(),
                exec_id: String::new(),
                signal: Signal::SIGKILL as u32,
                all: true,
            }))
            .await;
        match kill {
            Ok(_) => {}
            Err(status) if status.code() == tonic::Code::NotFound => {
                debug!("No task to kill for {}", id);
                return Ok(());
            }
            Err(status) if status.code() == tonic::Code::FailedPrecondition => {
                debug!("Task for {} already stopped", id);
            }
            Err(status) => {
                return Err(Error::StopFailed {
                    id: id.to_string(),
                    reason: status.message().to_string(),
                })
            }
        }

        let wait = tasks.wait(self.client.request(WaitRequest {
            container_id: id.to_string(),
            exec_id: String::new(),
        }));
        match tokio::time::timeout(TASK_STOP_TIMEOUT, wait).await {
            Ok(Ok(_)) => {}
            Ok(Err(status)) => debug!("Wait after kill for {}: {}", id, status.message()),
            Err(_) => warn!("Task for {} did not exit within {:?}", id, TASK_STOP_TIMEOUT),
        }

        match tasks
            .delete(self.client.request(DeleteTaskRequest {
                container_id: id.to_string(),
            }))
            .await
        {
            Ok(_) => Ok(()),
            Err(status) if status.code() == tonic::Code::NotFound => Ok(()),
            Err(status) => Err(Error::StopFailed {
                id: id.to_string(),
                reason: format!("failed to delete task: {}", status.message()),
            }),
        }
    }

    async fn remove_snapshot(&self, snapshotter: &str, key: &str) {
        let mut snapshots = SnapshotsClient::new(self.client.channel());
        match snapshots
            .remove(self.client.request(RemoveSnapshotRequest {
                snapshotter: snapshotter.to_string(),
                key: key.to_string(),
            }))
            .await
        {
            Ok(_) => debug!("Removed snapshot {}", key),
            Err(status) if status.code() == tonic::Code::NotFound => {}
            Err(status) => warn!("Failed to remove snapshot {}: {}", key, status.message()),
        }
    }
}

#[async_trait]
impl Backend for ContainerdBackend {
    fn backend_type(&self) -> BackendType {
        BackendType::Containerd
    }

    fn image(&self, name: &str) -> Box<dyn Image> {
        Box::new(self.containerd_image(name))
    }

    async fn create(&self, config: &ContainerConfig) -> Result<ContainerId> {
        config.validate()?;
        if let Some(validator) = &self.validator {
            for volume in config.volumes.iter().filter(|v| !v.is_named_volume) {
                validator.validate_mount_permissions(Path::new(&volume.source), &volume.destination)?;
            }
        }

        let id = ContainerId::generate();
        let image = self.containerd_image(&config.image);
        if !image.exists().await {
            image.pull().await?;
        }
        let resolved = image.resolve().await?;
        let spec = build_spec(config, &resolved.process)?;

        let snapshot_key = format!("{id}{SNAPSHOT_KEY_SUFFIX}");
        let mut snapshots = SnapshotsClient::new(self.client.channel());
        snapshots
            .prepare(self.client.request(PrepareSnapshotRequest {
                snapshotter: self.config.snapshotter.clone(),
                key: snapshot_key.clone(),
                parent: resolved.chain_id.clone(),
                ..Default::default()
            }))
            .await
            .map_err(|status| Error::CreateFailed {
                id: id.to_string(),
                reason: format!("failed to prepare snapshot: {}", status.message()),
            })?;

        let container = Container {
            id: id.to_string(),
            image: config.image.clone(),
            runtime: Some(Runtime {
                name: CONTAINERD_RUNTIME.to_string(),
                options: None,
            }),
            spec: Some(spec.to_any()?),
            snapshotter: self.config.snapshotter.clone(),
            snapshot_key: snapshot_key.clone(),
            ..Default::default()
        };

        let mut containers = ContainersClient::new(self.client.channel());
        if let Err(status) = containers
            .create(self.client.request(CreateContainerRequest {
                container: Some(container),
            }))
            .await
        {
            self.remove_snapshot(&self.config.snapshotter, &snapshot_key)
                .await;
            return Err(Error::CreateFailed {
                id: id.to_string(),
                reason: status.message().to_string(),
            });
        }

        info!("Created container {} from {}", id, config.image);
        Ok(id)
    }

    async fn start(&self, id: &ContainerId) -> Result<()> {
        let container = self.get_container(id).await?;

        let mut snapshots = SnapshotsClient::new(self.client.channel());
        let mounts = snapshots
            .mounts(self.client.request(MountsRequest {
                snapshotter: container.snapshotter.clone(),
                key: container.snapshot_key.clone(),
            }))
            .await
            .map_err(|status| Error::StartFailed {
                id: id.to_string(),
                reason: format!("failed to get rootfs mounts: {}", status.message()),
            })?
            .into_inner()
            .mounts;

        let io = TaskIo::create(id)?;
        let mut tasks = TasksClient::new(self.client.channel());
        tasks
            .create(self.client.request(CreateTaskRequest {
                container_id: id.to_string(),
                rootfs: mounts,
                stdout: io.stdout_path().to_string_lossy().into_owned(),
                stderr: io.stderr_path().to_string_lossy().into_owned(),
                ..Default::default()
            }))
            .await
            .map_err(|status| Error::StartFailed {
                id: id.to_string(),
                reason: format!("failed to create task: {}", status.message()),
            })?;

        if let Err(status) = tasks
            .start(self.client.request(StartRequest {
                container_id: id.to_string(),
                exec_id: String::new(),
            }))
            .await
        {
            drop(io);
            if let Err(e) = self.kill_and_delete_task(id).await {
                warn!("Failed to clean up task for {}: {}", id, e);
            }
            return Err(Error::StartFailed {
                id: id.to_string(),
                reason: status.message().to_string(),
            });
        }

        self.tasks.lock().await.insert(id.clone(), io);
        info!("Started container {}", id);
        Ok(())
    }

    async fn stop(&self, id: &ContainerId) -> Result<()> {
        // Close our FIFO ends before the task goes away.
        let io = self.tasks.lock().await.remove(id);
        if io.is_none() {
            debug!("{} not started here, stopping its task directly", id);
            self.get_container(id).await?;
        }
        drop(io);

        self.kill_and_delete_task(id).await?;
        info!("Stopped container {}", id);
        Ok(())
    }

    async fn remove(&self, id: &ContainerId) -> Result<()> {
        let container = self.get_container(id).await?;
        drop(self.tasks.lock().await.remove(id));

        self.kill_and_delete_task(id)
            .await
            .map_err(|e| Error::DeleteFailed {
                id: id.to_string(),
                reason: e.to_string(),
            })?;

        let mut containers = ContainersClient::new(self.client.channel());
        containers
            .delete(self.client.request(DeleteContainerRequest {
                id: id.to_string(),
            }))
            .await
            .map_err(|status| match status.code() {
                tonic::Code::NotFound => Error::ContainerNotFound(id.to_string()),
                _ => Error::DeleteFailed {
                    id: id.to_string(),
                    reason: status.message().to_string(),
                },
            })?;

        self.remove_snapshot(&container.snapshotter, &container.snapshot_key)
            .await;
        info!("Removed container {}", id);
        Ok(())
    }

    async fn wait(&self, id: &ContainerId) -> Result<()> {
        let mut tasks = TasksClient::new(self.client.channel());
        let response = tasks
            .wait(self.client.request(WaitRequest {
                container_id: id.to_string(),
                exec_id: String::new(),
            }))
            .await
            .map_err(|status| not_found_or(id, status))?
            .into_inner();

        match response.exit_status {
            0 => Ok(()),
            code => Err(Error::NonZeroExit {
                id: id.to_string(),
                code: i64::from(code),
            }),
        }
    }

    async fn logs(&self, id: &ContainerId) -> Result<LogStream> {
        let mut tasks = self.tasks.lock().await;
        let io = tasks
            .get_mut(id)
            .ok_or_else(|| Error::ContainerNotFound(format!("{id} (not started)")))?;
        Ok(io.take_log_stream())
    }

    async fn inspect(&self, id: &ContainerId) -> Result<ContainerInfo> {
        let container = self.get_container(id).await?;

        let mut info = ContainerInfo::new(id.clone(), "created");
        info.image = container.image.clone();
        info.resources = container
            .spec
            .as_ref()
            .and_then(|any| match OciSpec::from_any(any) {
                Ok(spec) => spec.resource_limits(),
                Err(e) => {
                    debug!("Unreadable spec on {}: {}", id, e);
                    None
                }
            });

        let mut tasks = TasksClient::new(self.client.channel());
        match tasks
            .get(self.client.request(GetRequest {
                container_id: id.to_string(),
                exec_id: String::new(),
            }))
            .await
        {
            Ok(response) => {
                if let Some(process) = response.into_inner().process {
                    info.status = task_status_name(process.status).to_string();
                    if process.status == TASK_STATUS_STOPPED {
                        info.exit_code = i64::from(process.exit_status);
                    }
                }
            }
            Err(status) if status.code() == tonic::Code::NotFound => {}
            Err(status) => return Err(status.into()),
        }

        Ok(info)
    }

    async fn health_check(&self) -> Result<()> {
        let version = self.version().await?;
        debug!("containerd {} healthy", version);
        Ok(())
    }

    fn capabilities(&self) -> BackendCapabilities {
        BackendCapabilities {
            supports_memory: true,
            supports_cpu: true,
            supports_storage: true,
            supports_pids: true,
            supports_memory_swap: true,
            supports_build: false,
            supports_oci: true,
            supports_networking: true,
            supports_volumes: true,
        }
    }
}

// =============================================================================
// Helpers
// =============================================================================

/// `containerd.types.v1.Status` value of an exited task.
const TASK_STATUS_STOPPED: i32 = 3;

fn task_status_name(status: i32) -> &'static str {
    match status {
        1 => "created",
        2 => "running",
        TASK_STATUS_STOPPED => "stopped",
        4 => "paused",
        5 => "pausing",
        _ => "unknown",
    }
}

fn not_found_or(id: &ContainerId, status: tonic::Status) -> Error {
    if status.code() == tonic::Code::NotFound {
        Error::ContainerNotFound(id.to_string())
    } else {
        Error::Grpc(status)
    }
}

/// Explicit socket, else the rootless XDG socket, else the system socket.
#[must_use]
pub fn socket_path_for(config: &ContainerdConfig, rootless: bool) -> PathBuf {
    DaemonPaths::for_config(config, rootless).socket_path
}

async fn ensure_running(rootless: bool, socket: &Path, daemon: Option<&Daemon>) -> Result<()> {
    if socket_ready(socket).await {
        return Ok(());
    }

    if !rootless {
        return Err(Error::BackendUnavailable {
            backend: BackendType::Containerd,
            reason: format!(
                "containerd not running at system socket {} - please start containerd system-wide",
                socket.display()
            ),
        });
    }

    match daemon {
        Some(daemon) => {
            info!("No containerd at {}, starting rootless daemon", socket.display());
            daemon.start().await
        }
        None => Err(Error::BackendUnavailable {
            backend: BackendType::Containerd,
            reason: format!(
                "containerd socket not found at {} and auto_start is disabled",
                socket.display()
            ),
        }),
    }
}
