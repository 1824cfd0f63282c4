//! Backend-neutral data model.
//!
//! Every backend consumes the same [`ContainerConfig`] and reports the same
//! [`ContainerInfo`]. Translation into engine-native request shapes lives in
//! each adapter; nothing here knows about Docker or containerd.
//!
//! ## Zero Means Unset
//!
//! All numeric limits in [`ResourceLimits`] default to zero, which means
//! "no limit imposed", never "limit of zero". Adapters must skip zero fields
//! rather than forwarding them.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::constants::{CONTAINER_ID_PREFIX, DEFAULT_PORT_PROTOCOL, VALID_PORT_PROTOCOLS};
use crate::error::{Error, Result};

// =============================================================================
// Identifiers
// =============================================================================

/// Opaque container identifier, unique per backend instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContainerId(String);

impl ContainerId {
    /// Wraps an existing identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generates a fresh identifier of the form `tau-YYYYMMDD-HHMMSS-<nanos>`.
    #[must_use]
    pub fn generate() -> Self {
        let now = Utc::now();
        Self(format!(
            "{CONTAINER_ID_PREFIX}-{}-{}",
            now.format("%Y%m%d-%H%M%S"),
            now.timestamp_subsec_nanos()
        ))
    }

    /// Returns the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ContainerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ContainerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Backend type tag, used to key factories and build inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendType {
    /// Docker engine API.
    Docker,
    /// containerd gRPC API (rootful or rootless).
    Containerd,
}

impl BackendType {
    /// Fixed selection preference: Docker first, then containerd.
    pub const PREFERENCE: [BackendType; 2] = [BackendType::Docker, BackendType::Containerd];

    /// Returns the tag string.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Docker => "docker",
            Self::Containerd => "containerd",
        }
    }
}

impl fmt::Display for BackendType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "docker" => Ok(Self::Docker),
            "containerd" => Ok(Self::Containerd),
            other => Err(Error::InvalidConfig(format!("unknown backend type '{other}'"))),
        }
    }
}

// =============================================================================
// Container Configuration
// =============================================================================

/// Resource constraints for a container. Zero fields impose no limit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    /// Memory limit in bytes.
    pub memory: i64,
    /// Memory + swap limit in bytes (-1 = unlimited swap).
    pub memory_swap: i64,
    /// CPU quota in microseconds per period.
    pub cpu_quota: i64,
    /// CPU period in microseconds.
    pub cpu_period: i64,
    /// CPU shares (relative weight).
    pub cpu_shares: i64,
    /// Storage limit in bytes.
    pub storage: i64,
    /// Maximum number of PIDs.
    pub pids: i64,
}

/// A volume or bind mount.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VolumeMount {
    /// Host path, or volume name when `is_named_volume` is set.
    pub source: String,
    /// Mount point inside the container.
    pub destination: String,
    /// Mount read-only.
    pub read_only: bool,
    /// Treat `source` as a named volume rather than a host path.
    pub is_named_volume: bool,
}

impl VolumeMount {
    /// Creates a read-write bind mount.
    pub fn bind(source: impl Into<String>, destination: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            destination: destination.into(),
            ..Default::default()
        }
    }

    /// Marks the mount read-only.
    #[must_use]
    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }
}

/// Container network mode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkMode {
    Bridge,
    Host,
    None,
    /// A user-defined network, by name.
    Custom(String),
}

impl NetworkMode {
    /// Engine-facing mode string (custom networks use their name).
    #[must_use]
    pub fn as_engine_str(&self) -> &str {
        match self {
            Self::Bridge => "bridge",
            Self::Host => "host",
            Self::None => "none",
            Self::Custom(name) => name,
        }
    }
}

/// A host-to-container port mapping.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PortMapping {
    pub host_port: u16,
    pub container_port: u16,
    /// `tcp`, `udp` or `sctp`; empty means `tcp`.
    pub protocol: String,
    /// Optional host address to bind.
    pub host_ip: Option<String>,
}

impl PortMapping {
    /// Creates a TCP mapping.
    #[must_use]
    pub fn tcp(host_port: u16, container_port: u16) -> Self {
        Self {
            host_port,
            container_port,
            protocol: "tcp".to_string(),
            host_ip: None,
        }
    }

    /// Returns the engine's `port/proto` key, rejecting unknown protocols and
    /// port zero.
    pub fn key(&self) -> Result<String> {
        let protocol = if self.protocol.is_empty() {
            DEFAULT_PORT_PROTOCOL.to_string()
        } else {
            self.protocol.to_ascii_lowercase()
        };

        if self.container_port == 0 || !VALID_PORT_PROTOCOLS.contains(&protocol.as_str()) {
            return Err(Error::InvalidPort {
                port: self.container_port,
                protocol,
            });
        }

        Ok(format!("{}/{}", self.container_port, protocol))
    }
}

/// Static IPv4 settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Ipv4Config {
    /// Static address (empty = DHCP).
    pub address: String,
    pub gateway: String,
    pub netmask: String,
    /// Seconds to wait for a DHCP lease.
    pub wait_for_dhcp_secs: u32,
}

/// Static IPv6 settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Ipv6Config {
    /// Static address (empty = DHCPv6).
    pub address: String,
    pub gateway: String,
    pub wait_for_dhcp_secs: u32,
}

/// Optional static IP configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IpConfig {
    pub ipv4: Option<Ipv4Config>,
    pub ipv6: Option<Ipv6Config>,
}

/// Unified network configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Network mode; `None` keeps the engine default.
    pub mode: Option<NetworkMode>,
    /// Port mappings, in order.
    pub port_mappings: Vec<PortMapping>,
    /// DNS servers.
    pub dns: Vec<String>,
    /// Static addressing. Docker applies the addresses on a user-defined
    /// network; gateway, netmask and DHCP waits are not sent to either
    /// engine.
    pub ip_config: Option<IpConfig>,
    /// MTU (0 = engine default). Neither engine sets a per-container MTU, so
    /// this is accepted and ignored.
    pub mtu: u32,
}

/// Everything needed to create a container.
///
/// Caller-owned and immutable once passed to `Backend::create`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerConfig {
    /// Image reference (required).
    pub image: String,
    /// Command argv.
    pub command: Vec<String>,
    /// Shell argv (shell-form commands).
    pub shell: Vec<String>,
    /// Environment, `KEY=VALUE`, in order.
    pub env: Vec<String>,
    /// Working directory (empty = `/`).
    pub work_dir: String,
    /// Mounts, in order. Order matters for overlapping destinations.
    pub volumes: Vec<VolumeMount>,
    pub network: Option<NetworkConfig>,
    pub resources: Option<ResourceLimits>,
}

impl ContainerConfig {
    /// Creates a config for the given image.
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            ..Default::default()
        }
    }

    /// Sets the command argv.
    #[must_use]
    pub fn with_command<I, S>(mut self, command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.command = command.into_iter().map(Into::into).collect();
        self
    }

    /// Appends a `KEY=VALUE` environment entry.
    #[must_use]
    pub fn with_env(mut self, entry: impl Into<String>) -> Self {
        self.env.push(entry.into());
        self
    }

    /// Appends a mount.
    #[must_use]
    pub fn with_volume(mut self, volume: VolumeMount) -> Self {
        self.volumes.push(volume);
        self
    }

    /// Sets the network configuration.
    #[must_use]
    pub fn with_network(mut self, network: NetworkConfig) -> Self {
        self.network = Some(network);
        self
    }

    /// Sets resource limits.
    #[must_use]
    pub fn with_resources(mut self, resources: ResourceLimits) -> Self {
        self.resources = Some(resources);
        self
    }

    /// Checks invariants that hold for every backend.
    pub fn validate(&self) -> Result<()> {
        if self.image.trim().is_empty() {
            return Err(Error::InvalidConfig("image must not be empty".to_string()));
        }
        for entry in &self.env {
            if !entry.contains('=') {
                return Err(Error::InvalidConfig(format!(
                    "environment entry '{entry}' is not KEY=VALUE"
                )));
            }
        }
        for volume in &self.volumes {
            if volume.destination.is_empty() {
                return Err(Error::InvalidConfig(format!(
                    "volume '{}' has no destination",
                    volume.source
                )));
            }
        }
        if let Some(network) = &self.network {
            for mapping in &network.port_mappings {
                mapping.key()?;
            }
        }
        Ok(())
    }
}

// =============================================================================
// Reported State
// =============================================================================

/// Information about a container, as reported by its backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerInfo {
    pub id: ContainerId,
    /// Engine status string (`created`, `running`, `exited`, `stopped`, ...).
    pub status: String,
    /// Exit code; meaningful once the container has stopped.
    pub exit_code: i64,
    pub started_at: Option<DateTime<Utc>>,
    pub image: String,
    /// Limits read back from the engine, not echoed from the request.
    pub resources: Option<ResourceLimits>,
}

impl ContainerInfo {
    /// Creates info with only the ID and status set.
    pub fn new(id: ContainerId, status: impl Into<String>) -> Self {
        Self {
            id,
            status: status.into(),
            exit_code: 0,
            started_at: None,
            image: String::new(),
            resources: None,
        }
    }
}

/// Optional features a backend supports.
///
/// Callers check these before relying on a feature.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendCapabilities {
    pub supports_memory: bool,
    pub supports_cpu: bool,
    pub supports_storage: bool,
    pub supports_pids: bool,
    pub supports_memory_swap: bool,
    pub supports_build: bool,
    pub supports_oci: bool,
    pub supports_networking: bool,
    pub supports_volumes: bool,
}

// =============================================================================
// Build Input
// =============================================================================

/// Docker build input: a tar build context and the Dockerfile path within it.
#[derive(Debug, Clone)]
pub struct DockerBuildInput {
    /// Tar-formatted build context.
    pub context: Bytes,
    /// Dockerfile path inside the context.
    pub dockerfile: String,
}

impl DockerBuildInput {
    /// Creates an input using `Dockerfile` at the context root.
    pub fn new(context: impl Into<Bytes>) -> Self {
        Self {
            context: context.into(),
            dockerfile: "Dockerfile".to_string(),
        }
    }
}

/// containerd build input: a context directory and a Dockerfile path.
#[derive(Debug, Clone)]
pub struct ContainerdBuildInput {
    pub context_dir: PathBuf,
    pub dockerfile: String,
}

/// Build input, tagged by the backend it is meant for.
#[derive(Debug, Clone)]
pub enum BuildInput {
    Docker(DockerBuildInput),
    Containerd(ContainerdBuildInput),
}

impl BuildInput {
    /// Returns the backend this input is tagged for.
    #[must_use]
    pub fn backend_type(&self) -> BackendType {
        match self {
            Self::Docker(_) => BackendType::Docker,
            Self::Containerd(_) => BackendType::Containerd,
        }
    }
}

// =============================================================================
// Rootless
// =============================================================================

/// Rootless mode selection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RootlessMode {
    /// Enabled iff the effective user is not root.
    #[default]
    Auto,
    Enabled,
    Disabled,
}

impl RootlessMode {
    /// Resolves the mode against the effective user.
    ///
    /// Returns `true` when rootless operation applies. Requesting rootless
    /// mode while running as root is a configuration error.
    pub fn resolve(self, is_root: bool) -> Result<bool> {
        match self {
            Self::Auto => Ok(!is_root),
            Self::Enabled if is_root => Err(Error::Rootless(
                "cannot enable rootless mode when running as root".to_string(),
            )),
            Self::Enabled => Ok(true),
            Self::Disabled => Ok(false),
        }
    }
}

/// A contiguous subordinate UID/GID range from `/etc/subuid` or `/etc/subgid`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubIdMapping {
    pub start: u32,
    pub count: u32,
}

impl SubIdMapping {
    /// Returns true if `id` lies in `[start, start + count)`.
    #[must_use]
    pub fn contains(&self, id: u32) -> bool {
        let id = u64::from(id);
        let start = u64::from(self.start);
        id >= start && id < start + u64::from(self.count)
    }
}
