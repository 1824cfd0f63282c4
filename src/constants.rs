//! # Container Layer Constants
//!
//! Paths, timeouts, and OCI defaults shared by the Docker and containerd
//! adapters. These constants are the **single source of truth** for values
//! that must stay bit-compatible with stock containerd and Docker setups.
//!
//! ## Cross-References
//!
//! - [`crate::backends::containerd::daemon`]: socket/state paths, poll timing
//! - [`crate::backends::containerd::spec`]: OCI defaults
//! - [`crate::backends::docker`]: stop timeout, default environment

use std::time::Duration;

// =============================================================================
// Container Defaults
// =============================================================================
//
// Injected when the caller leaves the corresponding field empty. Both
// adapters use the same values so a config behaves identically on either.
// =============================================================================

/// Default `PATH` for container processes.
pub const DEFAULT_PATH_ENV: &str =
    "PATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Default working directory for container processes.
pub const DEFAULT_WORKDIR: &str = "/";

/// Hostname set in generated OCI specs.
pub const DEFAULT_HOSTNAME: &str = "tau-container";

/// Prefix of generated container IDs (`tau-<YYYYMMDD-HHMMSS>-<nanos>`).
pub const CONTAINER_ID_PREFIX: &str = "tau";

/// Port protocols accepted in port mappings.
pub const VALID_PORT_PROTOCOLS: &[&str] = &["tcp", "udp", "sctp"];

/// Protocol used when a port mapping leaves it empty.
pub const DEFAULT_PORT_PROTOCOL: &str = "tcp";

// =============================================================================
// OCI Runtime Spec
// =============================================================================

/// OCI Runtime Spec version for generated specs.
///
/// See: <https://github.com/opencontainers/runtime-spec/releases>
pub const OCI_RUNTIME_SPEC_VERSION: &str = "1.0.2";

/// CFS period used when a CPU quota is given without a period (100ms).
pub const DEFAULT_CPU_PERIOD_US: u64 = 100_000;

/// `type_url` under which containerd stores the runtime spec.
pub const OCI_SPEC_TYPE_URL: &str = "types.containerd.io/opencontainers/runtime-spec/1/Spec";

/// containerd shim runtime for created containers.
pub const CONTAINERD_RUNTIME: &str = "io.containerd.runc.v2";

/// Default containerd snapshotter.
pub const DEFAULT_SNAPSHOTTER: &str = "overlayfs";

/// Default containerd namespace.
pub const DEFAULT_CONTAINERD_NAMESPACE: &str = "tau";

/// Suffix appended to a container ID to name its rootfs snapshot.
pub const SNAPSHOT_KEY_SUFFIX: &str = "-snapshot";

// =============================================================================
// OCI Media Types
// =============================================================================
//
// Reference: <https://github.com/opencontainers/image-spec/blob/main/media-types.md>
// =============================================================================

/// OCI Image Index media type (multi-platform manifest list).
pub const OCI_IMAGE_INDEX_MEDIA_TYPE: &str = "application/vnd.oci.image.index.v1+json";

/// Docker manifest list media type.
pub const DOCKER_MANIFEST_LIST_MEDIA_TYPE: &str =
    "application/vnd.docker.distribution.manifest.list.v2+json";

/// Maximum manifest/config blob read from the content store (4 MiB).
///
/// **Security**: Bounds memory used while resolving an image's layer chain.
pub const MAX_CONTENT_BLOB_SIZE: usize = 4 * 1024 * 1024;

// =============================================================================
// containerd Daemon
// =============================================================================
//
// Host-visible paths follow the rootless layout under the XDG directories:
//
//   $XDG_RUNTIME_DIR/tau/containerd/containerd.sock   (host-visible socket)
//   $XDG_RUNTIME_DIR/tau/containerd/containerd.pid    (state file)
//   $XDG_RUNTIME_DIR/tau/containerd/daemon            (state dir)
//   $XDG_DATA_HOME/tau/containerd/daemon              (root dir)
//   $XDG_RUNTIME_DIR/tau-containerd-rootless          (rootlesskit state)
//
// Inside the rootlesskit namespace the daemon only sees /run/containerd.
// =============================================================================

/// Rootful containerd control socket.
pub const ROOTFUL_SOCKET_PATH: &str = "/run/containerd/containerd.sock";

/// Rootful containerd PID file.
pub const ROOTFUL_STATE_FILE: &str = "/run/containerd/containerd.pid";

/// Control socket path as seen inside the rootless namespace.
pub const NAMESPACE_SOCKET_PATH: &str = "/run/containerd/containerd.sock";

/// Debug socket path as seen inside the rootless namespace.
pub const NAMESPACE_DEBUG_SOCKET_PATH: &str = "/run/containerd/containerd-debug.sock";

/// Application directory below each XDG base directory.
pub const XDG_APP_DIR: &str = "tau";

/// Socket file name in the host-visible containerd directory.
pub const SOCKET_FILE_NAME: &str = "containerd.sock";

/// PID file name in the host-visible containerd directory.
pub const STATE_FILE_NAME: &str = "containerd.pid";

/// Generated daemon config file name.
pub const CONFIG_FILE_NAME: &str = "containerd.toml";

/// rootlesskit state directory name below `$XDG_RUNTIME_DIR`.
pub const ROOTLESSKIT_STATE_DIR_NAME: &str = "tau-containerd-rootless";

/// CRI plugin disabled in the generated daemon config.
pub const CRI_PLUGIN_ID: &str = "io.containerd.grpc.v1.cri";

/// gRPC message size limit in the generated daemon config (16 MiB).
pub const GRPC_MAX_MESSAGE_SIZE: u32 = 16 * 1024 * 1024;

/// MTU for user-mode network drivers that support large frames.
pub const USERMODE_NET_MTU: u32 = 65520;

/// MTU for every other network driver.
pub const DEFAULT_NET_MTU: u32 = 1500;

/// How long `Daemon::start` waits for the control socket (30 seconds).
///
/// **Rationale**: rootlesskit setup plus containerd plugin loading takes a
/// few seconds on a cold host; 30s bounds a wedged start.
pub const DAEMON_START_TIMEOUT: Duration = Duration::from_secs(30);

/// Interval between socket dial attempts while waiting for the daemon.
pub const SOCKET_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Grace period for containerd task stop before SIGKILL.
pub const TASK_STOP_TIMEOUT: Duration = Duration::from_secs(10);

// =============================================================================
// Docker
// =============================================================================

/// Grace period passed to the engine's stop call (seconds).
pub const DOCKER_STOP_TIMEOUT_SECS: i32 = 10;

/// Request timeout for the Docker client (seconds).
pub const DOCKER_CLIENT_TIMEOUT_SECS: u64 = 120;

/// Engine address used when neither the config nor `DOCKER_HOST` names one.
pub const DEFAULT_DOCKER_HOST: &str = "unix:///var/run/docker.sock";

/// Wait condition for `Backend::wait`.
pub const DOCKER_WAIT_CONDITION: &str = "not-running";

// =============================================================================
// Container ID Validation
// =============================================================================

/// Valid characters for container names/IDs.
///
/// **Security**: Excludes `/` and `.` so an ID can be used as a FIFO file
/// name and a Docker name filter without escaping.
pub const CONTAINER_NAME_VALID_CHARS: &str =
    "abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789-_";

/// Maximum container ID length.
pub const MAX_CONTAINER_ID_LEN: usize = 128;

/// Validates a container ID.
///
/// IDs must be non-empty, at most `MAX_CONTAINER_ID_LEN` bytes, and only
/// contain characters from `CONTAINER_NAME_VALID_CHARS`.
#[inline]
#[must_use = "validation result must be checked to ensure container ID is safe"]
pub fn validate_container_id(id: &str) -> std::result::Result<(), &'static str> {
    if id.is_empty() {
        return Err("container ID cannot be empty");
    }
    if id.len() > MAX_CONTAINER_ID_LEN {
        return Err("container ID exceeds maximum length");
    }
    if !id.chars().all(|c| CONTAINER_NAME_VALID_CHARS.contains(c)) {
        return Err("container ID contains invalid characters");
    }
    Ok(())
}
