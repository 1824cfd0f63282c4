//! Error types for the container execution layer.

use std::path::PathBuf;

use crate::types::BackendType;

/// Result type alias for container backend operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the container execution layer.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // =========================================================================
    // Container Lifecycle Errors
    // =========================================================================
    /// Container not found (or never started through this backend).
    #[error("container not found: {0}")]
    ContainerNotFound(String),

    /// Container create failed.
    #[error("failed to create container '{id}': {reason}")]
    CreateFailed { id: String, reason: String },

    /// Container start failed.
    #[error("failed to start container '{id}': {reason}")]
    StartFailed { id: String, reason: String },

    /// Container stop failed.
    #[error("failed to stop container '{id}': {reason}")]
    StopFailed { id: String, reason: String },

    /// Container delete failed.
    #[error("failed to delete container '{id}': {reason}")]
    DeleteFailed { id: String, reason: String },

    /// Container exited with a non-zero status.
    ///
    /// The code is also available through `Backend::inspect`.
    #[error("container {id} exited with status {code}")]
    NonZeroExit { id: String, code: i64 },

    /// Port mapping with an unusable port/protocol combination.
    #[error("invalid port {port}/{protocol}")]
    InvalidPort { port: u16, protocol: String },

    /// Container configuration rejected before reaching the engine.
    #[error("invalid container config: {0}")]
    InvalidConfig(String),

    // =========================================================================
    // Image Errors
    // =========================================================================
    /// Image pull failed.
    #[error("failed to pull image '{reference}': {reason}")]
    ImagePullFailed { reference: String, reason: String },

    /// Image build failed.
    #[error("failed to build image '{reference}': {reason}")]
    ImageBuildFailed { reference: String, reason: String },

    /// Image not present in the backend's store.
    #[error("image not found: {0}")]
    ImageNotFound(String),

    /// Image content could not be resolved to a runnable rootfs.
    #[error("invalid image '{reference}': {reason}")]
    InvalidImage { reference: String, reason: String },

    /// One or more images could not be removed during cleanup.
    #[error("failed to remove {count} image(s): {failures}")]
    ImageCleanupFailed { count: usize, failures: String },

    /// The backend does not build images.
    #[error("build not supported by this backend ({backend})")]
    BuildNotSupported { backend: BackendType },

    /// The build input is tagged for a different backend.
    #[error("build input for '{input}' not supported by the {backend} backend")]
    UnsupportedBuildInput {
        backend: BackendType,
        input: BackendType,
    },

    // =========================================================================
    // Backend/Registry Errors
    // =========================================================================
    /// No factory registered for the backend type.
    #[error("backend '{0}' is not registered")]
    BackendNotRegistered(BackendType),

    /// Backend selection found nothing to try.
    #[error("no container backends registered")]
    NoBackendsRegistered,

    /// Every registered backend failed its health check.
    #[error("no healthy container backend available (registered but unhealthy: {failures})")]
    NoHealthyBackend { failures: String },

    /// Backend reachable but unusable.
    #[error("backend '{backend}' unavailable: {reason}")]
    BackendUnavailable {
        backend: BackendType,
        reason: String,
    },

    /// Operation not supported by this backend.
    #[error("operation not supported: {0}")]
    NotSupported(String),

    // =========================================================================
    // Daemon Errors
    // =========================================================================
    /// Required executable could not be located.
    #[error("{binary} binary not found: {reason}")]
    BinaryNotFound { binary: String, reason: String },

    /// Daemon failed to come up.
    #[error("failed to start containerd daemon: {0}")]
    DaemonStartFailed(String),

    /// Daemon liveness check failed.
    #[error("containerd daemon is not running")]
    DaemonNotRunning,

    /// Signal delivery to the daemon failed.
    #[error("failed to signal containerd daemon (pid {pid}): {reason}")]
    DaemonSignalFailed { pid: i32, reason: String },

    // =========================================================================
    // Rootless Errors
    // =========================================================================
    /// Rootless configuration problem (mode conflicts, missing subid entries).
    #[error("rootless configuration error: {0}")]
    Rootless(String),

    /// Host path cannot be mapped into the user namespace.
    #[error("cannot mount {path}: {reason}")]
    UnmappableMount { path: PathBuf, reason: String },

    // =========================================================================
    // Transport Errors
    // =========================================================================
    /// Docker engine API error.
    #[error("docker API error: {0}")]
    Docker(#[from] bollard::errors::Error),

    /// containerd gRPC status.
    #[error("containerd API error: {0}")]
    Grpc(#[from] tonic::Status),

    /// containerd connection error.
    #[error("containerd connection error: {0}")]
    Transport(#[from] tonic::transport::Error),

    // =========================================================================
    // I/O Errors
    // =========================================================================
    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Operation timed out.
    #[error("operation timed out after {duration:?}: {operation}")]
    Timeout {
        operation: String,
        duration: std::time::Duration,
    },
}

impl Error {
    /// Returns true for "unknown container/image" conditions, including
    /// engine-side 404s and gRPC `NotFound`.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::ContainerNotFound(_) | Self::ImageNotFound(_) => true,
            Self::Docker(bollard::errors::Error::DockerResponseServerError {
                status_code: 404,
                ..
            }) => true,
            Self::Grpc(status) => status.code() == tonic::Code::NotFound,
            _ => false,
        }
    }

    /// Returns true for capability mismatches (build sentinel, unsupported operation).
    #[must_use]
    pub fn is_not_supported(&self) -> bool {
        matches!(
            self,
            Self::BuildNotSupported { .. } | Self::NotSupported(_)
        )
    }

    /// Returns the container exit code carried by a [`Error::NonZeroExit`].
    #[must_use]
    pub fn exit_code(&self) -> Option<i64> {
        match self {
            Self::NonZeroExit { code, .. } => Some(*code),
            _ => None,
        }
    }
}
