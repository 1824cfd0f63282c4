//! Backend trait - the engine-neutral container lifecycle interface.
//!
//! A [`Backend`] drives one engine connection. Callers obtain an
//! [`Image`] handle, make sure the image is present, then walk a container
//! through its lifecycle:
//!
//! ```text
//!   image(name).pull()
//!          │
//!          ▼
//!   create(config) ──► start(id) ──► wait(id) ──► logs(id) ──► remove(id)
//!                          │                          │
//!                          └──── stop(id) ◄───────────┘
//!                                inspect(id) at any point
//! ```
//!
//! # Cancellation
//!
//! All operations are `async` and cancel-safe: dropping the returned future
//! aborts the in-flight request. There is no retry at this layer.

use std::pin::Pin;

use async_trait::async_trait;
use tokio::io::AsyncRead;

use crate::error::Result;
use crate::types::{
    BackendCapabilities, BackendType, BuildInput, ContainerConfig, ContainerId, ContainerInfo,
};

/// Combined stdout/stderr log stream.
///
/// Dropping the stream releases the underlying engine resources (FIFOs or
/// HTTP response).
pub type LogStream = Pin<Box<dyn AsyncRead + Send>>;

/// Container lifecycle against one concrete engine.
///
/// # Implementations
///
/// - `DockerBackend`: Docker engine API
/// - `ContainerdBackend`: containerd gRPC API, optionally supervising a
///   rootless daemon
#[async_trait]
pub trait Backend: Send + Sync {
    /// Returns the backend's type tag.
    fn backend_type(&self) -> BackendType;

    /// Returns a handle for image operations on `name`.
    fn image(&self, name: &str) -> Box<dyn Image>;

    // =========================================================================
    // Container Lifecycle
    // =========================================================================

    /// Creates a container and returns its ID. The container is not started.
    ///
    /// Configuration errors (empty image, invalid port mapping) are reported
    /// before any engine call.
    async fn create(&self, config: &ContainerConfig) -> Result<ContainerId>;

    /// Starts a created container.
    async fn start(&self, id: &ContainerId) -> Result<()>;

    /// Stops a running container.
    async fn stop(&self, id: &ContainerId) -> Result<()>;

    /// Removes a container and the resources the backend created for it.
    async fn remove(&self, id: &ContainerId) -> Result<()>;

    /// Blocks until the container exits.
    ///
    /// A non-zero exit is reported as [`crate::Error::NonZeroExit`]; the code
    /// itself should be read through [`Backend::inspect`].
    async fn wait(&self, id: &ContainerId) -> Result<()>;

    /// Returns the container's combined stdout/stderr.
    async fn logs(&self, id: &ContainerId) -> Result<LogStream>;

    /// Returns the container's current state.
    async fn inspect(&self, id: &ContainerId) -> Result<ContainerInfo>;

    // =========================================================================
    // Backend Operations
    // =========================================================================

    /// Checks that the engine is reachable and answering.
    async fn health_check(&self) -> Result<()>;

    /// Reports optional features.
    fn capabilities(&self) -> BackendCapabilities;
}

/// Image operations for a single image reference.
#[async_trait]
pub trait Image: Send + Sync {
    /// Retrieves the image from its registry.
    async fn pull(&self) -> Result<()>;

    /// Builds the image from backend-specific input.
    ///
    /// Returns [`crate::Error::BuildNotSupported`] when the backend cannot
    /// build, and [`crate::Error::UnsupportedBuildInput`] when `input` is
    /// tagged for another backend.
    async fn build(&self, input: BuildInput) -> Result<()>;

    /// Returns true if the image is present locally.
    async fn exists(&self) -> bool;

    /// Removes the image.
    async fn remove(&self) -> Result<()>;

    /// Returns the image reference.
    fn name(&self) -> &str;

    /// Returns the image digest, without the `sha256:` prefix.
    async fn digest(&self) -> Result<String>;

    /// Returns every tag pointing at this image.
    async fn tags(&self) -> Result<Vec<String>>;
}
