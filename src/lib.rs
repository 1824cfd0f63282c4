//! # tauctr
//!
//! **Backend-Agnostic Container Execution Layer**
//!
//! This crate lets a caller create, start, stop, inspect and read logs of a
//! container without knowing whether the engine underneath is Docker or
//! containerd, and, for containerd, whether the daemon runs as root or as a
//! per-user rootless daemon supervised by this crate.
//!
//! # Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                             tauctr                                  │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │  ┌─────────────────────────────────────────────────────────────┐    │
//! │  │                      Backend Trait                          │    │
//! │  │   create(config) → start → wait → logs → inspect → remove   │    │
//! │  │                image(name): pull / build / exists           │    │
//! │  └─────────────────────────────────────────────────────────────┘    │
//! │                              │                                      │
//! │  ┌───────────────────────────┼───────────────────────────────┐      │
//! │  │           BackendRegistry + select_backend                │      │
//! │  │   type tag → async factory │ Docker first, then containerd│      │
//! │  └───────────────────────────┼───────────────────────────────┘      │
//! ├──────────────────────────────┼──────────────────────────────────────┤
//! │  ┌───────────────────────────┴┐   ┌──────────────────────────────┐  │
//! │  │       DockerBackend        │   │      ContainerdBackend       │  │
//! │  │  bollard engine API        │   │  gRPC: images, snapshots,    │  │
//! │  │  config → create body      │   │  containers, tasks (FIFO IO) │  │
//! │  │  ContainerId → engine ID   │   │  config → OCI runtime spec   │  │
//! │  └────────────────────────────┘   ├──────────────────────────────┤  │
//! │                                   │  Daemon (rootless supervisor)│  │
//! │                                   │  rootlesskit + containerd    │  │
//! │                                   │  SubIdValidator (mounts)     │  │
//! │                                   └──────────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Normalized Configuration
//!
//! A single [`ContainerConfig`] drives both engines. Each adapter translates
//! it into its engine's native request:
//!
//! | Concern    | Docker                         | containerd                        |
//! |------------|--------------------------------|-----------------------------------|
//! | argv       | `Cmd` (image default if empty) | OCI `process.args`                |
//! | env        | default `PATH` only if empty   | default `PATH` always first       |
//! | limits     | `HostConfig`, zero = unset     | OCI `linux.resources`, zero = unset |
//! | mounts     | bind / named volume            | `rbind` only                      |
//! | build      | tar context + Dockerfile       | [`Error::BuildNotSupported`]      |
//!
//! # Rootless containerd
//!
//! When the effective user is not root, the containerd backend targets a
//! per-user daemon under `$XDG_RUNTIME_DIR/tau/containerd`. If none answers
//! and auto-start is enabled, [`Daemon`] launches containerd inside a
//! rootlesskit user/network namespace and waits for its socket. Bind mounts
//! are checked by [`SubIdValidator`] against `/etc/subuid` and `/etc/subgid`
//! before the container is created.
//!
//! # Example
//!
//! ```rust,ignore
//! use tauctr::{select_backend, BackendRegistry, ContainerConfig};
//!
//! #[tokio::main]
//! async fn main() -> tauctr::Result<()> {
//!     let registry = BackendRegistry::with_defaults();
//!     let backend = select_backend(&registry).await?;
//!
//!     let image = backend.image("alpine:3.19");
//!     if !image.exists().await {
//!         image.pull().await?;
//!     }
//!
//!     let id = backend
//!         .create(&ContainerConfig::new("alpine:3.19").with_command(["echo", "hi"]))
//!         .await?;
//!     backend.start(&id).await?;
//!     backend.wait(&id).await?;
//!     backend.remove(&id).await?;
//!     Ok(())
//! }
//! ```

pub mod backend;
pub mod backends;
pub mod config;
pub mod constants;
pub mod error;
pub mod platform;
pub mod registry;
pub mod rootless;
pub mod types;

// Re-exports
pub use backend::{Backend, Image, LogStream};
pub use backends::containerd::daemon::{Daemon, DaemonState};
pub use backends::{ContainerdBackend, DockerBackend};
pub use config::{BackendConfig, ContainerdConfig, DockerConfig};
pub use error::{Error, Result};
pub use platform::{Arch, Capability, Os, Platform};
pub use registry::{select_backend, BackendFactory, BackendRegistry};
pub use rootless::{Identity, RootlessTools, SubIdValidator, XdgDirs};
pub use types::{
    BackendCapabilities, BackendType, BuildInput, ContainerConfig, ContainerId, ContainerInfo,
    ContainerdBuildInput, DockerBuildInput, IpConfig, Ipv4Config, Ipv6Config, NetworkConfig,
    NetworkMode, PortMapping, ResourceLimits, RootlessMode, SubIdMapping, VolumeMount,
};
