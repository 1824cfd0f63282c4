//! Engine adapters.
//!
//! Each adapter implements [`crate::Backend`] for one engine and registers
//! itself through [`crate::BackendRegistry::with_defaults`].

pub mod containerd;
pub mod docker;

pub use self::containerd::ContainerdBackend;
pub use self::docker::DockerBackend;
