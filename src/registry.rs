//! Backend factory registry and default backend selection.
//!
//! The registry maps a [`BackendType`] tag to an async constructor. It is an
//! explicit value built once at startup (usually with
//! [`BackendRegistry::with_defaults`]) and then shared read-only, so
//! "registration happens before first use" holds by construction.
//!
//! # Selection Policy
//!
//! [`select_backend`] tries registered backends in a fixed order, Docker
//! first and then containerd, returning the first one whose constructor
//! and health check both succeed:
//!
//! ```text
//!   docker registered? ── yes ──► construct + health_check ── ok ──► use it
//!          │                                   │
//!          no                                 err (recorded)
//!          ▼                                   ▼
//!   containerd registered? ── yes ──► construct + health_check ── ok ──► use it
//!          │                                   │
//!          no                                 err (recorded)
//!          ▼                                   ▼
//!   NoBackendsRegistered            NoHealthyBackend { "docker: .., containerd: .." }
//! ```
//!
//! The two failure errors stay distinct so operators can tell a build with
//! no drivers apart from a host where the engines are down.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use tracing::{debug, info, warn};

use crate::backend::Backend;
use crate::backends::containerd::ContainerdBackend;
use crate::backends::docker::DockerBackend;
use crate::config::BackendConfig;
use crate::error::{Error, Result};
use crate::types::BackendType;

/// Future returned by a backend factory.
pub type BackendFuture = BoxFuture<'static, Result<Arc<dyn Backend>>>;

/// Async backend constructor.
pub type BackendFactory = Arc<dyn Fn(BackendConfig) -> BackendFuture + Send + Sync>;

/// Registry of backend constructors, keyed by type tag.
#[derive(Default, Clone)]
pub struct BackendRegistry {
    factories: HashMap<BackendType, BackendFactory>,
}

impl BackendRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry with the Docker and containerd backends registered.
    #[must_use]
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();

        registry.register(BackendType::Docker, |config| async move {
            let config = match config {
                BackendConfig::Docker(config) => config,
                other => return Err(mismatched_config(BackendType::Docker, &other)),
            };
            let backend = DockerBackend::connect(config).await?;
            Ok(Arc::new(backend) as Arc<dyn Backend>)
        });

        registry.register(BackendType::Containerd, |config| async move {
            let config = match config {
                BackendConfig::Containerd(config) => config,
                other => return Err(mismatched_config(BackendType::Containerd, &other)),
            };
            let backend = ContainerdBackend::connect(config).await?;
            Ok(Arc::new(backend) as Arc<dyn Backend>)
        });

        registry
    }

    /// Registers a constructor for `backend`.
    ///
    /// Registration is additive; registering a tag again replaces its
    /// constructor.
    pub fn register<F, Fut>(&mut self, backend: BackendType, factory: F) -> &mut Self
    where
        F: Fn(BackendConfig) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Arc<dyn Backend>>> + Send + 'static,
    {
        let factory: BackendFactory = Arc::new(move |config| factory(config).boxed());
        if self.factories.insert(backend, factory).is_some() {
            debug!("Replaced factory for {} backend", backend);
        }
        self
    }

    /// Returns the constructor for `backend`, if registered.
    #[must_use]
    pub fn get(&self, backend: BackendType) -> Option<BackendFactory> {
        self.factories.get(&backend).cloned()
    }

    /// Returns true if `backend` is registered.
    #[must_use]
    pub fn contains(&self, backend: BackendType) -> bool {
        self.factories.contains_key(&backend)
    }

    /// Returns registered types in selection order.
    #[must_use]
    pub fn registered(&self) -> Vec<BackendType> {
        BackendType::PREFERENCE
            .into_iter()
            .filter(|t| self.contains(*t))
            .collect()
    }

    /// Constructs the backend `config` targets.
    pub async fn create(&self, config: BackendConfig) -> Result<Arc<dyn Backend>> {
        let backend = config.backend_type();
        let factory = self
            .get(backend)
            .ok_or(Error::BackendNotRegistered(backend))?;
        factory(config).await
    }
}

impl std::fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendRegistry")
            .field("registered", &self.registered())
            .finish()
    }
}

fn mismatched_config(expected: BackendType, config: &BackendConfig) -> Error {
    Error::InvalidConfig(format!(
        "{expected} factory received a {} config",
        config.backend_type()
    ))
}

/// Selects the default backend: Docker if healthy, else containerd.
///
/// Each candidate is built with its default configuration and must pass
/// `health_check`. The error names every backend that was registered but
/// failed, with its reason.
pub async fn select_backend(registry: &BackendRegistry) -> Result<Arc<dyn Backend>> {
    let mut failures = Vec::new();

    for backend in BackendType::PREFERENCE {
        let Some(factory) = registry.get(backend) else {
            debug!("{} backend not registered, skipping", backend);
            continue;
        };

        let result = match factory(BackendConfig::default_for(backend)).await {
            Ok(instance) => instance.health_check().await.map(|()| instance),
            Err(e) => Err(e),
        };

        match result {
            Ok(instance) => {
                info!("Selected {} backend", backend);
                return Ok(instance);
            }
            Err(e) => {
                warn!("{} backend unhealthy: {}", backend, e);
                failures.push(format!("{backend}: {e}"));
            }
        }
    }

    if failures.is_empty() {
        return Err(Error::NoBackendsRegistered);
    }

    Err(Error::NoHealthyBackend {
        failures: failures.join(", "),
    })
}
