//! Tests for the Docker adapter that need no running engine.
//!
//! The client points at a socket that does not exist; bollard connects
//! lazily, so requests fail at send time.

use std::path::PathBuf;
use std::sync::Arc;

use bollard::Docker;
use tauctr::backends::docker::translate::translate;
use tauctr::{
    select_backend, Backend, BackendConfig, BackendRegistry, BackendType, BuildInput,
    ContainerConfig, ContainerdBuildInput, DockerBackend, DockerConfig, Error, NetworkConfig,
    PortMapping, ResourceLimits,
};

const MISSING_SOCKET: &str = "unix:///nonexistent/tau/docker.sock";

fn offline_backend() -> DockerBackend {
    let client = Docker::connect_with_unix(MISSING_SOCKET, 1, bollard::API_DEFAULT_VERSION)
        .expect("client construction does not touch the socket");
    DockerBackend::from_client(DockerConfig::default(), client)
}

// =============================================================================
// Health & Selection
// =============================================================================

#[tokio::test]
async fn test_health_check_unreachable_engine() {
    let backend = offline_backend();

    let err = backend.health_check().await.unwrap_err();
    assert!(
        matches!(
            err,
            Error::BackendUnavailable {
                backend: BackendType::Docker,
                ..
            }
        ),
        "unexpected error: {err}"
    );
}

#[tokio::test]
async fn test_selection_reports_unreachable_docker() {
    let mut registry = BackendRegistry::new();
    registry.register(BackendType::Docker, |_config| async {
        Ok(Arc::new(offline_backend()) as Arc<dyn Backend>)
    });

    let err = select_backend(&registry).await.err().unwrap();
    let msg = err.to_string();
    assert!(matches!(err, Error::NoHealthyBackend { .. }), "unexpected error: {msg}");
    assert!(msg.contains("docker"), "should name docker: {msg}");
}

#[tokio::test]
async fn test_connect_rejects_unknown_scheme() {
    let config = DockerConfig {
        host: Some("ssh://build-host".to_string()),
        api_version: Some("1.43".to_string()),
    };
    let err = DockerBackend::connect(config).await.unwrap_err();
    assert!(matches!(err, Error::InvalidConfig(_)), "unexpected error: {err}");
}

#[tokio::test]
async fn test_registry_factory_connects_with_config() {
    let registry = BackendRegistry::with_defaults();
    let config = BackendConfig::Docker(DockerConfig {
        host: Some(MISSING_SOCKET.to_string()),
        api_version: Some("1.43".to_string()),
    });

    let err = registry.create(config).await.err().unwrap();
    assert!(
        matches!(err, Error::BackendUnavailable { .. }),
        "pinned version skips negotiation, so ping fails: {err}"
    );
}

// =============================================================================
// Offline Operations
// =============================================================================

#[tokio::test]
async fn test_create_rejects_bad_port_before_request() {
    let backend = offline_backend();
    let network = NetworkConfig {
        port_mappings: vec![PortMapping {
            host_port: 8080,
            container_port: 80,
            protocol: "invalid-protocol".to_string(),
            host_ip: None,
        }],
        ..Default::default()
    };

    let err = backend
        .create(&ContainerConfig::new("nginx").with_network(network))
        .await
        .unwrap_err();
    assert!(
        matches!(err, Error::InvalidPort { port: 80, .. }),
        "unexpected error: {err}"
    );
    assert!(err.to_string().contains("invalid port"));
}

#[tokio::test]
async fn test_build_rejects_containerd_input() {
    let backend = offline_backend();
    let err = backend
        .image("app:latest")
        .build(BuildInput::Containerd(ContainerdBuildInput {
            context_dir: PathBuf::from("."),
            dockerfile: "Dockerfile".to_string(),
        }))
        .await
        .unwrap_err();
    assert!(
        matches!(
            err,
            Error::UnsupportedBuildInput {
                backend: BackendType::Docker,
                input: BackendType::Containerd
            }
        ),
        "unexpected error: {err}"
    );
}

#[tokio::test]
async fn test_capabilities_all_supported() {
    let caps = offline_backend().capabilities();
    assert!(caps.supports_build);
    assert!(caps.supports_storage);
    assert!(caps.supports_memory_swap);
}

// =============================================================================
// Request Translation
// =============================================================================

#[test]
fn test_translate_user_env_replaces_default_path() {
    let config = ContainerConfig::new("alpine")
        .with_command(["sh", "-c", "echo $FOO"])
        .with_env("FOO=bar");
    let body = translate(&config).unwrap();

    assert_eq!(body.env, Some(vec!["FOO=bar".to_string()]));
    assert_eq!(
        body.cmd,
        Some(vec!["sh".to_string(), "-c".to_string(), "echo $FOO".to_string()])
    );
    assert_eq!(body.image.as_deref(), Some("alpine"));
}

#[test]
fn test_translate_storage_and_cpu() {
    let limits = ResourceLimits {
        cpu_quota: 50_000,
        cpu_period: 100_000,
        storage: 10 * 1024 * 1024 * 1024,
        ..Default::default()
    };
    let body = translate(&ContainerConfig::new("alpine").with_resources(limits)).unwrap();
    let host = body.host_config.unwrap();

    assert_eq!(host.cpu_quota, Some(50_000));
    assert_eq!(host.cpu_period, Some(100_000));
    assert_eq!(host.cpu_shares, None);
    assert_eq!(
        host.storage_opt.unwrap().get("size").map(String::as_str),
        Some("10737418240")
    );
}

#[test]
fn test_port_mapping_key_normalization() {
    let mut mapping = PortMapping::tcp(0, 443);
    mapping.protocol = String::new();
    assert_eq!(mapping.key().unwrap(), "443/tcp");

    mapping.protocol = "SCTP".to_string();
    assert_eq!(mapping.key().unwrap(), "443/sctp");

    mapping.container_port = 0;
    assert!(matches!(
        mapping.key().unwrap_err(),
        Error::InvalidPort { port: 0, .. }
    ));
}
