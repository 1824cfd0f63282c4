//! Tests for the containerd adapter that need no running daemon.
//!
//! The backend is built over a lazy channel, so only operations that fail
//! before reaching the wire are exercised here.

use std::path::PathBuf;

use tauctr::backends::containerd::spec::{build_spec, ImageProcessDefaults};
use tauctr::{
    Backend, BuildInput, ContainerConfig, ContainerId, ContainerdBackend, ContainerdConfig,
    DockerBuildInput, Error, NetworkConfig, NetworkMode, PortMapping, ResourceLimits,
    RootlessMode, VolumeMount,
};
use tempfile::TempDir;
use tonic::transport::Channel;

fn rootful_config() -> ContainerdConfig {
    ContainerdConfig {
        rootless_mode: RootlessMode::Disabled,
        ..Default::default()
    }
}

fn lazy_backend() -> ContainerdBackend {
    let channel = Channel::from_static("http://[::]:50051").connect_lazy();
    ContainerdBackend::from_channel(rootful_config(), channel).unwrap()
}

// =============================================================================
// Connection
// =============================================================================

#[tokio::test]
async fn test_rootful_connect_without_daemon() {
    let dir = TempDir::new().unwrap();
    let config = ContainerdConfig {
        socket_path: Some(dir.path().join("containerd.sock")),
        ..rootful_config()
    };

    let err = ContainerdBackend::connect(config).await.unwrap_err();
    let msg = err.to_string();
    assert!(matches!(err, Error::BackendUnavailable { .. }), "unexpected error: {msg}");
    assert!(msg.contains("please start containerd system-wide"), "{msg}");
    assert!(msg.contains("containerd.sock"), "should name the socket: {msg}");
}

#[tokio::test]
async fn test_from_channel_keeps_explicit_socket() {
    let channel = Channel::from_static("http://[::]:50051").connect_lazy();
    let config = ContainerdConfig {
        socket_path: Some(PathBuf::from("/tmp/tau-test.sock")),
        ..rootful_config()
    };

    let backend = ContainerdBackend::from_channel(config, channel).unwrap();
    assert_eq!(backend.socket_path(), PathBuf::from("/tmp/tau-test.sock"));
    assert!(!backend.is_rootless());
    assert!(backend.daemon().is_none(), "no supervisor without connect()");
    assert!(backend.validate_uid_gid_mapping().is_ok(), "rootful skips subid checks");
}

#[tokio::test]
async fn test_socket_probe_missing_file() {
    let dir = TempDir::new().unwrap();
    let channel = Channel::from_static("http://[::]:50051").connect_lazy();
    let config = ContainerdConfig {
        socket_path: Some(dir.path().join("missing.sock")),
        ..rootful_config()
    };
    let backend = ContainerdBackend::from_channel(config, channel).unwrap();

    let msg = backend.test_socket_connection().await.unwrap_err().to_string();
    assert!(msg.contains("socket file does not exist"), "{msg}");
}

// =============================================================================
// Logs
// =============================================================================

#[tokio::test]
async fn test_logs_unknown_container_is_not_found() {
    let backend = lazy_backend();
    let id = ContainerId::new("never-created");

    for _ in 0..2 {
        let err = backend.logs(&id).await.err().unwrap();
        assert!(
            matches!(err, Error::ContainerNotFound(_)),
            "unexpected error: {err}"
        );
        assert!(err.is_not_found());
    }
}

// =============================================================================
// Capabilities & Build
// =============================================================================

#[tokio::test]
async fn test_capabilities_exclude_build() {
    let backend = lazy_backend();
    let caps = backend.capabilities();

    assert!(!caps.supports_build);
    assert!(caps.supports_memory && caps.supports_pids && caps.supports_volumes);
    assert_eq!(backend.backend_type(), tauctr::BackendType::Containerd);
}

#[tokio::test]
async fn test_build_is_not_supported() {
    let backend = lazy_backend();
    let image = backend.image("alpine:3.19");

    let err = image
        .build(BuildInput::Containerd(tauctr::ContainerdBuildInput {
            context_dir: PathBuf::from("."),
            dockerfile: "Dockerfile".to_string(),
        }))
        .await
        .unwrap_err();
    assert!(err.is_not_supported(), "unexpected error: {err}");

    let err = image
        .build(BuildInput::Docker(DockerBuildInput::new(Vec::<u8>::new())))
        .await
        .unwrap_err();
    assert!(
        matches!(err, Error::UnsupportedBuildInput { .. }),
        "Docker input must be rejected: {err}"
    );
}

#[tokio::test]
async fn test_create_rejects_invalid_config_before_rpc() {
    let backend = lazy_backend();
    let config = ContainerConfig::new("alpine").with_env("NOT_A_PAIR");

    let err = backend.create(&config).await.unwrap_err();
    assert!(matches!(err, Error::InvalidConfig(_)), "unexpected error: {err}");
}

#[tokio::test]
async fn test_create_rejects_bad_port_before_rpc() {
    let backend = lazy_backend();
    let network = NetworkConfig {
        port_mappings: vec![PortMapping {
            host_port: 8080,
            container_port: 80,
            protocol: "invalid-protocol".to_string(),
            host_ip: None,
        }],
        ..Default::default()
    };
    let config = ContainerConfig::new("alpine").with_network(network);

    assert!(matches!(
        config.validate().unwrap_err(),
        Error::InvalidPort { port: 80, .. }
    ));
    // The lazy channel has no server: reaching the wire would fail differently.
    let err = backend.create(&config).await.unwrap_err();
    assert!(
        matches!(err, Error::InvalidPort { port: 80, .. }),
        "unexpected error: {err}"
    );
    assert!(err.to_string().contains("invalid port"));
}

// =============================================================================
// OCI Spec Translation
// =============================================================================

fn namespaces(config: &ContainerConfig) -> Vec<String> {
    build_spec(config, &ImageProcessDefaults::default())
        .unwrap()
        .linux
        .unwrap()
        .namespaces
        .into_iter()
        .map(|ns| ns.ns_type)
        .collect()
}

#[test]
fn test_spec_network_namespace_follows_mode() {
    let base = ContainerConfig::new("alpine").with_command(["true"]);
    assert!(namespaces(&base).contains(&"network".to_string()));

    let host = base.clone().with_network(NetworkConfig {
        mode: Some(NetworkMode::Host),
        ..Default::default()
    });
    let host_ns = namespaces(&host);
    assert!(!host_ns.contains(&"network".to_string()), "host mode shares the host netns");
    assert!(host_ns.contains(&"pid".to_string()));

    let none = base.with_network(NetworkConfig {
        mode: Some(NetworkMode::None),
        ..Default::default()
    });
    assert!(namespaces(&none).contains(&"network".to_string()));
}

#[test]
fn test_spec_rejects_unbackable_networking() {
    let base = ContainerConfig::new("alpine").with_command(["true"]);

    let ports = base.clone().with_network(NetworkConfig {
        port_mappings: vec![PortMapping::tcp(8080, 80)],
        ..Default::default()
    });
    let err = build_spec(&ports, &ImageProcessDefaults::default()).unwrap_err();
    assert!(err.is_not_supported(), "unexpected error: {err}");

    let custom = base.with_network(NetworkConfig {
        mode: Some(NetworkMode::Custom("ci-net".to_string())),
        ..Default::default()
    });
    let err = build_spec(&custom, &ImageProcessDefaults::default()).unwrap_err();
    assert!(err.is_not_supported(), "unexpected error: {err}");
}

#[test]
fn test_spec_path_always_first() {
    let config = ContainerConfig::new("alpine")
        .with_command(["env"])
        .with_env("PATH=/custom")
        .with_env("FOO=bar");
    let spec = build_spec(&config, &ImageProcessDefaults::default()).unwrap();

    assert!(spec.process.env[0].starts_with("PATH=/usr/local/sbin"));
    assert_eq!(&spec.process.env[1..], ["PATH=/custom", "FOO=bar"]);
    assert_eq!(spec.process.cwd, "/");
}

#[test]
fn test_spec_command_overrides_image() {
    let image = ImageProcessDefaults {
        entrypoint: Some(vec!["/entry".to_string()]),
        cmd: Some(vec!["serve".to_string()]),
    };
    let config = ContainerConfig::new("app").with_command(["echo", "hi"]);
    let spec = build_spec(&config, &image).unwrap();
    assert_eq!(spec.process.args, vec!["echo", "hi"]);

    let mut shell = ContainerConfig::new("app");
    shell.shell = vec!["/bin/sh".to_string(), "-c".to_string(), "true".to_string()];
    let spec = build_spec(&shell, &image).unwrap();
    assert_eq!(spec.process.args[0], "/bin/sh");
}

#[test]
fn test_spec_bind_mounts() {
    let config = ContainerConfig::new("alpine")
        .with_command(["ls"])
        .with_volume(VolumeMount::bind("/srv/data", "/data").read_only())
        .with_volume(VolumeMount::bind("/srv/cache", "/cache"));
    let spec = build_spec(&config, &ImageProcessDefaults::default()).unwrap();

    let data = spec.mounts.iter().find(|m| m.destination == "/data").unwrap();
    assert_eq!(data.mount_type, "bind");
    assert_eq!(data.options, vec!["rbind", "ro"]);
    let cache = spec.mounts.iter().find(|m| m.destination == "/cache").unwrap();
    assert_eq!(cache.options, vec!["rbind", "rw"]);
}

#[test]
fn test_spec_named_volume_not_supported() {
    let mut volume = VolumeMount::bind("cache", "/cache");
    volume.is_named_volume = true;
    let config = ContainerConfig::new("alpine")
        .with_command(["ls"])
        .with_volume(volume);

    let err = build_spec(&config, &ImageProcessDefaults::default()).unwrap_err();
    assert!(err.is_not_supported(), "unexpected error: {err}");
}

#[test]
fn test_spec_resources_zero_means_unset() {
    let limits = ResourceLimits {
        memory: 64 * 1024 * 1024,
        cpu_quota: 50_000,
        pids: 0,
        ..Default::default()
    };
    let config = ContainerConfig::new("alpine")
        .with_command(["true"])
        .with_resources(limits);
    let spec = build_spec(&config, &ImageProcessDefaults::default()).unwrap();

    let resources = spec.linux.as_ref().unwrap().resources.as_ref().unwrap();
    assert_eq!(resources.memory.as_ref().unwrap().limit, Some(64 * 1024 * 1024));
    assert!(resources.pids.is_none(), "zero pids must not become a limit");
    let cpu = resources.cpu.as_ref().unwrap();
    assert_eq!(cpu.period, Some(100_000), "period defaults when unset");

    let read_back = spec.resource_limits().unwrap();
    assert_eq!(read_back.memory, limits.memory);
    assert_eq!(read_back.cpu_quota, 50_000);
    assert_eq!(read_back.pids, 0);
}

#[test]
fn test_spec_survives_any_round_trip() {
    let config = ContainerConfig::new("alpine").with_command(["true"]);
    let spec = build_spec(&config, &ImageProcessDefaults::default()).unwrap();

    let any = spec.to_any().unwrap();
    assert!(any.type_url.contains("opencontainers/runtime-spec"));
    assert_eq!(tauctr::backends::containerd::spec::OciSpec::from_any(&any).unwrap(), spec);
}
