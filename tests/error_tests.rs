//! Tests for error types.
//!
//! Validates display formatting and the classification helpers callers use
//! to branch on error categories.

use std::path::PathBuf;
use std::time::Duration;

use tauctr::{BackendType, Error};

// =============================================================================
// Container Lifecycle Error Tests
// =============================================================================

#[test]
fn test_container_not_found_display() {
    let err = Error::ContainerNotFound("tau-20240101-000000-1".to_string());
    let msg = err.to_string();

    assert!(msg.contains("tau-20240101-000000-1"), "should include container ID");
    assert!(msg.contains("not found"), "should indicate not found");
    assert!(err.is_not_found());
}

#[test]
fn test_non_zero_exit_carries_code() {
    let err = Error::NonZeroExit {
        id: "tau-x".to_string(),
        code: 42,
    };

    assert_eq!(err.exit_code(), Some(42));
    assert!(err.to_string().contains("status 42"), "should include exit code");
    assert_eq!(Error::DaemonNotRunning.exit_code(), None);
}

#[test]
fn test_invalid_port_display() {
    let err = Error::InvalidPort {
        port: 80,
        protocol: "icmp".to_string(),
    };
    assert_eq!(err.to_string(), "invalid port 80/icmp");
}

// =============================================================================
// Image Error Tests
// =============================================================================

#[test]
fn test_image_errors_display_reference() {
    let err = Error::ImagePullFailed {
        reference: "alpine:3.19".to_string(),
        reason: "manifest unknown".to_string(),
    };
    let msg = err.to_string();
    assert!(msg.contains("alpine:3.19"), "should include reference");
    assert!(msg.contains("manifest unknown"), "should include reason");

    assert!(Error::ImageNotFound("ghost".to_string()).is_not_found());
}

#[test]
fn test_cleanup_failure_counts() {
    let err = Error::ImageCleanupFailed {
        count: 2,
        failures: "sha256:a: in use; sha256:b: in use".to_string(),
    };
    assert!(err.to_string().starts_with("failed to remove 2 image(s)"));
}

#[test]
fn test_build_sentinels_are_not_supported() {
    let build = Error::BuildNotSupported {
        backend: BackendType::Containerd,
    };
    assert!(build.is_not_supported());
    assert!(build.to_string().contains("containerd"));

    assert!(Error::NotSupported("named volumes".to_string()).is_not_supported());

    let mismatch = Error::UnsupportedBuildInput {
        backend: BackendType::Docker,
        input: BackendType::Containerd,
    };
    assert!(!mismatch.is_not_supported(), "a wrong input tag is a caller error");
    assert_eq!(
        mismatch.to_string(),
        "build input for 'containerd' not supported by the docker backend"
    );
}

// =============================================================================
// Backend/Registry Error Tests
// =============================================================================

#[test]
fn test_selection_errors_are_distinct() {
    let none = Error::NoBackendsRegistered.to_string();
    let unhealthy = Error::NoHealthyBackend {
        failures: "docker: down".to_string(),
    }
    .to_string();

    assert_ne!(none, unhealthy);
    assert!(unhealthy.contains("registered but unhealthy"));
    assert!(unhealthy.contains("docker: down"));
}

#[test]
fn test_backend_not_registered_names_tag() {
    let err = Error::BackendNotRegistered(BackendType::Docker);
    assert_eq!(err.to_string(), "backend 'docker' is not registered");
}

// =============================================================================
// Daemon & Rootless Error Tests
// =============================================================================

#[test]
fn test_daemon_signal_failed_display() {
    let err = Error::DaemonSignalFailed {
        pid: 4242,
        reason: "EPERM".to_string(),
    };
    let msg = err.to_string();
    assert!(msg.contains("4242"), "should include PID");
    assert!(msg.contains("EPERM"), "should include reason");
}

#[test]
fn test_unmappable_mount_display() {
    let err = Error::UnmappableMount {
        path: PathBuf::from("/srv/data"),
        reason: "owner UID 0 outside subuid range".to_string(),
    };
    let msg = err.to_string();
    assert!(msg.contains("/srv/data"), "should include path");
    assert!(msg.contains("subuid"), "should include reason");
}

// =============================================================================
// Conversion Tests
// =============================================================================

#[test]
fn test_grpc_not_found_is_not_found() {
    let err: Error = tonic::Status::not_found("container x").into();
    assert!(err.is_not_found());

    let err: Error = tonic::Status::unavailable("socket").into();
    assert!(!err.is_not_found());
}

#[test]
fn test_docker_404_is_not_found() {
    let err: Error = bollard::errors::Error::DockerResponseServerError {
        status_code: 404,
        message: "No such container".to_string(),
    }
    .into();
    assert!(err.is_not_found());
}

#[test]
fn test_io_and_serde_conversions() {
    let err: Error = std::io::Error::new(std::io::ErrorKind::NotFound, "gone").into();
    assert!(matches!(err, Error::Io(_)));
    assert!(!err.is_not_found(), "plain I/O errors are not container lookups");

    let err: Error = serde_json::from_str::<u32>("nope").unwrap_err().into();
    assert!(matches!(err, Error::Serialization(_)));
}

#[test]
fn test_timeout_display() {
    let err = Error::Timeout {
        operation: "waiting for containerd.sock".to_string(),
        duration: Duration::from_secs(30),
    };
    let msg = err.to_string();
    assert!(msg.contains("30s"), "should include duration");
    assert!(msg.contains("containerd.sock"), "should include operation");
}
