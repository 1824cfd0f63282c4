//! Tests for constants module.
//!
//! Validates values that must match stock containerd and Docker setups,
//! and the container ID rules FIFO paths depend on.

use std::time::Duration;

use tauctr::constants::*;
use tauctr::ContainerId;

// =============================================================================
// Container Defaults
// =============================================================================

#[test]
fn test_default_path_env_shape() {
    assert!(DEFAULT_PATH_ENV.starts_with("PATH="));
    for dir in ["/usr/local/sbin", "/usr/bin", "/bin"] {
        assert!(DEFAULT_PATH_ENV.contains(dir), "PATH should include {dir}");
    }
    assert_eq!(DEFAULT_WORKDIR, "/");
}

#[test]
fn test_port_protocols() {
    assert!(VALID_PORT_PROTOCOLS.contains(&DEFAULT_PORT_PROTOCOL));
    assert_eq!(VALID_PORT_PROTOCOLS, &["tcp", "udp", "sctp"]);
}

// =============================================================================
// containerd Compatibility
// =============================================================================

#[test]
fn test_containerd_defaults() {
    assert_eq!(CONTAINERD_RUNTIME, "io.containerd.runc.v2");
    assert_eq!(DEFAULT_SNAPSHOTTER, "overlayfs");
    assert_eq!(DEFAULT_CONTAINERD_NAMESPACE, "tau");
    assert_eq!(ROOTFUL_SOCKET_PATH, "/run/containerd/containerd.sock");
    assert_eq!(
        NAMESPACE_SOCKET_PATH, ROOTFUL_SOCKET_PATH,
        "inside the namespace the daemon sees the standard path"
    );
}

#[test]
fn test_mtus() {
    assert_eq!(USERMODE_NET_MTU, 65520);
    assert_eq!(DEFAULT_NET_MTU, 1500);
}

#[test]
fn test_blob_limit_reasonable() {
    // Manifests and configs are small; layers never go through this path.
    assert!(MAX_CONTENT_BLOB_SIZE >= 1024 * 1024);
    assert!(MAX_CONTENT_BLOB_SIZE <= 64 * 1024 * 1024);
}

// =============================================================================
// Timeouts
// =============================================================================

#[test]
fn test_daemon_start_budget() {
    assert_eq!(DAEMON_START_TIMEOUT, Duration::from_secs(30));
    assert_eq!(SOCKET_POLL_INTERVAL, Duration::from_millis(100));
    assert!(
        DAEMON_START_TIMEOUT.as_millis() / SOCKET_POLL_INTERVAL.as_millis() >= 100,
        "the socket should be polled many times before giving up"
    );
}

#[test]
fn test_stop_timeouts_match_engine_defaults() {
    assert_eq!(DOCKER_STOP_TIMEOUT_SECS, 10);
    assert_eq!(TASK_STOP_TIMEOUT, Duration::from_secs(10));
}

// =============================================================================
// Container ID Validation
// =============================================================================

#[test]
fn test_generated_ids_are_valid() {
    for _ in 0..16 {
        let id = ContainerId::generate();
        assert!(id.as_str().starts_with(CONTAINER_ID_PREFIX));
        assert!(
            validate_container_id(id.as_str()).is_ok(),
            "generated ID {id} must be usable as a file name"
        );
    }
}

#[test]
fn test_container_id_rejects_path_characters() {
    for bad in ["a/b", "..", "id.with.dots", "spaces here", ""] {
        assert!(validate_container_id(bad).is_err(), "{bad:?} should be rejected");
    }
    assert!(validate_container_id(&"x".repeat(MAX_CONTAINER_ID_LEN)).is_ok());
}
