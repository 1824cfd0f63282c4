//! Tests for subordinate ID validation of rootless bind mounts.
//!
//! The validator runs against scratch subuid/subgid tables and a synthetic
//! identity, so results do not depend on the host's `/etc/subuid`.

use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use tauctr::rootless::parse_subid_table;
use tauctr::{Error, Identity, RootlessTools, SubIdMapping, SubIdValidator};
use tempfile::TempDir;

/// Writes subuid/subgid tables into `dir` and returns their paths.
fn tables(dir: &TempDir, subuid: &str, subgid: &str) -> (PathBuf, PathBuf) {
    let uid_path = dir.path().join("subuid");
    let gid_path = dir.path().join("subgid");
    fs::write(&uid_path, subuid).unwrap();
    fs::write(&gid_path, subgid).unwrap();
    (uid_path, gid_path)
}

fn stranger() -> Identity {
    Identity {
        username: "alice".to_string(),
        uid: 4242,
        gid: 4242,
    }
}

fn validator(
    identity: Identity,
    tools: RootlessTools,
    dir: &TempDir,
    subuid: &str,
    subgid: &str,
) -> SubIdValidator {
    let (uid_path, gid_path) = tables(dir, subuid, subgid);
    SubIdValidator::new(identity, tools).with_tables(uid_path, gid_path)
}

/// Owner of `/`, which the synthetic identity never owns.
fn root_owner() -> (u32, u32) {
    let meta = fs::metadata("/").unwrap();
    (meta.uid(), meta.gid())
}

// =============================================================================
// Trivially Valid Mounts
// =============================================================================

#[test]
fn test_own_file_is_valid_without_tables() {
    let dir = TempDir::new().unwrap();
    let file = dir.path().join("data");
    fs::write(&file, b"x").unwrap();
    let meta = fs::metadata(&file).unwrap();

    let me = Identity {
        username: "nobody-in-tables".to_string(),
        uid: meta.uid(),
        gid: meta.gid(),
    };
    let validator = SubIdValidator::new(me, RootlessTools::default())
        .with_tables(dir.path().join("missing-subuid"), dir.path().join("missing-subgid"));

    validator
        .validate_mount_permissions(&file, "/data")
        .expect("a file owned by the caller never needs the tables");
}

#[test]
fn test_matching_gid_alone_is_valid() {
    let (_, gid) = root_owner();
    let dir = TempDir::new().unwrap();
    let identity = Identity {
        username: "alice".to_string(),
        uid: 4242,
        gid,
    };
    let validator = validator(identity, RootlessTools::default(), &dir, "", "");

    assert!(validator.validate_mount_permissions(Path::new("/"), "/host").is_ok());
}

// =============================================================================
// Subordinate Range Checks
// =============================================================================

#[test]
fn test_foreign_owner_inside_ranges_is_valid() {
    let (uid, gid) = root_owner();
    let dir = TempDir::new().unwrap();
    let validator = validator(
        stranger(),
        RootlessTools::default(),
        &dir,
        &format!("alice:{uid}:65536\n"),
        &format!("alice:{gid}:65536\n"),
    );

    validator
        .validate_mount_permissions(Path::new("/"), "/host")
        .expect("owner inside both ranges should be mappable");
}

#[test]
fn test_foreign_owner_outside_subuid_range() {
    let (_, gid) = root_owner();
    let dir = TempDir::new().unwrap();
    let validator = validator(
        stranger(),
        RootlessTools::default(),
        &dir,
        "alice:100000:65536\n",
        &format!("alice:{gid}:1\n"),
    );

    let err = validator
        .validate_mount_permissions(Path::new("/"), "/host")
        .unwrap_err();
    let msg = err.to_string();
    assert!(matches!(err, Error::UnmappableMount { .. }), "unexpected error: {err}");
    assert!(msg.contains("subuid not configured"), "should name the table: {msg}");
    assert!(!msg.contains("rootlesskit"), "no helper detected: {msg}");
}

#[test]
fn test_foreign_owner_outside_subgid_range_with_rootlesskit() {
    let (uid, _) = root_owner();
    let dir = TempDir::new().unwrap();
    let tools = RootlessTools {
        rootlesskit: Some(PathBuf::from("/usr/bin/rootlesskit")),
        fuse_overlayfs: None,
    };
    let validator = validator(
        stranger(),
        tools,
        &dir,
        &format!("alice:{uid}:1\n"),
        "alice:100000:65536\n",
    );

    let msg = validator
        .validate_mount_permissions(Path::new("/"), "/host")
        .unwrap_err()
        .to_string();
    assert!(msg.contains("subgid not configured"), "{msg}");
    assert!(msg.contains("even with rootlesskit"), "{msg}");
}

#[test]
fn test_missing_host_path() {
    let dir = TempDir::new().unwrap();
    let validator = validator(stranger(), RootlessTools::default(), &dir, "", "");

    let err = validator
        .validate_mount_permissions(&dir.path().join("nope"), "/nope")
        .unwrap_err();
    assert!(matches!(err, Error::UnmappableMount { .. }));
}

#[test]
fn test_can_map_uid_upper_bound() {
    let dir = TempDir::new().unwrap();
    let validator = validator(
        stranger(),
        RootlessTools::default(),
        &dir,
        "alice:100000:65536\n",
        "",
    );

    assert!(validator.can_map_uid(165_535).is_ok());
    assert!(validator.can_map_uid(165_536).is_err(), "range end is exclusive");
}

// =============================================================================
// Mapping Presence
// =============================================================================

#[test]
fn test_uid_gid_mapping_present() {
    let dir = TempDir::new().unwrap();
    let validator = validator(
        stranger(),
        RootlessTools::default(),
        &dir,
        "alice:100000:65536\n",
        "alice:100000:65536\n",
    );
    assert!(validator.validate_uid_gid_mapping().is_ok());
}

#[test]
fn test_uid_gid_mapping_missing_subgid() {
    let dir = TempDir::new().unwrap();
    let validator = validator(
        stranger(),
        RootlessTools::default(),
        &dir,
        "alice:100000:65536\n",
        "bob:100000:65536\n",
    );

    let msg = validator.validate_uid_gid_mapping().unwrap_err().to_string();
    assert!(msg.contains("subgid mapping validation failed"), "{msg}");
    assert!(msg.contains("alice"), "{msg}");
}

#[test]
fn test_parse_table_multiple_ranges() {
    let mappings = parse_subid_table("alice:1:2\nalice:10:20\n", "alice").unwrap();
    assert_eq!(
        mappings,
        vec![
            SubIdMapping { start: 1, count: 2 },
            SubIdMapping {
                start: 10,
                count: 20
            }
        ]
    );
}
