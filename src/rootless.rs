//! # Rootless Support
//!
//! Host-side helpers for running containerd without root:
//!
//! - [`Identity`]: who the caller is (username, UID, GID)
//! - [`XdgDirs`]: XDG runtime/data/config directories with UID-based fallbacks
//! - [`RootlessTools`]: rootlesskit and fuse-overlayfs discovery
//! - [`SubIdValidator`]: subordinate UID/GID table checks for bind mounts
//!
//! ## Subordinate ID Tables
//!
//! `/etc/subuid` and `/etc/subgid` delegate ID ranges to users:
//!
//! ```text
//! # user:start:count
//! alice:100000:65536
//! bob:165536:65536
//! ```
//!
//! Blank lines and `#` comments are skipped. Only lines whose first field is
//! the caller's username are considered. A host file owned by some other
//! UID/GID can only be bind-mounted into a rootless container if that ID
//! falls inside one of the caller's ranges; otherwise it shows up as
//! `nobody` inside the namespace and the mount is unusable.

use std::fs::DirBuilder;
use std::io;
use std::os::unix::fs::{DirBuilderExt, MetadataExt};
use std::path::{Path, PathBuf};

use nix::unistd::{Gid, Uid, User};
use tracing::debug;

use crate::config::ContainerdConfig;
use crate::error::{Error, Result};
use crate::types::SubIdMapping;

/// Default subordinate UID table.
pub const SUBUID_PATH: &str = "/etc/subuid";

/// Default subordinate GID table.
pub const SUBGID_PATH: &str = "/etc/subgid";

/// rootlesskit binary names, in lookup order.
pub const ROOTLESSKIT_ALIASES: &[&str] = &["rootlesskit", "docker-rootlesskit"];

// =============================================================================
// Identity
// =============================================================================

/// The calling user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub username: String,
    pub uid: u32,
    pub gid: u32,
}

impl Identity {
    /// Looks up the current (real) user in the passwd database.
    pub fn current() -> Result<Self> {
        let uid = Uid::current();
        let user = User::from_uid(uid)
            .map_err(|e| Error::Rootless(format!("failed to get current user: {e}")))?
            .ok_or_else(|| Error::Rootless(format!("no passwd entry for UID {uid}")))?;

        Ok(Self {
            username: user.name,
            uid: uid.as_raw(),
            gid: Gid::current().as_raw(),
        })
    }
}

/// Returns true when the effective UID is root.
#[must_use]
pub fn is_root() -> bool {
    Uid::effective().is_root()
}

// =============================================================================
// XDG Directories
// =============================================================================

/// XDG base directories for the daemon's files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XdgDirs {
    /// `$XDG_RUNTIME_DIR`, else `/run/user/<uid>`.
    pub runtime_dir: PathBuf,
    /// `$XDG_DATA_HOME`, else `~/.local/share`.
    pub data_home: PathBuf,
    /// `$XDG_CONFIG_HOME`, else `~/.config`.
    pub config_home: PathBuf,
}

impl XdgDirs {
    /// Resolves the directories from the environment.
    pub fn resolve(uid: u32) -> Result<Self> {
        let data_home = match env_dir("XDG_DATA_HOME") {
            Some(dir) => dir,
            None => home_dir()?.join(".local").join("share"),
        };
        let config_home = match env_dir("XDG_CONFIG_HOME") {
            Some(dir) => dir,
            None => home_dir()?.join(".config"),
        };

        Ok(Self {
            runtime_dir: runtime_dir(uid),
            data_home,
            config_home,
        })
    }
}

/// Returns `$XDG_RUNTIME_DIR`, else `/run/user/<uid>`.
#[must_use]
pub fn runtime_dir(uid: u32) -> PathBuf {
    env_dir("XDG_RUNTIME_DIR").unwrap_or_else(|| PathBuf::from(format!("/run/user/{uid}")))
}

fn env_dir(var: &str) -> Option<PathBuf> {
    std::env::var_os(var)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}

fn home_dir() -> Result<PathBuf> {
    dirs::home_dir()
        .ok_or_else(|| Error::Rootless("failed to get home directory".to_string()))
}

/// Creates `path` (and parents) with mode 0755 if it does not exist.
///
/// An existing directory is fine; anything else (permission denied, a file
/// in the way) is returned.
pub fn ensure_dir(path: &Path) -> Result<()> {
    match DirBuilder::new().recursive(true).mode(0o755).create(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists && path.is_dir() => Ok(()),
        Err(e) => Err(Error::Io(io::Error::new(
            e.kind(),
            format!("failed to create directory {}: {e}", path.display()),
        ))),
    }
}

// =============================================================================
// Binary Discovery
// =============================================================================

/// Resolves a binary: the explicit path if given, else the first of `names`
/// found on `PATH`.
pub fn find_binary(explicit: Option<&Path>, names: &[&str]) -> Result<PathBuf> {
    if let Some(path) = explicit {
        return Ok(path.to_path_buf());
    }

    names
        .iter()
        .find_map(|name| which::which(name).ok())
        .ok_or_else(|| Error::BinaryNotFound {
            binary: names.first().copied().unwrap_or("binary").to_string(),
            reason: format!("none of {names:?} found in PATH"),
        })
}

/// Optional rootless helpers found on this host.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RootlessTools {
    pub rootlesskit: Option<PathBuf>,
    pub fuse_overlayfs: Option<PathBuf>,
}

impl RootlessTools {
    /// Detects tools from explicit config paths, else `PATH`.
    #[must_use]
    pub fn detect(config: &ContainerdConfig) -> Self {
        let tools = Self {
            rootlesskit: find_binary(config.rootlesskit_path.as_deref(), ROOTLESSKIT_ALIASES)
                .ok(),
            fuse_overlayfs: find_binary(config.fuse_overlayfs_path.as_deref(), &["fuse-overlayfs"])
                .ok(),
        };
        debug!(
            "Rootless tools: rootlesskit={:?} fuse-overlayfs={:?}",
            tools.rootlesskit, tools.fuse_overlayfs
        );
        tools
    }

    pub fn has_rootlesskit(&self) -> bool {
        self.rootlesskit.is_some()
    }

    pub fn has_fuse_overlayfs(&self) -> bool {
        self.fuse_overlayfs.is_some()
    }
}

// =============================================================================
// Subordinate ID Tables
// =============================================================================

/// Parses the ranges delegated to `username` from a subuid/subgid table.
///
/// Entries for other users are ignored, even if malformed. A malformed
/// entry for `username` is an error.
pub fn parse_subid_table(content: &str, username: &str) -> Result<Vec<SubIdMapping>> {
    let mut mappings = Vec::new();

    for (lineno, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let mut fields = line.split(':');
        if fields.next() != Some(username) {
            continue;
        }

        let parsed = match (fields.next(), fields.next()) {
            (Some(start), Some(count)) => start
                .trim()
                .parse::<u32>()
                .ok()
                .zip(count.trim().parse::<u32>().ok()),
            _ => None,
        };

        match parsed {
            Some((start, count)) => mappings.push(SubIdMapping { start, count }),
            None => {
                return Err(Error::Rootless(format!(
                    "malformed subordinate ID entry on line {}: '{line}'",
                    lineno + 1
                )))
            }
        }
    }

    Ok(mappings)
}

/// Checks whether host files can be mapped into the caller's user namespace.
#[derive(Debug, Clone)]
pub struct SubIdValidator {
    identity: Identity,
    tools: RootlessTools,
    subuid_path: PathBuf,
    subgid_path: PathBuf,
}

impl SubIdValidator {
    /// Creates a validator over the system tables.
    pub fn new(identity: Identity, tools: RootlessTools) -> Self {
        Self {
            identity,
            tools,
            subuid_path: PathBuf::from(SUBUID_PATH),
            subgid_path: PathBuf::from(SUBGID_PATH),
        }
    }

    /// Uses alternate table files.
    #[must_use]
    pub fn with_tables(mut self, subuid: impl Into<PathBuf>, subgid: impl Into<PathBuf>) -> Self {
        self.subuid_path = subuid.into();
        self.subgid_path = subgid.into();
        self
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Reads the caller's ranges from a table file.
    pub fn read_mappings(&self, table: &Path) -> Result<Vec<SubIdMapping>> {
        let content = std::fs::read_to_string(table).map_err(|e| {
            Error::Rootless(format!("cannot read {}: {e}", table.display()))
        })?;
        parse_subid_table(&content, &self.identity.username)
    }

    /// Succeeds if `uid` lies in one of the caller's subuid ranges.
    pub fn can_map_uid(&self, uid: u32) -> Result<()> {
        let mappings = self.read_mappings(&self.subuid_path)?;
        if mappings.iter().any(|m| m.contains(uid)) {
            return Ok(());
        }
        Err(Error::Rootless(format!(
            "UID {uid} not in subuid range for user {}",
            self.identity.username
        )))
    }

    /// Succeeds if `gid` lies in one of the caller's subgid ranges.
    pub fn can_map_gid(&self, gid: u32) -> Result<()> {
        let mappings = self.read_mappings(&self.subgid_path)?;
        if mappings.iter().any(|m| m.contains(gid)) {
            return Ok(());
        }
        Err(Error::Rootless(format!(
            "GID {gid} not in subgid range for user {}",
            self.identity.username
        )))
    }

    /// Checks that `host_path` can be bind-mounted at `container_path`.
    ///
    /// Files owned by the caller's UID or GID are always mountable and the
    /// tables are not read. Anything else needs both its owner UID and GID
    /// inside the caller's subordinate ranges.
    pub fn validate_mount_permissions(&self, host_path: &Path, container_path: &str) -> Result<()> {
        let meta = std::fs::metadata(host_path).map_err(|e| Error::UnmappableMount {
            path: host_path.to_path_buf(),
            reason: format!("cannot stat host path: {e}"),
        })?;

        let (uid, gid) = (meta.uid(), meta.gid());
        if uid == self.identity.uid || gid == self.identity.gid {
            return Ok(());
        }

        debug!(
            "Mount {} -> {} owned by {}:{}, checking subordinate ranges",
            host_path.display(),
            container_path,
            uid,
            gid
        );

        let helper = if self.tools.has_rootlesskit() {
            " even with rootlesskit"
        } else {
            ""
        };

        self.can_map_uid(uid).map_err(|e| Error::UnmappableMount {
            path: host_path.to_path_buf(),
            reason: format!("UID {uid} cannot be mapped{helper} (subuid not configured): {e}"),
        })?;

        self.can_map_gid(gid).map_err(|e| Error::UnmappableMount {
            path: host_path.to_path_buf(),
            reason: format!("GID {gid} cannot be mapped{helper} (subgid not configured): {e}"),
        })?;

        Ok(())
    }

    /// Checks that the caller has at least one entry in both tables.
    pub fn validate_uid_gid_mapping(&self) -> Result<()> {
        for (table, kind) in [(&self.subuid_path, "subuid"), (&self.subgid_path, "subgid")] {
            if self.read_mappings(table)?.is_empty() {
                return Err(Error::Rootless(format!(
                    "{kind} mapping validation failed: no mapping found for user {} in {}",
                    self.identity.username,
                    table.display()
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_skips_comments_and_other_users() {
        let table = "# comment\n\nbob:1:2\nalice:100000:65536\n  alice:200000:10  \n";
        let mappings = parse_subid_table(table, "alice").unwrap();
        assert_eq!(
            mappings,
            vec![
                SubIdMapping {
                    start: 100_000,
                    count: 65_536
                },
                SubIdMapping {
                    start: 200_000,
                    count: 10
                },
            ]
        );
    }

    #[test]
    fn test_parse_ignores_malformed_foreign_lines() {
        let table = "bob:notanumber:x\nalice:1:1\n";
        assert_eq!(parse_subid_table(table, "alice").unwrap().len(), 1);
    }

    #[test]
    fn test_parse_rejects_malformed_own_line() {
        let err = parse_subid_table("alice:100000\n", "alice").unwrap_err();
        assert!(err.to_string().contains("line 1"), "should name the line: {err}");
    }

    #[test]
    fn test_find_binary_explicit_path_wins() {
        let path = find_binary(Some(Path::new("/opt/bin/containerd")), &["containerd"]).unwrap();
        assert_eq!(path, PathBuf::from("/opt/bin/containerd"));
    }

    #[test]
    fn test_find_binary_missing() {
        let err = find_binary(None, &["definitely-not-a-real-binary-tauctr"]).unwrap_err();
        assert!(matches!(err, Error::BinaryNotFound { .. }));
    }

    #[test]
    fn test_ensure_dir_existing_is_ok() {
        let temp = tempfile::TempDir::new().unwrap();
        ensure_dir(temp.path()).unwrap();
        ensure_dir(&temp.path().join("a/b")).unwrap();
        assert!(temp.path().join("a/b").is_dir());
    }

    #[test]
    fn test_ensure_dir_file_in_the_way() {
        let temp = tempfile::TempDir::new().unwrap();
        let file = temp.path().join("file");
        std::fs::write(&file, b"x").unwrap();
        assert!(ensure_dir(&file).is_err(), "a file is not a directory");
    }
}
