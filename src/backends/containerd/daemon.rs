//! # Rootless containerd Supervisor
//!
//! Launches a private containerd inside a user/network/mount namespace
//! created by `rootlesskit`, so an unprivileged user gets a working daemon
//! without touching system paths.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │  Host (unprivileged user)                                        │
//! │                                                                  │
//! │  Daemon::start()                                                 │
//! │    ├─ write  $XDG_RUNTIME_DIR/tau/containerd/containerd.toml     │
//! │    ├─ write  /tmp/tau-containerd-rootless-XXXX.sh                │
//! │    ├─ spawn  rootlesskit --net <driver> ... /bin/sh <script>     │
//! │    ├─ write  containerd.pid                                      │
//! │    └─ poll   containerd.sock (100ms, 30s budget)                 │
//! │                     │                                            │
//! │  ┌──────────────────▼───────────────────────────────────────┐    │
//! │  │  rootlesskit namespace                                   │    │
//! │  │   <socket dir>          ──bind──►  /run/containerd       │    │
//! │  │   <data>/tau/containerd/daemon ──► /var/lib/containerd   │    │
//! │  │   <data>/tau/cni        ──bind──►  /var/lib/cni          │    │
//! │  │   <config>/tau/containerd ─────►   /etc/containerd       │    │
//! │  │   exec containerd --config containerd.toml               │    │
//! │  └──────────────────────────────────────────────────────────┘    │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! containerd listens on `/run/containerd/containerd.sock` inside the
//! namespace; the bind mount makes that the host-visible socket in the
//! user's runtime directory. Several users can therefore run independent
//! daemons on one host.
//!
//! ## State
//!
//! ```text
//! NotStarted ──start──► Starting ──socket ready──► Running ──stop──► Stopping ──► Stopped
//!                          │                                                        ▲
//!                          └────────────── spawn/poll failure ──────────────────────┘
//! ```
//!
//! The PID file is the source of truth across process restarts. It is only
//! trusted after a liveness signal succeeds.
//!
//! ## Security Considerations
//!
//! - Nothing here requires privileges; rootful daemons are left to systemd
//! - Paths embedded in the wrapper script are single-quoted for `/bin/sh`
//! - A PID read from disk is only signalled when it is positive

use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::{Pid, Uid};
use serde::Serialize;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::ContainerdConfig;
use crate::constants::{
    CONFIG_FILE_NAME, CRI_PLUGIN_ID, DAEMON_START_TIMEOUT, DEFAULT_NET_MTU, GRPC_MAX_MESSAGE_SIZE,
    NAMESPACE_DEBUG_SOCKET_PATH, NAMESPACE_SOCKET_PATH, ROOTFUL_SOCKET_PATH, ROOTFUL_STATE_FILE,
    ROOTLESSKIT_STATE_DIR_NAME, SOCKET_FILE_NAME, SOCKET_POLL_INTERVAL, STATE_FILE_NAME,
    USERMODE_NET_MTU, XDG_APP_DIR,
};
use crate::error::{Error, Result};
use crate::rootless::{self, ensure_dir, find_binary, XdgDirs, ROOTLESSKIT_ALIASES};

// =============================================================================
// Paths
// =============================================================================

/// Host-visible files the supervisor owns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonPaths {
    /// Control socket, as seen from the host.
    pub socket_path: PathBuf,
    /// PID file of the spawned helper.
    pub state_file: PathBuf,
}

impl DaemonPaths {
    /// `$XDG_RUNTIME_DIR/tau/containerd/{containerd.sock,containerd.pid}`.
    #[must_use]
    pub fn rootless(uid: u32) -> Self {
        let dir = rootless::runtime_dir(uid).join(XDG_APP_DIR).join("containerd");
        Self {
            socket_path: dir.join(SOCKET_FILE_NAME),
            state_file: dir.join(STATE_FILE_NAME),
        }
    }

    /// System paths used by a systemd-managed daemon.
    #[must_use]
    pub fn rootful() -> Self {
        Self {
            socket_path: PathBuf::from(ROOTFUL_SOCKET_PATH),
            state_file: PathBuf::from(ROOTFUL_STATE_FILE),
        }
    }

    /// Paths for `config`. An explicit socket keeps its PID file beside it.
    #[must_use]
    pub fn for_config(config: &ContainerdConfig, rootless: bool) -> Self {
        match &config.socket_path {
            Some(socket) => Self {
                socket_path: socket.clone(),
                state_file: socket.with_file_name(STATE_FILE_NAME),
            },
            None if rootless => Self::rootless(Uid::current().as_raw()),
            None => Self::rootful(),
        }
    }

    fn socket_dir(&self) -> PathBuf {
        self.socket_path
            .parent()
            .map_or_else(|| PathBuf::from("/"), Path::to_path_buf)
    }
}

/// Directory layout of one rootless daemon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonLayout {
    /// containerd `root` (persistent content and snapshots).
    pub root_dir: PathBuf,
    /// containerd `state` (ephemeral).
    pub state_dir: PathBuf,
    /// rootlesskit `--state-dir`.
    pub rootlesskit_state_dir: PathBuf,
    /// Host directory bind-mounted over `/run/containerd`.
    pub socket_dir: PathBuf,
    /// Generated daemon config, inside `socket_dir`.
    pub config_path: PathBuf,
    /// Host directory bind-mounted over `/var/lib/cni`.
    pub cni_dir: PathBuf,
    /// Host directory bind-mounted over `/etc/containerd`.
    pub etc_dir: PathBuf,
    pub xdg: XdgDirs,
}

impl DaemonLayout {
    /// Derives the layout from the XDG directories and the host socket path.
    #[must_use]
    pub fn new(xdg: &XdgDirs, paths: &DaemonPaths) -> Self {
        let socket_dir = paths.socket_dir();
        Self {
            root_dir: xdg.data_home.join(XDG_APP_DIR).join("containerd").join("daemon"),
            state_dir: xdg.runtime_dir.join(XDG_APP_DIR).join("containerd").join("daemon"),
            rootlesskit_state_dir: xdg.runtime_dir.join(ROOTLESSKIT_STATE_DIR_NAME),
            config_path: socket_dir.join(CONFIG_FILE_NAME),
            socket_dir,
            cni_dir: xdg.data_home.join(XDG_APP_DIR).join("cni"),
            etc_dir: xdg.config_home.join(XDG_APP_DIR).join("containerd"),
            xdg: xdg.clone(),
        }
    }

    fn create_dirs(&self) -> Result<()> {
        for dir in [
            &self.root_dir,
            &self.state_dir,
            &self.rootlesskit_state_dir,
            &self.socket_dir,
        ] {
            ensure_dir(dir)?;
        }
        Ok(())
    }
}

// =============================================================================
// Generated Files
// =============================================================================

/// Daemon config file, version 2 schema.
#[derive(Debug, Serialize)]
struct DaemonConfigFile<'a> {
    version: u32,
    root: String,
    state: String,
    disabled_plugins: Vec<&'a str>,
    grpc: GrpcSection<'a>,
    debug: DebugSection<'a>,
}

#[derive(Debug, Serialize)]
struct GrpcSection<'a> {
    address: &'a str,
    uid: u32,
    gid: u32,
    max_recv_message_size: u32,
    max_send_message_size: u32,
}

#[derive(Debug, Serialize)]
struct DebugSection<'a> {
    address: &'a str,
    uid: u32,
    gid: u32,
    format: &'a str,
}

/// Renders the daemon config.
///
/// Only the CRI plugin is disabled. Both sockets point at namespace-internal
/// paths; the host sees them through the `/run/containerd` bind mount.
pub fn render_config(layout: &DaemonLayout) -> Result<String> {
    let config = DaemonConfigFile {
        version: 2,
        root: layout.root_dir.to_string_lossy().into_owned(),
        state: layout.state_dir.to_string_lossy().into_owned(),
        disabled_plugins: vec![CRI_PLUGIN_ID],
        grpc: GrpcSection {
            address: NAMESPACE_SOCKET_PATH,
            uid: 0,
            gid: 0,
            max_recv_message_size: GRPC_MAX_MESSAGE_SIZE,
            max_send_message_size: GRPC_MAX_MESSAGE_SIZE,
        },
        debug: DebugSection {
            address: NAMESPACE_DEBUG_SOCKET_PATH,
            uid: 0,
            gid: 0,
            format: "text",
        },
    };
    toml::to_string(&config)
        .map_err(|e| Error::DaemonStartFailed(format!("failed to render config file: {e}")))
}

/// Renders the script rootlesskit runs inside the new namespace.
///
/// It drops the copied-up symlinks at the target paths, re-mounts `/etc/ssl`
/// if it is a symlink, bind-mounts the host directories into place and
/// finally execs containerd.
#[must_use]
pub fn render_wrapper_script(layout: &DaemonLayout, containerd: &Path) -> String {
    let mut script = String::from(
        r#"#!/bin/sh
set -e

rm -f /run/containerd /run/xtables.lock /var/lib/containerd /var/lib/cni /etc/containerd

if [ -L "/etc/ssl" ]; then
	realpath_etc_ssl=$(realpath /etc/ssl)
	rm -f /etc/ssl
	mkdir /etc/ssl
	mount --rbind "${realpath_etc_ssl}" /etc/ssl
fi
"#,
    );

    for (source, target) in [
        (&layout.socket_dir, "/run/containerd"),
        (&layout.root_dir, "/var/lib/containerd"),
        (&layout.cni_dir, "/var/lib/cni"),
        (&layout.etc_dir, "/etc/containerd"),
    ] {
        let source = shell_quote(&source.to_string_lossy());
        script.push_str(&format!(
            "\nmkdir -p {source} {target}\nmount --bind {source} {target}\n"
        ));
    }

    script.push_str(&format!(
        "\nexec {} --config {}\n",
        shell_quote(&containerd.to_string_lossy()),
        shell_quote(&layout.config_path.to_string_lossy()),
    ));
    script
}

fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

// =============================================================================
// Network Driver
// =============================================================================

/// rootlesskit network driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkDriver {
    Slirp4netns,
    Pasta,
    Vpnkit,
}

impl NetworkDriver {
    /// Picks the first usable driver: slirp4netns (only if new enough to
    /// support `--netns-type`), then pasta, then vpnkit.
    pub async fn detect() -> Result<Self> {
        if let Ok(path) = which::which("slirp4netns") {
            match Command::new(&path).arg("--help").output().await {
                Ok(output) => {
                    let stdout = String::from_utf8_lossy(&output.stdout);
                    let stderr = String::from_utf8_lossy(&output.stderr);
                    if output.status.success()
                        && (stdout.contains("--netns-type") || stderr.contains("--netns-type"))
                    {
                        return Ok(Self::Slirp4netns);
                    }
                    debug!("{} lacks --netns-type, skipping", path.display());
                }
                Err(e) => debug!("Failed to probe {}: {}", path.display(), e),
            }
        }

        if which::which("pasta").is_ok() {
            return Ok(Self::Pasta);
        }
        if which::which("vpnkit").is_ok() {
            return Ok(Self::Vpnkit);
        }

        Err(Error::DaemonStartFailed(
            "no suitable rootlesskit network driver found \
             (need slirp4netns >= v0.4.0, pasta, or vpnkit)"
                .to_string(),
        ))
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Slirp4netns => "slirp4netns",
            Self::Pasta => "pasta",
            Self::Vpnkit => "vpnkit",
        }
    }

    /// MTU to configure: usermode stacks get the large MTU.
    #[must_use]
    pub fn mtu(&self) -> u32 {
        match self {
            Self::Slirp4netns | Self::Pasta => USERMODE_NET_MTU,
            Self::Vpnkit => DEFAULT_NET_MTU,
        }
    }
}

/// Arguments for rootlesskit, ending with `/bin/sh <script>`.
#[must_use]
pub fn rootlesskit_args(
    layout: &DaemonLayout,
    driver: NetworkDriver,
    script: &Path,
) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec![
        "--state-dir".into(),
        layout.rootlesskit_state_dir.clone().into(),
        "--net".into(),
        driver.as_str().into(),
        "--mtu".into(),
        driver.mtu().to_string().into(),
    ];
    args.extend(
        [
            "--slirp4netns-sandbox=auto",
            "--slirp4netns-seccomp=auto",
            "--disable-host-loopback",
            "--port-driver=builtin",
            "--copy-up=/etc",
            "--copy-up=/run",
            "--copy-up=/var/lib",
            "--propagation=rslave",
            "/bin/sh",
        ]
        .into_iter()
        .map(OsString::from),
    );
    args.push(script.as_os_str().to_os_string());
    args
}

// =============================================================================
// Daemon
// =============================================================================

/// Supervisor lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonState {
    NotStarted,
    Starting,
    Running,
    Stopping,
    Stopped,
}

#[derive(Debug)]
struct Inner {
    state: DaemonState,
    /// The helper we spawned, if any. `None` after a restart of this process.
    child: Option<Child>,
}

/// containerd daemon supervisor.
///
/// `start` and `stop` hold the state lock for their whole duration, so
/// concurrent calls are serialized and a second `start` observes the first
/// one's daemon.
#[derive(Debug)]
pub struct Daemon {
    config: ContainerdConfig,
    rootless: bool,
    paths: DaemonPaths,
    inner: Mutex<Inner>,
}

impl Daemon {
    /// Creates a supervisor for the effective user.
    ///
    /// # Errors
    /// Fails if rootless mode is requested as root, or the socket directory
    /// cannot be created.
    pub fn new(config: ContainerdConfig) -> Result<Self> {
        let rootless = config.rootless_mode.resolve(rootless::is_root())?;
        let paths = DaemonPaths::for_config(&config, rootless);
        ensure_dir(&paths.socket_dir())?;
        Ok(Self::with_paths(config, rootless, paths))
    }

    /// Creates a supervisor with explicit paths.
    #[must_use]
    pub fn with_paths(config: ContainerdConfig, rootless: bool, paths: DaemonPaths) -> Self {
        Self {
            config,
            rootless,
            paths,
            inner: Mutex::new(Inner {
                state: DaemonState::NotStarted,
                child: None,
            }),
        }
    }

    #[must_use]
    pub fn socket_path(&self) -> &Path {
        &self.paths.socket_path
    }

    #[must_use]
    pub fn state_file(&self) -> &Path {
        &self.paths.state_file
    }

    #[must_use]
    pub fn is_rootless(&self) -> bool {
        self.rootless
    }

    pub async fn state(&self) -> DaemonState {
        self.inner.lock().await.state
    }

    /// Starts the daemon unless one is already alive.
    ///
    /// A second call while the daemon runs is a no-op. In rootful mode the
    /// daemon is never spawned here.
    pub async fn start(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;

        if self.liveness(&mut inner).await {
            debug!(
                "containerd already running at {}",
                self.paths.socket_path.display()
            );
            inner.state = DaemonState::Running;
            return Ok(());
        }

        if !self.rootless {
            return Err(Error::DaemonStartFailed(
                "rootful mode: containerd is managed by systemd, please start it via systemd"
                    .to_string(),
            ));
        }

        inner.state = DaemonState::Starting;
        match self.launch_rootless().await {
            Ok(child) => {
                info!(
                    "Started rootless containerd (pid {:?}) at {}",
                    child.id(),
                    self.paths.socket_path.display()
                );
                inner.child = Some(child);
                inner.state = DaemonState::Running;
                Ok(())
            }
            Err(e) => {
                inner.state = DaemonState::Stopped;
                Err(e)
            }
        }
    }

    /// Stops the daemon. Safe to call when nothing is running.
    ///
    /// The PID file and socket are removed in every case. Only a failure to
    /// signal the process is returned.
    pub async fn stop(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;

        let result = if self.liveness(&mut inner).await {
            inner.state = DaemonState::Stopping;
            self.terminate(&mut inner).await
        } else {
            debug!("containerd not running, nothing to stop");
            Ok(())
        };

        remove_if_exists(&self.paths.state_file);
        remove_if_exists(&self.paths.socket_path);
        inner.state = DaemonState::Stopped;
        result
    }

    /// Returns true if the daemon process or its socket is alive.
    pub async fn is_running(&self) -> bool {
        let mut inner = self.inner.lock().await;
        self.liveness(&mut inner).await
    }

    /// Fails with [`Error::DaemonNotRunning`] unless the daemon is alive.
    pub async fn health_check(&self) -> Result<()> {
        if self.is_running().await {
            Ok(())
        } else {
            Err(Error::DaemonNotRunning)
        }
    }

    // =========================================================================
    // Internals
    // =========================================================================

    async fn liveness(&self, inner: &mut Inner) -> bool {
        if let Some(child) = inner.child.as_mut() {
            match child.try_wait() {
                Ok(None) => return true,
                Ok(Some(status)) => debug!("containerd helper exited: {}", status),
                Err(e) => debug!("Failed to poll containerd helper: {}", e),
            }
            inner.child = None;
        }

        if let Some(pid) = read_pid(&self.paths.state_file) {
            if kill(pid, None).is_ok() {
                return true;
            }
            debug!("Stale PID file {} (pid {})", self.paths.state_file.display(), pid);
        }

        socket_ready(&self.paths.socket_path).await
    }

    async fn terminate(&self, inner: &mut Inner) -> Result<()> {
        if let Some(mut child) = inner.child.take() {
            // kill() also reaps; an already-exited child is fine.
            if let Err(e) = child.kill().await {
                debug!("containerd helper already gone: {}", e);
            }
            info!("Stopped containerd");
            return Ok(());
        }

        let Some(pid) = read_pid(&self.paths.state_file) else {
            debug!("No PID file, leaving externally managed containerd alone");
            return Ok(());
        };

        match kill(pid, Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => {
                info!("Stopped containerd (pid {})", pid);
                Ok(())
            }
            Err(e) => Err(Error::DaemonSignalFailed {
                pid: pid.as_raw(),
                reason: e.to_string(),
            }),
        }
    }

    async fn launch_rootless(&self) -> Result<Child> {
        let containerd = find_binary(self.config.containerd_path.as_deref(), &["containerd"])
            .map_err(|e| {
                Error::DaemonStartFailed(format!("failed to find containerd binary: {e}"))
            })?;
        let rootlesskit = find_binary(self.config.rootlesskit_path.as_deref(), ROOTLESSKIT_ALIASES)
            .map_err(|e| {
                Error::DaemonStartFailed(format!("rootlesskit is required for rootless mode: {e}"))
            })?;
        let driver = NetworkDriver::detect().await?;

        let xdg = XdgDirs::resolve(Uid::current().as_raw())?;
        let layout = DaemonLayout::new(&xdg, &self.paths);
        layout.create_dirs()?;

        tokio::fs::write(&layout.config_path, render_config(&layout)?)
            .await
            .map_err(|e| Error::DaemonStartFailed(format!("failed to write config file: {e}")))?;

        // Deleted when `script` drops, after the helper has read it.
        let script = write_wrapper_script(&render_wrapper_script(&layout, &containerd))?;

        debug!(
            "Spawning {} with {} networking",
            rootlesskit.display(),
            driver.as_str()
        );
        let child = Command::new(&rootlesskit)
            .args(rootlesskit_args(&layout, driver, &script))
            .env("XDG_RUNTIME_DIR", &xdg.runtime_dir)
            .env("XDG_DATA_HOME", &xdg.data_home)
            .env("XDG_CONFIG_HOME", &xdg.config_home)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| {
                Error::DaemonStartFailed(format!("failed to start containerd via rootlesskit: {e}"))
            })?;

        let mut guard = SpawnGuard {
            child: Some(child),
            state_file: self.paths.state_file.clone(),
        };

        let pid = guard.child.as_ref().and_then(Child::id).unwrap_or_default();
        tokio::fs::write(&self.paths.state_file, pid.to_string())
            .await
            .map_err(|e| Error::DaemonStartFailed(format!("failed to save PID: {e}")))?;

        wait_for_socket(&self.paths.socket_path, &mut guard)
            .await
            .map_err(|e| {
                Error::DaemonStartFailed(format!("containerd failed to start via rootlesskit: {e}"))
            })?;

        drop(script);
        guard.disarm().ok_or_else(|| {
            Error::DaemonStartFailed("containerd helper handle lost".to_string())
        })
    }
}

/// Kills the helper and removes the PID file unless disarmed.
///
/// Covers both error returns and a dropped `start` future.
struct SpawnGuard {
    child: Option<Child>,
    state_file: PathBuf,
}

impl SpawnGuard {
    fn disarm(mut self) -> Option<Child> {
        self.child.take()
    }
}

impl Drop for SpawnGuard {
    fn drop(&mut self) {
        if let Some(child) = self.child.as_mut() {
            if let Err(e) = child.start_kill() {
                warn!("Failed to kill containerd helper: {}", e);
            }
            remove_if_exists(&self.state_file);
        }
    }
}

fn write_wrapper_script(contents: &str) -> Result<tempfile::TempPath> {
    use std::io::Write;
    use std::os::unix::fs::PermissionsExt;

    let mut file = tempfile::Builder::new()
        .prefix("tau-containerd-rootless-")
        .suffix(".sh")
        .tempfile()
        .map_err(|e| Error::DaemonStartFailed(format!("failed to create temp script: {e}")))?;
    file.write_all(contents.as_bytes())
        .and_then(|()| {
            file.as_file()
                .set_permissions(std::fs::Permissions::from_mode(0o755))
        })
        .map_err(|e| Error::DaemonStartFailed(format!("failed to write wrapper script: {e}")))?;
    Ok(file.into_temp_path())
}

async fn wait_for_socket(socket: &Path, guard: &mut SpawnGuard) -> Result<()> {
    let poll = async {
        let mut interval = tokio::time::interval(SOCKET_POLL_INTERVAL);
        loop {
            interval.tick().await;
            if socket_ready(socket).await {
                return Ok(());
            }
            if let Some(child) = guard.child.as_mut() {
                if let Ok(Some(status)) = child.try_wait() {
                    return Err(Error::DaemonStartFailed(format!(
                        "rootlesskit exited early: {status}"
                    )));
                }
            }
        }
    };

    match tokio::time::timeout(DAEMON_START_TIMEOUT, poll).await {
        Ok(result) => result,
        Err(_) => Err(Error::Timeout {
            operation: format!("waiting for {}", socket.display()),
            duration: DAEMON_START_TIMEOUT,
        }),
    }
}

/// Returns true if `socket` exists and accepts a connection.
pub(crate) async fn socket_ready(socket: &Path) -> bool {
    if !socket.exists() {
        return false;
    }
    tokio::net::UnixStream::connect(socket).await.is_ok()
}

fn read_pid(state_file: &Path) -> Option<Pid> {
    let contents = std::fs::read_to_string(state_file).ok()?;
    let pid: i32 = contents.trim().parse().ok()?;
    // 0 and negatives address process groups.
    (pid > 0).then(|| Pid::from_raw(pid))
}

fn remove_if_exists(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove {}: {}", path.display(), e),
    }
}
