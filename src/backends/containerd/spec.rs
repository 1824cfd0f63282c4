//! OCI runtime spec generation for containerd containers.
//!
//! The spec is serialized to JSON and stored on the container record as a
//! `prost_types::Any`. `Inspect` reads it back to report the limits the
//! container actually runs with.
//!
//! ## Networking
//!
//! There is no CNI setup here. `host` shares the host's network namespace;
//! every other mode gets a private namespace with loopback only. Port
//! mappings and user-defined networks are rejected. DNS servers, static
//! addresses and the MTU have nothing to apply to and are ignored with a
//! warning.

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::constants::{
    DEFAULT_CPU_PERIOD_US, DEFAULT_HOSTNAME, DEFAULT_PATH_ENV, DEFAULT_WORKDIR,
    OCI_RUNTIME_SPEC_VERSION, OCI_SPEC_TYPE_URL,
};
use crate::error::{Error, Result};
use crate::types::{ContainerConfig, NetworkConfig, NetworkMode, ResourceLimits};

/// Process defaults taken from the image config.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ImageProcessDefaults {
    pub entrypoint: Option<Vec<String>>,
    pub cmd: Option<Vec<String>>,
}

impl ImageProcessDefaults {
    /// `Entrypoint` followed by `Cmd`.
    #[must_use]
    pub fn args(&self) -> Vec<String> {
        self.entrypoint
            .iter()
            .flatten()
            .chain(self.cmd.iter().flatten())
            .cloned()
            .collect()
    }
}

/// Builds the OCI spec for `config`.
///
/// The argv is the configured command, else the shell form, else the
/// image's own entrypoint and command. `PATH` always comes first in the
/// environment; caller entries follow and win on conflict.
pub fn build_spec(config: &ContainerConfig, image: &ImageProcessDefaults) -> Result<OciSpec> {
    let args = if !config.command.is_empty() {
        config.command.clone()
    } else if !config.shell.is_empty() {
        config.shell.clone()
    } else {
        image.args()
    };
    if args.is_empty() {
        return Err(Error::InvalidConfig(format!(
            "no command given and image {} defines none",
            config.image
        )));
    }

    let mut env = vec![DEFAULT_PATH_ENV.to_string()];
    env.extend(config.env.iter().cloned());

    let cwd = if config.work_dir.is_empty() {
        DEFAULT_WORKDIR.to_string()
    } else {
        config.work_dir.clone()
    };

    let share_host_network = match &config.network {
        Some(network) => check_network(network)?,
        None => false,
    };

    let mut mounts = default_mounts();
    for volume in &config.volumes {
        if volume.is_named_volume {
            return Err(Error::NotSupported(format!(
                "named volume '{}' on the containerd backend",
                volume.source
            )));
        }
        let access = if volume.read_only { "ro" } else { "rw" };
        mounts.push(OciMount {
            destination: volume.destination.clone(),
            mount_type: "bind".to_string(),
            source: volume.source.clone(),
            options: vec!["rbind".to_string(), access.to_string()],
        });
    }

    Ok(OciSpec {
        oci_version: OCI_RUNTIME_SPEC_VERSION.to_string(),
        root: OciRoot {
            path: "rootfs".to_string(),
            readonly: false,
        },
        process: OciProcess {
            terminal: false,
            user: OciUser { uid: 0, gid: 0 },
            args,
            env,
            cwd,
        },
        hostname: DEFAULT_HOSTNAME.to_string(),
        mounts,
        linux: Some(OciLinux {
            namespaces: ["pid", "network", "ipc", "uts", "mount"]
                .into_iter()
                .filter(|ns_type| !(share_host_network && *ns_type == "network"))
                .map(|ns_type| OciNamespace {
                    ns_type: ns_type.to_string(),
                    path: None,
                })
                .collect(),
            resources: config.resources.as_ref().map(resources_clause),
        }),
    })
}

/// Rejects what a bare network namespace cannot honour. Returns whether the
/// container shares the host network.
fn check_network(network: &NetworkConfig) -> Result<bool> {
    if !network.port_mappings.is_empty() {
        return Err(Error::NotSupported(
            "port mappings on the containerd backend".to_string(),
        ));
    }
    if let Some(NetworkMode::Custom(name)) = &network.mode {
        return Err(Error::NotSupported(format!(
            "network '{name}' on the containerd backend"
        )));
    }
    if !network.dns.is_empty() || network.ip_config.is_some() || network.mtu > 0 {
        warn!("containerd backend ignores DNS, static IP and MTU settings");
    }
    Ok(matches!(network.mode, Some(NetworkMode::Host)))
}

/// Translates limits into the OCI resources clause. Zero fields are left out.
fn resources_clause(limits: &ResourceLimits) -> OciResources {
    let memory = (limits.memory > 0).then(|| OciMemory {
        limit: Some(limits.memory),
    });
    let pids = (limits.pids > 0).then(|| OciPids {
        limit: limits.pids,
    });
    let cpu = (limits.cpu_quota > 0).then(|| OciCpu {
        shares: None,
        quota: Some(limits.cpu_quota),
        period: Some(
            u64::try_from(limits.cpu_period)
                .ok()
                .filter(|p| *p > 0)
                .unwrap_or(DEFAULT_CPU_PERIOD_US),
        ),
    });

    OciResources { memory, cpu, pids }
}

fn default_mounts() -> Vec<OciMount> {
    fn mount(destination: &str, mount_type: &str, options: &[&str]) -> OciMount {
        OciMount {
            destination: destination.to_string(),
            mount_type: mount_type.to_string(),
            source: mount_type.to_string(),
            options: options.iter().map(|o| (*o).to_string()).collect(),
        }
    }

    vec![
        mount("/proc", "proc", &["nosuid", "noexec", "nodev"]),
        mount(
            "/dev",
            "tmpfs",
            &["nosuid", "strictatime", "mode=755", "size=65536k"],
        ),
        mount(
            "/dev/pts",
            "devpts",
            &["nosuid", "noexec", "newinstance", "ptmxmode=0666", "mode=0620", "gid=5"],
        ),
        mount("/sys", "sysfs", &["nosuid", "noexec", "nodev", "ro"]),
        mount("/dev/mqueue", "mqueue", &["nosuid", "noexec", "nodev"]),
    ]
}

impl OciSpec {
    /// Wraps the spec as the `Any` containerd stores on the container.
    pub fn to_any(&self) -> Result<prost_types::Any> {
        Ok(prost_types::Any {
            type_url: OCI_SPEC_TYPE_URL.to_string(),
            value: serde_json::to_vec(self)?,
        })
    }

    /// Parses a spec stored by [`OciSpec::to_any`].
    pub fn from_any(any: &prost_types::Any) -> Result<Self> {
        Ok(serde_json::from_slice(&any.value)?)
    }

    /// Reads the limits back out of the resources clause.
    #[must_use]
    pub fn resource_limits(&self) -> Option<ResourceLimits> {
        let resources = self.linux.as_ref()?.resources.as_ref()?;
        let mut limits = ResourceLimits::default();

        if let Some(limit) = resources.memory.as_ref().and_then(|m| m.limit) {
            limits.memory = limit;
        }
        if let Some(pids) = &resources.pids {
            limits.pids = pids.limit;
        }
        if let Some(cpu) = &resources.cpu {
            limits.cpu_quota = cpu.quota.unwrap_or_default();
            limits.cpu_period = cpu
                .period
                .and_then(|p| i64::try_from(p).ok())
                .unwrap_or_default();
            limits.cpu_shares = cpu
                .shares
                .and_then(|s| i64::try_from(s).ok())
                .unwrap_or_default();
        }

        Some(limits)
    }
}

// =============================================================================
// OCI Runtime Spec Types
// =============================================================================

/// OCI Runtime Spec (the subset containerd needs from us).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OciSpec {
    pub oci_version: String,
    pub root: OciRoot,
    pub process: OciProcess,
    pub hostname: String,
    pub mounts: Vec<OciMount>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub linux: Option<OciLinux>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OciRoot {
    pub path: String,
    #[serde(default)]
    pub readonly: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OciProcess {
    pub terminal: bool,
    pub user: OciUser,
    pub args: Vec<String>,
    pub env: Vec<String>,
    pub cwd: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OciUser {
    pub uid: u32,
    pub gid: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OciMount {
    pub destination: String,
    #[serde(rename = "type")]
    pub mount_type: String,
    pub source: String,
    #[serde(default)]
    pub options: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OciLinux {
    pub namespaces: Vec<OciNamespace>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resources: Option<OciResources>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OciNamespace {
    #[serde(rename = "type")]
    pub ns_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OciResources {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory: Option<OciMemory>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu: Option<OciCpu>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pids: Option<OciPids>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OciMemory {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OciCpu {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shares: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quota: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub period: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OciPids {
    pub limit: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_args_fallback() {
        let image = ImageProcessDefaults {
            entrypoint: Some(vec!["/docker-entrypoint.sh".to_string()]),
            cmd: Some(vec!["nginx".to_string()]),
        };
        let spec = build_spec(&ContainerConfig::new("nginx"), &image).unwrap();
        assert_eq!(spec.process.args, vec!["/docker-entrypoint.sh", "nginx"]);
    }

    #[test]
    fn test_no_args_anywhere_is_rejected() {
        let err = build_spec(&ContainerConfig::new("scratch"), &ImageProcessDefaults::default())
            .unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }

    #[test]
    fn test_image_config_parses_pascal_case() {
        let image: ImageProcessDefaults =
            serde_json::from_str(r#"{"Cmd":["/bin/sh"],"WorkingDir":"/srv","Entrypoint":null}"#)
                .unwrap();
        assert_eq!(image.args(), vec!["/bin/sh"]);
    }

    #[test]
    fn test_spec_serializes_oci_field_names() {
        let config = ContainerConfig::new("alpine").with_command(["true"]);
        let json = serde_json::to_value(build_spec(&config, &ImageProcessDefaults::default()).unwrap())
            .unwrap();
        assert_eq!(json["ociVersion"], "1.0.2");
        assert_eq!(json["mounts"][0]["type"], "proc");
        assert!(json["linux"].get("resources").is_none());
    }
}
