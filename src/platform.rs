//! Platform detection and capability enumeration.
//!
//! Detects OS, architecture, and the kernel features rootless containerd
//! depends on. The OCI platform string selects which manifest is unpacked
//! when the containerd adapter pulls a multi-platform image.

use std::collections::HashSet;
use std::path::Path;

/// Detected platform information.
#[derive(Debug, Clone)]
pub struct Platform {
    /// Operating system.
    pub os: Os,
    /// CPU architecture.
    pub arch: Arch,
    /// Kernel version (if detectable).
    pub kernel_version: Option<String>,
    /// Available capabilities.
    pub capabilities: HashSet<Capability>,
}

/// Operating system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Os {
    Linux,
    Darwin,
    Windows,
    Unknown,
}

/// CPU architecture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Arch {
    Amd64,
    Arm64,
    Arm,
    Unknown,
}

/// Kernel features relevant to container backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    /// Linux namespaces (pid, net, mnt, etc.)
    Namespaces,
    /// Unprivileged user namespaces (required by rootlesskit)
    UserNamespaces,
    /// Linux control groups (v1 or v2)
    Cgroups,
    /// `/dev/fuse` present (fuse-overlayfs snapshotter)
    Fuse,
}

impl Platform {
    /// Detects the current platform and its capabilities.
    pub fn detect() -> Self {
        let os = Self::detect_os();
        let arch = Self::detect_arch();
        let kernel_version = Self::detect_kernel_version();
        let capabilities = Self::detect_capabilities(os);

        Self {
            os,
            arch,
            kernel_version,
            capabilities,
        }
    }

    fn detect_os() -> Os {
        #[cfg(target_os = "linux")]
        return Os::Linux;

        #[cfg(target_os = "macos")]
        return Os::Darwin;

        #[cfg(target_os = "windows")]
        return Os::Windows;

        #[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
        return Os::Unknown;
    }

    fn detect_arch() -> Arch {
        #[cfg(target_arch = "x86_64")]
        return Arch::Amd64;

        #[cfg(target_arch = "aarch64")]
        return Arch::Arm64;

        #[cfg(target_arch = "arm")]
        return Arch::Arm;

        #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64", target_arch = "arm")))]
        return Arch::Unknown;
    }

    fn detect_kernel_version() -> Option<String> {
        #[cfg(unix)]
        {
            nix::sys::utsname::uname()
                .ok()
                .map(|u| u.release().to_string_lossy().into_owned())
        }

        #[cfg(not(unix))]
        None
    }

    fn detect_capabilities(os: Os) -> HashSet<Capability> {
        let mut caps = HashSet::new();

        if os != Os::Linux {
            return caps;
        }

        if Path::new("/proc/self/ns/pid").exists() {
            caps.insert(Capability::Namespaces);
        }

        if Path::new("/proc/self/ns/user").exists() {
            // Debian-style kernels gate this behind a sysctl
            let disabled = std::fs::read_to_string("/proc/sys/kernel/unprivileged_userns_clone")
                .map(|v| v.trim() == "0")
                .unwrap_or(false);
            if !disabled {
                caps.insert(Capability::UserNamespaces);
            }
        }

        if Path::new("/sys/fs/cgroup").exists() {
            caps.insert(Capability::Cgroups);
        }

        if Path::new("/dev/fuse").exists() {
            caps.insert(Capability::Fuse);
        }

        caps
    }

    /// Returns true if a rootless daemon can be launched here.
    pub fn supports_rootless(&self) -> bool {
        self.capabilities.contains(&Capability::Namespaces)
            && self.capabilities.contains(&Capability::UserNamespaces)
    }

    /// OCI `os` field.
    pub fn os_str(&self) -> &'static str {
        match self.os {
            Os::Linux => "linux",
            Os::Darwin => "darwin",
            Os::Windows => "windows",
            Os::Unknown => "unknown",
        }
    }

    /// OCI `architecture` field.
    pub fn arch_str(&self) -> &'static str {
        match self.arch {
            Arch::Amd64 => "amd64",
            Arch::Arm64 => "arm64",
            Arch::Arm => "arm",
            Arch::Unknown => "unknown",
        }
    }

    /// Returns the OCI platform string (e.g., "linux/amd64").
    pub fn oci_platform(&self) -> String {
        format!("{}/{}", self.os_str(), self.arch_str())
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:?}/{:?} (capabilities: {:?})",
            self.os, self.arch, self.capabilities
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_platform_detection() {
        let platform = Platform::detect();
        assert!(platform.os != Os::Unknown || platform.arch != Arch::Unknown);
    }

    #[test]
    fn test_oci_platform_string() {
        let platform = Platform::detect();
        let oci = platform.oci_platform();
        assert!(oci.contains('/'));
        assert!(oci.starts_with(platform.os_str()));
    }
}
