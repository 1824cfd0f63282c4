//! [`ContainerConfig`] to Docker engine API request translation.
//!
//! | Field            | Docker                                  |
//! |------------------|-----------------------------------------|
//! | `env`            | `Env`, default `PATH` only when empty   |
//! | `work_dir`       | `WorkingDir`, `/` when empty            |
//! | `resources`      | `HostConfig` limits, zero fields unset  |
//! | `volumes`        | `HostConfig.Mounts` (bind or volume)    |
//! | `network.mode`   | `HostConfig.NetworkMode`                |
//! | `network.ports`  | `ExposedPorts` + `HostConfig.PortBindings` |
//! | `network.dns`    | `HostConfig.Dns`                        |
//! | `network.ip_config` | `NetworkingConfig` IPAM addresses     |
//!
//! Static addresses only work on a user-defined network; the gateway and
//! netmask come from that network's subnet. `network.mtu` is a property of
//! the engine network, not the container, and is not sent.
//!
//! Port mappings are checked by [`ContainerConfig::validate`], so a bad
//! protocol fails `create` before any request reaches the engine.

use std::collections::HashMap;

use bollard::models::{
    ContainerCreateBody, EndpointIpamConfig, EndpointSettings, HostConfig, Mount, MountTypeEnum,
    NetworkingConfig, PortBinding,
};

use crate::constants::{DEFAULT_PATH_ENV, DEFAULT_WORKDIR};
use crate::error::{Error, Result};
use crate::types::{ContainerConfig, NetworkConfig, NetworkMode, ResourceLimits, VolumeMount};

/// Builds the create-container body for `config`.
pub fn translate(config: &ContainerConfig) -> Result<ContainerCreateBody> {
    let env = if config.env.is_empty() {
        vec![DEFAULT_PATH_ENV.to_string()]
    } else {
        config.env.clone()
    };

    let working_dir = if config.work_dir.is_empty() {
        DEFAULT_WORKDIR.to_string()
    } else {
        config.work_dir.clone()
    };

    let cmd = if !config.command.is_empty() {
        Some(config.command.clone())
    } else if !config.shell.is_empty() {
        Some(config.shell.clone())
    } else {
        None
    };

    let mut host_config = HostConfig::default();
    if let Some(limits) = &config.resources {
        apply_resources(&mut host_config, limits);
    }
    if !config.volumes.is_empty() {
        host_config.mounts = Some(config.volumes.iter().map(mount).collect());
    }

    let mut exposed_ports = None;
    let mut networking_config = None;
    if let Some(network) = &config.network {
        exposed_ports = apply_network(&mut host_config, network)?;
        networking_config = static_addressing(network)?;
    }

    Ok(ContainerCreateBody {
        image: Some(config.image.clone()),
        cmd,
        env: Some(env),
        working_dir: Some(working_dir),
        exposed_ports,
        host_config: Some(host_config),
        networking_config,
        ..Default::default()
    })
}

/// Copies limits into the host config. Zero fields stay unset; a swap of
/// `-1` passes through as "unlimited".
fn apply_resources(host: &mut HostConfig, limits: &ResourceLimits) {
    let positive = |v: i64| (v > 0).then_some(v);

    host.memory = positive(limits.memory);
    host.memory_swap = if limits.memory_swap == -1 {
        Some(-1)
    } else {
        positive(limits.memory_swap)
    };
    host.cpu_quota = positive(limits.cpu_quota);
    host.cpu_period = positive(limits.cpu_period);
    host.cpu_shares = positive(limits.cpu_shares);
    host.pids_limit = positive(limits.pids);

    if limits.storage > 0 {
        host.storage_opt = Some(HashMap::from([(
            "size".to_string(),
            limits.storage.to_string(),
        )]));
    }
}

fn mount(volume: &VolumeMount) -> Mount {
    let typ = if volume.is_named_volume {
        MountTypeEnum::VOLUME
    } else {
        MountTypeEnum::BIND
    };
    Mount {
        source: Some(volume.source.clone()),
        target: Some(volume.destination.clone()),
        typ: Some(typ),
        read_only: Some(volume.read_only),
        ..Default::default()
    }
}

/// Applies mode, DNS and port bindings. Returns the exposed port keys.
fn apply_network(host: &mut HostConfig, network: &NetworkConfig) -> Result<Option<Vec<String>>> {
    if let Some(mode) = &network.mode {
        host.network_mode = Some(mode.as_engine_str().to_string());
    }
    if !network.dns.is_empty() {
        host.dns = Some(network.dns.clone());
    }
    if network.port_mappings.is_empty() {
        return Ok(None);
    }

    let mut bindings: HashMap<String, Option<Vec<PortBinding>>> = HashMap::new();
    let mut exposed = Vec::new();
    for mapping in &network.port_mappings {
        let key = mapping.key()?;
        if !exposed.contains(&key) {
            exposed.push(key.clone());
        }
        bindings
            .entry(key)
            .or_insert_with(|| Some(Vec::new()))
            .get_or_insert_with(Vec::new)
            .push(PortBinding {
                host_ip: mapping.host_ip.clone().filter(|ip| !ip.is_empty()),
                host_port: Some(mapping.host_port.to_string()),
            });
    }
    host.port_bindings = Some(bindings);

    Ok(Some(exposed))
}

/// Endpoint settings carrying static addresses, if any were requested.
fn static_addressing(network: &NetworkConfig) -> Result<Option<NetworkingConfig>> {
    let Some(ip) = &network.ip_config else {
        return Ok(None);
    };
    let ipv4_address = ip
        .ipv4
        .as_ref()
        .map(|v4| v4.address.clone())
        .filter(|a| !a.is_empty());
    let ipv6_address = ip
        .ipv6
        .as_ref()
        .map(|v6| v6.address.clone())
        .filter(|a| !a.is_empty());
    if ipv4_address.is_none() && ipv6_address.is_none() {
        return Ok(None);
    }

    let Some(NetworkMode::Custom(name)) = &network.mode else {
        return Err(Error::InvalidConfig(
            "static IP addresses require a user-defined network".to_string(),
        ));
    };

    let endpoint = EndpointSettings {
        ipam_config: Some(EndpointIpamConfig {
            ipv4_address,
            ipv6_address,
            ..Default::default()
        }),
        ..Default::default()
    };
    Ok(Some(NetworkingConfig {
        endpoints_config: Some(HashMap::from([(name.clone(), endpoint)])),
    }))
}
