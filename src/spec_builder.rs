//! Builds a swarm service spec from a standalone container.
//!
//! Pure transform over the bollard models: the caller supplies the container
//! inspect snapshot plus a pre-resolved view of cluster networks, and gets a
//! [`ServiceSpec`] that reproduces the container's observable behaviour as a
//! single-replica service. Submitting the spec and removing the source
//! container are the reconciler's job.

use std::collections::HashMap;

use bollard::models::{
    ContainerInspectResponse, EndpointPortConfig, EndpointPortConfigProtocolEnum,
    EndpointPortConfigPublishModeEnum, EndpointSpec, Mount, MountBindOptions,
    MountBindOptionsPropagationEnum, MountPoint, MountPointTypeEnum, MountTypeEnum,
    NetworkAttachmentConfig, RestartPolicyNameEnum, ServiceSpec, ServiceSpecMode,
    ServiceSpecModeReplicated, TaskSpec, TaskSpecContainerSpec, TaskSpecPlacement,
    TaskSpecRestartPolicy, TaskSpecRestartPolicyConditionEnum,
};
use log::warn;

use crate::errors::{Result, SyncError};
use crate::orchestrator::NetworkInfo;
use crate::types::{derive_service_name, MANAGED_LABEL, SOURCE_LABEL};

/// Network names that never translate to a service attachment.
const LOCAL_NETWORKS: [&str; 3] = ["bridge", "host", "none"];

/// Docker's default local volume root; volumes outside it are node-local.
const VOLUME_ROOT: &str = "/var/lib/docker/volumes/";

pub fn build_service_spec(
    container: &ContainerInspectResponse,
    known_networks: &HashMap<String, NetworkInfo>,
    ingress_network: &str,
    local_node_id: &str,
) -> Result<ServiceSpec> {
    let container_id = container.id.clone().unwrap_or_default();
    let raw_name = container.name.clone().unwrap_or_default();
    let service_name = derive_service_name(&raw_name, &container_id);

    let config = container.config.clone().unwrap_or_default();
    let host_config = container.host_config.clone().unwrap_or_default();

    let mounts = collect_mounts(&service_name, container.mounts.as_deref().unwrap_or(&[]))?;
    let networks = collect_networks(container, known_networks, ingress_network);
    let ports = collect_ports(
        &service_name,
        host_config.port_bindings.as_ref().unwrap_or(&HashMap::new()),
    )?;

    let container_spec = TaskSpecContainerSpec {
        image: config.image,
        env: config.env,
        user: config.user.filter(|u| !u.is_empty()),
        dir: config.working_dir.filter(|d| !d.is_empty()),
        command: config.entrypoint,
        args: config.cmd,
        tty: config.tty,
        mounts: if mounts.is_empty() { None } else { Some(mounts.clone()) },
        ..Default::default()
    };

    let restart_policy = host_config.restart_policy.unwrap_or_default();
    let condition = match restart_policy.name {
        Some(RestartPolicyNameEnum::NO) => TaskSpecRestartPolicyConditionEnum::NONE,
        Some(RestartPolicyNameEnum::ON_FAILURE) => TaskSpecRestartPolicyConditionEnum::ON_FAILURE,
        _ => TaskSpecRestartPolicyConditionEnum::ANY,
    };
    let max_attempts = restart_policy.maximum_retry_count.filter(|n| *n > 0);

    let placement = if requires_local_constraint(&mounts) {
        Some(TaskSpecPlacement {
            constraints: Some(vec![format!("node.id=={local_node_id}")]),
            ..Default::default()
        })
    } else {
        None
    };

    let task_template = TaskSpec {
        container_spec: Some(container_spec),
        restart_policy: Some(TaskSpecRestartPolicy {
            condition: Some(condition),
            max_attempts,
            ..Default::default()
        }),
        placement,
        ..Default::default()
    };

    let mut labels = HashMap::new();
    labels.insert(MANAGED_LABEL.to_string(), "true".to_string());
    labels.insert(
        SOURCE_LABEL.to_string(),
        raw_name.trim_start_matches('/').to_string(),
    );

    Ok(ServiceSpec {
        name: Some(service_name),
        labels: Some(labels),
        task_template: Some(task_template),
        mode: Some(ServiceSpecMode {
            replicated: Some(ServiceSpecModeReplicated { replicas: Some(1) }),
            ..Default::default()
        }),
        networks: if networks.is_empty() { None } else { Some(networks) },
        endpoint_spec: if ports.is_empty() {
            None
        } else {
            Some(EndpointSpec {
                ports: Some(ports),
                ..Default::default()
            })
        },
        ..Default::default()
    })
}

/// Carries bind and volume mounts over 1:1. Any other mount type cannot be
/// expressed in a service spec and fails the whole conversion; the caller
/// leaves the container untouched.
fn collect_mounts(service_name: &str, mounts: &[MountPoint]) -> Result<Vec<Mount>> {
    let mut out = Vec::new();
    for mount in mounts {
        let (Some(source), Some(target)) = (mount.source.as_ref(), mount.destination.as_ref())
        else {
            continue;
        };
        let typ = match mount.typ {
            Some(MountPointTypeEnum::BIND) => MountTypeEnum::BIND,
            Some(MountPointTypeEnum::VOLUME) => MountTypeEnum::VOLUME,
            other => {
                return Err(SyncError::mapping(
                    service_name,
                    format!("unsupported mount type {other:?} at {target}"),
                ))
            }
        };
        let bind_options = (typ == MountTypeEnum::BIND).then(|| MountBindOptions {
            propagation: Some(parse_propagation(mount.propagation.as_deref())),
            ..Default::default()
        });
        out.push(Mount {
            target: Some(target.clone()),
            source: Some(source.clone()),
            typ: Some(typ),
            read_only: Some(!mount.rw.unwrap_or(true)),
            bind_options,
            ..Default::default()
        });
    }
    Ok(out)
}

fn parse_propagation(value: Option<&str>) -> MountBindOptionsPropagationEnum {
    match value.unwrap_or("rprivate") {
        "private" => MountBindOptionsPropagationEnum::PRIVATE,
        "shared" => MountBindOptionsPropagationEnum::SHARED,
        "rshared" => MountBindOptionsPropagationEnum::RSHARED,
        "slave" => MountBindOptionsPropagationEnum::SLAVE,
        "rslave" => MountBindOptionsPropagationEnum::RSLAVE,
        _ => MountBindOptionsPropagationEnum::RPRIVATE,
    }
}

/// Translates published ports into endpoint port configs, preserving
/// protocol and the published/target pair. A binding pinned to a specific
/// host address keeps host publish mode; anything else goes through the
/// routing mesh.
fn collect_ports(
    service_name: &str,
    bindings: &HashMap<String, Option<Vec<bollard::models::PortBinding>>>,
) -> Result<Vec<EndpointPortConfig>> {
    let mut ports = Vec::new();
    for (key, entries) in bindings {
        let Some(entries) = entries else { continue };
        let (port_part, proto_part) = key.split_once('/').unwrap_or((key.as_str(), "tcp"));
        let target_port: i64 = port_part.parse().map_err(|_| {
            SyncError::mapping(service_name, format!("unparsable port binding '{key}'"))
        })?;
        let protocol = match proto_part {
            "udp" => EndpointPortConfigProtocolEnum::UDP,
            "sctp" => EndpointPortConfigProtocolEnum::SCTP,
            _ => EndpointPortConfigProtocolEnum::TCP,
        };
        for binding in entries {
            let Some(published) = binding.host_port.as_ref().filter(|p| !p.is_empty()) else {
                continue;
            };
            let published: i64 = published.parse().map_err(|_| {
                SyncError::mapping(service_name, format!("unparsable host port for '{key}'"))
            })?;
            let host_bound = binding
                .host_ip
                .as_deref()
                .is_some_and(|ip| !ip.is_empty() && ip != "0.0.0.0");
            ports.push(EndpointPortConfig {
                protocol: Some(protocol),
                target_port: Some(target_port),
                published_port: Some(published),
                publish_mode: Some(if host_bound {
                    EndpointPortConfigPublishModeEnum::HOST
                } else {
                    EndpointPortConfigPublishModeEnum::INGRESS
                }),
                ..Default::default()
            });
        }
    }
    Ok(ports)
}

/// Only overlay networks carry over; bridge/host/none are host-local. The
/// ingress network is always a candidate so Traefik can reach the service.
fn collect_networks(
    container: &ContainerInspectResponse,
    known_networks: &HashMap<String, NetworkInfo>,
    ingress_network: &str,
) -> Vec<NetworkAttachmentConfig> {
    let mut names: Vec<String> = container
        .network_settings
        .as_ref()
        .and_then(|s| s.networks.as_ref())
        .map(|nets| {
            nets.keys()
                .filter(|name| !LOCAL_NETWORKS.contains(&name.as_str()))
                .cloned()
                .collect()
        })
        .unwrap_or_default();
    if !ingress_network.is_empty() && !names.iter().any(|n| n == ingress_network) {
        names.push(ingress_network.to_string());
    }
    names.sort();

    let mut attachments = Vec::new();
    for name in names {
        let Some(info) = known_networks.get(&name) else {
            warn!("Overlay network '{name}' not found; create it manually if required.");
            continue;
        };
        if info.driver.as_deref() != Some("overlay") {
            warn!(
                "Network '{}' is not an overlay network (driver={:?}); skipping.",
                name, info.driver
            );
            continue;
        }
        attachments.push(NetworkAttachmentConfig {
            target: Some(info.id.clone()),
            ..Default::default()
        });
    }
    attachments
}

/// Bind mounts and node-local named volumes cannot follow a task to another
/// node, so the service stays pinned where the data lives.
fn requires_local_constraint(mounts: &[Mount]) -> bool {
    mounts.iter().any(|mount| match mount.typ {
        Some(MountTypeEnum::BIND) => true,
        Some(MountTypeEnum::VOLUME) => mount
            .source
            .as_deref()
            .is_some_and(|s| !s.starts_with(VOLUME_ROOT)),
        _ => false,
    })
}
