//! Service specs derived from a System's per-path entries.

use crds::{NodePath, ServiceComponentPort, ServiceDefinition, ServiceSpec, SystemServiceInfo};
use std::collections::{BTreeMap, BTreeSet};

/// First port handed to envoy.
pub const ENVOY_PORT_BASE: i32 = 10000;

/// Envoy ports for one service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvoyPorts {
    /// Component name to its ports, each with the envoy port in front of it
    pub ports: BTreeMap<String, Vec<ServiceComponentPort>>,
    pub admin: i32,
    pub egress: i32,
}

/// Assign envoy ports to every component port of `definition`.
///
/// Ports are taken upwards from [`ENVOY_PORT_BASE`], skipping numbers any
/// component listens on. Component ports get theirs in definition order; the
/// last two go to the admin and egress listeners.
#[must_use]
pub fn assign_envoy_ports(definition: &ServiceDefinition) -> EnvoyPorts {
    let used: BTreeSet<i32> = definition
        .components
        .iter()
        .flat_map(|c| c.ports.iter().map(|p| p.port))
        .collect();
    let mut free = (ENVOY_PORT_BASE..).filter(|port| !used.contains(port));

    let mut ports = BTreeMap::new();
    for component in &definition.components {
        let assigned: Vec<ServiceComponentPort> = component
            .ports
            .iter()
            .zip(free.by_ref())
            .map(|(port, envoy_port)| ServiceComponentPort {
                name: port.name.clone(),
                port: port.port,
                protocol: port.protocol.as_str().to_string(),
                public: port.is_public(),
                envoy_port,
            })
            .collect();
        ports.insert(component.name.clone(), assigned);
    }

    let admin = free.next().unwrap_or(ENVOY_PORT_BASE);
    let egress = free.next().unwrap_or(ENVOY_PORT_BASE);
    EnvoyPorts {
        ports,
        admin,
        egress,
    }
}

/// Spec of the Service running `path`.
#[must_use]
pub fn service_spec(path: &NodePath, info: &SystemServiceInfo) -> ServiceSpec {
    let envoy = assign_envoy_ports(&info.definition);
    ServiceSpec {
        path: path.clone(),
        definition: info.definition.clone(),
        component_build_artifacts: info.component_build_artifacts.clone(),
        ports: envoy.ports,
        envoy_admin_port: envoy.admin,
        envoy_egress_port: envoy.egress,
    }
}
