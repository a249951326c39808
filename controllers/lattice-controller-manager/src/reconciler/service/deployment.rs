//! Deployment construction for a lattice Service.
//!
//! Every component becomes a container (or an init container), and every pod
//! gets an envoy sidecar: an init container redirects egress into envoy, and
//! envoy listens on the ports assigned in the Service spec.

use crate::error::ControllerError;
use crate::owner::controller_owner_ref;
use crds::{
    Component, ComponentBuildArtifacts, ConfigSpec, HealthCheck, SERVICE_DEFINITION_ANNOTATION,
    SERVICE_DEPLOYMENT_LABEL, SYSTEM_VERSION_LABEL, Service, ServiceDefinition, canonical_json,
};
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Capabilities, Container, ContainerPort, EmptyDirVolumeSource, EnvVar, EnvVarSource,
    ExecAction, HTTPGetAction, HTTPHeader, ObjectFieldSelector, PodSpec, PodTemplateSpec, Probe,
    SecurityContext, TCPSocketAction, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use std::collections::BTreeMap;

const ENVOY_CONFIG_DIR: &str = "/etc/envoy";
const ENVOY_CONFIG_VOLUME: &str = "envoyconfig";
const ENVOY_CONTAINER: &str = "envoy";
const ENVOY_PREPARE_CONTAINER: &str = "envoy-prepare";

/// Name of the Deployment running `service_name`.
#[must_use]
pub fn deployment_name(service_name: &str) -> String {
    format!("lattice-service-{service_name}")
}

/// Value of the definition annotation for `definition`.
pub fn definition_annotation(definition: &ServiceDefinition) -> Result<String, ControllerError> {
    Ok(canonical_json(definition)?)
}

/// The definition annotation a Deployment was last written with.
#[must_use]
pub fn deployed_definition(deployment: &Deployment) -> Option<&str> {
    deployment
        .metadata
        .annotations
        .as_ref()?
        .get(SERVICE_DEFINITION_ANNOTATION)
        .map(String::as_str)
}

/// Labels selecting the pods of `service_name`.
#[must_use]
pub fn selector_labels(service_name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([(SERVICE_DEPLOYMENT_LABEL.to_string(), service_name.to_string())])
}

fn env(name: &str, value: impl ToString) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.to_string()),
        ..Default::default()
    }
}

fn liveness_probe(health_check: &HealthCheck) -> Option<Probe> {
    if let Some(exec) = &health_check.exec {
        return Some(Probe {
            exec: Some(ExecAction {
                command: Some(exec.command.clone()),
            }),
            ..Default::default()
        });
    }
    if let Some(http) = &health_check.http {
        let headers: Vec<HTTPHeader> = http
            .headers
            .iter()
            .map(|(name, value)| HTTPHeader {
                name: name.clone(),
                value: value.clone(),
            })
            .collect();
        return Some(Probe {
            http_get: Some(HTTPGetAction {
                path: Some(http.path.clone()),
                port: IntOrString::String(http.port.clone()),
                http_headers: (!headers.is_empty()).then_some(headers),
                ..Default::default()
            }),
            ..Default::default()
        });
    }
    health_check.tcp.as_ref().map(|tcp| Probe {
        tcp_socket: Some(TCPSocketAction {
            port: IntOrString::String(tcp.port.clone()),
            ..Default::default()
        }),
        ..Default::default()
    })
}

fn component_container(
    component: &Component,
    artifacts: &BTreeMap<String, ComponentBuildArtifacts>,
    service_name: &str,
) -> Result<Container, ControllerError> {
    let image = artifacts.get(&component.name).ok_or_else(|| {
        ControllerError::Invariant(format!(
            "Service {} has no build artifacts for component {}",
            service_name, component.name
        ))
    })?;

    let ports: Vec<ContainerPort> = component
        .ports
        .iter()
        .map(|port| ContainerPort {
            name: Some(port.name.clone()),
            container_port: port.port,
            ..Default::default()
        })
        .collect();
    let env: Vec<EnvVar> = component
        .exec
        .environment
        .iter()
        .map(|(name, value)| env(name, value))
        .collect();

    Ok(Container {
        name: component.name.clone(),
        image: Some(image.docker_image_fqn.clone()),
        image_pull_policy: Some("IfNotPresent".to_string()),
        command: (!component.exec.command.is_empty()).then(|| component.exec.command.clone()),
        ports: (!ports.is_empty()).then_some(ports),
        env: (!env.is_empty()).then_some(env),
        liveness_probe: component.health_check.as_ref().and_then(liveness_probe),
        ..Default::default()
    })
}

fn envoy_prepare_container(service: &Service, config: &ConfigSpec) -> Container {
    Container {
        name: ENVOY_PREPARE_CONTAINER.to_string(),
        image: Some(config.envoy.prepare_image.clone()),
        image_pull_policy: Some("IfNotPresent".to_string()),
        command: Some(vec!["/usr/local/bin/prepare-envoy.sh".to_string()]),
        env: Some(vec![
            env("EGRESS_PORT", service.spec.envoy_egress_port),
            env("REDIRECT_EGRESS_CIDR_BLOCK", &config.envoy.redirect_cidr_block),
            env("CONFIG_DIR", ENVOY_CONFIG_DIR),
            env("ADMIN_PORT", service.spec.envoy_admin_port),
            EnvVar {
                name: "XDS_API_HOST".to_string(),
                value_from: Some(EnvVarSource {
                    field_ref: Some(ObjectFieldSelector {
                        field_path: "status.hostIP".to_string(),
                        ..Default::default()
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            },
            env("XDS_API_PORT", config.envoy.xds_api_port),
        ]),
        volume_mounts: Some(vec![VolumeMount {
            name: ENVOY_CONFIG_VOLUME.to_string(),
            mount_path: ENVOY_CONFIG_DIR.to_string(),
            ..Default::default()
        }]),
        // iptables
        security_context: Some(SecurityContext {
            capabilities: Some(Capabilities {
                add: Some(vec!["NET_ADMIN".to_string()]),
                drop: None,
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn envoy_container(service: &Service, namespace: &str, config: &ConfigSpec) -> Container {
    let ports: Vec<ContainerPort> = service
        .spec
        .ports
        .iter()
        .flat_map(|(component, ports)| {
            ports.iter().map(move |port| ContainerPort {
                name: Some(format!("{component}-{}", port.name)),
                container_port: port.envoy_port,
                ..Default::default()
            })
        })
        .collect();

    Container {
        name: ENVOY_CONTAINER.to_string(),
        image: Some(config.envoy.image.clone()),
        image_pull_policy: Some("IfNotPresent".to_string()),
        command: Some(vec!["/usr/local/bin/envoy".to_string()]),
        args: Some(vec![
            "-c".to_string(),
            format!("{ENVOY_CONFIG_DIR}/config.json"),
            "--service-cluster".to_string(),
            namespace.to_string(),
            "--service-node".to_string(),
            service.spec.path.to_domain(),
        ]),
        ports: (!ports.is_empty()).then_some(ports),
        volume_mounts: Some(vec![VolumeMount {
            name: ENVOY_CONFIG_VOLUME.to_string(),
            mount_path: ENVOY_CONFIG_DIR.to_string(),
            read_only: Some(true),
            ..Default::default()
        }]),
        ..Default::default()
    }
}

/// The Deployment `service` should have.
pub fn build_deployment(service: &Service, config: &ConfigSpec) -> Result<Deployment, ControllerError> {
    let service_name = service
        .metadata
        .name
        .as_deref()
        .ok_or_else(|| ControllerError::Invariant("Service without a name".to_string()))?;
    let namespace = service.metadata.namespace.as_deref().unwrap_or_default();
    let name = deployment_name(service_name);

    let mut init_containers = vec![envoy_prepare_container(service, config)];
    let mut containers = Vec::new();
    for component in &service.spec.definition.components {
        let container =
            component_container(component, &service.spec.component_build_artifacts, service_name)?;
        if component.init {
            init_containers.push(container);
        } else {
            containers.push(container);
        }
    }
    containers.push(envoy_container(service, namespace, config));

    let mut labels = selector_labels(service_name);
    if let Some(version) = service
        .metadata
        .labels
        .as_ref()
        .and_then(|l| l.get(SYSTEM_VERSION_LABEL))
    {
        labels.insert(SYSTEM_VERSION_LABEL.to_string(), version.clone());
    }

    Ok(Deployment {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            namespace: Some(namespace.to_string()),
            labels: Some(labels),
            annotations: Some(BTreeMap::from([(
                SERVICE_DEFINITION_ANNOTATION.to_string(),
                definition_annotation(&service.spec.definition)?,
            )])),
            owner_references: Some(vec![controller_owner_ref(service)?]),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(service.spec.definition.resources.replicas()),
            selector: LabelSelector {
                match_labels: Some(selector_labels(service_name)),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    name: Some(name),
                    labels: Some(selector_labels(service_name)),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    init_containers: Some(init_containers),
                    containers,
                    dns_policy: Some("Default".to_string()),
                    volumes: Some(vec![Volume {
                        name: ENVOY_CONFIG_VOLUME.to_string(),
                        empty_dir: Some(EmptyDirVolumeSource::default()),
                        ..Default::default()
                    }]),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        status: None,
    })
}
