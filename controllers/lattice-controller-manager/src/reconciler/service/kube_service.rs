//! Headless Kubernetes Service giving a lattice Service a stable DNS name.

use super::deployment::selector_labels;
use crate::error::ControllerError;
use crate::owner::controller_owner_ref;
use crds::Service;
use k8s_openapi::api::core::v1::{Service as KubeService, ServicePort, ServiceSpec as KubeServiceSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

#[must_use]
pub fn kube_service_name(service_name: &str) -> String {
    format!("svc-{service_name}-lattice")
}

/// Headless Service selecting the pods of `service`. Each component port is
/// exposed under its own number and forwarded to the envoy port in front of it.
pub fn build_kube_service(service: &Service) -> Result<KubeService, ControllerError> {
    let service_name = service
        .metadata
        .name
        .as_deref()
        .ok_or_else(|| ControllerError::Invariant("Service without a name".to_string()))?;

    let ports: Vec<ServicePort> = service
        .spec
        .ports
        .iter()
        .flat_map(|(component, ports)| {
            ports.iter().map(move |port| ServicePort {
                name: Some(format!("{component}-{}", port.name)),
                port: port.port,
                target_port: Some(IntOrString::Int(port.envoy_port)),
                protocol: Some("TCP".to_string()),
                ..Default::default()
            })
        })
        .collect();

    Ok(KubeService {
        metadata: ObjectMeta {
            name: Some(kube_service_name(service_name)),
            namespace: service.metadata.namespace.clone(),
            owner_references: Some(vec![controller_owner_ref(service)?]),
            ..Default::default()
        },
        spec: Some(KubeServiceSpec {
            cluster_ip: Some("None".to_string()),
            selector: Some(selector_labels(service_name)),
            ports: (!ports.is_empty()).then_some(ports),
            ..Default::default()
        }),
        status: None,
    })
}
