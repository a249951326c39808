//! Service reconciler
//!
//! A Service runs as one Deployment (components plus the envoy sidecar)
//! behind one headless Kubernetes Service. The Deployment carries the JSON
//! of the definition it was built from; when the Service's definition or
//! images move on, the Deployment is rebuilt in place. The Service's status
//! mirrors the Deployment's rollout.

pub mod deployment;
pub mod kube_service;

use super::{Reconciler, ignore_already_exists, name_and_namespace};
use crate::error::ControllerError;
use crate::owner::owned_children;
use crds::{Service, ServiceState, ServiceStatus};
use deployment::{build_deployment, definition_annotation, deployed_definition};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::ServiceSpec as KubeServiceSpec;
use kube_runtime::controller::Action;
use std::collections::BTreeMap;
use tracing::{debug, info};

fn has_true_condition(deployment: &Deployment, type_: &str) -> bool {
    deployment
        .status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == type_ && c.status == "True")
        })
}

/// Rollout state of a Deployment, judged from its status.
pub(crate) fn service_state(deployment: &Deployment) -> ServiceState {
    if has_true_condition(deployment, "ReplicaFailure") {
        return ServiceState::RolloutFailed;
    }
    let Some(status) = deployment.status.as_ref() else {
        return ServiceState::RollingOut;
    };
    if let (Some(generation), Some(observed)) =
        (deployment.metadata.generation, status.observed_generation)
        && observed < generation
    {
        return ServiceState::RollingOut;
    }

    let replicas = deployment
        .spec
        .as_ref()
        .and_then(|s| s.replicas)
        .unwrap_or(1);
    let converged = status.updated_replicas.unwrap_or(0) >= replicas
        && status.available_replicas.unwrap_or(0) >= replicas;
    if has_true_condition(deployment, "Progressing") && !converged {
        return ServiceState::RollingOut;
    }
    ServiceState::RolloutSucceeded
}

/// Container name to image, init containers included.
fn images(deployment: &Deployment) -> BTreeMap<&str, Option<&str>> {
    let Some(pod) = deployment
        .spec
        .as_ref()
        .and_then(|s| s.template.spec.as_ref())
    else {
        return BTreeMap::new();
    };
    pod.init_containers
        .iter()
        .flatten()
        .chain(pod.containers.iter())
        .map(|c| (c.name.as_str(), c.image.as_deref()))
        .collect()
}

impl Reconciler {
    pub async fn reconcile_service(&self, service: &Service) -> Result<Action, ControllerError> {
        let (name, namespace) = name_and_namespace(service)?;

        if service.metadata.deletion_timestamp.is_some() {
            debug!("Service {}/{} is being deleted", namespace, name);
            return Ok(Action::await_change());
        }

        let deployments = owned_children(service, &self.caches.deployments);
        if deployments.len() > 1 {
            return Err(ControllerError::Invariant(format!(
                "Service {}/{} owns {} Deployments",
                namespace,
                name,
                deployments.len()
            )));
        }

        let state = match deployments.first() {
            None => {
                let config = self.config.get().await?;
                let desired = build_deployment(service, &config)?;
                if ignore_already_exists(self.clients.deployments.create(&namespace, &desired).await)?
                    .is_some()
                {
                    info!(
                        "Created Deployment {}/{} for Service {}",
                        namespace,
                        desired.metadata.name.as_deref().unwrap_or_default(),
                        name
                    );
                }
                ServiceState::RollingOut
            }
            Some(existing) => {
                if self.replace_drifted_deployment(service, existing).await? {
                    ServiceState::RollingOut
                } else {
                    service_state(existing)
                }
            }
        };

        self.ensure_kube_service(service).await?;
        self.update_service_state(service, state).await?;
        Ok(Action::await_change())
    }

    /// Rebuild `existing` if it no longer matches the Service. Returns whether
    /// it was replaced.
    async fn replace_drifted_deployment(
        &self,
        service: &Service,
        existing: &Deployment,
    ) -> Result<bool, ControllerError> {
        let annotation = definition_annotation(&service.spec.definition)?;
        let definition_drifted = deployed_definition(existing) != Some(annotation.as_str());
        let config = match self.config.get().await {
            Ok(config) => config,
            Err(e) if definition_drifted => return Err(e),
            Err(_) => return Ok(false),
        };

        let desired = build_deployment(service, &config)?;
        if !definition_drifted && images(existing) == images(&desired) {
            return Ok(false);
        }

        let (name, namespace) = name_and_namespace(existing)?;
        let mut updated = existing.clone();
        updated.spec = desired.spec;
        updated
            .metadata
            .annotations
            .get_or_insert_with(BTreeMap::new)
            .extend(desired.metadata.annotations.unwrap_or_default());
        self.clients.deployments.replace(&namespace, &updated).await?;
        info!("Updated Deployment {}/{} to the current definition", namespace, name);
        Ok(true)
    }

    /// Create the headless Service, or move its ports and selector to the
    /// current envoy port assignment.
    async fn ensure_kube_service(&self, service: &Service) -> Result<(), ControllerError> {
        let (name, namespace) = name_and_namespace(service)?;
        let desired = kube_service::build_kube_service(service)?;

        if let Some(existing) = owned_children(service, &self.caches.kube_services).first() {
            let current = existing.spec.clone().unwrap_or_default();
            let wanted = desired.spec.unwrap_or_default();
            if current.ports == wanted.ports && current.selector == wanted.selector {
                return Ok(());
            }
            let mut updated = existing.as_ref().clone();
            updated.spec = Some(KubeServiceSpec {
                ports: wanted.ports,
                selector: wanted.selector,
                ..current
            });
            self.clients
                .kube_services
                .replace(&namespace, &updated)
                .await?;
            info!(
                "Updated ports of Kubernetes Service {}/{} for Service {}",
                namespace,
                updated.metadata.name.as_deref().unwrap_or_default(),
                name
            );
            return Ok(());
        }

        if ignore_already_exists(self.clients.kube_services.create(&namespace, &desired).await)?
            .is_some()
        {
            info!(
                "Created Kubernetes Service {}/{} for Service {}",
                namespace,
                desired.metadata.name.as_deref().unwrap_or_default(),
                name
            );
        }
        Ok(())
    }

    async fn update_service_state(
        &self,
        service: &Service,
        state: ServiceState,
    ) -> Result<(), ControllerError> {
        let desired = ServiceStatus { state };
        if service.status.as_ref() == Some(&desired) {
            return Ok(());
        }

        let (name, namespace) = name_and_namespace(service)?;
        if service.state() != state {
            info!("Service {}/{}: {:?} -> {:?}", namespace, name, service.state(), state);
        }
        let mut updated = service.clone();
        updated.status = Some(desired);
        self.clients
            .services
            .replace_status(&namespace, &updated)
            .await?;
        Ok(())
    }
}
