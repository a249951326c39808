//! System reconciler
//!
//! Keeps one Service per path of the System's spec, deletes Services that
//! no path references, and folds the Services' rollout states into the
//! System's status. Deletion is driven by the System's finalizer: every
//! Service in the namespace is deleted before the finalizer is dropped.

pub mod service_spec;

use super::{Reconciler, ignore_not_found, name_and_namespace};
use crate::error::ControllerError;
use crate::owner::{controller_owner_ref, is_controlled_by};
use crds::{
    NodePath, SYSTEM_CONTROLLER_FINALIZER, SYSTEM_VERSION_LABEL, Service, ServiceState,
    ServiceStatus, System, SystemServiceInfo, SystemSpec, SystemState, SystemStatus,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube_runtime::controller::Action;
use kube_runtime::reflector::ObjectRef;
use service_spec::service_spec;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info};

/// Fold per-path Service states into the System's state and message.
pub(crate) fn aggregate(spec: &SystemSpec) -> (SystemState, Option<String>) {
    let failed: Vec<&str> = spec
        .services
        .iter()
        .filter(|(_, info)| info.service_state == Some(ServiceState::RolloutFailed))
        .map(|(path, _)| path.as_str())
        .collect();
    if !failed.is_empty() {
        return (
            SystemState::RolloutFailed,
            Some(format!(
                "the following services failed to roll out: {}",
                failed.join(", ")
            )),
        );
    }

    let rolled_out = spec
        .services
        .values()
        .all(|info| info.service_state == Some(ServiceState::RolloutSucceeded));
    if rolled_out {
        (SystemState::RolloutSucceeded, None)
    } else {
        (SystemState::RollingOut, None)
    }
}

/// Whether `service` runs what `info` asks for.
fn is_current(service: &Service, info: &SystemServiceInfo) -> bool {
    service.spec.definition == info.definition
        && service.spec.component_build_artifacts == info.component_build_artifacts
}

impl Reconciler {
    pub async fn reconcile_system(&self, system: &System) -> Result<Action, ControllerError> {
        let (name, namespace) = name_and_namespace(system)?;

        if system.metadata.deletion_timestamp.is_some() {
            return self.drain_system(system).await;
        }

        let mut spec = system.spec.clone();
        let mut referenced = BTreeSet::new();
        let mut owned = None;
        for (path, info) in &mut spec.services {
            if info.service_name.is_none() {
                if owned.is_none() {
                    owned = Some(self.owned_services_by_path(system).await?);
                }
                if let Some(adopted) = owned.as_ref().and_then(|by_path| by_path.get(path)) {
                    info!(
                        "Adopting Service {}/{} for {} of System {}",
                        namespace, adopted, path, name
                    );
                    info.service_name = Some(adopted.clone());
                }
            }
            let Some(service_name) = info.service_name.clone() else {
                let created = self.create_service(system, path, info).await?;
                referenced.insert(created);
                continue;
            };

            let service = self
                .service_for_path(&namespace, &service_name)
                .await?
                .ok_or_else(|| {
                    ControllerError::Invariant(format!(
                        "System {}/{} references Service {} for {}, which does not exist",
                        namespace, name, service_name, path
                    ))
                })?;
            referenced.insert(service_name);

            if is_current(&service, info) {
                info.service_state = Some(service.state());
            } else {
                self.update_service(&service, path, info).await?;
                info.service_state = Some(ServiceState::RollingOut);
            }
        }

        let system = self.replace_system_spec(system, spec).await?;
        self.delete_unreferenced_services(&system, &referenced)
            .await?;

        let (state, message) = aggregate(&system.spec);
        self.update_system_status(&system, state, message).await?;
        Ok(Action::await_change())
    }

    /// Delete the namespace's Services, then drop the finalizer once none are left.
    async fn drain_system(&self, system: &System) -> Result<Action, ControllerError> {
        let (name, namespace) = name_and_namespace(system)?;
        let services = self.services_in(&namespace);

        if services.is_empty() {
            let mut updated = system.clone();
            let before = updated.metadata.finalizers.as_ref().map_or(0, Vec::len);
            if let Some(finalizers) = updated.metadata.finalizers.as_mut() {
                finalizers.retain(|f| f != SYSTEM_CONTROLLER_FINALIZER);
            }
            if updated.metadata.finalizers.as_ref().map_or(0, Vec::len) != before {
                self.clients.systems.replace(&namespace, &updated).await?;
                info!("System {}/{} drained, removed finalizer", namespace, name);
            }
            return Ok(Action::await_change());
        }

        for service in services
            .iter()
            .filter(|s| s.metadata.deletion_timestamp.is_none())
        {
            let (service_name, _) = name_and_namespace(service.as_ref())?;
            ignore_not_found(self.clients.services.delete(&namespace, &service_name).await)?;
            info!("Deleted Service {}/{} of deleting System {}", namespace, service_name, name);
        }
        Ok(Action::await_change())
    }

    fn services_in(&self, namespace: &str) -> Vec<Arc<Service>> {
        let mut services: Vec<Arc<Service>> = self
            .caches
            .services
            .state()
            .into_iter()
            .filter(|s| s.metadata.namespace.as_deref() == Some(namespace))
            .collect();
        services.sort_by(|a, b| a.metadata.name.cmp(&b.metadata.name));
        services
    }

    /// The Service named in a path entry; the API is asked when the cache
    /// has not caught up with a recent create.
    async fn service_for_path(
        &self,
        namespace: &str,
        service_name: &str,
    ) -> Result<Option<Service>, ControllerError> {
        if let Some(service) = self
            .caches
            .services
            .get(&ObjectRef::new(service_name).within(namespace))
        {
            return Ok(Some(service.as_ref().clone()));
        }
        Ok(self.clients.services.get(namespace, service_name).await?)
    }

    /// Live Services controlled by `system`, keyed by the path they serve.
    ///
    /// Read from the API: a System replayed from a stale cache has lost the
    /// names of Services created on an earlier pass.
    async fn owned_services_by_path(
        &self,
        system: &System,
    ) -> Result<BTreeMap<NodePath, String>, ControllerError> {
        let (_, namespace) = name_and_namespace(system)?;
        let Some(uid) = system.metadata.uid.as_deref() else {
            return Ok(BTreeMap::new());
        };
        let mut services = self.clients.services.list(&namespace).await?;
        services.sort_by(|a, b| a.metadata.name.cmp(&b.metadata.name));

        let mut by_path = BTreeMap::new();
        for service in services {
            if service.metadata.deletion_timestamp.is_some()
                || !is_controlled_by(&service.metadata, uid)
            {
                continue;
            }
            if let Some(service_name) = service.metadata.name {
                by_path.entry(service.spec.path).or_insert(service_name);
            }
        }
        Ok(by_path)
    }

    /// Create the Service for `path` and record it in `info`. Returns its name.
    async fn create_service(
        &self,
        system: &System,
        path: &NodePath,
        info: &mut SystemServiceInfo,
    ) -> Result<String, ControllerError> {
        let (system_name, namespace) = name_and_namespace(system)?;
        let name = uuid::Uuid::new_v4().to_string();
        let labels: BTreeMap<String, String> = system
            .metadata
            .labels
            .iter()
            .flatten()
            .filter(|(key, _)| key.as_str() == SYSTEM_VERSION_LABEL)
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();

        let service = Service {
            metadata: ObjectMeta {
                name: Some(name.clone()),
                namespace: Some(namespace.clone()),
                labels: (!labels.is_empty()).then_some(labels),
                owner_references: Some(vec![controller_owner_ref(system)?]),
                ..Default::default()
            },
            spec: service_spec(path, info),
            status: None,
        };
        self.clients.services.create(&namespace, &service).await?;
        info!(
            "Created Service {}/{} for {} of System {}",
            namespace, name, path, system_name
        );

        info.service_name = Some(name.clone());
        info.service_state = Some(ServiceState::RollingOut);
        Ok(name)
    }

    /// Move `service` to what `info` asks for and mark it RollingOut.
    async fn update_service(
        &self,
        service: &Service,
        path: &NodePath,
        info: &SystemServiceInfo,
    ) -> Result<(), ControllerError> {
        let (name, namespace) = name_and_namespace(service)?;
        let mut updated = service.clone();
        updated.spec = service_spec(path, info);
        let mut updated = self.clients.services.replace(&namespace, &updated).await?;

        if updated.status.as_ref().map(|s| s.state) != Some(ServiceState::RollingOut) {
            updated.status = Some(ServiceStatus {
                state: ServiceState::RollingOut,
            });
            self.clients
                .services
                .replace_status(&namespace, &updated)
                .await?;
        }
        info!("Updated Service {}/{} for {}", namespace, name, path);
        Ok(())
    }

    /// Delete Services no path of the written spec refers to.
    ///
    /// A Service this System controls whose path is still in the spec is kept
    /// even when unnamed there.
    async fn delete_unreferenced_services(
        &self,
        system: &System,
        referenced: &BTreeSet<String>,
    ) -> Result<(), ControllerError> {
        let (_, namespace) = name_and_namespace(system)?;
        let uid = system.metadata.uid.as_deref();
        for service in self.services_in(&namespace) {
            let (name, _) = name_and_namespace(service.as_ref())?;
            if referenced.contains(&name) || service.metadata.deletion_timestamp.is_some() {
                continue;
            }
            let still_served = uid.is_some_and(|uid| is_controlled_by(&service.metadata, uid))
                && system.spec.services.contains_key(&service.spec.path);
            if still_served {
                debug!(
                    "Keeping Service {}/{}: {} is still in the System",
                    namespace, name, service.spec.path
                );
                continue;
            }
            ignore_not_found(self.clients.services.delete(&namespace, &name).await)?;
            info!(
                "Deleted Service {}/{} for {}: no longer in the System",
                namespace, name, service.spec.path
            );
        }
        Ok(())
    }

    /// Replace the spec if it changed, returning the object to base later writes on.
    async fn replace_system_spec(
        &self,
        system: &System,
        spec: SystemSpec,
    ) -> Result<System, ControllerError> {
        if system.spec == spec {
            return Ok(system.clone());
        }
        let (_, namespace) = name_and_namespace(system)?;
        let mut updated = system.clone();
        updated.spec = spec;
        Ok(self.clients.systems.replace(&namespace, &updated).await?)
    }

    pub(crate) async fn update_system_status(
        &self,
        system: &System,
        state: SystemState,
        message: Option<String>,
    ) -> Result<System, ControllerError> {
        let desired = SystemStatus { state, message };
        if system.status.as_ref() == Some(&desired) {
            return Ok(system.clone());
        }

        let (name, namespace) = name_and_namespace(system)?;
        if system.state() != state {
            info!("System {}/{}: {:?} -> {:?}", namespace, name, system.state(), state);
        } else {
            debug!("System {}/{}: status message changed", namespace, name);
        }
        let mut updated = system.clone();
        updated.status = Some(desired);
        Ok(self
            .clients
            .systems
            .replace_status(&namespace, &updated)
            .await?)
    }
}
