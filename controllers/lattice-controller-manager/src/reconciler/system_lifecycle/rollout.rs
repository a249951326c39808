//! SystemRollout state machine: Pending, Accepted, InProgress, then
//! Succeeded or Failed.

use super::lock_conflict_message;
use super::owning::OwningAction;
use crate::error::ControllerError;
use crate::reconciler::{Reconciler, name_and_namespace};
use crds::{
    BuildState, SYSTEM_CONTROLLER_FINALIZER, SYSTEM_VERSION_LABEL, System, SystemBuild,
    SystemRollout, SystemRolloutState, SystemRolloutStatus, SystemServiceInfo, SystemSpec,
    SystemState,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube_runtime::controller::Action;
use kube_runtime::reflector::ObjectRef;
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Whether `system` runs the definitions and artifacts of `desired`.
fn runs(system: &SystemSpec, desired: &SystemSpec) -> bool {
    system.services.len() == desired.services.len()
        && desired.services.iter().all(|(path, want)| {
            system.services.get(path).is_some_and(|have| {
                have.definition == want.definition
                    && have.component_build_artifacts == want.component_build_artifacts
            })
        })
}

fn version_label(build: &SystemBuild) -> Option<&String> {
    build.metadata.labels.as_ref()?.get(SYSTEM_VERSION_LABEL)
}

impl Reconciler {
    pub async fn reconcile_system_rollout(
        &self,
        rollout: &SystemRollout,
    ) -> Result<Action, ControllerError> {
        let (name, namespace) = name_and_namespace(rollout)?;
        let tenant = rollout.spec.lattice_namespace.as_str();
        let action = OwningAction::rollout(&namespace, &name);

        match rollout.state() {
            state if state.is_terminal() => {
                debug!("SystemRollout {}/{} is {:?}, nothing to do", namespace, name, state);
                Ok(Action::await_change())
            }
            SystemRolloutState::Pending => {
                if let Err(owner) = self.owning.claim(tenant, &action) {
                    self.update_rollout_status(
                        rollout,
                        SystemRolloutState::Failed,
                        Some(lock_conflict_message(tenant, &owner)),
                    )
                    .await?;
                    return Ok(Action::await_change());
                }
                let rollout = self
                    .update_rollout_status(rollout, SystemRolloutState::Accepted, None)
                    .await?;
                self.accepted_rollout(&rollout, tenant, &action).await
            }
            SystemRolloutState::Accepted => self.accepted_rollout(rollout, tenant, &action).await,
            _ => self.in_progress_rollout(rollout, tenant, &action).await,
        }
    }

    /// Re-claim the tenant; on conflict fail the rollout. Returns whether the
    /// rollout still owns the tenant.
    async fn reclaim_for_rollout(
        &self,
        rollout: &SystemRollout,
        tenant: &str,
        action: &OwningAction,
    ) -> Result<bool, ControllerError> {
        match self.owning.claim(tenant, action) {
            Ok(()) => Ok(true),
            Err(owner) => {
                self.update_rollout_status(
                    rollout,
                    SystemRolloutState::Failed,
                    Some(lock_conflict_message(tenant, &owner)),
                )
                .await?;
                Ok(false)
            }
        }
    }

    fn rollout_build(&self, rollout: &SystemRollout) -> Result<SystemBuild, ControllerError> {
        let (_, namespace) = name_and_namespace(rollout)?;
        self.caches
            .system_builds
            .get(&ObjectRef::new(&rollout.spec.build_name).within(&namespace))
            .map(|build| build.as_ref().clone())
            .ok_or_else(|| {
                ControllerError::MissingObject(format!(
                    "SystemBuild {}/{}",
                    namespace, rollout.spec.build_name
                ))
            })
    }

    async fn accepted_rollout(
        &self,
        rollout: &SystemRollout,
        tenant: &str,
        action: &OwningAction,
    ) -> Result<Action, ControllerError> {
        if !self.reclaim_for_rollout(rollout, tenant, action).await? {
            return Ok(Action::await_change());
        }

        let build = self.rollout_build(rollout)?;
        match build.state() {
            BuildState::Failed => {
                self.update_rollout_status(
                    rollout,
                    SystemRolloutState::Failed,
                    Some(format!("SystemBuild {} failed", rollout.spec.build_name)),
                )
                .await?;
                self.owning.release(tenant, action);
                Ok(Action::await_change())
            }
            BuildState::Succeeded => {
                let desired = self.system_spec_for_build(&build)?;
                self.apply_system(tenant, &build, desired).await?;
                self.update_rollout_status(rollout, SystemRolloutState::InProgress, None)
                    .await?;
                Ok(Action::await_change())
            }
            state => {
                debug!(
                    "SystemRollout {} waiting for SystemBuild {} ({:?})",
                    action, rollout.spec.build_name, state
                );
                Ok(Action::await_change())
            }
        }
    }

    async fn in_progress_rollout(
        &self,
        rollout: &SystemRollout,
        tenant: &str,
        action: &OwningAction,
    ) -> Result<Action, ControllerError> {
        if !self.reclaim_for_rollout(rollout, tenant, action).await? {
            return Ok(Action::await_change());
        }

        let Some(system) = self.tenant_system(tenant).await? else {
            self.update_rollout_status(
                rollout,
                SystemRolloutState::Failed,
                Some(format!("System {tenant} no longer exists")),
            )
            .await?;
            self.owning.release(tenant, action);
            return Ok(Action::await_change());
        };

        let desired = self.system_spec_for_build(&self.rollout_build(rollout)?)?;
        if !runs(&system.spec, &desired) {
            debug!("System {} does not run {} yet", tenant, rollout.spec.build_name);
            return Ok(Action::await_change());
        }

        let (state, message) = match system.state() {
            SystemState::RollingOut => return Ok(Action::await_change()),
            SystemState::RolloutSucceeded => (SystemRolloutState::Succeeded, None),
            SystemState::RolloutFailed => (
                SystemRolloutState::Failed,
                Some(
                    system
                        .status
                        .as_ref()
                        .and_then(|s| s.message.clone())
                        .unwrap_or_else(|| format!("System {tenant} failed to roll out")),
                ),
            ),
        };
        self.update_rollout_status(rollout, state, message).await?;
        self.owning.release(tenant, action);
        Ok(Action::await_change())
    }

    /// The System spec running every service of a succeeded SystemBuild.
    pub(crate) fn system_spec_for_build(
        &self,
        build: &SystemBuild,
    ) -> Result<SystemSpec, ControllerError> {
        let (build_name, namespace) = name_and_namespace(build)?;
        let missing = |what: String| {
            ControllerError::MissingObject(format!("{what} of SystemBuild {namespace}/{build_name}"))
        };

        let mut services = BTreeMap::new();
        for (path, definition) in build.spec.definition.services()? {
            let service_build_name = build
                .spec
                .services
                .get(&path)
                .and_then(|info| info.build_name.as_deref())
                .ok_or_else(|| missing(format!("ServiceBuild for {path}")))?;
            let service_build = self
                .caches
                .service_builds
                .get(&ObjectRef::new(service_build_name).within(&namespace))
                .ok_or_else(|| missing(format!("ServiceBuild {service_build_name}")))?;

            let mut artifacts = BTreeMap::new();
            for component in &definition.components {
                let component_build_name = service_build
                    .spec
                    .components
                    .get(&component.name)
                    .and_then(|info| info.build_name.as_deref())
                    .ok_or_else(|| {
                        missing(format!("ComponentBuild for {path} component {}", component.name))
                    })?;
                let component_artifacts = self
                    .caches
                    .component_builds
                    .get(&ObjectRef::new(component_build_name).within(&namespace))
                    .and_then(|cb| cb.spec.artifacts.clone())
                    .ok_or_else(|| {
                        missing(format!("artifacts of ComponentBuild {component_build_name}"))
                    })?;
                artifacts.insert(component.name.clone(), component_artifacts);
            }

            services.insert(
                path,
                SystemServiceInfo {
                    definition,
                    component_build_artifacts: artifacts,
                    service_name: None,
                    service_state: None,
                },
            );
        }
        Ok(SystemSpec { services })
    }

    /// Create the tenant's System from `desired`, or move the existing one to it.
    async fn apply_system(
        &self,
        tenant: &str,
        build: &SystemBuild,
        mut desired: SystemSpec,
    ) -> Result<(), ControllerError> {
        let Some(system) = self.tenant_system(tenant).await? else {
            let system = System {
                metadata: ObjectMeta {
                    name: Some(tenant.to_string()),
                    namespace: Some(tenant.to_string()),
                    finalizers: Some(vec![SYSTEM_CONTROLLER_FINALIZER.to_string()]),
                    labels: version_label(build).map(|version| {
                        BTreeMap::from([(SYSTEM_VERSION_LABEL.to_string(), version.clone())])
                    }),
                    ..Default::default()
                },
                spec: desired,
                status: None,
            };
            let created = self
                .clients
                .systems
                .create(tenant, &system)
                .await
                .map_err(|e| {
                    if e.is_already_exists() {
                        ControllerError::MissingObject(format!("System {tenant} not cached yet"))
                    } else {
                        e.into()
                    }
                })?;
            self.update_system_status(&created, SystemState::RollingOut, None)
                .await?;
            info!("Created System {} for {}", tenant, build.metadata.name.as_deref().unwrap_or_default());
            return Ok(());
        };

        if system.metadata.deletion_timestamp.is_some() {
            return Err(ControllerError::MissingObject(format!(
                "System {tenant} is being deleted"
            )));
        }

        for (path, info) in &mut desired.services {
            if let Some(current) = system.spec.services.get(path) {
                info.service_name.clone_from(&current.service_name);
                info.service_state = current.service_state;
            }
        }
        let mut labels = system.metadata.labels.clone().unwrap_or_default();
        if let Some(version) = version_label(build) {
            labels.insert(SYSTEM_VERSION_LABEL.to_string(), version.clone());
        }
        if system.spec == desired && system.metadata.labels.clone().unwrap_or_default() == labels {
            return Ok(());
        }

        // status before spec
        let system = self
            .update_system_status(&system, SystemState::RollingOut, None)
            .await?;
        let mut updated = system;
        updated.spec = desired;
        updated.metadata.labels = (!labels.is_empty()).then_some(labels);
        self.clients.systems.replace(tenant, &updated).await?;
        info!("Updated System {} to {}", tenant, build.metadata.name.as_deref().unwrap_or_default());
        Ok(())
    }

    async fn update_rollout_status(
        &self,
        rollout: &SystemRollout,
        state: SystemRolloutState,
        message: Option<String>,
    ) -> Result<SystemRollout, ControllerError> {
        let desired = SystemRolloutStatus { state, message };
        if rollout.status.as_ref() == Some(&desired) {
            return Ok(rollout.clone());
        }

        let (name, namespace) = name_and_namespace(rollout)?;
        info!(
            "SystemRollout {}/{}: {:?} -> {:?}",
            namespace,
            name,
            rollout.state(),
            state
        );
        let mut updated = rollout.clone();
        updated.status = Some(desired);
        Ok(self
            .clients
            .rollouts
            .replace_status(&namespace, &updated)
            .await?)
    }
}
