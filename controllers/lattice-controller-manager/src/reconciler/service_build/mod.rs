//! ServiceBuild reconciler
//!
//! Fans a service's components out to ComponentBuilds (shared between service
//! builds through [`dedup`]) and folds their states back into one.

mod dedup;
#[cfg(test)]
mod service_build_test;

pub use dedup::RecentBuilds;

use super::{Reconciler, name_and_namespace};
use crate::error::ControllerError;
use crds::{
    BuildState, ComponentBuild, ComponentBuildState, ServiceBuild, ServiceBuildComponentInfo,
    ServiceBuildSpec, ServiceBuildStatus, definition_hash,
};
use kube_runtime::controller::Action;
use kube_runtime::reflector::{ObjectRef, Store};
use std::collections::BTreeSet;
use tracing::{debug, info};

/// Where a ServiceBuild stands, judged from its components.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Progress {
    /// Components whose build failed
    HasFailedChildren(Vec<String>),
    /// Components without a build yet
    NeedsNewChildren(Vec<String>),
    /// Components whose build has not finished
    HasActiveChildren(Vec<String>),
    AllChildrenSucceeded,
}

/// Classify a ServiceBuild whose component info was refreshed from the cache.
/// `uncached` holds the components whose build is not in the cache.
pub(crate) fn classify(spec: &ServiceBuildSpec, uncached: &BTreeSet<String>) -> Progress {
    let failed: Vec<String> = spec
        .components
        .iter()
        .filter(|(component, info)| {
            !uncached.contains(*component) && info.build_state == Some(ComponentBuildState::Failed)
        })
        .map(|(component, _)| component.clone())
        .collect();
    if !failed.is_empty() {
        return Progress::HasFailedChildren(failed);
    }

    let missing: Vec<String> = spec
        .components
        .iter()
        .filter(|(_, info)| info.build_name.is_none())
        .map(|(component, _)| component.clone())
        .collect();
    if !missing.is_empty() {
        return Progress::NeedsNewChildren(missing);
    }

    let active = active_components(spec, uncached);
    if !active.is_empty() {
        return Progress::HasActiveChildren(active);
    }
    Progress::AllChildrenSucceeded
}

fn active_components(spec: &ServiceBuildSpec, uncached: &BTreeSet<String>) -> Vec<String> {
    spec.components
        .iter()
        .filter(|(component, info)| {
            uncached.contains(*component)
                || info.build_state != Some(ComponentBuildState::Succeeded)
        })
        .map(|(component, _)| component.clone())
        .collect()
}

/// Status message naming the failed components, in name order.
pub(crate) fn failed_message(spec: &ServiceBuildSpec, failed: &[String]) -> String {
    let parts: Vec<String> = failed
        .iter()
        .map(|component| {
            let failure = spec
                .components
                .get(component)
                .and_then(|info| info.failure_info.as_ref());
            match failure {
                Some(info) if info.internal => {
                    format!("{component} (failed due to an internal error)")
                }
                Some(info) => format!("{component} ({})", info.message),
                None => component.clone(),
            }
        })
        .collect();
    format!("the following components failed to build: {}", parts.join(", "))
}

fn active_message(active: &[String]) -> String {
    format!(
        "the following components are still building: {}",
        active.join(", ")
    )
}

/// Mirror the referenced ComponentBuilds into `info`.
fn refresh_component(info: &mut ServiceBuildComponentInfo, build: &ComponentBuild) {
    info.build_state = Some(build.state());
    let status = build.status.clone().unwrap_or_default();
    info.last_observed_phase = status.last_observed_phase;
    info.failure_info = status.failure_info;
}

/// ServiceBuilds in the build's namespace that reference it by name.
pub fn service_builds_referencing(
    build: &ComponentBuild,
    service_builds: &Store<ServiceBuild>,
) -> Vec<ObjectRef<ServiceBuild>> {
    let Some(name) = build.metadata.name.as_deref() else {
        return Vec::new();
    };
    let namespace = build.metadata.namespace.as_deref();
    service_builds
        .state()
        .into_iter()
        .filter(|sb| sb.metadata.namespace.as_deref() == namespace)
        .filter(|sb| {
            sb.spec
                .components
                .values()
                .any(|info| info.build_name.as_deref() == Some(name))
        })
        .map(|sb| ObjectRef::from_obj(sb.as_ref()))
        .collect()
}

impl Reconciler {
    pub async fn reconcile_service_build(
        &self,
        build: &ServiceBuild,
    ) -> Result<Action, ControllerError> {
        let (name, namespace) = name_and_namespace(build)?;

        if build.state().is_terminal() {
            debug!("ServiceBuild {}/{} is {:?}, nothing to do", namespace, name, build.state());
            return Ok(Action::await_change());
        }

        let mut spec = build.spec.clone();
        let mut uncached = BTreeSet::new();
        for (component, info) in &mut spec.components {
            let Some(build_name) = info.build_name.as_deref() else {
                continue;
            };
            match self
                .caches
                .component_builds
                .get(&ObjectRef::new(build_name).within(&namespace))
            {
                Some(child) => refresh_component(info, &child),
                None => {
                    uncached.insert(component.clone());
                }
            }
        }
        let mut build = self.replace_service_build_spec(build, spec).await?;

        let (state, message) = match classify(&build.spec, &uncached) {
            Progress::HasFailedChildren(failed) => {
                (BuildState::Failed, failed_message(&build.spec, &failed))
            }
            Progress::NeedsNewChildren(missing) => {
                let mut spec = build.spec.clone();
                for component in &missing {
                    let Some(info) = spec.components.get_mut(component) else {
                        continue;
                    };
                    let hash = definition_hash(&info.definition_block)?;
                    let (child, child_state) = self
                        .find_or_create_component_build(
                            &namespace,
                            &hash,
                            &info.definition_block,
                            info.build_name.as_deref(),
                        )
                        .await?;
                    debug!(
                        "ServiceBuild {}/{} component {} uses ComponentBuild {}",
                        namespace, name, component, child
                    );
                    info.definition_hash = Some(hash);
                    info.build_name = Some(child);
                    info.build_state = Some(child_state);
                }
                build = self.replace_service_build_spec(&build, spec).await?;

                let active = active_components(&build.spec, &uncached);
                if active.is_empty() {
                    // every component reused a finished build
                    (BuildState::Succeeded, String::new())
                } else {
                    (BuildState::Running, active_message(&active))
                }
            }
            Progress::HasActiveChildren(active) => (BuildState::Running, active_message(&active)),
            Progress::AllChildrenSucceeded => (BuildState::Succeeded, String::new()),
        };

        self.update_service_build_status(&build, state, message)
            .await?;
        Ok(Action::await_change())
    }

    /// Replace the spec if it changed, returning the object to base later writes on.
    async fn replace_service_build_spec(
        &self,
        build: &ServiceBuild,
        spec: ServiceBuildSpec,
    ) -> Result<ServiceBuild, ControllerError> {
        if build.spec == spec {
            return Ok(build.clone());
        }
        let (_, namespace) = name_and_namespace(build)?;
        let mut updated = build.clone();
        updated.spec = spec;
        Ok(self
            .clients
            .service_builds
            .replace(&namespace, &updated)
            .await?)
    }

    async fn update_service_build_status(
        &self,
        build: &ServiceBuild,
        state: BuildState,
        message: String,
    ) -> Result<(), ControllerError> {
        let desired = ServiceBuildStatus {
            state,
            message: (!message.is_empty()).then_some(message),
        };
        if build.status.as_ref() == Some(&desired) {
            return Ok(());
        }

        let (name, namespace) = name_and_namespace(build)?;
        if build.state() != state {
            info!("ServiceBuild {}/{}: {:?} -> {:?}", namespace, name, build.state(), state);
        }
        let mut updated = build.clone();
        updated.status = Some(desired);
        self.clients
            .service_builds
            .replace_status(&namespace, &updated)
            .await?;
        Ok(())
    }
}
