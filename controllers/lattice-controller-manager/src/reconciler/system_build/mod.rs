//! SystemBuild reconciler
//!
//! One ServiceBuild per service path of the definition. Unlike component
//! builds these are never shared: each SystemBuild owns its ServiceBuilds.


use super::service_build::Progress;
use super::{Reconciler, name_and_namespace};
use crate::error::ControllerError;
use crate::owner::{controller_owner_ref, is_controlled_by};
use crds::{
    BuildState, NodePath, SERVICE_BUILD_PATH_ANNOTATION, ServiceBuild, ServiceBuildComponentInfo, ServiceBuildSpec,
    ServiceDefinition, SystemBuild, SystemBuildComponentInfo, SystemBuildServiceInfo,
    SystemBuildSpec, SystemBuildStatus,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube_runtime::controller::Action;
use kube_runtime::reflector::ObjectRef;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info};

fn paths_where(
    spec: &SystemBuildSpec,
    pred: impl Fn(&NodePath, &SystemBuildServiceInfo) -> bool,
) -> Vec<String> {
    spec.services
        .iter()
        .filter(|(path, info)| pred(path, info))
        .map(|(path, _)| path.to_string())
        .collect()
}

fn active_paths(spec: &SystemBuildSpec, uncached: &BTreeSet<NodePath>) -> Vec<String> {
    paths_where(spec, |path, info| {
        uncached.contains(path) || info.build_state != Some(BuildState::Succeeded)
    })
}

/// Classify a SystemBuild whose service info was refreshed from the cache.
/// `uncached` holds the paths whose ServiceBuild is not in the cache.
pub(crate) fn classify(spec: &SystemBuildSpec, uncached: &BTreeSet<NodePath>) -> Progress {
    let failed = paths_where(spec, |path, info| {
        !uncached.contains(path) && info.build_state == Some(BuildState::Failed)
    });
    if !failed.is_empty() {
        return Progress::HasFailedChildren(failed);
    }

    let missing = paths_where(spec, |_, info| info.build_name.is_none());
    if !missing.is_empty() {
        return Progress::NeedsNewChildren(missing);
    }

    let active = active_paths(spec, uncached);
    if !active.is_empty() {
        return Progress::HasActiveChildren(active);
    }
    Progress::AllChildrenSucceeded
}

/// The ServiceBuild for the service at `path` of `build`.
fn new_service_build(
    build: &SystemBuild,
    namespace: &str,
    path: &NodePath,
    definition: &ServiceDefinition,
) -> Result<ServiceBuild, ControllerError> {
    let components = definition
        .components
        .iter()
        .map(|component| {
            (
                component.name.clone(),
                ServiceBuildComponentInfo {
                    definition_block: component.build.clone(),
                    ..Default::default()
                },
            )
        })
        .collect();

    Ok(ServiceBuild {
        metadata: ObjectMeta {
            name: Some(uuid::Uuid::new_v4().to_string()),
            namespace: Some(namespace.to_string()),
            annotations: Some(BTreeMap::from([(
                SERVICE_BUILD_PATH_ANNOTATION.to_string(),
                path.to_string(),
            )])),
            owner_references: Some(vec![controller_owner_ref(build)?]),
            ..Default::default()
        },
        spec: ServiceBuildSpec { components },
        status: None,
    })
}

/// Mirror a ServiceBuild into the path's entry.
fn refresh_service(info: &mut SystemBuildServiceInfo, child: &ServiceBuild) {
    info.build_state = Some(child.state());
    info.components = child
        .spec
        .components
        .iter()
        .map(|(component, child_info)| {
            (
                component.clone(),
                SystemBuildComponentInfo {
                    build_name: child_info.build_name.clone(),
                    build_state: child_info.build_state,
                    last_observed_phase: child_info.last_observed_phase,
                    failure_info: child_info.failure_info.clone(),
                },
            )
        })
        .collect();
}

impl Reconciler {
    pub async fn reconcile_system_build(
        &self,
        build: &SystemBuild,
    ) -> Result<Action, ControllerError> {
        let (name, namespace) = name_and_namespace(build)?;

        if build.state().is_terminal() {
            debug!("SystemBuild {}/{} is {:?}, nothing to do", namespace, name, build.state());
            return Ok(Action::await_change());
        }

        let mut spec = build.spec.clone();
        for (path, definition) in build.spec.definition.services()? {
            spec.services
                .entry(path)
                .or_insert_with(|| SystemBuildServiceInfo {
                    definition,
                    ..Default::default()
                });
        }

        let mut uncached = BTreeSet::new();
        for (path, info) in &mut spec.services {
            let Some(child_name) = info.build_name.as_deref() else {
                continue;
            };
            match self
                .caches
                .service_builds
                .get(&ObjectRef::new(child_name).within(&namespace))
            {
                Some(child) => refresh_service(info, &child),
                None => {
                    uncached.insert(path.clone());
                }
            }
        }
        let mut build = self.replace_system_build_spec(build, spec).await?;

        let (state, message) = match classify(&build.spec, &uncached) {
            Progress::HasFailedChildren(failed) => (
                BuildState::Failed,
                format!("the following services failed to build: {}", failed.join(", ")),
            ),
            Progress::NeedsNewChildren(_) => {
                let owned = self.owned_service_builds_by_path(&build).await?;
                let mut spec = build.spec.clone();
                for (path, info) in &mut spec.services {
                    if info.build_name.is_some() {
                        continue;
                    }
                    if let Some(existing) = owned.get(path.as_str()) {
                        let child_name = existing.metadata.name.clone().unwrap_or_default();
                        info!(
                            "Adopting ServiceBuild {}/{} for {} of SystemBuild {}",
                            namespace, child_name, path, name
                        );
                        refresh_service(info, existing);
                        info.build_name = Some(child_name);
                        continue;
                    }
                    let child = new_service_build(&build, &namespace, path, &info.definition)?;
                    let created = self
                        .clients
                        .service_builds
                        .create(&namespace, &child)
                        .await?;
                    let child_name = created.metadata.name.unwrap_or_default();
                    info!(
                        "Created ServiceBuild {}/{} for {} of SystemBuild {}",
                        namespace, child_name, path, name
                    );
                    info.build_name = Some(child_name);
                    info.build_state = Some(BuildState::Pending);
                }
                build = self.replace_system_build_spec(&build, spec).await?;

                let active = active_paths(&build.spec, &uncached);
                (
                    BuildState::Running,
                    format!("the following services are still building: {}", active.join(", ")),
                )
            }
            Progress::HasActiveChildren(active) => (
                BuildState::Running,
                format!("the following services are still building: {}", active.join(", ")),
            ),
            Progress::AllChildrenSucceeded => (BuildState::Succeeded, String::new()),
        };

        self.update_system_build_status(&build, state, message)
            .await?;
        Ok(Action::await_change())
    }

    /// Live ServiceBuilds controlled by `build`, keyed by their path annotation.
    ///
    /// Read from the API: a SystemBuild replayed from a stale cache has lost
    /// the names of ServiceBuilds created on an earlier pass.
    async fn owned_service_builds_by_path(
        &self,
        build: &SystemBuild,
    ) -> Result<BTreeMap<String, ServiceBuild>, ControllerError> {
        let (_, namespace) = name_and_namespace(build)?;
        let Some(uid) = build.metadata.uid.as_deref() else {
            return Ok(BTreeMap::new());
        };
        let mut children = self.clients.service_builds.list(&namespace).await?;
        children.sort_by(|a, b| a.metadata.name.cmp(&b.metadata.name));

        let mut by_path = BTreeMap::new();
        for child in children {
            if child.metadata.deletion_timestamp.is_some()
                || !is_controlled_by(&child.metadata, uid)
            {
                continue;
            }
            let path = child
                .metadata
                .annotations
                .as_ref()
                .and_then(|annotations| annotations.get(SERVICE_BUILD_PATH_ANNOTATION))
                .cloned();
            if let Some(path) = path {
                by_path.entry(path).or_insert(child);
            }
        }
        Ok(by_path)
    }

    async fn replace_system_build_spec(
        &self,
        build: &SystemBuild,
        spec: SystemBuildSpec,
    ) -> Result<SystemBuild, ControllerError> {
        if build.spec == spec {
            return Ok(build.clone());
        }
        let (_, namespace) = name_and_namespace(build)?;
        let mut updated = build.clone();
        updated.spec = spec;
        Ok(self
            .clients
            .system_builds
            .replace(&namespace, &updated)
            .await?)
    }

    async fn update_system_build_status(
        &self,
        build: &SystemBuild,
        state: BuildState,
        message: String,
    ) -> Result<(), ControllerError> {
        let desired = SystemBuildStatus {
            state,
            message: (!message.is_empty()).then_some(message),
        };
        if build.status.as_ref() == Some(&desired) {
            return Ok(());
        }

        let (name, namespace) = name_and_namespace(build)?;
        if build.state() != state {
            info!("SystemBuild {}/{}: {:?} -> {:?}", namespace, name, build.state(), state);
        }
        let mut updated = build.clone();
        updated.status = Some(desired);
        self.clients
            .system_builds
            .replace_status(&namespace, &updated)
            .await?;
        Ok(())
    }
}
