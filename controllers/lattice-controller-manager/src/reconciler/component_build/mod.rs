//! ComponentBuild reconciler
//!
//! Runs each build as one Job and mirrors the Job's outcome back into the
//! build's status. On success the image the Job produced is recorded in
//! `spec.artifacts` before the status flips to Succeeded, so anyone who sees
//! Succeeded can rely on the artifacts being present.

pub mod job;

use super::{Reconciler, ignore_already_exists, name_and_namespace};
use crate::error::ControllerError;
use crate::owner::owned_children;
use crds::{
    ComponentBuild, ComponentBuildArtifacts, ComponentBuildState, ComponentBuildStatus,
    JOB_DOCKER_IMAGE_FQN_ANNOTATION,
};
use k8s_openapi::api::batch::v1::Job;
use kube_runtime::controller::Action;
use tracing::{debug, info};

/// What a build Job has done so far.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum JobOutcome {
    Queued,
    Running,
    Succeeded,
    Failed,
}

fn has_true_condition(job: &Job, type_: &str) -> bool {
    job.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == type_ && c.status == "True")
        })
}

/// Classify a Job by its conditions, then by its pod counters.
pub(crate) fn job_outcome(job: &Job) -> JobOutcome {
    if has_true_condition(job, "Complete") {
        return JobOutcome::Succeeded;
    }
    if has_true_condition(job, "Failed") {
        return JobOutcome::Failed;
    }
    let started = job.status.as_ref().is_some_and(|s| {
        s.active.unwrap_or(0) > 0 || s.failed.unwrap_or(0) > 0 || s.succeeded.unwrap_or(0) > 0
    });
    if started {
        JobOutcome::Running
    } else {
        JobOutcome::Queued
    }
}

impl Reconciler {
    pub async fn reconcile_component_build(
        &self,
        build: &ComponentBuild,
    ) -> Result<Action, ControllerError> {
        let (name, namespace) = name_and_namespace(build)?;

        if build.state().is_terminal() {
            debug!(
                "ComponentBuild {}/{} is {:?}, nothing to do",
                namespace,
                name,
                build.state()
            );
            return Ok(Action::await_change());
        }

        let jobs = owned_children(build, &self.caches.jobs);
        if jobs.len() > 1 {
            return Err(ControllerError::Invariant(format!(
                "ComponentBuild {}/{} owns {} Jobs",
                namespace,
                name,
                jobs.len()
            )));
        }

        let Some(job) = jobs.first() else {
            let config = self.config.get().await?;
            let job = job::build_job(build, &config, chrono::Utc::now().timestamp())?;
            let job_name = job.metadata.name.clone().unwrap_or_default();
            if ignore_already_exists(self.clients.jobs.create(&namespace, &job).await)?.is_some() {
                info!("Created Job {}/{} for ComponentBuild {}", namespace, job_name, name);
            }
            self.update_component_build_state(build, ComponentBuildState::Queued)
                .await?;
            return Ok(Action::await_change());
        };

        let state = match job_outcome(job) {
            JobOutcome::Succeeded => {
                let fqn = job
                    .metadata
                    .annotations
                    .as_ref()
                    .and_then(|a| a.get(JOB_DOCKER_IMAGE_FQN_ANNOTATION))
                    .ok_or_else(|| {
                        ControllerError::Invariant(format!(
                            "Job for ComponentBuild {}/{} has no {} annotation",
                            namespace, name, JOB_DOCKER_IMAGE_FQN_ANNOTATION
                        ))
                    })?;
                let build = self.record_artifacts(build, fqn).await?;
                self.update_component_build_state(&build, ComponentBuildState::Succeeded)
                    .await?;
                info!("ComponentBuild {}/{} succeeded: {}", namespace, name, fqn);
                return Ok(Action::await_change());
            }
            JobOutcome::Failed => ComponentBuildState::Failed,
            JobOutcome::Running => ComponentBuildState::Running,
            JobOutcome::Queued => ComponentBuildState::Queued,
        };

        self.update_component_build_state(build, state).await?;
        Ok(Action::await_change())
    }

    /// Write `spec.artifacts`, returning the object to base later writes on.
    async fn record_artifacts(
        &self,
        build: &ComponentBuild,
        fqn: &str,
    ) -> Result<ComponentBuild, ControllerError> {
        let artifacts = ComponentBuildArtifacts {
            docker_image_fqn: fqn.to_string(),
        };
        if build.spec.artifacts.as_ref() == Some(&artifacts) {
            return Ok(build.clone());
        }

        let (_, namespace) = name_and_namespace(build)?;
        let mut updated = build.clone();
        updated.spec.artifacts = Some(artifacts);
        Ok(self.clients.component_builds.replace(&namespace, &updated).await?)
    }

    /// Set `status.state`, keeping what the builder reported.
    async fn update_component_build_state(
        &self,
        build: &ComponentBuild,
        state: ComponentBuildState,
    ) -> Result<(), ControllerError> {
        let current = build.status.clone().unwrap_or_default();
        let desired = ComponentBuildStatus {
            state,
            ..current.clone()
        };
        if build.status.is_some() && current == desired {
            return Ok(());
        }

        let (name, namespace) = name_and_namespace(build)?;
        if current.state != state {
            info!(
                "ComponentBuild {}/{}: {:?} -> {:?}",
                namespace, name, current.state, state
            );
        }
        let mut updated = build.clone();
        updated.status = Some(desired);
        self.clients
            .component_builds
            .replace_status(&namespace, &updated)
            .await?;
        Ok(())
    }
}
