//! Build Job construction.
//!
//! A ComponentBuild runs as a single-attempt Job: an init container checks out
//! the source into a host work directory, then the main container builds (and
//! optionally pushes) the image through the node's docker socket.

use crate::error::ControllerError;
use crate::owner::controller_owner_ref;
use crds::{
    COMPONENT_BUILD_JOB_LABEL, ComponentBuild, ConfigSpec, DockerImage,
    JOB_DOCKER_IMAGE_FQN_ANNOTATION, ProviderKind,
};
use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    Container, EnvVar, HostPathVolumeSource, PodSpec, PodTemplateSpec, Toleration, Volume,
    VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::collections::BTreeMap;

const WORK_DIR: &str = "/var/run/builder";
const WORK_DIR_VOLUME: &str = "workdir";
const DOCKER_SOCKET_PATH: &str = "/var/run/docker.sock";
const DOCKER_SOCKET_VOLUME: &str = "dockersock";
const LOCAL_WORK_DIR_PREFIX: &str = "/data/component-builder";
const AWS_WORK_DIR_PREFIX: &str = "/var/lib/component-builder";

/// Service account the build pods run as.
pub const COMPONENT_BUILDER_SERVICE_ACCOUNT: &str = "lattice-component-builder";

/// Taint carried by build nodes.
pub const BUILD_NODE_TAINT: &str = "node-role.lattice.mlab.com/build";

/// Name of the Job running `build_name`.
#[must_use]
pub fn job_name(build_name: &str) -> String {
    format!("lattice-build-{build_name}")
}

/// Image a build will produce.
///
/// By default every build pushes to the configured repository, tagged with the
/// build name. With `repositoryPerImage` each build gets its own repository,
/// tagged with `timestamp`.
#[must_use]
pub fn target_image(build_name: &str, config: &ConfigSpec, timestamp: i64) -> DockerImage {
    let docker = &config.component_build.docker_config;
    let (repository, tag) = if docker.repository_per_image {
        (build_name.to_string(), timestamp.to_string())
    } else {
        (docker.repository.clone(), build_name.to_string())
    };
    DockerImage {
        registry: docker.registry.clone(),
        repository,
        tag,
    }
}

fn env(name: &str, value: impl Into<String>) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.into()),
        ..Default::default()
    }
}

fn work_dir_mount() -> VolumeMount {
    VolumeMount {
        name: WORK_DIR_VOLUME.to_string(),
        mount_path: WORK_DIR.to_string(),
        ..Default::default()
    }
}

fn host_path_volume(name: &str, path: String) -> Volume {
    Volume {
        name: name.to_string(),
        host_path: Some(HostPathVolumeSource {
            path,
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Job running the build, with the image it will produce in its annotations.
pub fn build_job(
    build: &ComponentBuild,
    config: &ConfigSpec,
    timestamp: i64,
) -> Result<Job, ControllerError> {
    let build_name = build
        .metadata
        .name
        .as_deref()
        .ok_or_else(|| ControllerError::Invariant("ComponentBuild without a name".to_string()))?;
    let definition = &build.spec.definition_block;

    let git = definition.git_repository.as_ref().ok_or_else(|| {
        ControllerError::Invariant(format!(
            "ComponentBuild {build_name} has no git repository"
        ))
    })?;
    let base_image = definition.base_image().ok_or_else(|| {
        ControllerError::Invariant(format!(
            "ComponentBuild {build_name} has neither a language nor a docker image"
        ))
    })?;

    let name = job_name(build_name);
    let image = target_image(build_name, config, timestamp);
    let builder = &config.component_build;
    let provider = config.provider_config.kind();

    let mut init_containers = vec![Container {
        name: "pull-git-repo".to_string(),
        image: Some(builder.pull_git_repo_image.clone()),
        command: Some(vec!["./pull-git-repo.sh".to_string()]),
        env: Some(vec![
            env("WORK_DIR", WORK_DIR),
            env("GIT_URL", git.url.clone()),
            env("GIT_CHECKOUT_TARGET", git.checkout_target().unwrap_or_default()),
        ]),
        volume_mounts: Some(vec![work_dir_mount()]),
        ..Default::default()
    }];

    if provider == ProviderKind::Aws
        && let Some(ecr_image) = &builder.get_ecr_creds_image
    {
        let region = config
            .provider_config
            .aws
            .as_ref()
            .map(|aws| aws.region.clone())
            .unwrap_or_default();
        init_containers.push(Container {
            name: "get-ecr-creds".to_string(),
            image: Some(ecr_image.clone()),
            command: Some(vec!["./get-ecr-creds.sh".to_string()]),
            env: Some(vec![env("WORK_DIR", WORK_DIR), env("AWS_REGION", region)]),
            volume_mounts: Some(vec![work_dir_mount()]),
            ..Default::default()
        });
    }

    let build_container = Container {
        name: "build-docker-image".to_string(),
        image: Some(builder.build_docker_image.clone()),
        command: Some(vec!["./build-docker-image.sh".to_string()]),
        env: Some(vec![
            env("WORK_DIR", WORK_DIR),
            env("DOCKER_REGISTRY", image.registry.clone()),
            env("DOCKER_REPOSITORY", image.repository.clone()),
            env("DOCKER_IMAGE_TAG", image.tag.clone()),
            env("DOCKER_PUSH", if builder.docker_config.push { "1" } else { "0" }),
            env("BUILD_CMD", definition.command.clone().unwrap_or_default()),
            env("DOCKER_BASE_IMAGE", base_image),
        ]),
        volume_mounts: Some(vec![
            work_dir_mount(),
            VolumeMount {
                name: DOCKER_SOCKET_VOLUME.to_string(),
                mount_path: DOCKER_SOCKET_PATH.to_string(),
                ..Default::default()
            },
        ]),
        ..Default::default()
    };

    let work_dir_prefix = match provider {
        ProviderKind::Local => LOCAL_WORK_DIR_PREFIX,
        ProviderKind::Aws => AWS_WORK_DIR_PREFIX,
    };
    let labels = BTreeMap::from([(COMPONENT_BUILD_JOB_LABEL.to_string(), "true".to_string())]);

    Ok(Job {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            namespace: build.metadata.namespace.clone(),
            labels: Some(labels.clone()),
            annotations: Some(BTreeMap::from([(
                JOB_DOCKER_IMAGE_FQN_ANNOTATION.to_string(),
                image.fqn(),
            )])),
            owner_references: Some(vec![controller_owner_ref(build)?]),
            ..Default::default()
        },
        spec: Some(JobSpec {
            // a build is attempted exactly once
            backoff_limit: Some(0),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    name: Some(name.clone()),
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    init_containers: Some(init_containers),
                    containers: vec![build_container],
                    restart_policy: Some("Never".to_string()),
                    dns_policy: Some("Default".to_string()),
                    service_account_name: Some(COMPONENT_BUILDER_SERVICE_ACCOUNT.to_string()),
                    tolerations: Some(vec![Toleration {
                        key: Some(BUILD_NODE_TAINT.to_string()),
                        operator: Some("Exists".to_string()),
                        effect: Some("NoSchedule".to_string()),
                        ..Default::default()
                    }]),
                    volumes: Some(vec![
                        host_path_volume(WORK_DIR_VOLUME, format!("{work_dir_prefix}/{name}")),
                        host_path_volume(DOCKER_SOCKET_VOLUME, DOCKER_SOCKET_PATH.to_string()),
                    ]),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        status: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::*;
    use crds::{AwsProviderConfig, GitRepository};

    fn env_of(container: &Container) -> BTreeMap<String, String> {
        container
            .env
            .iter()
            .flatten()
            .map(|e| (e.name.clone(), e.value.clone().unwrap_or_default()))
            .collect()
    }

    fn pod(job: &Job) -> &PodSpec {
        job.spec.as_ref().unwrap().template.spec.as_ref().unwrap()
    }

    #[test]
    fn test_local_job() {
        let build = with_uid(test_component_build("cb-1", "lattice-internal"), "uid-cb");
        let job = build_job(&build, &test_config_spec(), 1_700_000_000).unwrap();

        assert_eq!(job.metadata.name.as_deref(), Some("lattice-build-cb-1"));
        assert_eq!(
            job.metadata.labels.as_ref().unwrap()[COMPONENT_BUILD_JOB_LABEL],
            "true"
        );
        assert_eq!(
            job.metadata.annotations.as_ref().unwrap()[JOB_DOCKER_IMAGE_FQN_ANNOTATION],
            "registry.test/lattice:cb-1"
        );
        let owner = &job.metadata.owner_references.as_ref().unwrap()[0];
        assert_eq!(owner.kind, "ComponentBuild");
        assert_eq!(owner.uid, "uid-cb");
        assert_eq!(owner.controller, Some(true));
        assert_eq!(job.spec.as_ref().unwrap().backoff_limit, Some(0));

        let pod = pod(&job);
        assert_eq!(pod.restart_policy.as_deref(), Some("Never"));
        assert_eq!(pod.dns_policy.as_deref(), Some("Default"));
        assert_eq!(
            pod.service_account_name.as_deref(),
            Some(COMPONENT_BUILDER_SERVICE_ACCOUNT)
        );
        let volumes = pod.volumes.as_ref().unwrap();
        assert_eq!(
            volumes[0].host_path.as_ref().unwrap().path,
            "/data/component-builder/lattice-build-cb-1"
        );
        assert_eq!(volumes[1].host_path.as_ref().unwrap().path, "/var/run/docker.sock");

        let init = pod.init_containers.as_ref().unwrap();
        assert_eq!(init.len(), 1);
        let pull = env_of(&init[0]);
        assert_eq!(pull["GIT_URL"], "https://github.com/example/app.git");
        assert_eq!(pull["GIT_CHECKOUT_TARGET"], "c1");

        let main = env_of(&pod.containers[0]);
        assert_eq!(main["DOCKER_REGISTRY"], "registry.test");
        assert_eq!(main["DOCKER_REPOSITORY"], "lattice");
        assert_eq!(main["DOCKER_IMAGE_TAG"], "cb-1");
        assert_eq!(main["DOCKER_PUSH"], "0");
        assert_eq!(main["BUILD_CMD"], "make");
        assert_eq!(main["DOCKER_BASE_IMAGE"], "node:6");
    }

    #[test]
    fn test_repository_per_image_and_aws() {
        let build = with_uid(test_component_build("cb-1", "lattice-internal"), "uid-cb");
        let mut config = test_config_spec();
        config.component_build.docker_config.repository_per_image = true;
        config.component_build.docker_config.push = true;
        config.component_build.get_ecr_creds_image = Some("ecr-creds:1".to_string());
        config.provider_config.local = None;
        config.provider_config.aws = Some(AwsProviderConfig {
            region: "us-east-1".to_string(),
            ..Default::default()
        });

        let job = build_job(&build, &config, 1_700_000_000).unwrap();
        assert_eq!(
            job.metadata.annotations.as_ref().unwrap()[JOB_DOCKER_IMAGE_FQN_ANNOTATION],
            "registry.test/cb-1:1700000000"
        );
        let pod = pod(&job);
        let init = pod.init_containers.as_ref().unwrap();
        assert_eq!(init[1].name, "get-ecr-creds");
        assert_eq!(env_of(&init[1])["AWS_REGION"], "us-east-1");
        assert_eq!(env_of(&pod.containers[0])["DOCKER_PUSH"], "1");
        assert!(
            pod.volumes.as_ref().unwrap()[0]
                .host_path
                .as_ref()
                .unwrap()
                .path
                .starts_with("/var/lib/component-builder/")
        );
    }

    #[test]
    fn test_tag_wins_only_without_commit() {
        let mut build = with_uid(test_component_build("cb-1", "lattice-internal"), "uid-cb");
        build.spec.definition_block.git_repository = Some(GitRepository {
            url: "https://github.com/example/app.git".to_string(),
            commit: None,
            tag: Some("v1.0".to_string()),
        });
        let job = build_job(&build, &test_config_spec(), 0).unwrap();
        let init = &pod(&job).init_containers.as_ref().unwrap()[0];
        assert_eq!(env_of(init)["GIT_CHECKOUT_TARGET"], "v1.0");
    }

    #[test]
    fn test_invalid_definitions() {
        let mut no_git = with_uid(test_component_build("cb-1", "lattice-internal"), "uid-cb");
        no_git.spec.definition_block.git_repository = None;
        assert!(matches!(
            build_job(&no_git, &test_config_spec(), 0),
            Err(ControllerError::Invariant(_))
        ));

        let mut no_base = with_uid(test_component_build("cb-1", "lattice-internal"), "uid-cb");
        no_base.spec.definition_block.language = None;
        no_base.spec.definition_block.docker_image = None;
        assert!(matches!(
            build_job(&no_base, &test_config_spec(), 0),
            Err(ControllerError::Invariant(_))
        ));
    }
}
