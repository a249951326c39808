//! Test utilities for unit testing reconcilers
//!
//! Fixtures for every kind, plus [`FakeCluster`]: one in-memory
//! [`MockResourceClient`] per kind with a reflector [`Store`] in front of it,
//! so reconcilers read from caches and write through clients just like they
//! do against a real cluster. Stores only change on [`FakeCluster::sync`].

use crate::caches::Caches;
use crate::error::ControllerError;
use crate::reconciler::{Clients, Reconciler};
use crate::shared_config::SharedConfig;
use crds::*;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentCondition, DeploymentStatus};
use k8s_openapi::api::batch::v1::{Job, JobCondition, JobStatus};
use k8s_openapi::api::core::v1::Service as KubeService;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::Resource;
use kube_runtime::reflector::{self, Store, store::Writer};
use kube_runtime::watcher;
use lattice_client::MockResourceClient;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::sync::Arc;

pub const INTERNAL_NAMESPACE: &str = "lattice-internal";

/// Rounds [`FakeCluster::settle`] runs before giving up on quiescence.
const MAX_SETTLE_ROUNDS: usize = 32;

pub fn test_config_spec() -> ConfigSpec {
    ConfigSpec {
        system_id: "lattice-test".to_string(),
        provider_config: ProviderConfig {
            local: Some(LocalProviderConfig {
                ip: "172.16.29.2".to_string(),
            }),
            aws: None,
        },
        component_build: ComponentBuildConfig {
            docker_config: BuildDockerConfig {
                registry: "registry.test".to_string(),
                repository_per_image: false,
                repository: "lattice".to_string(),
                push: false,
            },
            pull_git_repo_image: "lattice/pull-git-repo:test".to_string(),
            build_docker_image: "lattice/build-docker-image:test".to_string(),
            get_ecr_creds_image: None,
        },
        envoy: EnvoyConfig {
            prepare_image: "lattice/envoy-prepare:test".to_string(),
            image: "envoyproxy/envoy-alpine:test".to_string(),
            redirect_cidr_block: "10.0.0.0/8".to_string(),
            xds_api_port: 8080,
        },
        user_system: BTreeMap::new(),
        terraform: None,
    }
}

pub fn meta(name: &str, namespace: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(namespace.to_string()),
        ..Default::default()
    }
}

/// Set the uid of a fixture, as the API server would on create.
pub fn with_uid<K: Resource>(mut object: K, uid: &str) -> K {
    object.meta_mut().uid = Some(uid.to_string());
    object
}

pub fn test_build_definition(commit: &str) -> ComponentBuildDefinition {
    ComponentBuildDefinition {
        git_repository: Some(GitRepository {
            url: "https://github.com/example/app.git".to_string(),
            commit: Some(commit.to_string()),
            tag: None,
        }),
        language: Some("node:6".to_string()),
        docker_image: None,
        command: Some("make".to_string()),
    }
}

pub fn test_component_build(name: &str, namespace: &str) -> ComponentBuild {
    let definition = test_build_definition("c1");
    let mut build = ComponentBuild::new(
        name,
        ComponentBuildSpec {
            definition_block: definition.clone(),
            artifacts: None,
        },
    );
    build.metadata.namespace = Some(namespace.to_string());
    build.metadata.annotations = Some(BTreeMap::from([(
        COMPONENT_BUILD_DEFINITION_HASH_ANNOTATION.to_string(),
        definition_hash(&definition).unwrap(),
    )]));
    build
}

/// A component listening on `http:8080`, built from `commit`.
pub fn test_component(name: &str, commit: &str) -> Component {
    Component {
        name: name.to_string(),
        init: false,
        ports: vec![ComponentPortDefinition {
            name: "http".to_string(),
            port: 8080,
            protocol: PortProtocol::Http,
            external_access: None,
        }],
        build: test_build_definition(commit),
        exec: ComponentExec {
            command: vec!["./run.sh".to_string()],
            environment: BTreeMap::from([("PORT".to_string(), "8080".to_string())]),
        },
        health_check: None,
    }
}

pub fn test_service_definition(name: &str, components: Vec<Component>) -> ServiceDefinition {
    ServiceDefinition {
        name: name.to_string(),
        description: None,
        components,
        resources: ServiceResources {
            num_instances: Some(1),
            ..Default::default()
        },
    }
}

pub fn test_system_definition(services: Vec<ServiceDefinition>) -> SystemDefinition {
    SystemDefinition {
        name: "root".to_string(),
        description: None,
        subsystems: services.into_iter().map(DefinitionNode::Service).collect(),
    }
}

pub fn test_service_build(
    name: &str,
    namespace: &str,
    components: &[(&str, ComponentBuildDefinition)],
) -> ServiceBuild {
    let components = components
        .iter()
        .map(|(component, definition)| {
            (
                (*component).to_string(),
                ServiceBuildComponentInfo {
                    definition_block: definition.clone(),
                    ..Default::default()
                },
            )
        })
        .collect();
    let mut build = ServiceBuild::new(name, ServiceBuildSpec { components });
    build.metadata.namespace = Some(namespace.to_string());
    build
}

/// A SystemBuild of a single service `/api` with one component `web`.
pub fn test_system_build(name: &str, namespace: &str, tenant: &str) -> SystemBuild {
    test_system_build_of(
        name,
        namespace,
        tenant,
        test_system_definition(vec![test_service_definition(
            "api",
            vec![test_component("web", "c1")],
        )]),
    )
}

pub fn test_system_build_of(
    name: &str,
    namespace: &str,
    tenant: &str,
    definition: SystemDefinition,
) -> SystemBuild {
    let mut build = SystemBuild::new(
        name,
        SystemBuildSpec {
            lattice_namespace: tenant.to_string(),
            definition,
            services: BTreeMap::new(),
        },
    );
    build.metadata.namespace = Some(namespace.to_string());
    build
}

pub fn test_artifacts(fqn: &str) -> ComponentBuildArtifacts {
    ComponentBuildArtifacts {
        docker_image_fqn: fqn.to_string(),
    }
}

/// A Service for `/api` running `web` from `registry.test/lattice:web`.
pub fn test_service(name: &str, namespace: &str) -> Service {
    let definition = test_service_definition("api", vec![test_component("web", "c1")]);
    let mut service = Service::new(
        name,
        ServiceSpec {
            path: NodePath::new("/api").unwrap(),
            definition,
            component_build_artifacts: BTreeMap::from([(
                "web".to_string(),
                test_artifacts("registry.test/lattice:web"),
            )]),
            ports: BTreeMap::from([(
                "web".to_string(),
                vec![ServiceComponentPort {
                    name: "http".to_string(),
                    port: 8080,
                    protocol: "HTTP".to_string(),
                    public: false,
                    envoy_port: 10000,
                }],
            )]),
            envoy_admin_port: 10001,
            envoy_egress_port: 10002,
        },
    );
    service.metadata.namespace = Some(namespace.to_string());
    service
}

/// The System of `tenant`, with the controller's finalizer.
pub fn test_system(tenant: &str) -> System {
    let mut system = System::new(tenant, SystemSpec::default());
    system.metadata.namespace = Some(tenant.to_string());
    system.metadata.finalizers = Some(vec![SYSTEM_CONTROLLER_FINALIZER.to_string()]);
    system
}

/// System spec entry for `/api` running `web`.
pub fn test_system_service_info() -> SystemServiceInfo {
    SystemServiceInfo {
        definition: test_service_definition("api", vec![test_component("web", "c1")]),
        component_build_artifacts: BTreeMap::from([(
            "web".to_string(),
            test_artifacts("registry.test/lattice:web"),
        )]),
        service_name: None,
        service_state: None,
    }
}

pub fn test_rollout(name: &str, namespace: &str, tenant: &str, build: &str) -> SystemRollout {
    let mut rollout = SystemRollout::new(
        name,
        SystemRolloutSpec {
            lattice_namespace: tenant.to_string(),
            build_name: build.to_string(),
        },
    );
    rollout.metadata.namespace = Some(namespace.to_string());
    rollout
}

pub fn test_teardown(name: &str, namespace: &str, tenant: &str) -> SystemTeardown {
    let mut teardown = SystemTeardown::new(
        name,
        SystemTeardownSpec {
            lattice_namespace: tenant.to_string(),
        },
    );
    teardown.metadata.namespace = Some(namespace.to_string());
    teardown
}

pub fn test_job(name: &str, namespace: &str) -> Job {
    Job {
        metadata: meta(name, namespace),
        spec: None,
        status: None,
    }
}

fn job_condition(type_: &str) -> JobCondition {
    JobCondition {
        type_: type_.to_string(),
        status: "True".to_string(),
        ..Default::default()
    }
}

/// Play the Job controller: one pod running.
pub fn start_job(job: &mut Job) {
    job.status = Some(JobStatus {
        active: Some(1),
        ..Default::default()
    });
}

pub fn complete_job(job: &mut Job) {
    job.status = Some(JobStatus {
        succeeded: Some(1),
        conditions: Some(vec![job_condition("Complete")]),
        ..Default::default()
    });
}

pub fn fail_job(job: &mut Job) {
    job.status = Some(JobStatus {
        failed: Some(1),
        conditions: Some(vec![job_condition("Failed")]),
        ..Default::default()
    });
}

fn deployment_condition(type_: &str, status: &str) -> DeploymentCondition {
    DeploymentCondition {
        type_: type_.to_string(),
        status: status.to_string(),
        ..Default::default()
    }
}

fn desired_replicas(deployment: &Deployment) -> i32 {
    deployment
        .spec
        .as_ref()
        .and_then(|s| s.replicas)
        .unwrap_or(1)
}

/// Play the Deployment controller: every replica updated and available.
pub fn roll_out_deployment(deployment: &mut Deployment) {
    let replicas = desired_replicas(deployment);
    deployment.status = Some(DeploymentStatus {
        replicas: Some(replicas),
        updated_replicas: Some(replicas),
        available_replicas: Some(replicas),
        ready_replicas: Some(replicas),
        conditions: Some(vec![
            deployment_condition("Available", "True"),
            deployment_condition("Progressing", "True"),
        ]),
        ..Default::default()
    });
}

/// Play the Deployment controller: new pods progressing, none available.
pub fn progress_deployment(deployment: &mut Deployment) {
    deployment.status = Some(DeploymentStatus {
        replicas: Some(desired_replicas(deployment)),
        updated_replicas: Some(0),
        available_replicas: Some(0),
        conditions: Some(vec![deployment_condition("Progressing", "True")]),
        ..Default::default()
    });
}

pub fn fail_deployment(deployment: &mut Deployment) {
    deployment.status = Some(DeploymentStatus {
        conditions: Some(vec![deployment_condition("ReplicaFailure", "True")]),
        ..Default::default()
    });
}

fn sync_store<K>(writer: &mut Writer<K>, client: &MockResourceClient<K>)
where
    K: Resource<DynamicType = ()> + Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    writer.apply_watcher_event(&watcher::Event::Init);
    for object in client.objects() {
        writer.apply_watcher_event(&watcher::Event::InitApply(object));
    }
    writer.apply_watcher_event(&watcher::Event::InitDone);
}

struct Writers {
    component_builds: Writer<ComponentBuild>,
    service_builds: Writer<ServiceBuild>,
    system_builds: Writer<SystemBuild>,
    services: Writer<Service>,
    systems: Writer<System>,
    rollouts: Writer<SystemRollout>,
    teardowns: Writer<SystemTeardown>,
    jobs: Writer<Job>,
    deployments: Writer<Deployment>,
    kube_services: Writer<KubeService>,
}

fn store<K>() -> (Store<K>, Writer<K>)
where
    K: Resource<DynamicType = ()> + Clone + 'static,
{
    reflector::store()
}

/// In-memory cluster: one mock client and one cache per kind.
pub struct FakeCluster {
    pub component_builds: MockResourceClient<ComponentBuild>,
    pub service_builds: MockResourceClient<ServiceBuild>,
    pub system_builds: MockResourceClient<SystemBuild>,
    pub services: MockResourceClient<Service>,
    pub systems: MockResourceClient<System>,
    pub rollouts: MockResourceClient<SystemRollout>,
    pub teardowns: MockResourceClient<SystemTeardown>,
    pub jobs: MockResourceClient<Job>,
    pub deployments: MockResourceClient<Deployment>,
    pub kube_services: MockResourceClient<KubeService>,
    pub caches: Caches,
    pub config: SharedConfig,
    writers: Writers,
}

impl FakeCluster {
    /// Empty cluster with synced (empty) caches and no Config observed.
    pub fn new() -> Self {
        let (component_builds, component_builds_writer) = store();
        let (service_builds, service_builds_writer) = store();
        let (system_builds, system_builds_writer) = store();
        let (services, services_writer) = store();
        let (systems, systems_writer) = store();
        let (rollouts, rollouts_writer) = store();
        let (teardowns, teardowns_writer) = store();
        let (jobs, jobs_writer) = store();
        let (deployments, deployments_writer) = store();
        let (kube_services, kube_services_writer) = store();

        let mut cluster = Self {
            component_builds: MockResourceClient::new(),
            service_builds: MockResourceClient::new(),
            system_builds: MockResourceClient::new(),
            services: MockResourceClient::new(),
            systems: MockResourceClient::new(),
            rollouts: MockResourceClient::new(),
            teardowns: MockResourceClient::new(),
            jobs: MockResourceClient::new(),
            deployments: MockResourceClient::new(),
            kube_services: MockResourceClient::new(),
            caches: Caches {
                component_builds,
                service_builds,
                system_builds,
                services,
                systems,
                rollouts,
                teardowns,
                jobs,
                deployments,
                kube_services,
            },
            config: SharedConfig::new(INTERNAL_NAMESPACE, GLOBAL_CONFIG_NAME),
            writers: Writers {
                component_builds: component_builds_writer,
                service_builds: service_builds_writer,
                system_builds: system_builds_writer,
                services: services_writer,
                systems: systems_writer,
                rollouts: rollouts_writer,
                teardowns: teardowns_writer,
                jobs: jobs_writer,
                deployments: deployments_writer,
                kube_services: kube_services_writer,
            },
        };
        cluster.sync();
        cluster
    }

    /// Observe [`test_config_spec`] as the cluster Config.
    pub async fn with_config(self) -> Self {
        self.config.set(test_config_spec()).await;
        self
    }

    pub fn clients(&self) -> Clients {
        Clients {
            component_builds: Arc::new(self.component_builds.clone()),
            service_builds: Arc::new(self.service_builds.clone()),
            system_builds: Arc::new(self.system_builds.clone()),
            services: Arc::new(self.services.clone()),
            systems: Arc::new(self.systems.clone()),
            rollouts: Arc::new(self.rollouts.clone()),
            teardowns: Arc::new(self.teardowns.clone()),
            jobs: Arc::new(self.jobs.clone()),
            deployments: Arc::new(self.deployments.clone()),
            kube_services: Arc::new(self.kube_services.clone()),
        }
    }

    /// A reconciler over this cluster. Reconcilers built from the same
    /// cluster share objects but not their in-process state.
    pub fn reconciler(&self) -> Reconciler {
        Reconciler::new(self.clients(), self.caches.clone(), self.config.clone())
    }

    /// Refresh every cache from its mock, like a relist.
    pub fn sync(&mut self) {
        sync_store(&mut self.writers.component_builds, &self.component_builds);
        sync_store(&mut self.writers.service_builds, &self.service_builds);
        sync_store(&mut self.writers.system_builds, &self.system_builds);
        sync_store(&mut self.writers.services, &self.services);
        sync_store(&mut self.writers.systems, &self.systems);
        sync_store(&mut self.writers.rollouts, &self.rollouts);
        sync_store(&mut self.writers.teardowns, &self.teardowns);
        sync_store(&mut self.writers.jobs, &self.jobs);
        sync_store(&mut self.writers.deployments, &self.deployments);
        sync_store(&mut self.writers.kube_services, &self.kube_services);
    }

    /// Total writes recorded across every mock.
    pub fn write_count(&self) -> usize {
        self.component_builds.writes().len()
            + self.service_builds.writes().len()
            + self.system_builds.writes().len()
            + self.services.writes().len()
            + self.systems.writes().len()
            + self.rollouts.writes().len()
            + self.teardowns.writes().len()
            + self.jobs.writes().len()
            + self.deployments.writes().len()
            + self.kube_services.writes().len()
    }

    pub fn clear_writes(&self) {
        self.component_builds.clear_writes();
        self.service_builds.clear_writes();
        self.system_builds.clear_writes();
        self.services.clear_writes();
        self.systems.clear_writes();
        self.rollouts.clear_writes();
        self.teardowns.clear_writes();
        self.jobs.clear_writes();
        self.deployments.clear_writes();
        self.kube_services.clear_writes();
    }

    /// Run every reconciler over every cached object, syncing between rounds,
    /// until a round makes no writes. Returns the errors of the last round.
    pub async fn settle(&mut self, reconciler: &Reconciler) -> Vec<ControllerError> {
        let mut errors = Vec::new();
        for _ in 0..MAX_SETTLE_ROUNDS {
            self.sync();
            let before = self.write_count();
            errors.clear();

            for rollout in self.caches.rollouts.state() {
                errors.extend(reconciler.reconcile_system_rollout(&rollout).await.err());
            }
            for teardown in self.caches.teardowns.state() {
                errors.extend(reconciler.reconcile_system_teardown(&teardown).await.err());
            }
            for build in self.caches.system_builds.state() {
                errors.extend(reconciler.reconcile_system_build(&build).await.err());
            }
            for build in self.caches.service_builds.state() {
                errors.extend(reconciler.reconcile_service_build(&build).await.err());
            }
            for build in self.caches.component_builds.state() {
                errors.extend(reconciler.reconcile_component_build(&build).await.err());
            }
            for system in self.caches.systems.state() {
                errors.extend(reconciler.reconcile_system(&system).await.err());
            }
            for service in self.caches.services.state() {
                errors.extend(reconciler.reconcile_service(&service).await.err());
            }

            if self.write_count() == before {
                break;
            }
        }
        self.sync();
        errors
    }

    pub fn complete_all_jobs(&self) {
        for job in self.jobs.objects() {
            let (name, namespace) = name_of(&job);
            self.jobs.update(&namespace, &name, complete_job);
        }
    }

    pub fn roll_out_all_deployments(&self) {
        for deployment in self.deployments.objects() {
            let (name, namespace) = name_of(&deployment);
            self.deployments
                .update(&namespace, &name, roll_out_deployment);
        }
    }
}

pub fn name_of<K: Resource>(object: &K) -> (String, String) {
    (
        object.meta().name.clone().unwrap_or_default(),
        object.meta().namespace.clone().unwrap_or_default(),
    )
}
