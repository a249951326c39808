//! Reconciliation logic for the lattice resource graph.
//!
//! One [`Reconciler`] serves every controller. Each submodule adds the
//! reconcile function for one kind:
//! - `component_build`: ComponentBuild to build Job
//! - `service_build`: ServiceBuild to deduplicated ComponentBuilds
//! - `system_build`: SystemBuild to ServiceBuilds
//! - `service`: Service to Deployment and headless Kubernetes Service
//! - `system`: System to Services, finalizer-driven deletion
//! - `system_lifecycle`: SystemRollout and SystemTeardown state machines

pub mod component_build;
pub mod service;
pub mod service_build;
pub mod system;
pub mod system_build;
pub mod system_lifecycle;

use crate::backoff::ExponentialBackoff;
use crate::caches::Caches;
use crate::error::ControllerError;
use crate::shared_config::SharedConfig;
use crds::{
    ComponentBuild, Service, ServiceBuild, System, SystemBuild, SystemRollout, SystemTeardown,
};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::Service as KubeService;
use kube::{Client, Resource};
use lattice_client::{ClientError, KubeResourceClient, SharedClient};
use service_build::RecentBuilds;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use system_lifecycle::owning::OwningActions;

/// Backoff state for a resource
#[derive(Debug, Clone)]
struct BackoffState {
    backoff: ExponentialBackoff,
    error_count: u32,
}

impl BackoffState {
    fn new() -> Self {
        Self {
            backoff: ExponentialBackoff::default(), // 5 seconds base, 5 minutes max
            error_count: 0,
        }
    }

    fn increment_error(&mut self) {
        self.error_count += 1;
    }
}

/// Write access to every kind the controllers manage.
#[derive(Clone)]
pub struct Clients {
    pub component_builds: SharedClient<ComponentBuild>,
    pub service_builds: SharedClient<ServiceBuild>,
    pub system_builds: SharedClient<SystemBuild>,
    pub services: SharedClient<Service>,
    pub systems: SharedClient<System>,
    pub rollouts: SharedClient<SystemRollout>,
    pub teardowns: SharedClient<SystemTeardown>,
    pub jobs: SharedClient<Job>,
    pub deployments: SharedClient<Deployment>,
    pub kube_services: SharedClient<KubeService>,
}

impl Clients {
    /// Clients backed by the Kubernetes API.
    #[must_use]
    pub fn kube(client: &Client) -> Self {
        Self {
            component_builds: Arc::new(KubeResourceClient::new(client.clone())),
            service_builds: Arc::new(KubeResourceClient::new(client.clone())),
            system_builds: Arc::new(KubeResourceClient::new(client.clone())),
            services: Arc::new(KubeResourceClient::new(client.clone())),
            systems: Arc::new(KubeResourceClient::new(client.clone())),
            rollouts: Arc::new(KubeResourceClient::new(client.clone())),
            teardowns: Arc::new(KubeResourceClient::new(client.clone())),
            jobs: Arc::new(KubeResourceClient::new(client.clone())),
            deployments: Arc::new(KubeResourceClient::new(client.clone())),
            kube_services: Arc::new(KubeResourceClient::new(client.clone())),
        }
    }
}

/// Reconciles lattice resources.
pub struct Reconciler {
    pub(crate) clients: Clients,
    pub(crate) caches: Caches,
    pub(crate) config: SharedConfig,
    /// Per-namespace hash to name of ComponentBuilds this process created
    pub(crate) recent_builds: RecentBuilds,
    /// Rollout or teardown currently driving each tenant
    pub(crate) owning: OwningActions,
    /// Error count tracking per controller and resource (controller/namespace/name -> BackoffState)
    backoff_states: Arc<Mutex<HashMap<String, BackoffState>>>,
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("config", &self.config.key())
            .field("caches", &self.caches)
            .finish_non_exhaustive()
    }
}

impl Reconciler {
    /// Creates a new reconciler instance.
    #[must_use]
    pub fn new(clients: Clients, caches: Caches, config: SharedConfig) -> Self {
        Self {
            clients,
            caches,
            config,
            recent_builds: RecentBuilds::default(),
            owning: OwningActions::default(),
            backoff_states: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Record a failed reconcile of `key` and return the delay before the retry.
    pub fn next_retry(&self, key: &str) -> Duration {
        let mut states = self
            .backoff_states
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let state = states.entry(key.to_string()).or_insert_with(BackoffState::new);
        state.increment_error();
        state.backoff.next_backoff()
    }

    /// Forget the failures of `key` after a successful reconcile.
    pub fn reset_backoff(&self, key: &str) {
        self.backoff_states
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
    }

    /// Consecutive failures recorded for `key`.
    #[must_use]
    pub fn error_count(&self, key: &str) -> u32 {
        self.backoff_states
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .map_or(0, |state| state.error_count)
    }
}

/// Name and namespace of a cached object.
pub(crate) fn name_and_namespace<K>(object: &K) -> Result<(String, String), ControllerError>
where
    K: Resource<DynamicType = ()>,
{
    let meta = object.meta();
    match (&meta.name, &meta.namespace) {
        (Some(name), Some(namespace)) => Ok((name.clone(), namespace.clone())),
        _ => Err(ControllerError::Invariant(format!(
            "{} without a name or namespace",
            K::kind(&())
        ))),
    }
}

/// Treat "already exists" on create as success.
pub(crate) fn ignore_already_exists<T>(result: Result<T, ClientError>) -> Result<Option<T>, ClientError> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(e) if e.is_already_exists() => Ok(None),
        Err(e) => Err(e),
    }
}

/// Treat "not found" on delete as success.
pub(crate) fn ignore_not_found(result: Result<(), ClientError>) -> Result<(), ClientError> {
    match result {
        Err(e) if e.is_not_found() => Ok(()),
        other => other,
    }
}
