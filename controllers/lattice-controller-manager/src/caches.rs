//! Shared informer caches.
//!
//! One reflector per kind feeds a [`Store`] that every reconciler reads from.
//! Controllers wait for the stores they depend on before they start.

use crate::error::ControllerError;
use crds::{
    ComponentBuild, Service, ServiceBuild, System, SystemBuild, SystemRollout, SystemTeardown,
};
use futures::StreamExt;
use k8s_openapi::NamespaceResourceScope;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::Service as KubeService;
use kube::{Api, Client, Resource};
use kube_runtime::reflector::{self, Store};
use kube_runtime::{WatchStreamExt, watcher};
use serde::de::DeserializeOwned;
use std::fmt::Debug;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Read-only caches of every kind the controllers look at.
#[derive(Clone)]
pub struct Caches {
    pub component_builds: Store<ComponentBuild>,
    pub service_builds: Store<ServiceBuild>,
    pub system_builds: Store<SystemBuild>,
    pub services: Store<Service>,
    pub systems: Store<System>,
    pub rollouts: Store<SystemRollout>,
    pub teardowns: Store<SystemTeardown>,
    pub jobs: Store<Job>,
    pub deployments: Store<Deployment>,
    pub kube_services: Store<KubeService>,
}

impl std::fmt::Debug for Caches {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Caches")
            .field("component_builds", &self.component_builds.state().len())
            .field("service_builds", &self.service_builds.state().len())
            .field("system_builds", &self.system_builds.state().len())
            .field("services", &self.services.state().len())
            .field("systems", &self.systems.state().len())
            .finish_non_exhaustive()
    }
}

/// Background reflector tasks backing a [`Caches`].
pub type ReflectorHandles = Vec<(String, JoinHandle<Result<(), ControllerError>>)>;

/// An [`Api`] over one namespace, or every namespace when `namespace` is `None`.
pub fn api<K>(client: Client, namespace: Option<&str>) -> Api<K>
where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>,
{
    match namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    }
}

fn reflect<K>(
    client: &Client,
    namespace: Option<&str>,
    handles: &mut ReflectorHandles,
) -> Store<K>
where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
        + Clone
        + DeserializeOwned
        + Debug
        + Send
        + Sync
        + 'static,
{
    let kind = K::kind(&()).to_string();
    let task_name = format!("{kind} reflector");
    let (store, writer) = reflector::store();
    let stream = watcher(api::<K>(client.clone(), namespace), watcher::Config::default())
        .default_backoff()
        .reflect(writer)
        .touched_objects();

    let handle = tokio::spawn(async move {
        stream
            .for_each(|event| {
                if let Err(e) = event {
                    warn!("{} reflector error: {}", kind, e);
                }
                futures::future::ready(())
            })
            .await;
        Err(ControllerError::Watch(format!("{kind} reflector stream ended")))
    });
    debug!("Started {}", task_name);
    handles.push((task_name, handle));
    store
}

impl Caches {
    /// Start a reflector for every kind.
    #[must_use]
    pub fn spawn(client: &Client, namespace: Option<&str>) -> (Self, ReflectorHandles) {
        let mut handles = Vec::new();
        let caches = Self {
            component_builds: reflect(client, namespace, &mut handles),
            service_builds: reflect(client, namespace, &mut handles),
            system_builds: reflect(client, namespace, &mut handles),
            services: reflect(client, namespace, &mut handles),
            systems: reflect(client, namespace, &mut handles),
            rollouts: reflect(client, namespace, &mut handles),
            teardowns: reflect(client, namespace, &mut handles),
            jobs: reflect(client, namespace, &mut handles),
            deployments: reflect(client, namespace, &mut handles),
            kube_services: reflect(client, namespace, &mut handles),
        };
        (caches, handles)
    }
}

/// Wait until `store` has completed its initial list.
pub async fn wait_until_ready<K>(store: &Store<K>) -> Result<(), ControllerError>
where
    K: Resource<DynamicType = ()> + Clone + 'static,
{
    store.wait_until_ready().await.map_err(|e| {
        ControllerError::Watch(format!("{} cache never synced: {}", K::kind(&()), e))
    })
}
