//! Kubernetes resource watchers.
//!
//! Every controller is a `kube_runtime::Controller` over its primary kind,
//! plus mapped watches on the kinds whose events should wake it. All of them
//! go through [`run_controller`], which adds panic isolation, per-key backoff
//! and reconcile metrics around the reconcile function.

use crate::caches::{self, Caches};
use crate::error::ControllerError;
use crate::metrics;
use crate::owner::resolve_owner;
use crate::reconciler::Reconciler;
use crate::reconciler::service_build::service_builds_referencing;
use crate::reconciler::system_lifecycle::{system_build_tenant, system_tenant};
use crate::server::Readiness;
use crate::settings::ControllerKind;
use crds::{
    COMPONENT_BUILD_JOB_LABEL, ComponentBuild, Service, ServiceBuild, System, SystemBuild,
    SystemRollout, SystemTeardown,
};
use futures::{FutureExt, StreamExt};
use k8s_openapi::NamespaceResourceScope;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::Service as KubeService;
use kube::{Api, Client, Resource};
use kube_runtime::controller::{Action, Config as ControllerConfig};
use kube_runtime::{Controller, watcher};
use serde::de::DeserializeOwned;
use std::any::Any;
use std::fmt::Debug;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Backoff key of one object in one controller: `controller/namespace/name`.
pub(crate) fn reconcile_key<K: Resource>(kind: ControllerKind, object: &K) -> String {
    format!(
        "{}/{}/{}",
        kind,
        object.meta().namespace.as_deref().unwrap_or(""),
        object.meta().name.as_deref().unwrap_or("")
    )
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Run one reconcile, turning a panic into [`ControllerError::Panic`] and
/// recording its outcome.
pub(crate) async fn guarded_reconcile<Fut>(
    kind: ControllerKind,
    key: &str,
    ctx: &Reconciler,
    reconcile: Fut,
) -> Result<Action, ControllerError>
where
    Fut: Future<Output = Result<Action, ControllerError>>,
{
    let started = Instant::now();
    let result = AssertUnwindSafe(reconcile)
        .catch_unwind()
        .await
        .unwrap_or_else(|panic| Err(ControllerError::Panic(panic_message(panic.as_ref()))));
    metrics::observe_reconciliation(kind.name(), started.elapsed(), result.is_err());

    if result.is_ok() {
        ctx.reset_backoff(key);
    }
    result
}

/// Terminal errors wait for the next change; everything else retries with
/// the key's backoff.
pub(crate) fn error_action(
    kind: ControllerKind,
    key: &str,
    error: &ControllerError,
    ctx: &Reconciler,
) -> Action {
    if error.is_terminal() {
        warn!("{} reconcile of {} failed, waiting for a change: {}", kind, key, error);
        return Action::await_change();
    }
    let delay = ctx.next_retry(key);
    warn!(
        "{} reconcile of {} failed (attempt {}), retrying in {:?}: {}",
        kind,
        key,
        ctx.error_count(key),
        delay,
        error
    );
    Action::requeue(delay)
}

/// Drive `controller` with `reconcile_fn` until shutdown.
pub async fn run_controller<K, F, Fut>(
    kind: ControllerKind,
    controller: Controller<K>,
    reconciler: Arc<Reconciler>,
    reconcile_fn: F,
) -> Result<(), ControllerError>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
    F: Fn(Arc<Reconciler>, Arc<K>) -> Fut + Send + Sync + Clone + 'static,
    Fut: Future<Output = Result<Action, ControllerError>> + Send + 'static,
{
    info!("Starting {} controller", kind);

    let reconcile = move |obj: Arc<K>, ctx: Arc<Reconciler>| {
        let reconcile_fn = reconcile_fn.clone();
        async move {
            let key = reconcile_key(kind, obj.as_ref());
            debug!("Reconciling {}", key);
            guarded_reconcile(kind, &key, &ctx, reconcile_fn(ctx.clone(), obj)).await
        }
    };
    let error_policy = move |obj: Arc<K>, error: &ControllerError, ctx: Arc<Reconciler>| {
        error_action(kind, &reconcile_key(kind, obj.as_ref()), error, &ctx)
    };

    controller
        .shutdown_on_signal()
        .run(reconcile, error_policy, reconciler)
        .for_each(|res| async move {
            match res {
                Ok((object, _)) => debug!("{} reconciled {}", kind, object),
                Err(e) => debug!("{} controller event: {}", kind, e),
            }
        })
        .await;

    info!("{} controller stopped", kind);
    Ok(())
}

/// Builds and runs the six controllers against one set of caches.
pub struct Watcher {
    reconciler: Arc<Reconciler>,
    client: Client,
    namespace: Option<String>,
    controller_config: ControllerConfig,
    readiness: Readiness,
}

impl Watcher {
    /// Creates a new watcher instance.
    pub fn new(
        reconciler: Arc<Reconciler>,
        client: Client,
        namespace: Option<String>,
        controller_config: ControllerConfig,
        readiness: Readiness,
    ) -> Self {
        Self {
            reconciler,
            client,
            namespace,
            controller_config,
            readiness,
        }
    }

    fn api<K>(&self) -> Api<K>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>,
    {
        caches::api(self.client.clone(), self.namespace.as_deref())
    }

    fn caches(&self) -> &Caches {
        &self.reconciler.caches
    }

    fn controller<K>(&self) -> Controller<K>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
            + Clone
            + DeserializeOwned
            + Debug
            + Send
            + Sync
            + 'static,
    {
        Controller::new(self.api::<K>(), watcher::Config::default())
            .with_config(self.controller_config.clone())
    }

    fn synced(&self, kind: ControllerKind) {
        self.readiness.mark_synced(kind.name());
        info!("{} caches synced", kind);
    }

    /// Run `kind`'s controller.
    pub async fn watch(&self, kind: ControllerKind) -> Result<(), ControllerError> {
        match kind {
            ControllerKind::ComponentBuild => self.watch_component_builds().await,
            ControllerKind::ServiceBuild => self.watch_service_builds().await,
            ControllerKind::SystemBuild => self.watch_system_builds().await,
            ControllerKind::Service => self.watch_services().await,
            ControllerKind::System => self.watch_systems().await,
            ControllerKind::SystemLifecycle => self.watch_system_lifecycle().await,
        }
    }

    /// ComponentBuilds, woken by their build Jobs.
    pub async fn watch_component_builds(&self) -> Result<(), ControllerError> {
        let kind = ControllerKind::ComponentBuild;
        caches::wait_until_ready(&self.caches().component_builds).await?;
        caches::wait_until_ready(&self.caches().jobs).await?;
        self.reconciler.config.wait_until_observed().await;
        self.synced(kind);

        let builds = self.caches().component_builds.clone();
        let jobs = watcher::Config::default().labels(&format!("{COMPONENT_BUILD_JOB_LABEL}=true"));
        let controller = self
            .controller::<ComponentBuild>()
            .watches(self.api::<Job>(), jobs, move |job| {
                resolve_owner(&job.metadata, &builds)
            });

        run_controller(kind, controller, self.reconciler.clone(), |ctx, build| async move {
            ctx.reconcile_component_build(&build).await
        })
        .await
    }

    /// ServiceBuilds, woken by the ComponentBuilds they reference.
    pub async fn watch_service_builds(&self) -> Result<(), ControllerError> {
        let kind = ControllerKind::ServiceBuild;
        caches::wait_until_ready(&self.caches().service_builds).await?;
        caches::wait_until_ready(&self.caches().component_builds).await?;
        self.synced(kind);

        let service_builds = self.caches().service_builds.clone();
        let controller = self.controller::<ServiceBuild>().watches(
            self.api::<ComponentBuild>(),
            watcher::Config::default(),
            move |build| service_builds_referencing(&build, &service_builds),
        );

        run_controller(kind, controller, self.reconciler.clone(), |ctx, build| async move {
            ctx.reconcile_service_build(&build).await
        })
        .await
    }

    /// SystemBuilds, woken by the ServiceBuilds they own.
    pub async fn watch_system_builds(&self) -> Result<(), ControllerError> {
        let kind = ControllerKind::SystemBuild;
        caches::wait_until_ready(&self.caches().system_builds).await?;
        caches::wait_until_ready(&self.caches().service_builds).await?;
        self.synced(kind);

        let system_builds = self.caches().system_builds.clone();
        let controller = self.controller::<SystemBuild>().watches(
            self.api::<ServiceBuild>(),
            watcher::Config::default(),
            move |build| resolve_owner(&build.metadata, &system_builds),
        );

        run_controller(kind, controller, self.reconciler.clone(), |ctx, build| async move {
            ctx.reconcile_system_build(&build).await
        })
        .await
    }

    /// Services, woken by their Deployments and headless Kubernetes Services.
    pub async fn watch_services(&self) -> Result<(), ControllerError> {
        let kind = ControllerKind::Service;
        caches::wait_until_ready(&self.caches().services).await?;
        caches::wait_until_ready(&self.caches().deployments).await?;
        caches::wait_until_ready(&self.caches().kube_services).await?;
        self.reconciler.config.wait_until_observed().await;
        self.synced(kind);

        let from_deployments = self.caches().services.clone();
        let from_kube_services = self.caches().services.clone();
        let controller = self
            .controller::<Service>()
            .watches(
                self.api::<Deployment>(),
                watcher::Config::default(),
                move |deployment| resolve_owner(&deployment.metadata, &from_deployments),
            )
            .watches(
                self.api::<KubeService>(),
                watcher::Config::default(),
                move |service| resolve_owner(&service.metadata, &from_kube_services),
            );

        run_controller(kind, controller, self.reconciler.clone(), |ctx, service| async move {
            ctx.reconcile_service(&service).await
        })
        .await
    }

    /// Systems, woken by their Services.
    pub async fn watch_systems(&self) -> Result<(), ControllerError> {
        let kind = ControllerKind::System;
        caches::wait_until_ready(&self.caches().systems).await?;
        caches::wait_until_ready(&self.caches().services).await?;
        self.synced(kind);

        let systems = self.caches().systems.clone();
        let controller = self.controller::<System>().watches(
            self.api::<Service>(),
            watcher::Config::default(),
            move |service| resolve_owner(&service.metadata, &systems),
        );

        run_controller(kind, controller, self.reconciler.clone(), |ctx, system| async move {
            ctx.reconcile_system(&system).await
        })
        .await
    }

    /// SystemRollouts and SystemTeardowns, woken by the Systems and
    /// SystemBuilds of the tenant they own.
    ///
    /// Owning actions are restored from the caches before either controller
    /// starts, so a restart cannot hand a tenant to a second action.
    pub async fn watch_system_lifecycle(&self) -> Result<(), ControllerError> {
        let kind = ControllerKind::SystemLifecycle;
        caches::wait_until_ready(&self.caches().rollouts).await?;
        caches::wait_until_ready(&self.caches().teardowns).await?;
        caches::wait_until_ready(&self.caches().systems).await?;
        caches::wait_until_ready(&self.caches().system_builds).await?;
        caches::wait_until_ready(&self.caches().service_builds).await?;
        caches::wait_until_ready(&self.caches().component_builds).await?;

        let restored = self.reconciler.restore_owning_actions()?;
        info!("Restored {} running lifecycle actions", restored);
        self.synced(kind);

        let rollouts = {
            let by_system = self.reconciler.clone();
            let by_build = self.reconciler.clone();
            self.controller::<SystemRollout>()
                .watches(self.api::<System>(), watcher::Config::default(), move |system| {
                    system_tenant(&system).and_then(|tenant| by_system.rollout_for_tenant(&tenant))
                })
                .watches(
                    self.api::<SystemBuild>(),
                    watcher::Config::default(),
                    move |build| by_build.rollout_for_tenant(&system_build_tenant(&build)),
                )
        };
        let teardowns = {
            let by_system = self.reconciler.clone();
            self.controller::<SystemTeardown>().watches(
                self.api::<System>(),
                watcher::Config::default(),
                move |system| {
                    system_tenant(&system).and_then(|tenant| by_system.teardown_for_tenant(&tenant))
                },
            )
        };

        let rollouts = run_controller(kind, rollouts, self.reconciler.clone(), |ctx, rollout| async move {
            ctx.reconcile_system_rollout(&rollout).await
        });
        let teardowns = run_controller(kind, teardowns, self.reconciler.clone(), |ctx, teardown| async move {
            ctx.reconcile_system_teardown(&teardown).await
        });
        let (rollouts, teardowns) = tokio::join!(rollouts, teardowns);
        rollouts.and(teardowns)
    }
}
