//! Main controller implementation.
//!
//! The `Controller` owns every background task of the manager: the cache
//! reflectors, the Config watcher, the probe server and one task per enabled
//! controller. [`Controller::run`] returns when the controllers shut down or
//! any background task dies.

use crate::caches::{Caches, ReflectorHandles};
use crate::error::ControllerError;
use crate::reconciler::{Clients, Reconciler};
use crate::server::{self, Readiness};
use crate::settings::{ControllerKind, Settings};
use crate::shared_config::SharedConfig;
use crate::watcher::Watcher;
use crds::Config;
use futures::future::{join_all, select_all};
use kube::{Api, Client};
use kube_runtime::controller::Config as ControllerConfig;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info};

type Task = JoinHandle<Result<(), ControllerError>>;

/// Runs the enabled lattice controllers.
pub struct Controller {
    controllers: Vec<(ControllerKind, Task)>,
    background: Vec<(String, Task)>,
}

impl Controller {
    /// Creates a new controller instance.
    pub async fn new(settings: &Settings) -> Result<Self, ControllerError> {
        info!("Initializing lattice controller manager");

        let client = Client::try_default().await?;
        let namespace = settings.watch_namespace.clone();

        let (caches, reflectors): (Caches, ReflectorHandles) =
            Caches::spawn(&client, namespace.as_deref());
        let mut background = reflectors;

        let config = SharedConfig::new(&settings.internal_namespace, &settings.config_name);
        let config_api: Api<Config> = Api::namespaced(client.clone(), &settings.internal_namespace);
        background.push((
            "Config watcher".to_string(),
            tokio::spawn(config.clone().watch(config_api)),
        ));

        let readiness = Readiness::default();
        background.push((
            "probe server".to_string(),
            tokio::spawn(server::serve(settings.metrics_addr, readiness.clone())),
        ));

        let reconciler = Arc::new(Reconciler::new(Clients::kube(&client), caches, config));
        let controller_config = ControllerConfig::default()
            .debounce(settings.debounce)
            .concurrency(settings.workers);
        let watcher = Arc::new(Watcher::new(
            reconciler,
            client,
            namespace,
            controller_config,
            readiness.clone(),
        ));

        let mut controllers = Vec::new();
        for kind in ControllerKind::ALL {
            if !settings.is_enabled(kind) {
                info!("{} controller disabled", kind);
                continue;
            }
            readiness.register(kind.name());
            let watcher = watcher.clone();
            controllers.push((kind, tokio::spawn(async move { watcher.watch(kind).await })));
        }
        if controllers.is_empty() {
            return Err(ControllerError::InvalidConfig(
                "no controllers enabled".to_string(),
            ));
        }

        Ok(Self {
            controllers,
            background,
        })
    }

    /// Runs the controllers until shutdown.
    pub async fn run(self) -> Result<(), ControllerError> {
        let (kinds, handles): (Vec<ControllerKind>, Vec<Task>) =
            self.controllers.into_iter().unzip();
        let (names, background): (Vec<String>, Vec<Task>) = self.background.into_iter().unzip();

        let controllers = join_all(handles);
        tokio::select! {
            results = controllers => {
                for (kind, result) in kinds.iter().zip(results) {
                    task_result(kind.name(), result)?;
                }
                info!("All controllers stopped");
                Ok(())
            }
            (result, index, _) = select_all(background) => {
                let name = names.get(index).map_or("background task", String::as_str);
                task_result(name, result)?;
                Err(ControllerError::Watch(format!("{name} exited")))
            }
        }
    }
}

fn task_result(
    name: &str,
    result: Result<Result<(), ControllerError>, tokio::task::JoinError>,
) -> Result<(), ControllerError> {
    match result {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => {
            error!("{} failed: {}", name, e);
            Err(e)
        }
        Err(e) => {
            error!("{} task aborted: {}", name, e);
            Err(ControllerError::Panic(format!("{name}: {e}")))
        }
    }
}
