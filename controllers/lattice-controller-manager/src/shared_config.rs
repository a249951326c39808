//! Snapshot of the cluster Config shared by every controller.
//!
//! A watcher task keeps the latest `Config` spec. Controllers that build
//! workloads (ComponentBuild, Service) do not start until the Config has been
//! observed once.

use crate::error::ControllerError;
use crds::{Config, ConfigSpec};
use futures::StreamExt;
use kube::Api;
use kube_runtime::{WatchStreamExt, watcher};
use std::pin::pin;
use std::sync::Arc;
use tokio::sync::{Notify, RwLock};
use tracing::{debug, info, warn};

/// Latest observed Config spec.
#[derive(Debug, Clone)]
pub struct SharedConfig {
    namespace: String,
    name: String,
    current: Arc<RwLock<Option<Arc<ConfigSpec>>>>,
    observed: Arc<Notify>,
}

impl SharedConfig {
    /// An empty snapshot for the Config `namespace/name`.
    #[must_use]
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            current: Arc::new(RwLock::new(None)),
            observed: Arc::new(Notify::new()),
        }
    }

    /// `namespace/name` of the watched Config.
    #[must_use]
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }

    /// Replace the snapshot and wake everyone waiting for the first observation.
    pub async fn set(&self, spec: ConfigSpec) {
        *self.current.write().await = Some(Arc::new(spec));
        self.observed.notify_waiters();
    }

    /// The current spec, or [`ControllerError::ConfigUnavailable`].
    pub async fn get(&self) -> Result<Arc<ConfigSpec>, ControllerError> {
        self.current
            .read()
            .await
            .as_ref()
            .map(Arc::clone)
            .ok_or_else(|| ControllerError::ConfigUnavailable(self.key()))
    }

    /// Wait until a Config has been observed.
    pub async fn wait_until_observed(&self) {
        loop {
            let mut notified = pin!(self.observed.notified());
            notified.as_mut().enable();
            if self.current.read().await.is_some() {
                return;
            }
            notified.await;
        }
    }

    /// Follow the Config until the watch stream ends.
    pub async fn watch(self, api: Api<Config>) -> Result<(), ControllerError> {
        info!("Starting Config watcher for {}", self.key());
        let config = watcher::Config::default().fields(&format!("metadata.name={}", self.name));
        let mut events = pin!(watcher(api, config).default_backoff());

        while let Some(event) = events.next().await {
            match event {
                Ok(watcher::Event::Apply(config) | watcher::Event::InitApply(config)) => {
                    debug!("Observed Config {}", self.key());
                    self.set(config.spec).await;
                }
                Ok(watcher::Event::Delete(_)) => {
                    warn!("Config {} was deleted, keeping the last observed spec", self.key());
                }
                Ok(watcher::Event::Init | watcher::Event::InitDone) => {}
                Err(e) => warn!("Config watch error for {}: {}", self.key(), e),
            }
        }

        Err(ControllerError::Watch(format!("Config {} watch stream ended", self.key())))
    }
}
