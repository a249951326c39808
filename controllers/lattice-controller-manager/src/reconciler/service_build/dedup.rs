//! ComponentBuild deduplication.
//!
//! Builds are pure functions of their definition block, so every component
//! whose block hashes the same shares one ComponentBuild. Candidates are
//! looked up in three places, cheapest first: builds this process created
//! recently (which may not have reached the informer cache yet), the informer
//! cache, and finally a locked re-check right before creating a new build.

use crate::error::ControllerError;
use crate::reconciler::Reconciler;
use crds::{
    COMPONENT_BUILD_DEFINITION_HASH_ANNOTATION, ComponentBuild, ComponentBuildDefinition,
    ComponentBuildSpec, ComponentBuildState,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube_runtime::reflector::ObjectRef;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Namespace to definition hash to the name of the ComponentBuild created for it.
#[derive(Debug, Default)]
pub struct RecentBuilds {
    builds: RwLock<HashMap<String, HashMap<String, String>>>,
}

impl RecentBuilds {
    /// Name recorded for `hash` in `namespace`.
    pub async fn get(&self, namespace: &str, hash: &str) -> Option<String> {
        self.builds
            .read()
            .await
            .get(namespace)
            .and_then(|hashes| hashes.get(hash))
            .cloned()
    }
}

/// A ComponentBuild chosen for a component, with its last known state.
pub type ChosenBuild = (String, ComponentBuildState);

fn usable(name: &str, build: &ComponentBuild) -> Option<ChosenBuild> {
    let state = build.state();
    (state != ComponentBuildState::Failed).then(|| (name.to_string(), state))
}

/// Outcome of looking a hash up in [`RecentBuilds`].
enum RecentLookup {
    Usable(ChosenBuild),
    /// Recorded, but failed or gone
    Rejected(String),
    Absent,
}

impl Reconciler {
    /// Find a non-failed ComponentBuild for `hash`, creating one if none exists.
    ///
    /// `previous_build_name` is the build the component used before; the final
    /// locked re-check never hands it back, nor a recorded build already found
    /// failed or gone.
    pub(crate) async fn find_or_create_component_build(
        &self,
        namespace: &str,
        hash: &str,
        definition: &ComponentBuildDefinition,
        previous_build_name: Option<&str>,
    ) -> Result<ChosenBuild, ControllerError> {
        let rejected = match self.recent_component_build(namespace, hash).await? {
            RecentLookup::Usable(found) => {
                debug!("Reusing recent ComponentBuild {}/{} for {}", namespace, found.0, hash);
                return Ok(found);
            }
            RecentLookup::Rejected(name) => Some(name),
            RecentLookup::Absent => None,
        };

        if let Some(found) = self.cached_component_build(namespace, hash) {
            debug!("Reusing cached ComponentBuild {}/{} for {}", namespace, found.0, hash);
            return Ok(found);
        }

        let skip = [previous_build_name, rejected.as_deref()];
        self.create_component_build(namespace, hash, definition, &skip)
            .await
    }

    async fn recent_component_build(
        &self,
        namespace: &str,
        hash: &str,
    ) -> Result<RecentLookup, ControllerError> {
        // held across the API read so a concurrent create cannot slip in between
        let recent = self.recent_builds.builds.read().await;
        let Some(name) = recent.get(namespace).and_then(|hashes| hashes.get(hash)) else {
            return Ok(RecentLookup::Absent);
        };

        let build = match self
            .caches
            .component_builds
            .get(&ObjectRef::new(name).within(namespace))
        {
            Some(build) => Some(build.as_ref().clone()),
            None => self.clients.component_builds.get(namespace, name).await?,
        };
        let Some(build) = build else {
            warn!(
                "Recently created ComponentBuild {}/{} no longer exists, ignoring it",
                namespace, name
            );
            return Ok(RecentLookup::Rejected(name.clone()));
        };
        Ok(match usable(name, &build) {
            Some(found) => RecentLookup::Usable(found),
            None => RecentLookup::Rejected(name.clone()),
        })
    }

    fn cached_component_build(&self, namespace: &str, hash: &str) -> Option<ChosenBuild> {
        let mut candidates: Vec<_> = self
            .caches
            .component_builds
            .state()
            .into_iter()
            .filter(|build| build.metadata.namespace.as_deref() == Some(namespace))
            .filter(|build| build.definition_hash() == Some(hash))
            .filter(|build| build.state() != ComponentBuildState::Failed)
            .collect();
        candidates.sort_by(|a, b| a.metadata.name.cmp(&b.metadata.name));

        let build = candidates.first()?;
        let name = build.metadata.name.as_deref()?;
        usable(name, build)
    }

    async fn create_component_build(
        &self,
        namespace: &str,
        hash: &str,
        definition: &ComponentBuildDefinition,
        skip: &[Option<&str>],
    ) -> Result<ChosenBuild, ControllerError> {
        let mut recent = self.recent_builds.builds.write().await;

        // a concurrent reconcile may have created one while we waited for the lock
        let existing = recent
            .get(namespace)
            .and_then(|hashes| hashes.get(hash))
            .filter(|name| !skip.contains(&Some(name.as_str())))
            .cloned();
        if let Some(name) = existing {
            match self
                .caches
                .component_builds
                .get(&ObjectRef::new(&name).within(namespace))
            {
                Some(build) if build.state() == ComponentBuildState::Failed => {}
                Some(build) => return Ok((name, build.state())),
                None => return Ok((name, ComponentBuildState::Pending)),
            }
        }

        let name = uuid::Uuid::new_v4().to_string();
        let build = ComponentBuild {
            metadata: ObjectMeta {
                name: Some(name.clone()),
                namespace: Some(namespace.to_string()),
                annotations: Some(BTreeMap::from([(
                    COMPONENT_BUILD_DEFINITION_HASH_ANNOTATION.to_string(),
                    hash.to_string(),
                )])),
                ..Default::default()
            },
            spec: ComponentBuildSpec {
                definition_block: definition.clone(),
                artifacts: None,
            },
            status: None,
        };
        self.clients
            .component_builds
            .create(namespace, &build)
            .await?;
        recent
            .entry(namespace.to_string())
            .or_default()
            .insert(hash.to_string(), name.clone());

        info!("Created ComponentBuild {}/{} for {}", namespace, name, hash);
        Ok((name, ComponentBuildState::Pending))
    }
}
