//! Kubernetes-backed resource client

use crate::error::ClientError;
use crate::resource_trait::{ResourceClient, object_name};
use kube::api::{DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::{Api, Client, Resource, ResourceExt};
use k8s_openapi::NamespaceResourceScope;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fmt;
use std::marker::PhantomData;
use tracing::debug;

/// [`ResourceClient`] talking to the Kubernetes API server.
pub struct KubeResourceClient<K> {
    client: Client,
    _kind: PhantomData<fn() -> K>,
}

impl<K> KubeResourceClient<K> {
    /// Wraps a kube client.
    pub fn new(client: Client) -> Self {
        Self {
            client,
            _kind: PhantomData,
        }
    }
}

impl<K> Clone for KubeResourceClient<K> {
    fn clone(&self) -> Self {
        Self::new(self.client.clone())
    }
}

impl<K> fmt::Debug for KubeResourceClient<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KubeResourceClient")
            .field("kind", &std::any::type_name::<K>())
            .finish_non_exhaustive()
    }
}

impl<K> KubeResourceClient<K>
where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
        + Clone
        + DeserializeOwned
        + fmt::Debug,
{
    fn api(&self, namespace: &str) -> Api<K> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait::async_trait]
impl<K> ResourceClient<K> for KubeResourceClient<K>
where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
        + Clone
        + DeserializeOwned
        + Serialize
        + fmt::Debug
        + Send
        + Sync
        + 'static,
{
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<K>, ClientError> {
        Ok(self.api(namespace).get_opt(name).await?)
    }

    async fn list(&self, namespace: &str) -> Result<Vec<K>, ClientError> {
        let list = self.api(namespace).list(&ListParams::default()).await?;
        Ok(list.items)
    }

    async fn create(&self, namespace: &str, object: &K) -> Result<K, ClientError> {
        debug!(
            "Creating {} {}/{}",
            K::kind(&()),
            namespace,
            object.name_any()
        );
        Ok(self
            .api(namespace)
            .create(&PostParams::default(), object)
            .await?)
    }

    async fn replace(&self, namespace: &str, object: &K) -> Result<K, ClientError> {
        let name = object_name(object)?;
        debug!("Replacing {} {}/{}", K::kind(&()), namespace, name);
        Ok(self
            .api(namespace)
            .replace(&name, &PostParams::default(), object)
            .await?)
    }

    async fn replace_status(&self, namespace: &str, object: &K) -> Result<K, ClientError> {
        let name = object_name(object)?;
        let status = serde_json::to_value(object)?
            .get("status")
            .cloned()
            .unwrap_or(serde_json::Value::Null);

        // resourceVersion in the patch makes the write conditional
        let patch = serde_json::json!({
            "metadata": { "resourceVersion": object.resource_version() },
            "status": status,
        });
        debug!("Writing status of {} {}/{}", K::kind(&()), namespace, name);
        Ok(self
            .api(namespace)
            .patch_status(&name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?)
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<(), ClientError> {
        debug!("Deleting {} {}/{}", K::kind(&()), namespace, name);
        self.api(namespace)
            .delete(name, &DeleteParams::default())
            .await?;
        Ok(())
    }
}
