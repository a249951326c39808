//! ResourceClient trait for mocking
//!
//! This trait abstracts namespaced CRUD on one resource kind so reconcilers
//! can run against the Kubernetes API or an in-memory mock.

use crate::error::ClientError;
use kube::Resource;
use std::sync::Arc;

/// Namespaced CRUD on a single resource kind.
///
/// All writes carry the object's `resourceVersion`; a stale one fails with
/// [`ClientError::Conflict`].
#[async_trait::async_trait]
pub trait ResourceClient<K>: Send + Sync
where
    K: Clone + Send + Sync + 'static,
{
    /// Fetch an object; `Ok(None)` when it does not exist.
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<K>, ClientError>;

    /// List every object in a namespace.
    async fn list(&self, namespace: &str) -> Result<Vec<K>, ClientError>;

    /// Create an object. The status, if any, is ignored.
    async fn create(&self, namespace: &str, object: &K) -> Result<K, ClientError>;

    /// Replace an object's metadata and spec. The status is left untouched.
    async fn replace(&self, namespace: &str, object: &K) -> Result<K, ClientError>;

    /// Write an object's status. Everything else is left untouched.
    async fn replace_status(&self, namespace: &str, object: &K) -> Result<K, ClientError>;

    /// Delete an object. Objects with finalizers only get a deletion timestamp.
    async fn delete(&self, namespace: &str, name: &str) -> Result<(), ClientError>;
}

/// Client shared between reconcilers.
pub type SharedClient<K> = Arc<dyn ResourceClient<K>>;

/// Name of an object, or [`ClientError::InvalidObject`] when it has none.
pub fn object_name<K: Resource<DynamicType = ()>>(object: &K) -> Result<String, ClientError> {
    object
        .meta()
        .name
        .clone()
        .ok_or_else(|| ClientError::InvalidObject(format!("{} without a name", K::kind(&()))))
}
