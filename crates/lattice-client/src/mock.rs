//! Mock ResourceClient for unit testing
//!
//! Stores objects in memory and behaves like the API server where the
//! controllers depend on it:
//! - create assigns a uid and resource version and drops the status;
//! - replace keeps the stored status, replace_status keeps everything else;
//! - writes with a stale resource version fail with a conflict;
//! - deleting an object with finalizers only sets its deletion timestamp, and
//!   the object disappears once a replace empties its finalizers.
//!
//! Every write is recorded so tests can assert a reconcile was a no-op.

use crate::error::ClientError;
use crate::resource_trait::{ResourceClient, object_name};
use kube::Resource;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// A write observed by the mock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockWrite {
    Create { namespace: String, name: String },
    Replace { namespace: String, name: String },
    ReplaceStatus { namespace: String, name: String },
    Delete { namespace: String, name: String },
}

impl MockWrite {
    /// Name of the written object.
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Create { name, .. }
            | Self::Replace { name, .. }
            | Self::ReplaceStatus { name, .. }
            | Self::Delete { name, .. } => name,
        }
    }
}

struct MockState<K> {
    objects: BTreeMap<(String, String), K>,
    next_resource_version: u64,
    writes: Vec<MockWrite>,
    conflict_next_write: bool,
}

/// In-memory [`ResourceClient`].
#[derive(Clone)]
pub struct MockResourceClient<K> {
    state: Arc<Mutex<MockState<K>>>,
    yield_on_create: Arc<AtomicBool>,
}

impl<K> fmt::Debug for MockResourceClient<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockResourceClient")
            .field("kind", &std::any::type_name::<K>())
            .finish_non_exhaustive()
    }
}

impl<K> Default for MockResourceClient<K> {
    fn default() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState {
                objects: BTreeMap::new(),
                next_resource_version: 1,
                writes: Vec::new(),
                conflict_next_write: false,
            })),
            yield_on_create: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl<K> MockResourceClient<K>
where
    K: Resource<DynamicType = ()> + Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Create an empty mock
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MockState<K>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert an object as-is, status included (for test setup).
    ///
    /// A missing uid or resource version is filled in.
    pub fn seed(&self, mut object: K) -> K {
        let mut state = self.lock();
        let namespace = object.meta().namespace.clone().unwrap_or_default();
        let name = object.meta().name.clone().unwrap_or_default();
        let meta = object.meta_mut();
        if meta.uid.is_none() {
            meta.uid = Some(uuid::Uuid::new_v4().to_string());
        }
        meta.resource_version = Some(state.next_resource_version.to_string());
        state.next_resource_version += 1;
        state.objects.insert((namespace, name), object.clone());
        object
    }

    /// Current copy of an object.
    #[must_use]
    pub fn object(&self, namespace: &str, name: &str) -> Option<K> {
        self.lock()
            .objects
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    /// Every stored object, ordered by namespace and name.
    #[must_use]
    pub fn objects(&self) -> Vec<K> {
        self.lock().objects.values().cloned().collect()
    }

    /// Mutate a stored object in place, bumping its resource version
    /// (for test setup, e.g. to play the role of another writer).
    pub fn update(&self, namespace: &str, name: &str, f: impl FnOnce(&mut K)) -> Option<K> {
        let mut state = self.lock();
        let version = state.next_resource_version;
        let object = state
            .objects
            .get_mut(&(namespace.to_string(), name.to_string()))?;
        f(object);
        object.meta_mut().resource_version = Some(version.to_string());
        let updated = object.clone();
        state.next_resource_version += 1;
        Some(updated)
    }

    /// Remove an object regardless of finalizers (for test setup).
    pub fn remove(&self, namespace: &str, name: &str) -> Option<K> {
        self.lock()
            .objects
            .remove(&(namespace.to_string(), name.to_string()))
    }

    /// Writes recorded since creation or the last [`Self::clear_writes`].
    #[must_use]
    pub fn writes(&self) -> Vec<MockWrite> {
        self.lock().writes.clone()
    }

    /// Forget recorded writes.
    pub fn clear_writes(&self) {
        self.lock().writes.clear();
    }

    /// Make the next write fail with a conflict.
    pub fn conflict_next_write(&self) {
        self.lock().conflict_next_write = true;
    }

    /// Yield to the runtime before every create, so concurrent callers interleave.
    pub fn set_yield_on_create(&self, enabled: bool) {
        self.yield_on_create.store(enabled, Ordering::SeqCst);
    }

    fn take_conflict(state: &mut MockState<K>, name: &str) -> Result<(), ClientError> {
        if std::mem::take(&mut state.conflict_next_write) {
            return Err(ClientError::Conflict(format!("injected conflict on {name}")));
        }
        Ok(())
    }

    fn check_version(stored: &K, object: &K, name: &str) -> Result<(), ClientError> {
        match &object.meta().resource_version {
            Some(version) if Some(version) != stored.meta().resource_version.as_ref() => Err(
                ClientError::Conflict(format!(
                    "{name}: resource version {version} is stale"
                )),
            ),
            _ => Ok(()),
        }
    }
}

/// Copies the `status` of `source` onto `target`.
fn with_status_of<K: Serialize + DeserializeOwned>(target: &K, source: &K) -> Result<K, ClientError> {
    let mut value = serde_json::to_value(target)?;
    let status = serde_json::to_value(source)?.get("status").cloned();
    if let Some(map) = value.as_object_mut() {
        match status {
            Some(status) => {
                map.insert("status".to_string(), status);
            }
            None => {
                map.remove("status");
            }
        }
    }
    Ok(serde_json::from_value(value)?)
}

fn without_status<K: Serialize + DeserializeOwned>(object: &K) -> Result<K, ClientError> {
    let mut value = serde_json::to_value(object)?;
    if let Some(map) = value.as_object_mut() {
        map.remove("status");
    }
    Ok(serde_json::from_value(value)?)
}

fn with_deletion_timestamp<K: Serialize + DeserializeOwned>(object: &K) -> Result<K, ClientError> {
    let mut value = serde_json::to_value(object)?;
    value["metadata"]["deletionTimestamp"] = serde_json::Value::String(
        chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
    );
    Ok(serde_json::from_value(value)?)
}

fn has_finalizers<K: Resource>(object: &K) -> bool {
    object
        .meta()
        .finalizers
        .as_ref()
        .is_some_and(|f| !f.is_empty())
}

#[async_trait::async_trait]
impl<K> ResourceClient<K> for MockResourceClient<K>
where
    K: Resource<DynamicType = ()> + Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<K>, ClientError> {
        Ok(self.object(namespace, name))
    }

    async fn list(&self, namespace: &str) -> Result<Vec<K>, ClientError> {
        Ok(self
            .lock()
            .objects
            .iter()
            .filter(|((ns, _), _)| ns == namespace)
            .map(|(_, object)| object.clone())
            .collect())
    }

    async fn create(&self, namespace: &str, object: &K) -> Result<K, ClientError> {
        if self.yield_on_create.load(Ordering::SeqCst) {
            tokio::task::yield_now().await;
        }

        let name = object_name(object)?;
        let mut created = without_status(object)?;
        let mut state = self.lock();
        Self::take_conflict(&mut state, &name)?;

        let key = (namespace.to_string(), name.clone());
        if state.objects.contains_key(&key) {
            return Err(ClientError::AlreadyExists(format!(
                "{} {namespace}/{name} already exists",
                K::kind(&())
            )));
        }

        let meta = created.meta_mut();
        meta.namespace = Some(namespace.to_string());
        meta.uid = Some(uuid::Uuid::new_v4().to_string());
        meta.resource_version = Some(state.next_resource_version.to_string());
        meta.deletion_timestamp = None;
        state.next_resource_version += 1;

        state.objects.insert(key, created.clone());
        state.writes.push(MockWrite::Create {
            namespace: namespace.to_string(),
            name,
        });
        Ok(created)
    }

    async fn replace(&self, namespace: &str, object: &K) -> Result<K, ClientError> {
        let name = object_name(object)?;
        let mut state = self.lock();
        Self::take_conflict(&mut state, &name)?;

        let key = (namespace.to_string(), name.clone());
        let stored = state
            .objects
            .get(&key)
            .cloned()
            .ok_or_else(|| ClientError::NotFound(format!("{namespace}/{name}")))?;
        Self::check_version(&stored, object, &name)?;

        let mut replaced = with_status_of(object, &stored)?;
        let meta = replaced.meta_mut();
        meta.namespace = Some(namespace.to_string());
        meta.uid.clone_from(&stored.meta().uid);
        meta.deletion_timestamp.clone_from(&stored.meta().deletion_timestamp);
        meta.resource_version = Some(state.next_resource_version.to_string());
        state.next_resource_version += 1;

        state.writes.push(MockWrite::Replace {
            namespace: namespace.to_string(),
            name,
        });
        if replaced.meta().deletion_timestamp.is_some() && !has_finalizers(&replaced) {
            state.objects.remove(&key);
        } else {
            state.objects.insert(key, replaced.clone());
        }
        Ok(replaced)
    }

    async fn replace_status(&self, namespace: &str, object: &K) -> Result<K, ClientError> {
        let name = object_name(object)?;
        let mut state = self.lock();
        Self::take_conflict(&mut state, &name)?;

        let key = (namespace.to_string(), name.clone());
        let stored = state
            .objects
            .get(&key)
            .cloned()
            .ok_or_else(|| ClientError::NotFound(format!("{namespace}/{name}")))?;
        Self::check_version(&stored, object, &name)?;

        let mut updated = with_status_of(&stored, object)?;
        updated.meta_mut().resource_version = Some(state.next_resource_version.to_string());
        state.next_resource_version += 1;

        state.objects.insert(key, updated.clone());
        state.writes.push(MockWrite::ReplaceStatus {
            namespace: namespace.to_string(),
            name,
        });
        Ok(updated)
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<(), ClientError> {
        let mut state = self.lock();
        Self::take_conflict(&mut state, name)?;

        let key = (namespace.to_string(), name.to_string());
        let stored = state
            .objects
            .get(&key)
            .cloned()
            .ok_or_else(|| ClientError::NotFound(format!("{namespace}/{name}")))?;

        if has_finalizers(&stored) {
            if stored.meta().deletion_timestamp.is_none() {
                let mut marked = with_deletion_timestamp(&stored)?;
                marked.meta_mut().resource_version =
                    Some(state.next_resource_version.to_string());
                state.next_resource_version += 1;
                state.objects.insert(key, marked);
            }
        } else {
            state.objects.remove(&key);
        }

        state.writes.push(MockWrite::Delete {
            namespace: namespace.to_string(),
            name: name.to_string(),
        });
        Ok(())
    }
}
