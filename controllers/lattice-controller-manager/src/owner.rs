//! Owner references between parents and the children they create.
//!
//! Children point at their logical parent with a controller owner reference.
//! Events on a child enqueue the parent only if the reference still names the
//! cached parent: same kind, same name, same UID. A parent that was deleted and
//! recreated under the same name has a new UID, so stale children are dropped.

use crate::error::ControllerError;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::Resource;
use kube_runtime::reflector::{ObjectRef, Store};
use std::sync::Arc;
use tracing::warn;

/// Controller owner reference pointing at `owner`.
pub fn controller_owner_ref<K>(owner: &K) -> Result<OwnerReference, ControllerError>
where
    K: Resource<DynamicType = ()>,
{
    owner.controller_owner_ref(&()).ok_or_else(|| {
        ControllerError::MissingObject(format!(
            "{} {} has no name or uid yet",
            K::kind(&()),
            owner.meta().name.as_deref().unwrap_or("<unnamed>")
        ))
    })
}

/// The controller owner reference of an object, if any.
#[must_use]
pub fn controller_of(meta: &ObjectMeta) -> Option<&OwnerReference> {
    meta.owner_references
        .as_ref()?
        .iter()
        .find(|owner| owner.controller == Some(true))
}

/// Whether `meta` is controlled by the object with `uid`.
#[must_use]
pub fn is_controlled_by(meta: &ObjectMeta, uid: &str) -> bool {
    controller_of(meta).is_some_and(|owner| owner.uid == uid)
}

/// Children in `namespace` controlled by `parent`, sorted by name.
pub fn owned_children<P, C>(parent: &P, children: &Store<C>) -> Vec<Arc<C>>
where
    P: Resource,
    C: Resource + Clone + 'static,
    C::DynamicType: Eq + std::hash::Hash + Clone,
{
    let Some(uid) = parent.meta().uid.as_deref() else {
        return Vec::new();
    };
    let namespace = parent.meta().namespace.as_deref();
    let mut owned: Vec<Arc<C>> = children
        .state()
        .into_iter()
        .filter(|child| child.meta().namespace.as_deref() == namespace)
        .filter(|child| is_controlled_by(child.meta(), uid))
        .collect();
    owned.sort_by(|a, b| a.meta().name.cmp(&b.meta().name));
    owned
}

/// Resolve the parent of a child event against the parent cache.
///
/// Returns `None` (after logging) for orphans, foreign owners and stale
/// references.
pub fn resolve_owner<P>(child: &ObjectMeta, parents: &Store<P>) -> Option<ObjectRef<P>>
where
    P: Resource<DynamicType = ()> + Clone + 'static,
{
    let child_name = child.name.as_deref().unwrap_or("<unnamed>");
    let namespace = child.namespace.as_deref()?;

    let Some(owner) = controller_of(child) else {
        warn!("Ignoring orphaned child {}/{}", namespace, child_name);
        return None;
    };
    if owner.kind != P::kind(&()) || owner.api_version != P::api_version(&()) {
        // owned by some other kind; not ours to resolve
        return None;
    }

    let parent_ref = ObjectRef::new(&owner.name).within(namespace);
    let Some(parent) = parents.get(&parent_ref) else {
        warn!(
            "Ignoring child {}/{}: owner {} {} not found in cache",
            namespace, child_name, owner.kind, owner.name
        );
        return None;
    };
    if parent.meta().uid.as_deref() != Some(owner.uid.as_str()) {
        warn!(
            "Ignoring child {}/{}: owner {} {} has uid {:?}, reference has {}",
            namespace,
            child_name,
            owner.kind,
            owner.name,
            parent.meta().uid,
            owner.uid
        );
        return None;
    }
    Some(parent_ref)
}
