//! SystemRollout and SystemTeardown reconcilers
//!
//! Lifecycle actions change a tenant's System. They are serialized per
//! tenant through [`owning::OwningActions`]: an action must own the tenant
//! before it touches the System, and gives it up once it is done. A second
//! action arriving while the tenant is owned fails instead of queueing.

pub mod owning;
mod rollout;
mod teardown;

use super::Reconciler;
use crate::error::ControllerError;
use crds::{
    System, SystemBuild, SystemRollout, SystemRolloutState, SystemTeardown, SystemTeardownState,
};
use kube::Resource;
use kube_runtime::reflector::ObjectRef;
use owning::OwningAction;
use std::time::Duration;
use tracing::info;

/// How often a teardown checks on a System that is being deleted.
pub const TEARDOWN_REQUEUE: Duration = Duration::from_secs(30);

/// Status message of an action that found its tenant owned by `owner`.
pub(crate) fn lock_conflict_message(tenant: &str, owner: &OwningAction) -> String {
    format!(
        "unable to acquire lifecycle lock: tenant {} is owned by {} {}",
        tenant,
        owner.kind(),
        owner.name()
    )
}

fn action_ref<K>(object: &K) -> Option<(String, String)>
where
    K: Resource<DynamicType = ()>,
{
    Some((object.meta().namespace.clone()?, object.meta().name.clone()?))
}

impl Reconciler {
    /// Install the actions that were running before a restart as owners.
    ///
    /// Must run after the rollout and teardown caches have synced. Two
    /// actions owning the same tenant cannot be reconciled and abort startup.
    pub fn restore_owning_actions(&self) -> Result<usize, ControllerError> {
        let mut running: Vec<(String, OwningAction)> = Vec::new();

        for rollout in self.caches.rollouts.state() {
            // Accepted rollouts hold the lock as well
            if !matches!(
                rollout.state(),
                SystemRolloutState::Accepted | SystemRolloutState::InProgress
            ) {
                continue;
            }
            if let Some((namespace, name)) = action_ref(rollout.as_ref()) {
                running.push((
                    rollout.spec.lattice_namespace.clone(),
                    OwningAction::rollout(namespace, name),
                ));
            }
        }
        for teardown in self.caches.teardowns.state() {
            if teardown.state() != SystemTeardownState::InProgress {
                continue;
            }
            if let Some((namespace, name)) = action_ref(teardown.as_ref()) {
                running.push((
                    teardown.spec.lattice_namespace.clone(),
                    OwningAction::teardown(namespace, name),
                ));
            }
        }
        running.sort_by(|a, b| (&a.0, a.1.name()).cmp(&(&b.0, b.1.name())));

        for (tenant, action) in &running {
            if let Err(owner) = self.owning.claim(tenant, action) {
                return Err(ControllerError::Invariant(format!(
                    "tenant {tenant} is owned by both {owner} and {action}"
                )));
            }
            info!("Restored {} as owner of tenant {}", action, tenant);
        }
        Ok(running.len())
    }

    /// The rollout owning `tenant`, if the owner is a rollout.
    #[must_use]
    pub fn rollout_for_tenant(&self, tenant: &str) -> Option<ObjectRef<SystemRollout>> {
        match self.owning.owner(tenant)? {
            OwningAction::Rollout { namespace, name } => {
                Some(ObjectRef::new(&name).within(&namespace))
            }
            OwningAction::Teardown { .. } => None,
        }
    }

    /// The teardown owning `tenant`, if the owner is a teardown.
    #[must_use]
    pub fn teardown_for_tenant(&self, tenant: &str) -> Option<ObjectRef<SystemTeardown>> {
        match self.owning.owner(tenant)? {
            OwningAction::Teardown { namespace, name } => {
                Some(ObjectRef::new(&name).within(&namespace))
            }
            OwningAction::Rollout { .. } => None,
        }
    }

    /// The System of `tenant`: named after it, in its namespace. The API is
    /// asked when the cache has not caught up.
    pub(crate) async fn tenant_system(&self, tenant: &str) -> Result<Option<System>, ControllerError> {
        if let Some(system) = self
            .caches
            .systems
            .get(&ObjectRef::new(tenant).within(tenant))
        {
            return Ok(Some(system.as_ref().clone()));
        }
        Ok(self.clients.systems.get(tenant, tenant).await?)
    }
}

/// Tenant of a System event.
#[must_use]
pub fn system_tenant(system: &System) -> Option<String> {
    system.metadata.name.clone()
}

/// Tenant of a SystemBuild event.
#[must_use]
pub fn system_build_tenant(build: &SystemBuild) -> String {
    build.spec.lattice_namespace.clone()
}
