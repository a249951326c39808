//! Per-tenant lifecycle lock.
//!
//! Rollouts and teardowns of one tenant must not interleave. Each tenant is
//! owned by at most one action at a time; an action claims the tenant before
//! it touches the System and releases it when it reaches a terminal state.

use std::collections::HashMap;
use std::fmt;
use std::sync::{PoisonError, RwLock};

/// A lifecycle action, identified by namespace and name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum OwningAction {
    Rollout { namespace: String, name: String },
    Teardown { namespace: String, name: String },
}

impl OwningAction {
    pub fn rollout(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self::Rollout {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn teardown(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self::Teardown {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Kind of the resource behind the action.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Rollout { .. } => "SystemRollout",
            Self::Teardown { .. } => "SystemTeardown",
        }
    }

    #[must_use]
    pub fn namespace(&self) -> &str {
        match self {
            Self::Rollout { namespace, .. } | Self::Teardown { namespace, .. } => namespace,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Rollout { name, .. } | Self::Teardown { name, .. } => name,
        }
    }
}

impl fmt::Display for OwningAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}/{}", self.kind(), self.namespace(), self.name())
    }
}

/// Tenant to the action currently owning it.
#[derive(Debug, Default)]
pub struct OwningActions {
    owners: RwLock<HashMap<String, OwningAction>>,
}

impl OwningActions {
    /// Make `action` the owner of `tenant`.
    ///
    /// Claiming again with the same action succeeds. If another action owns
    /// the tenant, that action is returned.
    pub fn claim(&self, tenant: &str, action: &OwningAction) -> Result<(), OwningAction> {
        let mut owners = self.owners.write().unwrap_or_else(PoisonError::into_inner);
        match owners.get(tenant) {
            Some(owner) if owner != action => Err(owner.clone()),
            Some(_) => Ok(()),
            None => {
                owners.insert(tenant.to_string(), action.clone());
                Ok(())
            }
        }
    }

    /// Give up `tenant` if `action` owns it. Returns whether anything was released.
    pub fn release(&self, tenant: &str, action: &OwningAction) -> bool {
        let mut owners = self.owners.write().unwrap_or_else(PoisonError::into_inner);
        if owners.get(tenant) == Some(action) {
            owners.remove(tenant);
            true
        } else {
            false
        }
    }

    /// The action owning `tenant`, if any.
    #[must_use]
    pub fn owner(&self, tenant: &str) -> Option<OwningAction> {
        self.owners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(tenant)
            .cloned()
    }
}
