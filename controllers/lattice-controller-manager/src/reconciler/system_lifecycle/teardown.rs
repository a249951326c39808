//! SystemTeardown state machine: Pending, InProgress, then Succeeded or Failed.
//!
//! A teardown only deletes the System. The System controller drains its
//! Services and drops the finalizer; the teardown succeeds once the System
//! is gone.

use super::owning::OwningAction;
use super::{TEARDOWN_REQUEUE, lock_conflict_message};
use crate::error::ControllerError;
use crate::reconciler::{Reconciler, ignore_not_found, name_and_namespace};
use crds::{SystemTeardown, SystemTeardownState, SystemTeardownStatus};
use kube_runtime::controller::Action;
use tracing::{debug, info};

impl Reconciler {
    pub async fn reconcile_system_teardown(
        &self,
        teardown: &SystemTeardown,
    ) -> Result<Action, ControllerError> {
        let (name, namespace) = name_and_namespace(teardown)?;
        let tenant = teardown.spec.lattice_namespace.as_str();
        let action = OwningAction::teardown(&namespace, &name);

        let teardown = match teardown.state() {
            state if state.is_terminal() => {
                debug!("SystemTeardown {}/{} is {:?}, nothing to do", namespace, name, state);
                return Ok(Action::await_change());
            }
            state => {
                if let Err(owner) = self.owning.claim(tenant, &action) {
                    self.update_teardown_status(
                        teardown,
                        SystemTeardownState::Failed,
                        Some(lock_conflict_message(tenant, &owner)),
                    )
                    .await?;
                    return Ok(Action::await_change());
                }
                if state == SystemTeardownState::Pending {
                    self.update_teardown_status(teardown, SystemTeardownState::InProgress, None)
                        .await?
                } else {
                    teardown.clone()
                }
            }
        };

        let Some(system) = self.tenant_system(tenant).await? else {
            self.update_teardown_status(&teardown, SystemTeardownState::Succeeded, None)
                .await?;
            self.owning.release(tenant, &action);
            return Ok(Action::await_change());
        };

        if system.metadata.deletion_timestamp.is_none() {
            ignore_not_found(self.clients.systems.delete(tenant, tenant).await)?;
            info!("Deleting System {} for {}", tenant, action);
        } else {
            debug!("System {} is still being deleted", tenant);
        }
        Ok(Action::requeue(TEARDOWN_REQUEUE))
    }

    async fn update_teardown_status(
        &self,
        teardown: &SystemTeardown,
        state: SystemTeardownState,
        message: Option<String>,
    ) -> Result<SystemTeardown, ControllerError> {
        let desired = SystemTeardownStatus { state, message };
        if teardown.status.as_ref() == Some(&desired) {
            return Ok(teardown.clone());
        }

        let (name, namespace) = name_and_namespace(teardown)?;
        info!(
            "SystemTeardown {}/{}: {:?} -> {:?}",
            namespace,
            name,
            teardown.state(),
            state
        );
        let mut updated = teardown.clone();
        updated.status = Some(desired);
        Ok(self
            .clients
            .teardowns
            .replace_status(&namespace, &updated)
            .await?)
    }
}
