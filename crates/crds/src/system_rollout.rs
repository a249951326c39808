//! SystemRollout CRD
//!
//! Requests that a tenant's running system move to the artifacts of a SystemBuild.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "lattice.mlab.com",
    version = "v1",
    kind = "SystemRollout",
    namespaced,
    status = "SystemRolloutStatus",
    printcolumn = r#"{"name":"Build","type":"string","jsonPath":".spec.buildName"}"#,
    printcolumn = r#"{"name":"State","type":"string","jsonPath":".status.state"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct SystemRolloutSpec {
    /// Tenant whose system is rolled out
    pub lattice_namespace: String,

    /// SystemBuild providing the artifacts
    pub build_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct SystemRolloutStatus {
    pub state: SystemRolloutState,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "PascalCase")]
/// Rollout state
pub enum SystemRolloutState {
    /// Waiting for the tenant's lifecycle lock
    #[default]
    Pending,
    /// Holds the lock, waiting for its build
    Accepted,
    /// System spec written, waiting for it to roll out
    InProgress,
    Succeeded,
    Failed,
}

impl SystemRolloutState {
    /// Succeeded and Failed never change again.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

impl SystemRollout {
    #[must_use]
    pub fn state(&self) -> SystemRolloutState {
        self.status.as_ref().map(|s| s.state).unwrap_or_default()
    }
}
