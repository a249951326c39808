//! SystemTeardown CRD
//!
//! Requests that a tenant's running system be removed.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "lattice.mlab.com",
    version = "v1",
    kind = "SystemTeardown",
    namespaced,
    status = "SystemTeardownStatus",
    shortname = "lsyst",
    printcolumn = r#"{"name":"State","type":"string","jsonPath":".status.state"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct SystemTeardownSpec {
    /// Tenant whose system is removed
    pub lattice_namespace: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct SystemTeardownStatus {
    pub state: SystemTeardownState,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "PascalCase")]
/// Teardown state
pub enum SystemTeardownState {
    #[default]
    Pending,
    InProgress,
    Succeeded,
    Failed,
}

impl SystemTeardownState {
    /// Succeeded and Failed never change again.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

impl SystemTeardown {
    #[must_use]
    pub fn state(&self) -> SystemTeardownState {
        self.status.as_ref().map(|s| s.state).unwrap_or_default()
    }
}
