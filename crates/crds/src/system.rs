//! System CRD
//!
//! The running system of one tenant. Named after the tenant and living in
//! the tenant's namespace.

use crate::component_build::ComponentBuildArtifacts;
use crate::definition::ServiceDefinition;
use crate::service::ServiceState;
use crate::tree::NodePath;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(CustomResource, Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema, Default)]
#[kube(
    group = "lattice.mlab.com",
    version = "v1",
    kind = "System",
    namespaced,
    status = "SystemStatus",
    shortname = "lsys",
    printcolumn = r#"{"name":"State","type":"string","jsonPath":".status.state"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct SystemSpec {
    /// Service path to the service that should run there
    #[serde(default)]
    pub services: BTreeMap<NodePath, SystemServiceInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct SystemServiceInfo {
    pub definition: ServiceDefinition,

    #[serde(default)]
    pub component_build_artifacts: BTreeMap<String, ComponentBuildArtifacts>,

    /// Service resource running this path
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_state: Option<ServiceState>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct SystemStatus {
    pub state: SystemState,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "PascalCase")]
/// Aggregate rollout state of a System
pub enum SystemState {
    /// Some service is still rolling out
    #[default]
    RollingOut,
    /// Every service rolled out
    RolloutSucceeded,
    /// Some service failed to roll out
    RolloutFailed,
}

impl System {
    #[must_use]
    pub fn state(&self) -> SystemState {
        self.status.as_ref().map(|s| s.state).unwrap_or_default()
    }
}
