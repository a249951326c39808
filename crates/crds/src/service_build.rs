//! ServiceBuild CRD
//!
//! Builds every component of one service, sharing ComponentBuilds with other
//! service builds that ask for the same definition.

use crate::component_build::{ComponentBuildFailureInfo, ComponentBuildPhase, ComponentBuildState};
use crate::definition::ComponentBuildDefinition;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(CustomResource, Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema, Default)]
#[kube(
    group = "lattice.mlab.com",
    version = "v1",
    kind = "ServiceBuild",
    namespaced,
    status = "ServiceBuildStatus",
    printcolumn = r#"{"name":"State","type":"string","jsonPath":".status.state"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ServiceBuildSpec {
    /// Component name to build info
    #[serde(default)]
    pub components: BTreeMap<String, ServiceBuildComponentInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct ServiceBuildComponentInfo {
    pub definition_block: ComponentBuildDefinition,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub definition_hash: Option<String>,

    /// ComponentBuild building this component
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_name: Option<String>,

    /// Last state observed on the ComponentBuild
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_state: Option<ComponentBuildState>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_observed_phase: Option<ComponentBuildPhase>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_info: Option<ComponentBuildFailureInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct ServiceBuildStatus {
    pub state: BuildState,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "PascalCase")]
/// State shared by ServiceBuild and SystemBuild
pub enum BuildState {
    /// No children observed yet
    #[default]
    Pending,
    /// Some children still building
    Running,
    /// All children succeeded
    Succeeded,
    /// A child failed
    Failed,
}

impl BuildState {
    /// Succeeded and Failed never change again.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

impl ServiceBuild {
    #[must_use]
    pub fn state(&self) -> BuildState {
        self.status.as_ref().map(|s| s.state).unwrap_or_default()
    }
}
