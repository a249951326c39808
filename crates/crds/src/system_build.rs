//! SystemBuild CRD
//!
//! Builds every service of a system definition at one version.

use crate::component_build::{ComponentBuildFailureInfo, ComponentBuildPhase, ComponentBuildState};
use crate::definition::{ServiceDefinition, SystemDefinition};
use crate::service_build::BuildState;
use crate::tree::NodePath;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(CustomResource, Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "lattice.mlab.com",
    version = "v1",
    kind = "SystemBuild",
    namespaced,
    status = "SystemBuildStatus",
    shortname = "lsysb",
    printcolumn = r#"{"name":"State","type":"string","jsonPath":".status.state"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct SystemBuildSpec {
    /// Tenant the build belongs to
    pub lattice_namespace: String,

    /// The tree is recursive, so the schema leaves it unchecked
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub definition: SystemDefinition,

    /// Service path to build info
    #[serde(default)]
    pub services: BTreeMap<NodePath, SystemBuildServiceInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct SystemBuildServiceInfo {
    pub definition: ServiceDefinition,

    /// ServiceBuild building this service
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_state: Option<BuildState>,

    /// Mirrored from the ServiceBuild
    #[serde(default)]
    pub components: BTreeMap<String, SystemBuildComponentInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct SystemBuildComponentInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_state: Option<ComponentBuildState>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_observed_phase: Option<ComponentBuildPhase>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_info: Option<ComponentBuildFailureInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct SystemBuildStatus {
    pub state: BuildState,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl SystemBuild {
    #[must_use]
    pub fn state(&self) -> BuildState {
        self.status.as_ref().map(|s| s.state).unwrap_or_default()
    }
}

pub(crate) fn preserve_unknown_fields(_: &mut schemars::SchemaGenerator) -> schemars::Schema {
    schemars::json_schema!({
        "type": "object",
        "x-kubernetes-preserve-unknown-fields": true
    })
}
