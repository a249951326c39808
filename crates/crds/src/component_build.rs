//! ComponentBuild CRD
//!
//! One attempt to turn a component's build definition into a docker image.

use crate::constants::COMPONENT_BUILD_DEFINITION_HASH_ANNOTATION;
use crate::definition::ComponentBuildDefinition;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "lattice.mlab.com",
    version = "v1",
    kind = "ComponentBuild",
    namespaced,
    status = "ComponentBuildStatus",
    shortname = "lcb",
    printcolumn = r#"{"name":"State","type":"string","jsonPath":".status.state"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ComponentBuildSpec {
    /// What to build
    pub definition_block: ComponentBuildDefinition,

    /// Filled in once the build succeeds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifacts: Option<ComponentBuildArtifacts>,
}

/// Output of a successful component build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct ComponentBuildArtifacts {
    /// Fully qualified image reference, `registry/repository:tag`
    pub docker_image_fqn: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct ComponentBuildStatus {
    pub state: ComponentBuildState,

    /// Reported by the builder while it runs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_observed_phase: Option<ComponentBuildPhase>,

    /// Reported by the builder when it fails
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_info: Option<ComponentBuildFailureInfo>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "PascalCase")]
/// Component build state
pub enum ComponentBuildState {
    /// Created, no Job yet
    #[default]
    Pending,
    /// Job created, no pod observed
    Queued,
    /// Job has pods
    Running,
    /// Image built
    Succeeded,
    /// Job failed
    Failed,
}

impl ComponentBuildState {
    /// Succeeded and Failed never change again.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "kebab-case")]
/// Phase reported by the builder
pub enum ComponentBuildPhase {
    PullingGitRepository,
    BuildingDockerImage,
    PushingDockerImage,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct ComponentBuildFailureInfo {
    pub message: String,

    /// Set when the failure was the platform's fault rather than the user's
    #[serde(default)]
    pub internal: bool,
}

impl ComponentBuild {
    /// State of the build, Pending when no status was written yet.
    #[must_use]
    pub fn state(&self) -> ComponentBuildState {
        self.status.as_ref().map(|s| s.state).unwrap_or_default()
    }

    /// Value of the definition hash annotation.
    #[must_use]
    pub fn definition_hash(&self) -> Option<&str> {
        self.metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(COMPONENT_BUILD_DEFINITION_HASH_ANNOTATION))
            .map(String::as_str)
    }
}
