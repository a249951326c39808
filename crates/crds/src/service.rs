//! Service CRD
//!
//! A deployed service of a System. Translated into a Deployment and a
//! headless Kubernetes Service.

use crate::component_build::ComponentBuildArtifacts;
use crate::definition::ServiceDefinition;
use crate::tree::NodePath;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(CustomResource, Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "lattice.mlab.com",
    version = "v1",
    kind = "Service",
    namespaced,
    status = "ServiceStatus",
    printcolumn = r#"{"name":"Path","type":"string","jsonPath":".spec.path"}"#,
    printcolumn = r#"{"name":"State","type":"string","jsonPath":".status.state"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ServiceSpec {
    /// Where the service sits in the system tree
    pub path: NodePath,

    pub definition: ServiceDefinition,

    /// Component name to the image built for it
    #[serde(default)]
    pub component_build_artifacts: BTreeMap<String, ComponentBuildArtifacts>,

    /// Component name to its ports and their envoy assignments
    #[serde(default)]
    pub ports: BTreeMap<String, Vec<ServiceComponentPort>>,

    pub envoy_admin_port: i32,
    pub envoy_egress_port: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ServiceComponentPort {
    pub name: String,
    pub port: i32,
    pub protocol: String,
    pub public: bool,
    /// Port envoy listens on in front of `port`
    pub envoy_port: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct ServiceStatus {
    pub state: ServiceState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "PascalCase")]
/// Rollout state of a Service
pub enum ServiceState {
    /// Deployment still converging
    #[default]
    RollingOut,
    /// Deployment fully available
    RolloutSucceeded,
    /// Deployment reported a replica failure
    RolloutFailed,
}

impl Service {
    #[must_use]
    pub fn state(&self) -> ServiceState {
        self.status.as_ref().map(|s| s.state).unwrap_or_default()
    }
}
