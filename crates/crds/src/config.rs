//! Config CRD
//!
//! Cluster-wide lattice configuration. A single instance named `global`
//! lives in the internal namespace; every field added later must be optional.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(CustomResource, Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Default)]
#[kube(
    group = "lattice.mlab.com",
    version = "v1",
    kind = "Config",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct ConfigSpec {
    /// Identifier of this lattice installation
    #[serde(default)]
    pub system_id: String,

    pub provider_config: ProviderConfig,

    pub component_build: ComponentBuildConfig,

    pub envoy: EnvoyConfig,

    /// Tenant to the URL of its system definition repository
    #[serde(default)]
    pub user_system: BTreeMap<String, UserSystemConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub terraform: Option<TerraformConfig>,
}

/// Exactly one provider is expected to be set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct ProviderConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local: Option<LocalProviderConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aws: Option<AwsProviderConfig>,
}

/// Which provider a cluster runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    /// Single-node local cluster
    Local,
    /// Amazon Web Services
    Aws,
}

impl ProviderConfig {
    /// The configured provider; a config with neither set is treated as local.
    #[must_use]
    pub fn kind(&self) -> ProviderKind {
        if self.aws.is_some() {
            ProviderKind::Aws
        } else {
            ProviderKind::Local
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct LocalProviderConfig {
    pub ip: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct AwsProviderConfig {
    pub region: String,
    pub account_id: String,
    pub vpc_id: String,
    #[serde(default)]
    pub subnet_ids: Vec<String>,
    pub master_node_security_group_id: String,
    pub base_node_ami_id: String,
    pub key_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct ComponentBuildConfig {
    pub docker_config: BuildDockerConfig,

    /// Image of the init container cloning the git repository
    pub pull_git_repo_image: String,

    /// Image of the container building the docker image
    pub build_docker_image: String,

    /// Image fetching registry credentials before a build on AWS
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub get_ecr_creds_image: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct BuildDockerConfig {
    pub registry: String,

    /// Give every build its own repository, tagged with a timestamp
    #[serde(default)]
    pub repository_per_image: bool,

    /// Shared repository used when `repository_per_image` is off
    #[serde(default)]
    pub repository: String,

    #[serde(default)]
    pub push: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct EnvoyConfig {
    pub prepare_image: String,
    pub image: String,
    pub redirect_cidr_block: String,
    pub xds_api_port: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Default)]
pub struct UserSystemConfig {
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct TerraformConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s3_backend: Option<TerraformS3Backend>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Default)]
pub struct TerraformS3Backend {
    pub bucket: String,
}
