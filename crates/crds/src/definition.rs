//! System definition tree
//!
//! The declarative description users submit: a tree of systems whose leaves
//! are services, each made of components that are built from source.

use crate::error::DefinitionError;
use crate::tree::NodePath;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A system: a named subtree of systems and services.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct SystemDefinition {
    /// Name of this node; ignored for the root
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Child systems and services
    #[serde(default)]
    pub subsystems: Vec<DefinitionNode>,
}

/// A child of a system.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum DefinitionNode {
    /// Nested system
    System(SystemDefinition),
    /// Leaf service
    Service(ServiceDefinition),
}

impl DefinitionNode {
    fn name(&self) -> &str {
        match self {
            Self::System(system) => &system.name,
            Self::Service(service) => &service.name,
        }
    }
}

impl SystemDefinition {
    /// Every service in the tree, keyed by its path. The root is `/`.
    pub fn services(&self) -> Result<BTreeMap<NodePath, ServiceDefinition>, DefinitionError> {
        let mut services = BTreeMap::new();
        let mut seen = std::collections::BTreeSet::new();
        collect_services(self, &NodePath::root(), &mut services, &mut seen)?;
        Ok(services)
    }
}

fn collect_services(
    system: &SystemDefinition,
    path: &NodePath,
    services: &mut BTreeMap<NodePath, ServiceDefinition>,
    seen: &mut std::collections::BTreeSet<NodePath>,
) -> Result<(), DefinitionError> {
    for node in &system.subsystems {
        let child = NodePath::new(path.child(node.name()).as_str())?;
        if !seen.insert(child.clone()) {
            return Err(DefinitionError::DuplicatePath(child.to_string()));
        }
        match node {
            DefinitionNode::System(subsystem) => {
                collect_services(subsystem, &child, services, seen)?;
            }
            DefinitionNode::Service(service) => {
                services.insert(child, service.clone());
            }
        }
    }
    Ok(())
}

/// A deployable service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct ServiceDefinition {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Containers making up the service
    #[serde(default)]
    pub components: Vec<Component>,

    #[serde(default)]
    pub resources: ServiceResources,
}

impl ServiceDefinition {
    /// Looks up a component by name.
    #[must_use]
    pub fn component(&self, name: &str) -> Option<&Component> {
        self.components.iter().find(|c| c.name == name)
    }
}

/// Instance sizing for a service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct ServiceResources {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_instances: Option<i32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_instances: Option<i32>,

    /// Fixed instance count; wins over `min_instances`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_instances: Option<i32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_type: Option<String>,
}

impl ServiceResources {
    /// Replica count a Deployment should run.
    #[must_use]
    pub fn replicas(&self) -> i32 {
        self.num_instances.or(self.min_instances).unwrap_or(1)
    }
}

/// One container of a service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct Component {
    pub name: String,

    /// Run to completion before the other components start
    #[serde(default)]
    pub init: bool,

    #[serde(default)]
    pub ports: Vec<ComponentPortDefinition>,

    pub build: ComponentBuildDefinition,

    #[serde(default)]
    pub exec: ComponentExec,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_check: Option<HealthCheck>,
}

/// A port a component listens on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ComponentPortDefinition {
    pub name: String,
    pub port: i32,
    pub protocol: PortProtocol,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_access: Option<ExternalAccess>,
}

impl ComponentPortDefinition {
    /// Whether the port is exposed outside the system.
    #[must_use]
    pub fn is_public(&self) -> bool {
        self.external_access.as_ref().is_some_and(|a| a.public)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum PortProtocol {
    #[default]
    Http,
    Tcp,
}

impl PortProtocol {
    /// Wire name of the protocol.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Http => "HTTP",
            Self::Tcp => "TCP",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Default)]
pub struct ExternalAccess {
    pub public: bool,
}

/// How a component is started.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct ComponentExec {
    #[serde(default)]
    pub command: Vec<String>,

    #[serde(default)]
    pub environment: BTreeMap<String, String>,
}

/// Liveness check for a component. At most one variant should be set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheck {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exec: Option<ExecHealthCheck>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http: Option<HttpHealthCheck>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tcp: Option<TcpHealthCheck>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Default)]
pub struct ExecHealthCheck {
    pub command: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Default)]
pub struct HttpHealthCheck {
    pub path: String,
    /// Name of one of the component's ports
    pub port: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Default)]
pub struct TcpHealthCheck {
    /// Name of one of the component's ports
    pub port: String,
}

/// The build definition block of a component. Builds are pure functions of this
/// value, so its hash identifies a build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct ComponentBuildDefinition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_repository: Option<GitRepository>,

    /// Base language image, e.g. `node:6`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,

    /// Base docker image; used when `language` is unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub docker_image: Option<DockerImage>,

    /// Build command run inside the base image
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
}

impl ComponentBuildDefinition {
    /// Image the build starts from.
    #[must_use]
    pub fn base_image(&self) -> Option<String> {
        if let Some(language) = &self.language {
            return Some(language.clone());
        }
        self.docker_image.as_ref().map(DockerImage::fqn)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct GitRepository {
    pub url: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
}

impl GitRepository {
    /// Ref to check out; a commit wins over a tag.
    #[must_use]
    pub fn checkout_target(&self) -> Option<&str> {
        self.commit.as_deref().or(self.tag.as_deref())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct DockerImage {
    #[serde(default)]
    pub registry: String,
    pub repository: String,
    pub tag: String,
}

impl DockerImage {
    /// `registry/repository:tag`, or `repository:tag` without a registry.
    #[must_use]
    pub fn fqn(&self) -> String {
        if self.registry.is_empty() {
            format!("{}:{}", self.repository, self.tag)
        } else {
            format!("{}/{}:{}", self.registry, self.repository, self.tag)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service(name: &str) -> DefinitionNode {
        DefinitionNode::Service(ServiceDefinition {
            name: name.to_string(),
            ..Default::default()
        })
    }

    #[test]
    fn test_services_walks_nested_systems() {
        let definition = SystemDefinition {
            name: "root".to_string(),
            description: None,
            subsystems: vec![
                service("api"),
                DefinitionNode::System(SystemDefinition {
                    name: "data".to_string(),
                    description: None,
                    subsystems: vec![service("db"), service("cache")],
                }),
            ],
        };

        let services = definition.services().unwrap();
        let paths: Vec<_> = services.keys().map(NodePath::as_str).collect();
        assert_eq!(paths, vec!["/api", "/data/cache", "/data/db"]);
    }

    #[test]
    fn test_services_rejects_duplicate_paths() {
        let definition = SystemDefinition {
            name: "root".to_string(),
            description: None,
            subsystems: vec![service("api"), service("api")],
        };
        assert_eq!(
            definition.services(),
            Err(DefinitionError::DuplicatePath("/api".to_string()))
        );
    }

    #[test]
    fn test_node_type_tag_round_trips() {
        let json = serde_json::json!({
            "name": "",
            "subsystems": [
                {"type": "service", "name": "api", "components": []},
                {"type": "system", "name": "inner", "subsystems": []}
            ]
        });
        let definition: SystemDefinition = serde_json::from_value(json).unwrap();
        assert!(matches!(definition.subsystems[0], DefinitionNode::Service(_)));
        assert!(matches!(definition.subsystems[1], DefinitionNode::System(_)));
    }

    #[test]
    fn test_checkout_target_prefers_commit() {
        let repo = GitRepository {
            url: "https://example.com/r.git".to_string(),
            commit: Some("c1".to_string()),
            tag: Some("v1".to_string()),
        };
        assert_eq!(repo.checkout_target(), Some("c1"));
    }

    #[test]
    fn test_base_image_prefers_language() {
        let mut build = ComponentBuildDefinition {
            docker_image: Some(DockerImage {
                registry: "reg".to_string(),
                repository: "base".to_string(),
                tag: "1".to_string(),
            }),
            ..Default::default()
        };
        assert_eq!(build.base_image().as_deref(), Some("reg/base:1"));
        build.language = Some("node:6".to_string());
        assert_eq!(build.base_image().as_deref(), Some("node:6"));
    }

    #[test]
    fn test_replicas_fall_back_to_min_then_one() {
        let mut resources = ServiceResources::default();
        assert_eq!(resources.replicas(), 1);
        resources.min_instances = Some(2);
        assert_eq!(resources.replicas(), 2);
        resources.num_instances = Some(3);
        assert_eq!(resources.replicas(), 3);
    }
}
