//! Well-known names shared between the controllers and the CRDs.

/// API group of every lattice custom resource.
pub const API_GROUP: &str = "lattice.mlab.com";

/// API version of every lattice custom resource.
pub const API_VERSION: &str = "v1";

/// Annotation carrying the hash of a ComponentBuild's definition block.
pub const COMPONENT_BUILD_DEFINITION_HASH_ANNOTATION: &str = "component-build-definition-hash";

/// Annotation on a build Job carrying the image the builder will produce.
pub const JOB_DOCKER_IMAGE_FQN_ANNOTATION: &str = "docker-image-fqn";

/// Label placed on every build Job.
pub const COMPONENT_BUILD_JOB_LABEL: &str = "lattice.mlab.com/component-build";

/// Annotation on a ServiceBuild naming the service path it builds.
pub const SERVICE_BUILD_PATH_ANNOTATION: &str = "lattice.mlab.com/service-path";

/// Label selecting the pods of a Service's Deployment.
pub const SERVICE_DEPLOYMENT_LABEL: &str = "lattice.mlab.com/service-deployment";

/// Annotation on a Deployment holding the JSON of the definition it was built from.
pub const SERVICE_DEFINITION_ANNOTATION: &str = "lattice.mlab.com/service-definition";

/// Version label propagated from SystemBuild to System to Service.
pub const SYSTEM_VERSION_LABEL: &str = "lattice.mlab.com/system-version";

/// Finalizer placed on every System; drained by the System controller.
pub const SYSTEM_CONTROLLER_FINALIZER: &str = "lattice.mlab.com/system-controller";

/// Default namespace holding the cluster Config.
pub const DEFAULT_INTERNAL_NAMESPACE: &str = "lattice-internal";

/// Name of the cluster Config singleton.
pub const GLOBAL_CONFIG_NAME: &str = "global";
