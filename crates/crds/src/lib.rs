//! Lattice CRD Definitions
//!
//! Kubernetes Custom Resource Definitions for the lattice control plane,
//! plus the system definition tree they carry and the content hash used
//! to deduplicate component builds.

pub mod component_build;
pub mod config;
pub mod constants;
pub mod definition;
pub mod error;
pub mod hash;
pub mod service;
pub mod service_build;
pub mod system;
pub mod system_build;
pub mod system_rollout;
pub mod system_teardown;
pub mod tree;

pub use component_build::*;
pub use config::*;
pub use constants::*;
pub use definition::*;
pub use error::DefinitionError;
pub use hash::{canonical_json, definition_hash};
pub use service::*;
pub use service_build::*;
pub use system::*;
pub use system_build::*;
pub use system_rollout::*;
pub use system_teardown::*;
pub use tree::NodePath;
