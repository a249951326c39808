//! Lattice resource client
//!
//! The controllers reach the orchestrator only through [`ResourceClient`]:
//! typed, namespaced CRUD plus a status write. [`KubeResourceClient`] backs it
//! with the Kubernetes API; with the `test-util` feature, [`MockResourceClient`]
//! backs it with an in-memory store that models resource versions, the status
//! subresource and finalizer-blocked deletion.
//!
//! # Example
//!
//! ```no_run
//! use lattice_client::{KubeResourceClient, ResourceClient};
//! use k8s_openapi::api::batch::v1::Job;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = kube::Client::try_default().await?;
//! let jobs = KubeResourceClient::<Job>::new(client);
//!
//! if let Some(job) = jobs.get("tenant-a", "lattice-build-1234").await? {
//!     println!("job status: {:?}", job.status);
//! }
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod error;
#[cfg(any(test, feature = "test-util"))]
pub mod mock;
#[path = "trait.rs"]
pub mod resource_trait;

pub use client::KubeResourceClient;
pub use error::ClientError;
#[cfg(any(test, feature = "test-util"))]
pub use mock::{MockResourceClient, MockWrite};
pub use resource_trait::{ResourceClient, SharedClient, object_name};
