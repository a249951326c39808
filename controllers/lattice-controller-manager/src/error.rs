//! Controller-specific error types.
//!
//! Every reconcile returns a [`ControllerError`]. The watcher decides from the
//! variant whether the key is retried with backoff or parked until the next
//! change (see [`ControllerError::is_terminal`]).

use crds::DefinitionError;
use kube::Error as KubeError;
use lattice_client::ClientError;
use thiserror::Error;

/// Errors that can occur in the Lattice controller manager.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Kubernetes API error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] KubeError),

    /// Resource client error
    #[error("Resource client error: {0}")]
    Client(#[from] ClientError),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The cluster Config has not been observed yet
    #[error("Config {0} has not been observed yet")]
    ConfigUnavailable(String),

    /// An invariant of the resource graph does not hold
    #[error("Invariant violated: {0}")]
    Invariant(String),

    /// An object the reconcile depends on is not in the cache yet
    #[error("Missing object: {0}")]
    MissingObject(String),

    /// JSON serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Resource watch failed
    #[error("Resource watch failed: {0}")]
    Watch(String),

    /// The reconcile future panicked
    #[error("Reconcile panicked: {0}")]
    Panic(String),
}

impl ControllerError {
    /// Terminal errors are not retried on a timer.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Invariant(_))
    }
}

impl From<DefinitionError> for ControllerError {
    fn from(err: DefinitionError) -> Self {
        Self::Invariant(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_invariants_are_terminal() {
        assert!(ControllerError::Invariant("x".to_string()).is_terminal());
        assert!(!ControllerError::MissingObject("x".to_string()).is_terminal());
        assert!(!ControllerError::Client(ClientError::Conflict("x".to_string())).is_terminal());
        assert!(!ControllerError::Panic("x".to_string()).is_terminal());
    }

    #[test]
    fn test_definition_errors_are_invariants() {
        let err: ControllerError = DefinitionError::DuplicatePath("/a".to_string()).into();
        assert!(err.is_terminal());
    }
}
