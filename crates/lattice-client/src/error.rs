//! Resource client errors

use thiserror::Error;

/// Errors returned by a [`crate::ResourceClient`].
#[derive(Debug, Error)]
pub enum ClientError {
    /// The object does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Create raced with an existing object of the same name
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// The write carried a stale resource version
    #[error("Conflict: {0}")]
    Conflict(String),

    /// The object cannot be written as given (missing name, rejected by validation)
    #[error("Invalid object: {0}")]
    InvalidObject(String),

    /// Any other Kubernetes API failure
    #[error("Kubernetes error: {0}")]
    Kube(#[source] kube::Error),

    /// JSON serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ClientError {
    /// Whether the error means the object is missing.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Whether the error means a create found the name taken.
    #[must_use]
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists(_))
    }

    /// Whether the error is an optimistic concurrency failure.
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }
}

impl From<kube::Error> for ClientError {
    fn from(err: kube::Error) -> Self {
        if let kube::Error::Api(ae) = &err {
            match ae.code {
                404 => return Self::NotFound(ae.message.clone()),
                409 if ae.reason == "AlreadyExists" => {
                    return Self::AlreadyExists(ae.message.clone());
                }
                409 => return Self::Conflict(ae.message.clone()),
                422 => return Self::InvalidObject(ae.message.clone()),
                _ => {}
            }
        }
        Self::Kube(err)
    }
}
