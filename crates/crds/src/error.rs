//! Definition errors

use thiserror::Error;

/// Errors raised while validating definitions and node paths.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DefinitionError {
    /// Node path failed validation
    #[error("invalid node path {path:?}: {reason}")]
    InvalidPath {
        /// Path as supplied
        path: String,
        /// What was wrong with it
        reason: &'static str,
    },

    /// Two nodes of a definition resolve to the same path
    #[error("duplicate node at path {0}")]
    DuplicatePath(String),
}
