//! Error types for the activation lifecycle.

use eda_core::error::EdaError;

/// Errors from submitting or running jobs.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("Job queue is closed")]
    QueueClosed,
    #[error("Unsupported deployment type: {0}")]
    UnsupportedDeployment(String),
    #[error("Engine launch failed: {0}")]
    Launch(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors returned by lifecycle operations.
///
/// The first four variants are the caller-facing taxonomy; the transport
/// layer maps them to 422, 404, 409 and 403.
#[derive(Debug, thiserror::Error)]
pub enum ActivationError {
    /// A referenced resource is missing or a write broke an integrity constraint.
    #[error("{0}")]
    Unprocessable(String),
    #[error("{0}")]
    NotFound(String),
    /// The requested transition races one already in flight.
    #[error("Activation is busy or was modified concurrently")]
    Conflict,
    #[error("{0}")]
    Forbidden(String),
    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),
    #[error("Storage error: {0}")]
    Storage(EdaError),
}

impl From<EdaError> for ActivationError {
    fn from(err: EdaError) -> Self {
        match err {
            EdaError::VersionConflict { .. } => ActivationError::Conflict,
            EdaError::NotFound { .. } => ActivationError::NotFound(err.to_string()),
            other => ActivationError::Storage(other),
        }
    }
}

impl ActivationError {
    pub fn not_found(entity: &'static str, id: i64) -> Self {
        ActivationError::NotFound(EdaError::NotFound { entity, id }.to_string())
    }
}
