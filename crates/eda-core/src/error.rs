use thiserror::Error;

/// Top-level error type for the EDA service.
///
/// Subsystem crates define their own error types and implement
/// `From<EdaError>` so that the `?` operator works across crate boundaries.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum EdaError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(String),

    /// A foreign-key or uniqueness constraint rejected a write.
    #[error("Integrity error: {0}")]
    Integrity(String),

    #[error("{entity} with ID={id} does not exist.")]
    NotFound { entity: &'static str, id: i64 },

    /// An optimistic update lost the race against a concurrent writer.
    #[error("{entity} {id} was modified concurrently")]
    VersionConflict { entity: &'static str, id: i64 },

    #[error("API error: {0}")]
    Api(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<toml::de::Error> for EdaError {
    fn from(err: toml::de::Error) -> Self {
        EdaError::Config(err.to_string())
    }
}

impl From<toml::ser::Error> for EdaError {
    fn from(err: toml::ser::Error) -> Self {
        EdaError::Config(err.to_string())
    }
}

impl From<serde_json::Error> for EdaError {
    fn from(err: serde_json::Error) -> Self {
        EdaError::Serialization(err.to_string())
    }
}

/// A specialized `Result` type for EDA operations.
pub type Result<T> = std::result::Result<T, EdaError>;
