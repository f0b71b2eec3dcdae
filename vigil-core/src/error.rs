//! Error types for Vigil core operations

/// Result type for Vigil core operations
pub type Result<T> = std::result::Result<T, VigilError>;

/// Error types for discovery, configuration and persistence
#[derive(Debug, thiserror::Error)]
pub enum VigilError {
    /// A descriptor source was missing or unreadable
    #[error("Discovery error: {0}")]
    Discovery(String),

    /// A descriptor was readable but failed validation
    #[error("Invalid descriptor for agent {id}: {reason}")]
    InvalidDescriptor {
        /// Agent ID (or source path when the ID is unknown)
        id: String,
        /// What was wrong with it
        reason: String,
    },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Artifact or manifest write failed
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl VigilError {
    /// Shorthand for an invalid descriptor error
    pub fn invalid(id: impl Into<String>, reason: impl Into<String>) -> Self {
        VigilError::InvalidDescriptor {
            id: id.into(),
            reason: reason.into(),
        }
    }
}

impl From<String> for VigilError {
    fn from(s: String) -> Self {
        VigilError::Other(s)
    }
}

impl From<&str> for VigilError {
    fn from(s: &str) -> Self {
        VigilError::Other(s.to_string())
    }
}

impl From<anyhow::Error> for VigilError {
    fn from(err: anyhow::Error) -> Self {
        VigilError::Other(err.to_string())
    }
}

impl From<figment::Error> for VigilError {
    fn from(err: figment::Error) -> Self {
        VigilError::Configuration(err.to_string())
    }
}
