//! Domain-level error taxonomy for junction.

/// Junction domain errors.
#[derive(Debug, thiserror::Error)]
pub enum JunctionError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid signal: {0}")]
    InvalidSignal(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for junction domain operations.
pub type Result<T> = std::result::Result<T, JunctionError>;
