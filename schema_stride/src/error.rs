//! Error types for schema_stride

use thiserror::Error;

/// Result type for schema_stride operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for schema_stride
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Malformed operation lists, naming conflicts, cyclic dependencies and unsafe diffs
    #[error("Invalid migration: {0}")]
    InvalidMigration(String),

    #[error("Operation is not reversible: {0}")]
    NotReversible(String),

    #[error("Could not connect to database at {host}: {message}")]
    ConnectivityError { host: String, message: String },

    #[error("Failed to apply migration {migration}: {message}")]
    MigrationApplyError { migration: String, message: String },

    /// Migration files that cannot be listed, read or decoded
    #[error("Discovery error: {0}")]
    DiscoveryError(String),

    #[error("State error: {0}")]
    StateError(String),

    #[error("Recorder error: {0}")]
    RecorderError(String),

    #[error("Model extraction error: {0}")]
    ExtractionError(String),

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("SQLx error: {0}")]
    SqlxError(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl Error {
    /// Build an error that lists every offender under a headline
    pub fn with_offenders(headline: &str, offenders: &[String]) -> Self {
        let mut message = String::from(headline);
        for offender in offenders {
            message.push_str("\n  - ");
            message.push_str(offender);
        }
        Error::InvalidMigration(message)
    }
}

/// Convert Serde JSON errors to schema_stride errors
impl From<serde_json::Error> for Error {
    fn from(error: serde_json::Error) -> Self {
        Error::SerializationError(error.to_string())
    }
}

/// Convert TOML deserialization errors to schema_stride errors
impl From<toml::de::Error> for Error {
    fn from(error: toml::de::Error) -> Self {
        Error::ConfigError(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_with_offenders_lists_everything() {
        let err = Error::with_offenders(
            "Unresolvable index columns:",
            &["Book.missing".to_string(), "Author.nope".to_string()],
        );
        assert_eq!(
            err.to_string(),
            "Invalid migration: Unresolvable index columns:\n  - Book.missing\n  - Author.nope"
        );
    }
}
