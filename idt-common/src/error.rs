//! Common error types for IDT

use thiserror::Error;

/// Common result type for IDT operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error types shared by the IDT crates
#[derive(Error, Debug)]
pub enum Error {
    /// I/O operation error (wraps std::io::Error)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encode/decode error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration loading or validation error
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Invalid caller input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Configuration error
///
/// Always fatal: a run with an invalid configuration aborts before any work starts.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A required value is missing
    #[error("Missing required configuration: {key}")]
    Missing { key: String },

    /// A value is present but unusable
    #[error("Invalid configuration value for {key}: {reason}")]
    Invalid { key: String, reason: String },

    /// Configuration file could not be read or parsed
    #[error("Failed to load configuration file {path}: {reason}")]
    File { path: String, reason: String },

    /// Run directory already holds a run started with different settings
    #[error("Run manifest mismatch for {field}: run was started with {existing}, requested {requested}")]
    ManifestMismatch {
        field: String,
        existing: String,
        requested: String,
    },
}

impl ConfigError {
    pub fn invalid(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key: key.into(),
            reason: reason.into(),
        }
    }

    pub fn missing(key: impl Into<String>) -> Self {
        Self::Missing { key: key.into() }
    }
}
