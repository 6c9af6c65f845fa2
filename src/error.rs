//! Error types for jobcache
//!
//! Operational failures (configuration, IO, runtime setup) surface as
//! `JobCacheError`. Cache misses, remote outages and cancellations are not
//! errors; they flow through the normal job completion path.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for jobcache operations
pub type JobCacheResult<T> = Result<T, JobCacheError>;

/// All errors that can occur in jobcache
#[derive(Error, Debug)]
pub enum JobCacheError {
    // Configuration errors
    #[error("Invalid configuration at {path}: {reason}")]
    ConfigInvalid { path: PathBuf, reason: String },

    #[error("Failed to create config directory {path}: {source}")]
    ConfigDirCreate {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid setting {key}: {reason}")]
    InvalidSetting { key: String, reason: String },

    // Runtime errors
    #[error("No Tokio runtime available to drive remote cache requests")]
    RuntimeUnavailable,

    // IO errors
    #[error("IO error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    // Serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    // General errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    User(String),
}

impl JobCacheError {
    /// Create an IO error with context
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Create an invalid setting error
    pub fn setting(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidSetting {
            key: key.into(),
            reason: reason.into(),
        }
    }

    /// Get actionable hint for the error
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            Self::ConfigInvalid { .. } => Some("Run: jobcache config init --force"),
            Self::InvalidSetting { .. } => Some("Run: jobcache config show"),
            Self::RuntimeUnavailable => {
                Some("Build the cache inside a Tokio runtime or pass a handle to the builder")
            }
            _ => None,
        }
    }
}
