//! Error types for buildhist
//!
//! All modules use `BuildhistResult<T>` as their return type.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for buildhist operations
pub type BuildhistResult<T> = Result<T, BuildhistError>;

/// All errors that can occur in buildhist
#[derive(Error, Debug)]
pub enum BuildhistError {
    // Build record errors
    #[error("Build not found: {builder} #{number}")]
    BuildNotFound { builder: String, number: i64 },

    #[error("Corrupted build record {path}: {reason}")]
    CorruptedRecord { path: PathBuf, reason: String },

    #[error("Build record {path} has unsupported schema version {version}")]
    UnsupportedSchema { path: PathBuf, version: u32 },

    #[error("Build #{0} is already running")]
    BuildAlreadyRunning(u64),

    // Builder directory errors
    #[error("Builder directory not found: {0}")]
    BuilderDirNotFound(PathBuf),

    // Request store errors
    #[error("Build request store error: {0}")]
    RequestStore(String),

    #[error("Build request not found: {0}")]
    RequestNotFound(u64),

    // Subscriber errors
    #[error("Status receiver failed: {0}")]
    Receiver(String),

    // Configuration errors
    #[error("Invalid configuration at {path}: {reason}")]
    ConfigInvalid { path: PathBuf, reason: String },

    #[error("Failed to create config directory {path}: {source}")]
    ConfigDirCreate {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

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
}

impl BuildhistError {
    /// Create an IO error with context
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Create a corrupted-record error
    pub fn corrupted(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Self::CorruptedRecord {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    /// Whether the error means the record should be treated as absent
    pub fn is_absent(&self) -> bool {
        matches!(
            self,
            Self::BuildNotFound { .. } | Self::CorruptedRecord { .. } | Self::UnsupportedSchema { .. }
        )
    }

    /// Get actionable hint for the error
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            Self::BuilderDirNotFound(_) => Some("Pass the directory holding the builder's records"),
            Self::ConfigInvalid { .. } => Some("Run: buildhist config show"),
            Self::BuildNotFound { .. } => Some("Run: buildhist list"),
            _ => None,
        }
    }
}
