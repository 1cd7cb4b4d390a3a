//! Error handling module for the curtin driver
//!
//! Provides centralized error handling with proper error types using thiserror.
//! Artifact generation errors stop the pipeline before any subprocess is spawned;
//! provisioning failures are surfaced as structured values, never swallowed.

use std::path::PathBuf;

use thiserror::Error;

use crate::driver::DriverTransitionError;

/// Main error type for the curtin driver
#[derive(Error, Debug)]
pub enum DriverError {
    /// Template rendering failed, usually an unbound placeholder.
    /// Raised before the storage artifact is touched.
    #[error("Template error: {0}")]
    Template(String),

    /// An artifact could not be written (permissions, missing directory, disk full)
    #[error("Failed to write artifact {}: {source}", .path.display())]
    FileIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The provisioning tool ran and exited non-zero (or was killed by a signal)
    #[error("Provisioning failed (exit code {}): {}", .code.map_or_else(|| "signal".to_string(), |c| c.to_string()), .stderr.trim())]
    Provisioning { code: Option<i32>, stderr: String },

    /// The provisioning tool could not be launched at all
    #[error("Failed to launch {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The detached reboot child could not be created
    #[error("Reboot dispatch error: {0}")]
    Reboot(String),

    /// YAML serialization of an artifact body failed
    #[error("YAML error: {0}")]
    Serialize(#[from] serde_yaml::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Validation errors (installer state, action records)
    #[error("Validation error: {0}")]
    Validation(String),

    /// Configuration errors (loading, parsing, validation)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Driver state machine transition errors
    #[error("Driver transition error: {0}")]
    Transition(#[from] DriverTransitionError),
}

/// Result type alias for driver operations
pub type Result<T> = std::result::Result<T, DriverError>;

impl DriverError {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a file write error for `path`
    pub fn file_io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::FileIo {
            path: path.into(),
            source,
        }
    }

    /// Build a template error from a tera error, keeping the whole cause chain.
    ///
    /// Tera reports "Failed to render" at the top and the missing variable in
    /// its sources, so the chain is flattened into one message.
    pub fn template(err: &tera::Error) -> Self {
        let mut msg = err.to_string();
        let mut source = std::error::Error::source(err);
        while let Some(cause) = source {
            msg.push_str(": ");
            msg.push_str(&cause.to_string());
            source = cause.source();
        }
        Self::Template(msg)
    }

    /// True if this error was raised before any subprocess could have been spawned
    pub fn is_generation_error(&self) -> bool {
        matches!(
            self,
            Self::Template(_) | Self::FileIo { .. } | Self::Serialize(_) | Self::Validation(_)
        )
    }
}
