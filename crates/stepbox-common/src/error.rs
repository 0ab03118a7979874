//! Unified error types for the stepbox workspace.
//!
//! Each higher-level crate defines its own domain-specific error enum and
//! wraps these common variants when appropriate.

use thiserror::Error;

/// Top-level error type shared across the workspace.
#[derive(Debug, Error)]
pub enum SandboxError {
    /// A configuration value is invalid.
    #[error("invalid configuration: {message}")]
    Config {
        /// Description of the invalid configuration.
        message: String,
    },

    /// The stdin payload handed to the contained process is malformed.
    #[error("malformed input: {message}")]
    MalformedInput {
        /// Which part of the framing was missing or invalid.
        message: String,
    },

    /// Serialization or deserialization failed.
    #[error("serialization error: {source}")]
    Serialization {
        /// Underlying serialization error.
        #[from]
        source: serde_json::Error,
    },
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, SandboxError>;
