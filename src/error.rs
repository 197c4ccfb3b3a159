//! Crate-level error types
//!
//! Subsystem errors live with their subsystem ([`BindError`] in
//! [`crate::bind`]); this module aggregates them and adds the
//! configuration errors.

use std::io;

use thiserror::Error;

use crate::bind::BindError;

/// Top-level error type.
#[derive(Debug, Error)]
pub enum WgStreamError {
    /// Stream bind and framing errors.
    #[error("bind error: {0}")]
    Bind(#[from] BindError),

    /// Configuration errors.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl WgStreamError {
    /// Check if retrying the operation can succeed without intervention.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Bind(e) => e.is_recoverable(),
            Self::Config(_) => false,
        }
    }
}

/// Configuration-related errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File not found or inaccessible.
    #[error("configuration file not found: {path}")]
    FileNotFound {
        /// Path that was probed.
        path: String,
    },

    /// JSON parsing error.
    #[error("failed to parse configuration: {0}")]
    ParseError(String),

    /// Invalid values or missing required fields.
    #[error("configuration validation failed: {0}")]
    ValidationError(String),

    /// I/O error while reading the file.
    #[error("I/O error reading configuration: {0}")]
    IoError(#[from] io::Error),
}

impl ConfigError {
    /// Create a validation error.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::ValidationError(msg.into())
    }
}

/// Type alias for Result with [`WgStreamError`].
pub type Result<T> = std::result::Result<T, WgStreamError>;
