//! Error types for device control
//!
//! Every error that reaches a caller names the device it concerns, and
//! command errors also name the verb, so the UI can attribute failures.

use crate::backend::BackendError;
use crate::device::DeviceClass;
use std::path::PathBuf;
use thiserror::Error;

// =============================================================================
// Validation
// =============================================================================

/// A command rejected before any request was made
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("Unknown device '{0}'")]
    UnknownDevice(String),

    #[error("Unknown verb '{0}'")]
    UnknownVerb(String),

    #[error("{verb} needs parameter '{name}'")]
    MissingParameter { verb: &'static str, name: &'static str },

    #[error("{verb} is not supported by {class} devices")]
    UnsupportedVerb { verb: &'static str, class: DeviceClass },

    #[error("Target {value} is outside the allowed range {min}..{max}")]
    OutOfBounds { value: f64, min: f64, max: f64 },

    #[error("Index {0} is not a whole number")]
    NotAnIndex(f64),

    #[error("Speed must be a positive number, got {0}")]
    InvalidSpeed(f64),
}

// =============================================================================
// Commands
// =============================================================================

/// Failure of a dispatched command. No registry change happened.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CommandError {
    #[error("{verb} on '{device_id}' rejected: {source}")]
    Validation {
        device_id: String,
        verb: &'static str,
        #[source]
        source: ValidationError,
    },

    #[error("{verb} on '{device_id}' failed with HTTP {status}: {message}")]
    Rejected {
        device_id: String,
        verb: &'static str,
        status: u16,
        message: String,
    },

    #[error("{verb} on '{device_id}' could not reach the backend: {reason}")]
    Transport {
        device_id: String,
        verb: &'static str,
        reason: String,
    },
}

impl CommandError {
    pub fn device_id(&self) -> &str {
        match self {
            CommandError::Validation { device_id, .. }
            | CommandError::Rejected { device_id, .. }
            | CommandError::Transport { device_id, .. } => device_id,
        }
    }

    pub fn verb(&self) -> &'static str {
        match self {
            CommandError::Validation { verb, .. }
            | CommandError::Rejected { verb, .. }
            | CommandError::Transport { verb, .. } => verb,
        }
    }

    /// The local validation failure, if the command never left the process
    pub fn validation(&self) -> Option<&ValidationError> {
        match self {
            CommandError::Validation { source, .. } => Some(source),
            _ => None,
        }
    }
}

// =============================================================================
// Registry and motion
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("Unknown device '{0}'")]
    UnknownDevice(String),
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum MotionError {
    #[error("Unknown device '{0}'")]
    UnknownDevice(String),

    #[error("Speed must be a positive number, got {0}")]
    InvalidSpeed(f64),
}

impl From<RegistryError> for MotionError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::UnknownDevice(id) => MotionError::UnknownDevice(id),
        }
    }
}

// =============================================================================
// Configuration
// =============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read settings from {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse settings: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid value for {key}: {reason}")]
    Invalid { key: String, reason: String },
}

impl ConfigError {
    pub fn invalid(key: impl Into<String>, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            key: key.into(),
            reason: reason.into(),
        }
    }
}

// =============================================================================
// Service
// =============================================================================

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Failed to create backend client: {0}")]
    Backend(#[from] BackendError),
}
