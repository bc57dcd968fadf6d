//! Telemetry error types

use thiserror::Error;

/// Failures of the underlying link.
///
/// These never escape the supervisor: they are logged and turned into an
/// `Error` or `Closed` connection state followed by a reconnect.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    #[error("Handshake with {url} failed: {reason}")]
    Handshake { url: String, reason: String },

    #[error("Transport error: {0}")]
    Transport(String),
}

impl ConnectionError {
    pub fn handshake(url: impl Into<String>, reason: impl Into<String>) -> Self {
        ConnectionError::Handshake {
            url: url.into(),
            reason: reason.into(),
        }
    }
}

/// A frame that could not be decoded or routed.
///
/// The offending frame is dropped; the connection stays open.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("Malformed frame: {0}")]
    Malformed(String),

    #[error("Frame has no \"type\" discriminator")]
    MissingKind,

    #[error("Unknown frame kind '{0}'")]
    UnknownKind(String),

    #[error("Invalid payload for '{kind}': {reason}")]
    InvalidPayload { kind: String, reason: String },
}

impl ProtocolError {
    pub fn invalid_payload(kind: impl Into<String>, reason: impl Into<String>) -> Self {
        ProtocolError::InvalidPayload {
            kind: kind.into(),
            reason: reason.into(),
        }
    }
}

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        ProtocolError::Malformed(err.to_string())
    }
}
