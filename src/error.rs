//! Error types for the session core.
//!
//! Mirrors the error taxonomy from the spec: protocol errors are reported to
//! the client and never become a Rust `Error`; transport and backend failures
//! do, because they propagate across an `await` boundary before anyone
//! decides what to do with them.

use serde::Serialize;

/// A backend-reported failure, surfaced to the client as the reply to the
/// request that triggered it (unless it is [`BackendError::DUPLICATE_SUBMIT`],
/// which the agent upgrades to a success).
#[derive(Debug, Clone, thiserror::Error, Serialize)]
#[error("{message}")]
pub struct BackendError {
    pub code: u32,
    pub message: String,
}

impl BackendError {
    /// "Op already submitted" — duplicate submits are expected after a
    /// reconnect and are treated as success by the agent (spec §4.12).
    pub const DUPLICATE_SUBMIT: u32 = 4001;

    pub fn new(code: u32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn is_duplicate_submit(&self) -> bool {
        self.code == Self::DUPLICATE_SUBMIT
    }
}

/// A malformed or unsupported client request (spec §4.3). Always reported
/// with code `4000`; never closes the connection.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{0}")]
pub struct ValidationError(pub String);

impl ValidationError {
    pub const CODE: u32 = 4000;

    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }

    pub fn into_backend_error(self) -> BackendError {
        BackendError::new(Self::CODE, self.0)
    }
}
