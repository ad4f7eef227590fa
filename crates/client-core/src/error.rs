use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::lifecycle::ClientPhase;

/// Stable client error emitted across API and notice boundaries.
#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq, Eq)]
pub enum ClientError {
    /// Network or TLS failure, or a response body that is not JSON.
    #[error("transport failure: {0}")]
    Transport(String),
    /// The server answered with a non-success HTTP status.
    #[error("server returned status {status}: {message}")]
    Status { status: u16, message: String },
    /// Malformed JSON, a missing required field, or a field of an
    /// unexpected type.
    #[error("protocol violation: {0}")]
    Protocol(String),
    /// No offered authentication flow is satisfiable with the supplied
    /// credentials.
    #[error("no supported authentication flow")]
    AuthUnsupported,
    /// The server refused the authentication attempt.
    #[error("authentication rejected: {0}")]
    AuthRejected(String),
    /// Backward pagination already walked past the room-create event.
    #[error("pagination exhausted")]
    PaginationExhausted,
    /// An operation was attempted in an incompatible lifecycle phase.
    #[error("cannot run '{action}' while client is in phase {phase:?}")]
    InvalidPhase { phase: ClientPhase, action: String },
}

impl ClientError {
    /// Build a transport error from any displayable cause.
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport(message.into())
    }

    /// Build a protocol error from any displayable cause.
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }

    /// Build a standard invalid-phase error.
    pub fn invalid_phase(phase: ClientPhase, action: impl Into<String>) -> Self {
        Self::InvalidPhase {
            phase,
            action: action.into(),
        }
    }

    /// Whether retrying the same request later can reasonably succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport(_) => true,
            Self::Status { status, .. } => {
                classify_http_status(*status) == StatusClass::Transient
            }
            _ => false,
        }
    }
}

/// Broad HTTP status classification used for retry decisions.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum StatusClass {
    /// Authentication/authorization failure.
    Auth,
    /// Worth retrying after a delay.
    Transient,
    /// The request itself is wrong; retrying is pointless.
    Request,
}

/// Map an HTTP status code to a retry classification.
pub fn classify_http_status(status: u16) -> StatusClass {
    match status {
        401 | 403 => StatusClass::Auth,
        408 | 429 => StatusClass::Transient,
        400..=499 => StatusClass::Request,
        500..=599 => StatusClass::Transient,
        _ => StatusClass::Request,
    }
}
