//! Error types for the API client.
//!
//! # Design
//! Callers see four kinds of failure: the transport never got a response
//! (`Network`), the session is gone and the user must sign in again
//! (`SessionExpired`), the server rejected the request (`Validation` for 4xx,
//! `Server` for 5xx). An expired credential on a first attempt is not an
//! error at all from the caller's point of view; it is handled internally by
//! refreshing and replaying the request.

use thiserror::Error;

use crate::payload::Payload;

#[derive(Debug, Clone, Error)]
pub enum ApiError {
    /// No response was received.
    #[error("network error: {0}")]
    Network(String),

    /// The refresh attempt failed or a replayed request was rejected again.
    /// The stored token has been cleared.
    #[error("session expired: {reason}")]
    SessionExpired { reason: String },

    /// The server returned a 4xx status other than an expired credential.
    #[error("request rejected ({status}): {message}")]
    Validation {
        status: u16,
        message: String,
        body: Payload,
    },

    /// The server returned a 5xx status (or another unexpected non-2xx).
    #[error("server error ({status}): {message}")]
    Server {
        status: u16,
        message: String,
        body: Payload,
    },

    /// The request payload could not be encoded.
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// The response body could not be decoded.
    #[error("deserialization failed: {0}")]
    Deserialization(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl ApiError {
    pub fn session_expired(reason: impl Into<String>) -> Self {
        Self::SessionExpired {
            reason: reason.into(),
        }
    }

    /// `true` when the caller should send the user back to sign in.
    pub fn is_session_expired(&self) -> bool {
        matches!(self, Self::SessionExpired { .. })
    }

    /// HTTP status for errors that came from a response.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Validation { status, .. } | Self::Server { status, .. } => Some(*status),
            _ => None,
        }
    }
}

#[cfg(feature = "reqwest")]
impl From<reqwest::Error> for ApiError {
    fn from(e: reqwest::Error) -> Self {
        Self::Network(e.to_string())
    }
}

impl From<figment::Error> for ApiError {
    fn from(e: figment::Error) -> Self {
        Self::Config(e.to_string())
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_status_and_message() {
        let err = ApiError::Validation {
            status: 422,
            message: "name is required".to_string(),
            body: Payload::Null,
        };
        assert_eq!(err.to_string(), "request rejected (422): name is required");
        assert_eq!(err.status(), Some(422));
    }

    #[test]
    fn session_expired_helpers() {
        let err = ApiError::session_expired("refresh rejected");
        assert!(err.is_session_expired());
        assert_eq!(err.status(), None);
        assert_eq!(err.to_string(), "session expired: refresh rejected");
    }

    #[test]
    fn network_is_not_session_expired() {
        assert!(!ApiError::Network("connection refused".into()).is_session_expired());
    }
}
