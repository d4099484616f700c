//! Error types for the hub.

use edgesync_protocol::{AuthError, ProtocolError};
use thiserror::Error;

/// Result type for hub operations.
pub type ServerResult<T> = Result<T, ServerError>;

/// Errors that can occur while handling a request.
#[derive(Error, Debug)]
pub enum ServerError {
    /// Malformed request body or query.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Signature check failed.
    #[error("authentication failed: {0}")]
    AuthenticationFailed(#[from] AuthError),

    /// The signing key does not belong to the site named in the request.
    #[error("key {key_id} may not act as site {site_id}")]
    Forbidden {
        /// Key that signed the request.
        key_id: String,
        /// Site named in the body.
        site_id: String,
    },

    /// No route for the path.
    #[error("not found: {0}")]
    NotFound(String),

    /// The path exists but not for this method.
    #[error("method {method} not allowed on {path}")]
    MethodNotAllowed {
        /// Request method.
        method: String,
        /// Request path.
        path: String,
    },

    /// Push batch above the configured maximum.
    #[error("batch of {count} entities exceeds limit of {max}")]
    BatchTooLarge {
        /// Entities in the request.
        count: usize,
        /// Configured maximum.
        max: usize,
    },

    /// Internal server error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ServerError {
    /// Returns the HTTP status code for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            ServerError::InvalidRequest(_) => 400,
            ServerError::AuthenticationFailed(_) => 401,
            ServerError::Forbidden { .. } => 403,
            ServerError::NotFound(_) => 404,
            ServerError::MethodNotAllowed { .. } => 405,
            ServerError::BatchTooLarge { .. } => 413,
            ServerError::Internal(_) => 500,
        }
    }

    /// Returns true if this is a client error (4xx).
    pub fn is_client_error(&self) -> bool {
        (400..500).contains(&self.status_code())
    }

    /// Returns true if this is a server error (5xx).
    pub fn is_server_error(&self) -> bool {
        self.status_code() >= 500
    }
}

impl From<ProtocolError> for ServerError {
    fn from(e: ProtocolError) -> Self {
        ServerError::InvalidRequest(e.to_string())
    }
}

impl From<serde_json::Error> for ServerError {
    fn from(e: serde_json::Error) -> Self {
        ServerError::InvalidRequest(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_errors() {
        assert!(ServerError::InvalidRequest("x".into()).is_client_error());
        assert!(ServerError::AuthenticationFailed(AuthError::BadSignature).is_client_error());
        assert!(ServerError::BatchTooLarge { count: 9, max: 1 }.is_client_error());
        assert!(!ServerError::Internal("x".into()).is_client_error());
    }

    #[test]
    fn server_errors() {
        assert!(ServerError::Internal("x".into()).is_server_error());
        assert!(!ServerError::NotFound("/x".into()).is_server_error());
    }

    #[test]
    fn status_codes() {
        assert_eq!(
            ServerError::from(AuthError::UnknownKey("k".into())).status_code(),
            401
        );
        assert_eq!(
            ServerError::MethodNotAllowed {
                method: "PUT".into(),
                path: "/sync/push".into()
            }
            .status_code(),
            405
        );
        assert_eq!(
            ServerError::Forbidden {
                key_id: "site-1".into(),
                site_id: "site-2".into()
            }
            .status_code(),
            403
        );
    }
}
