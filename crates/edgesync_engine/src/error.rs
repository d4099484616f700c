//! Error types for the sync engine.

use edgesync_queue::QueueError;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during sync operations.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Network or transport error.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// A request exceeded its deadline and was aborted.
    #[error("{operation} timed out")]
    Timeout {
        /// The operation that timed out.
        operation: &'static str,
    },

    /// The cloud answered with a non-2xx status.
    #[error("cloud returned HTTP {status}: {body}")]
    Http {
        /// Status code.
        status: u16,
        /// Response body, as text.
        body: String,
    },

    /// A message could not be encoded or decoded.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The cloud rejected part of a pushed batch.
    #[error("push partially rejected: {synced} synced, {errors} failed")]
    PartialPush {
        /// Entities accepted.
        synced: u32,
        /// Entities rejected.
        errors: u32,
    },

    /// The server certificate does not match the pinned fingerprint.
    #[error("certificate pin mismatch: expected {expected}, got {actual}")]
    PinMismatch {
        /// Configured fingerprint.
        expected: String,
        /// Presented fingerprint.
        actual: String,
    },

    /// Plaintext HTTP configured for a non-loopback host.
    #[error("refusing plaintext endpoint {0}: HTTPS is required for non-local hosts")]
    InsecureEndpoint(String),

    /// The offline queue failed.
    #[error("offline queue error: {0}")]
    Queue(#[from] QueueError),

    /// The local record store failed.
    #[error("local store error: {0}")]
    LocalStore(String),

    /// A local dependency reported unhealthy.
    #[error("local dependency unhealthy: {0}")]
    LocalUnhealthy(String),

    /// The configuration is unusable.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl SyncError {
    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Returns true if the next tick may succeed without intervention.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Transport { retryable, .. } => *retryable,
            SyncError::Timeout { .. } | SyncError::PartialPush { .. } => true,
            SyncError::Http { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }

    /// Returns true for timeouts.
    pub fn is_timeout(&self) -> bool {
        matches!(self, SyncError::Timeout { .. })
    }

    /// Returns true for errors that indicate a possible attack on the link.
    pub fn is_security_event(&self) -> bool {
        matches!(
            self,
            SyncError::PinMismatch { .. } | SyncError::InsecureEndpoint(_)
        )
    }

    /// Returns true if the cloud rejected the request as malformed (4xx).
    pub fn is_client_error(&self) -> bool {
        matches!(self, SyncError::Http { status, .. } if (400..500).contains(status))
    }

    /// Returns true if the cloud failed to handle the request (5xx).
    pub fn is_server_error(&self) -> bool {
        matches!(self, SyncError::Http { status, .. } if *status >= 500)
    }
}
