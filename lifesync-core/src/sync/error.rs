//! Remote call errors.

use std::time::Duration;

use thiserror::Error;

/// Errors returned by a [`super::RemoteClient`].
///
/// Everything except [`RemoteError::Rejected`] is transient: the engine
/// treats it like being offline for that one call and falls back locally.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RemoteError {
    #[error("Remote unreachable: {0}")]
    Unreachable(String),

    #[error("Remote call timed out after {0:?}")]
    Timeout(Duration),

    #[error("Remote server error ({status}): {message}")]
    Server { status: u16, message: String },

    #[error("Remote rejected the request ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("Not authorized by remote: {0}")]
    Unauthorized(String),

    #[error("Invalid response from remote: {0}")]
    InvalidResponse(String),
}

impl RemoteError {
    /// Maps a non-success HTTP status to an error.
    ///
    /// 408 and 429 are retryable; 401/403 are configuration problems and are
    /// retried rather than dead-lettered; other 4xx are rejections.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            401 | 403 => RemoteError::Unauthorized(message),
            408 | 429 => RemoteError::Server { status, message },
            400..=499 => RemoteError::Rejected { status, message },
            _ => RemoteError::Server { status, message },
        }
    }

    /// True when the backend refused the request for a reason unrelated to
    /// connectivity. Retrying the same request will not help.
    pub fn is_rejection(&self) -> bool {
        matches!(self, RemoteError::Rejected { .. })
    }

    pub fn is_transient(&self) -> bool {
        !self.is_rejection()
    }
}
