//! Error taxonomy for the upload core.

use soulgate_proto::ProtoError;
use thiserror::Error;

/// Primary error type for core operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Admission refused the request; the message goes on the wire verbatim.
    #[error("{message}")]
    Rejected {
        /// Wire-visible rejection text.
        message: String,
    },
    /// A user, file, or scheduled upload could not be located.
    #[error("{what} not found")]
    NotFound {
        /// What was being looked up.
        what: &'static str,
    },
    /// The operation was interrupted by cancellation.
    #[error("operation cancelled")]
    Cancelled,
    /// A persistence operation failed; the caller decides whether it is
    /// fatal or swallowed.
    #[error("persistence failure")]
    Database {
        /// Underlying failure.
        #[source]
        source: anyhow::Error,
    },
    /// The protocol library reported a transfer failure.
    #[error("transfer failed")]
    Transfer {
        /// Underlying failure.
        #[source]
        source: ProtoError,
    },
}

impl CoreError {
    /// Convenience constructor for wire rejections.
    #[must_use]
    pub fn rejected(message: impl Into<String>) -> Self {
        Self::Rejected {
            message: message.into(),
        }
    }
}

impl From<CoreError> for ProtoError {
    fn from(error: CoreError) -> Self {
        match error {
            CoreError::Rejected { message } => Self::Rejected { message },
            CoreError::NotFound { what } => Self::NotFound { what },
            CoreError::Cancelled => Self::Cancelled,
            CoreError::Transfer { source } => source,
            CoreError::Database { source } => Self::OperationFailed {
                operation: "persistence",
                source: source.into(),
            },
        }
    }
}

/// Convenience alias for core operation results.
pub type CoreResult<T> = Result<T, CoreError>;
