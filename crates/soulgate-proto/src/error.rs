//! Error types shared across the collaborator contracts.

use std::error::Error;

use thiserror::Error;

/// Primary error type for collaborator operations.
#[derive(Debug, Error)]
pub enum ProtoError {
    /// An enqueue request was refused; the message is written to the wire
    /// verbatim.
    #[error("{message}")]
    Rejected {
        /// Wire-visible rejection text.
        message: String,
    },
    /// A file, user, or transfer could not be located.
    #[error("{what} not found")]
    NotFound {
        /// What was being looked up.
        what: &'static str,
    },
    /// The operation was interrupted by cancellation.
    #[error("operation cancelled")]
    Cancelled,
    /// The remote side or the library gave up waiting.
    #[error("operation timed out")]
    TimedOut,
    /// Operation is not supported by the collaborator.
    #[error("operation not supported")]
    Unsupported {
        /// Operation identifier.
        operation: &'static str,
    },
    /// Operation failed inside the collaborator.
    #[error("operation failed")]
    OperationFailed {
        /// Operation identifier.
        operation: &'static str,
        /// Underlying failure.
        #[source]
        source: Box<dyn Error + Send + Sync>,
    },
}

impl ProtoError {
    /// Convenience constructor for rejections carrying a wire message.
    #[must_use]
    pub fn rejected(message: impl Into<String>) -> Self {
        Self::Rejected {
            message: message.into(),
        }
    }

    /// Wrap an arbitrary failure under an operation label.
    #[must_use]
    pub fn failed(
        operation: &'static str,
        source: impl Error + Send + Sync + 'static,
    ) -> Self {
        Self::OperationFailed {
            operation,
            source: Box::new(source),
        }
    }
}

/// Convenience alias for collaborator operation results.
pub type ProtoResult<T> = Result<T, ProtoError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejection_message_is_the_display_form() {
        let err = ProtoError::rejected("File not shared.");
        assert_eq!(err.to_string(), "File not shared.");
    }

    #[test]
    fn failed_preserves_source() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe closed");
        let err = ProtoError::failed("upload", io);
        assert!(matches!(
            err,
            ProtoError::OperationFailed {
                operation: "upload",
                ..
            }
        ));
        assert!(err.source().is_some());
    }
}
