//! Application-level error type with operation labels.

use thiserror::Error;

/// Failures surfaced while assembling or running the daemon.
#[derive(Debug, Error)]
pub enum AppError {
    /// A required environment variable is missing.
    #[error("missing required environment variable {name}")]
    MissingEnv {
        /// Variable name.
        name: &'static str,
    },
    /// The options file could not be read or parsed.
    #[error("failed to load options ({operation})")]
    Options {
        /// Operation label.
        operation: &'static str,
        /// Underlying failure.
        #[source]
        source: anyhow::Error,
    },
    /// Configuration was rejected by validation.
    #[error("invalid configuration")]
    Config {
        /// Underlying failure.
        #[source]
        source: soulgate_config::ConfigError,
    },
    /// A persistence operation failed during startup.
    #[error("persistence failure ({operation})")]
    Persistence {
        /// Operation label.
        operation: &'static str,
        /// Underlying failure.
        #[source]
        source: anyhow::Error,
    },
    /// Telemetry could not be initialised.
    #[error("telemetry failure ({operation})")]
    Telemetry {
        /// Operation label.
        operation: &'static str,
        /// Underlying failure.
        #[source]
        source: anyhow::Error,
    },
}

impl AppError {
    pub(crate) fn options(operation: &'static str, source: impl Into<anyhow::Error>) -> Self {
        Self::Options {
            operation,
            source: source.into(),
        }
    }

    pub(crate) fn persistence(operation: &'static str, source: impl Into<anyhow::Error>) -> Self {
        Self::Persistence {
            operation,
            source: source.into(),
        }
    }
}

/// Convenience alias for application results.
pub type AppResult<T> = Result<T, AppError>;
