//! Error types for options validation and application.

use thiserror::Error;

/// Primary error type for configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A share filter pattern failed to compile.
    #[error("invalid share filter '{pattern}'")]
    InvalidFilter {
        /// The offending pattern.
        pattern: String,
        /// Compilation failure detail.
        #[source]
        source: regex::Error,
    },
    /// A group definition is unusable.
    #[error("invalid group '{name}': {reason}")]
    InvalidGroup {
        /// The offending group name.
        name: String,
        /// Why the definition was refused.
        reason: String,
    },
}

/// Convenience alias for configuration operation results.
pub type ConfigResult<T> = Result<T, ConfigError>;
