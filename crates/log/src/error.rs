//! Error types for logger setup

use thiserror::Error;

/// Errors raised while building the subscriber
#[derive(Debug, Error)]
pub enum LogError {
    /// The filter directive could not be parsed
    #[error("Invalid filter '{filter}': {reason}")]
    Filter {
        /// Directive as given
        filter: String,
        /// Parser message
        reason: String,
    },

    /// A global subscriber is already installed
    #[error("Global subscriber already installed: {0}")]
    AlreadyInstalled(String),

    /// Reloading the filter failed
    #[error("Failed to reload filter: {0}")]
    Reload(String),
}

/// Result type for logger operations
pub type LogResult<T> = Result<T, LogError>;
