//! Error types for depguard

use std::io;
use std::time::Duration;

use thiserror::Error;

/// Result type alias for depguard
pub type Result<T> = std::result::Result<T, Error>;

/// depguard errors
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration is absent or cannot be turned into a usable target
    #[error("Configuration error: {0}")]
    Config(String),

    /// Name could not be resolved and no fallback exists
    #[error("Resolution failed for '{name}': {reason}")]
    Resolution {
        /// Logical name that was being resolved
        name: String,
        /// Why the live lookup failed
        reason: String,
    },

    /// Call rejected because the circuit breaker is open
    #[error("Circuit open for '{dependency}'{}", retry_hint(*.retry_in))]
    CircuitOpen {
        /// Guarded dependency
        dependency: String,
        /// Time until the next probe is admitted (`None` when locked open)
        retry_in: Option<Duration>,
    },

    /// The auth path could not reach a verdict
    #[error("Validator unavailable: {0}")]
    ValidatorUnavailable(String),

    /// Verdict reached: the credential is invalid
    #[error("Unauthorized")]
    Unauthorized,

    /// A deadline expired
    #[error("Timed out after {}ms: {operation}", .after.as_millis())]
    Timeout {
        /// What was being waited on
        operation: String,
        /// The deadline that expired
        after: Duration,
    },

    /// A guarded dependency reported a failure
    #[error("Dependency error ({dependency}): {message}")]
    Dependency {
        /// Dependency name
        dependency: String,
        /// Failure description
        message: String,
    },

    /// No dependency registered under this name
    #[error("Unknown dependency: {0}")]
    UnknownDependency(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

fn retry_hint(retry_in: Option<Duration>) -> String {
    match retry_in {
        Some(d) => format!(", retry in {}ms", d.as_millis()),
        None => ", manual reset required".to_string(),
    }
}

impl Error {
    /// Shorthand for a dependency failure
    pub fn dependency(dependency: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Dependency {
            dependency: dependency.into(),
            message: message.into(),
        }
    }

    /// Whether this error counts against a circuit breaker.
    ///
    /// Verdicts (`Unauthorized`) and local misconfiguration are not
    /// dependency failures. An unparsable response is.
    #[must_use]
    pub fn is_dependency_failure(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. }
                | Self::Dependency { .. }
                | Self::Resolution { .. }
                | Self::Io(_)
                | Self::Json(_)
                | Self::Http(_)
        )
    }
}
