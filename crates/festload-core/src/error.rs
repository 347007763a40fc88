use thiserror::Error;

/// Canonical error type for configuration and declarative inputs.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Configuration could not be loaded or failed validation.
    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// A duration string such as `"1m30s"` could not be parsed.
    #[error("invalid duration `{input}`: {reason}")]
    InvalidDuration {
        /// The offending input.
        input: String,
        /// Human-readable explanation.
        reason: String,
    },

    /// A threshold expression such as `"p(95)<2000"` could not be parsed.
    #[error("invalid threshold expression `{expression}` for metric `{metric}`: {reason}")]
    InvalidThreshold {
        /// Metric the threshold was declared on.
        metric: String,
        /// The offending expression.
        expression: String,
        /// Human-readable explanation.
        reason: String,
    },

    /// Validation error for a declarative input.
    #[error("validation error: {0}")]
    Validation(String),

    /// JSON (de)serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CoreError {
    /// Creates an `InvalidDuration` variant.
    #[must_use]
    pub fn invalid_duration(input: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidDuration {
            input: input.into(),
            reason: reason.into(),
        }
    }

    /// Creates an `InvalidThreshold` variant.
    #[must_use]
    pub fn invalid_threshold(
        metric: impl Into<String>,
        expression: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::InvalidThreshold {
            metric: metric.into(),
            expression: expression.into(),
            reason: reason.into(),
        }
    }

    /// Creates a `Validation` variant.
    #[must_use]
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }
}

/// Convenient result alias for core operations.
pub type CoreResult<T> = Result<T, CoreError>;
