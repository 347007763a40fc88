use festload_core::CoreError;
use std::time::Duration;
use thiserror::Error;

/// Transport-level failure talking to the target service.
///
/// Application-level failures (unexpected status codes) are not errors; they
/// come back as typed results from [`crate::target::TargetService`].
#[derive(Debug, Error)]
pub enum TargetError {
    /// The request did not complete within the configured timeout.
    #[error("request `{operation}` timed out after {timeout:?}")]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },

    /// Connection refused, reset, DNS failure and similar.
    #[error("request `{operation}` failed: {message}")]
    Transport {
        operation: &'static str,
        message: String,
    },

    /// The response body could not be read.
    #[error("response to `{operation}` could not be decoded: {message}")]
    Decode {
        operation: &'static str,
        message: String,
    },
}

impl TargetError {
    #[must_use]
    pub fn transport(operation: &'static str, message: impl Into<String>) -> Self {
        Self::Transport {
            operation,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn decode(operation: &'static str, message: impl Into<String>) -> Self {
        Self::Decode {
            operation,
            message: message.into(),
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// Setup/teardown precondition failures.
#[derive(Debug, Error)]
pub enum LifecycleError {
    /// Every login failed, so no worker has a credential to use.
    #[error("no credentials available: 0 of {attempted} logins succeeded")]
    NoCredentials { attempted: usize },

    /// Setup was interrupted before issuing any credential.
    #[error("setup interrupted after {attempted} of {planned} logins")]
    Interrupted { attempted: usize, planned: usize },
}

/// Top-level failure of a run.
///
/// Threshold breaches are not errors: they are reported in the run report.
#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    /// HTTP client could not be built.
    #[error("failed to build HTTP client: {0}")]
    Client(String),

    /// A pool task panicked or was cancelled by the runtime.
    #[error("worker pool task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("report error: {0}")]
    Report(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RunError {
    #[must_use]
    pub fn report(message: impl Into<String>) -> Self {
        Self::Report(message.into())
    }
}

pub type TargetResult<T> = std::result::Result<T, TargetError>;
pub type RunResult<T> = std::result::Result<T, RunError>;
