//! Error types for the sandbox pool
//!
//! Distinguishes failures of the isolation backend itself (unreachable,
//! creation refused) from failures of a script running inside a sandbox.
//! The latter never surface here: they are captured as
//! [`RunFailure`](crate::protocol::RunFailure) text on the run outcome.

/// Sandbox pool and backend errors
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    /// Isolation backend is unreachable; the pool runs degraded
    #[error("sandboxing unavailable: {0}")]
    Unavailable(String),

    /// A sandbox could not be created
    #[error("sandbox creation failed: {0}")]
    CreationFailed(String),

    /// Backend command failed for an existing sandbox
    #[error("sandbox backend error: {0}")]
    Backend(String),

    /// The caller abandoned the run before it finished
    #[error("sandbox run cancelled")]
    Cancelled,

    /// Ownership label could not be parsed
    #[error("invalid owner label '{0}': expected key=value")]
    InvalidLabel(String),

    /// Deployment profile could not be parsed
    #[error("unknown deployment profile '{0}': expected laptop, server or cluster")]
    UnknownProfile(String),

    /// IO error talking to the backend
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl SandboxError {
    /// Whether a later attempt could plausibly succeed
    ///
    /// Backend availability errors are never retryable: the retry loop cannot
    /// fix a missing daemon.
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Backend(_))
    }

    /// Whether this error means the isolation backend is down
    #[inline]
    #[must_use]
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}
