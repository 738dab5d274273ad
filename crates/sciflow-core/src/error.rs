//! Error types for the orchestrator
//!
//! Only failures the retry loop cannot fix become errors. Script failures,
//! timeouts and guardrail rejections are reported inside the response.

use crate::state::FlowState;
use sciflow_memory::MemoryError;
use sciflow_sandbox::SandboxError;

/// Orchestrator errors
#[derive(Debug, thiserror::Error)]
pub enum FlowError {
    /// Code-generation collaborator unreachable or timed out
    #[error("model unavailable: {0}")]
    ModelUnavailable(String),

    /// Isolation backend down; retrying cannot help
    #[error("sandboxing unavailable: {0}")]
    SandboxUnavailable(String),

    /// Other sandbox pool failure
    #[error("sandbox error: {0}")]
    Sandbox(#[source] SandboxError),

    /// Working memory could not be opened
    #[error("memory error: {0}")]
    Memory(#[from] MemoryError),

    /// Invalid configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// Dataset is malformed
    #[error("dataset error: {0}")]
    Dataset(String),

    /// State machine was asked for a transition it does not allow
    #[error("illegal flow transition {from:?} -> {to:?}")]
    IllegalTransition {
        /// Current state
        from: FlowState,
        /// Requested state
        to: FlowState,
    },

    /// Caller abandoned the request
    #[error("request cancelled")]
    Cancelled,
}

impl FlowError {
    /// Check if error is retryable
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Sandbox(e) => e.is_retryable(),
            Self::Memory(e) => e.is_retryable(),
            _ => false,
        }
    }
}

impl From<SandboxError> for FlowError {
    fn from(e: SandboxError) -> Self {
        match e {
            SandboxError::Unavailable(msg) | SandboxError::CreationFailed(msg) => {
                Self::SandboxUnavailable(msg)
            }
            SandboxError::Cancelled => Self::Cancelled,
            other => Self::Sandbox(other),
        }
    }
}

impl From<GenerationError> for FlowError {
    fn from(e: GenerationError) -> Self {
        Self::ModelUnavailable(e.to_string())
    }
}

/// Code-generation collaborator errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GenerationError {
    /// Model server unreachable
    #[error("model server unreachable: {0}")]
    Unavailable(String),

    /// Model server answered with an error status
    #[error("model server rejected request ({status}): {body}")]
    Rejected {
        /// HTTP status code
        status: u16,
        /// Response body, truncated
        body: String,
    },

    /// Response body did not have the expected shape
    #[error("malformed model response: {0}")]
    Malformed(String),
}
