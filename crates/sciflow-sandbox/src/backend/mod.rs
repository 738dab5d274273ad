//! Isolation backend port
//!
//! The pool only talks to isolation through [`SandboxBackend`]. The shipped
//! implementation drives the Docker CLI; tests substitute an in-memory fake.

use crate::error::SandboxError;
use crate::limits::ResourceLimits;
use crate::sandbox::OwnerLabel;
use async_trait::async_trait;
use std::fmt::{self, Display, Formatter};

pub mod docker;

pub use docker::DockerCliBackend;

/// Backend-specific reference to a live sandbox (container ID for Docker)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BackendHandle(String);

impl BackendHandle {
    /// Wrap a backend identifier
    #[inline]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Identifier as string
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for BackendHandle {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Raw result of a command executed inside a sandbox
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    /// Captured standard output
    pub stdout: String,
    /// Captured standard error
    pub stderr: String,
    /// Exit code, if the process exited normally
    pub exit_code: Option<i32>,
}

impl ExecOutput {
    /// Successful output with the given stdout
    #[inline]
    pub fn stdout(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: String::new(),
            exit_code: Some(0),
        }
    }

    /// Failed output with the given stderr
    #[inline]
    pub fn stderr(stderr: impl Into<String>) -> Self {
        Self {
            stdout: String::new(),
            stderr: stderr.into(),
            exit_code: Some(1),
        }
    }
}

/// Operations the pool needs from an isolation backend
///
/// Implementations must be safe to call concurrently; the pool serializes
/// its own bookkeeping but not backend calls.
#[async_trait]
pub trait SandboxBackend: Send + Sync + fmt::Debug {
    /// Backend name for logging
    fn name(&self) -> &'static str;

    /// Check that the backend is reachable
    async fn ping(&self) -> Result<(), SandboxError>;

    /// List every sandbox carrying `label`, including stopped ones
    async fn list_labeled(&self, label: &OwnerLabel) -> Result<Vec<BackendHandle>, SandboxError>;

    /// Create and start an idle sandbox with the given caps and label
    async fn create(
        &self,
        limits: &ResourceLimits,
        label: &OwnerLabel,
    ) -> Result<BackendHandle, SandboxError>;

    /// Write `contents` to `path` inside the sandbox
    async fn put_file(
        &self,
        handle: &BackendHandle,
        path: &str,
        contents: &[u8],
    ) -> Result<(), SandboxError>;

    /// Run `argv` inside the sandbox, capturing stdout and stderr separately
    ///
    /// A non-zero exit is not an error here; only failure to run is.
    async fn exec(&self, handle: &BackendHandle, argv: &[&str]) -> Result<ExecOutput, SandboxError>;

    /// Force-remove the sandbox, killing anything still running in it
    async fn remove(&self, handle: &BackendHandle) -> Result<(), SandboxError>;
}
