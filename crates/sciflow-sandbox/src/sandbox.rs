//! Sandbox identity and lifecycle
//!
//! A sandbox runs exactly one script in its lifetime:
//! `Warm -> InUse -> Destroyed`. Only the owning pool moves it between states.

use crate::backend::BackendHandle;
use crate::error::SandboxError;
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;
use std::time::Instant;
use ulid::Ulid;

/// Unique sandbox identifier (ULID for sortability)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SandboxId(pub Ulid);

impl SandboxId {
    /// Generate new sandbox ID
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for SandboxId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for SandboxId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SandboxState {
    /// Created and idle in the warm pool
    Warm,
    /// Leased to a single run
    InUse,
    /// Removed from the backend
    Destroyed,
}

/// Ownership label attached to every sandbox this process creates
///
/// Used to find and force-remove sandboxes left behind by a crashed run.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OwnerLabel {
    key: String,
    value: String,
}

impl OwnerLabel {
    /// Create label from key and value
    #[inline]
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    /// Label key
    #[inline]
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Label value
    #[inline]
    #[must_use]
    pub fn value(&self) -> &str {
        &self.value
    }
}

impl Default for OwnerLabel {
    fn default() -> Self {
        Self::new("sciflow_managed", "true")
    }
}

impl Display for OwnerLabel {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.key, self.value)
    }
}

impl FromStr for OwnerLabel {
    type Err = SandboxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('=') {
            Some((key, value)) if !key.trim().is_empty() && !value.trim().is_empty() => {
                Ok(Self::new(key.trim(), value.trim()))
            }
            _ => Err(SandboxError::InvalidLabel(s.to_string())),
        }
    }
}

/// One disposable, isolated execution environment
#[derive(Debug)]
pub struct Sandbox {
    id: SandboxId,
    handle: BackendHandle,
    state: SandboxState,
    created_at: Instant,
}

impl Sandbox {
    pub(crate) fn warm(handle: BackendHandle) -> Self {
        Self {
            id: SandboxId::new(),
            handle,
            state: SandboxState::Warm,
            created_at: Instant::now(),
        }
    }

    /// Sandbox ID
    #[inline]
    #[must_use]
    pub fn id(&self) -> SandboxId {
        self.id
    }

    /// Backend handle (container ID for Docker)
    #[inline]
    #[must_use]
    pub fn handle(&self) -> &BackendHandle {
        &self.handle
    }

    /// Current lifecycle state
    #[inline]
    #[must_use]
    pub fn state(&self) -> SandboxState {
        self.state
    }

    /// Time since the sandbox was created
    #[inline]
    #[must_use]
    pub fn age(&self) -> std::time::Duration {
        self.created_at.elapsed()
    }

    pub(crate) fn mark(&mut self, state: SandboxState) {
        debug_assert!(
            !(self.state == SandboxState::Destroyed && state != SandboxState::Destroyed),
            "destroyed sandbox cannot be revived"
        );
        self.state = state;
    }
}
