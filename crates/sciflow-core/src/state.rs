//! Per-request flow state machine
//!
//! `Planning -> WaitingConfirmation` ends a planning call. Otherwise
//! `Planning -> Executing`, looping through `Retry` on failed attempts and
//! ending in `Guarded` or `Completed`.

use crate::error::FlowError;
use serde::{Deserialize, Serialize};

/// Flow states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowState {
    /// Producing or fetching a plan
    Planning,
    /// Plan returned to the caller for approval
    WaitingConfirmation,
    /// Generating and running a script
    Executing,
    /// Last attempt failed; feeding the error back
    Retry,
    /// Guardrail rejected the script
    Guarded,
    /// Finished, successfully or not
    Completed,
}

impl FlowState {
    /// Whether no further transition is allowed
    #[inline]
    #[must_use]
    pub fn is_terminal(self) -> bool {
        allowed_transitions(self).is_empty()
    }
}

/// States reachable from `from` in one step
#[must_use]
pub fn allowed_transitions(from: FlowState) -> &'static [FlowState] {
    use FlowState::*;
    match from {
        Planning => &[WaitingConfirmation, Executing],
        Executing => &[Retry, Guarded, Completed],
        Retry => &[Executing],
        WaitingConfirmation | Guarded | Completed => &[],
    }
}

/// Validate a single transition
///
/// # Errors
/// Returns `FlowError::IllegalTransition` if `to` is not reachable from `from`.
pub fn validate_transition(from: FlowState, to: FlowState) -> Result<(), FlowError> {
    if allowed_transitions(from).contains(&to) {
        Ok(())
    } else {
        Err(FlowError::IllegalTransition { from, to })
    }
}

/// Tracks one request's path through the flow
#[derive(Debug, Clone)]
pub struct FlowMachine {
    state: FlowState,
    history: Vec<FlowState>,
}

impl Default for FlowMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl FlowMachine {
    /// Machine in `Planning`
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: FlowState::Planning,
            history: vec![FlowState::Planning],
        }
    }

    /// Current state
    #[inline]
    #[must_use]
    pub fn state(&self) -> FlowState {
        self.state
    }

    /// Every state visited, in order
    #[inline]
    #[must_use]
    pub fn history(&self) -> &[FlowState] {
        &self.history
    }

    /// Move to `to`
    ///
    /// # Errors
    /// Returns `FlowError::IllegalTransition` and leaves the state unchanged.
    pub fn advance(&mut self, to: FlowState) -> Result<(), FlowError> {
        validate_transition(self.state, to)?;
        tracing::trace!(from = ?self.state, to = ?to, "flow transition");
        self.state = to;
        self.history.push(to);
        Ok(())
    }
}
