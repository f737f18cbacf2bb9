//! Process lifecycle state machine.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};

/// Lifecycle state of a supervised daemon.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessState {
    #[default]
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl ProcessState {
    /// Whether moving from `self` to `next` is a legal transition.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Stopped, Self::Starting)
                | (Self::Starting, Self::Running | Self::Stopped)
                | (Self::Running, Self::Stopping)
                | (Self::Stopping, Self::Stopped)
        )
    }
}

/// Error returned for an illegal transition.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("Invalid state transition: {from:?} -> {to:?}")]
pub struct TransitionError {
    pub from: ProcessState,
    pub to: ProcessState,
}

/// State machine shared between a supervisor and its monitor task.
///
/// Cloning yields another handle to the same state.
#[derive(Debug, Clone, Default)]
pub struct StateMachine {
    state: Arc<Mutex<ProcessState>>,
}

impl StateMachine {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn state(&self) -> ProcessState {
        *self.lock()
    }

    /// Move to `next` if the current state allows it.
    ///
    /// # Errors
    ///
    /// Returns `TransitionError` and leaves the state untouched otherwise.
    pub fn transition(&self, next: ProcessState) -> Result<(), TransitionError> {
        let mut state = self.lock();
        Self::apply(&mut state, next)
    }

    /// Record that the daemon went away on its own.
    ///
    /// Only acts on a running process, which is walked through `Stopping`
    /// to `Stopped`. Returns whether anything changed.
    pub fn mark_exited(&self) -> bool {
        let mut state = self.lock();
        if *state != ProcessState::Running {
            return false;
        }
        Self::apply(&mut state, ProcessState::Stopping)
            .and_then(|()| Self::apply(&mut state, ProcessState::Stopped))
            .is_ok()
    }

    fn apply(state: &mut ProcessState, next: ProcessState) -> Result<(), TransitionError> {
        if !state.can_transition_to(next) {
            return Err(TransitionError {
                from: *state,
                to: next,
            });
        }
        tracing::debug!(from = ?*state, to = ?next, "State transition");
        *state = next;
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, ProcessState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
